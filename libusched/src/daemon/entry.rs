// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The daemon side entry record and its admission rules.

use std::{
    hash::{DefaultHasher, Hash as _, Hasher as _},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::anyhow;

use crate::consts;
use usched_protocol::{EntryFlags, EntryHeader, EntryRecord};

/// One scheduled job as the daemon tracks it. Session material and
/// in-flight payloads live with the connection that is assembling
/// the request, never here.
#[derive(Debug, Default, Clone)]
pub struct Entry {
    pub id: u64,
    pub flags: EntryFlags,
    pub uid: u32,
    pub gid: u32,
    pub trigger: u32,
    pub step: u32,
    pub expire: u32,
    pub username: String,
    pub subj: String,

    // most recent execution status, maintained by the stat collector
    pub pid: u32,
    pub status: u32,
    pub exec_time: u64,
    pub latency: u64,
    pub outdata: Vec<u8>,

    /// Scheduler handle; non-zero iff the entry is armed. Never
    /// persisted, never sent to clients.
    pub psched_id: u64,
}

impl Entry {
    /// Build the staging entry for a freshly received header. The
    /// header has already been through `sanitize_header`.
    pub fn from_header(conn_id: u64, header: &EntryHeader) -> Entry {
        let mut flags = header.flags;
        flags.set(EntryFlags::PROGRESS);
        Entry {
            // staged entries borrow the connection id as their key
            id: conn_id,
            flags,
            uid: header.uid,
            gid: header.gid,
            trigger: header.trigger,
            step: header.step,
            expire: header.expire,
            username: header.username.clone(),
            ..Entry::default()
        }
    }

    /// The non-sensitive projection sent back for GET requests.
    pub fn to_record(&self) -> EntryRecord {
        EntryRecord {
            id: self.id,
            flags: self.flags,
            uid: self.uid,
            gid: self.gid,
            trigger: self.trigger,
            step: self.step,
            expire: self.expire,
            pid: self.pid,
            status: self.status,
            exec_time: self.exec_time,
            latency: self.latency,
            outdata: self.outdata.clone(),
            username: self.username.clone(),
            subj: self.subj.clone(),
        }
    }
}

/// Check an inbound header before an entry is staged: clear local
/// flags, require exactly one operation bit and a payload, and bound
/// the payload size.
pub fn sanitize_header(header: &mut EntryHeader, max_psize: usize) -> anyhow::Result<()> {
    header.flags.clear_local();

    if header.flags.op_count() != 1 {
        return Err(anyhow!(
            "request must carry exactly one operation flag, got {:#x}",
            header.flags.0
        ));
    }
    if header.psize == 0 {
        return Err(anyhow!("request without a payload"));
    }
    if header.psize as usize > max_psize {
        return Err(anyhow!(
            "payload of {} bytes exceeds the {} byte limit",
            header.psize,
            max_psize
        ));
    }
    Ok(())
}

/// Admission checks for a NEW entry that go beyond header shape:
/// expiry ordering and the calendar alignment contract.
pub fn check_admission(entry: &Entry, now: u32) -> anyhow::Result<()> {
    if entry.expire != 0 && entry.expire <= entry.trigger {
        return Err(anyhow!(
            "expire {} is not after trigger {}",
            entry.expire,
            entry.trigger
        ));
    }
    if entry.expire != 0 && entry.expire <= now {
        return Err(anyhow!("entry is already expired"));
    }
    if entry.flags.contains(EntryFlags::MONTHDAY_ALIGN)
        && (entry.step == 0 || entry.step % consts::MONTH_SECS != 0)
    {
        return Err(anyhow!(
            "month alignment requires a step that is a whole number of months, got {}",
            entry.step
        ));
    }
    if entry.flags.contains(EntryFlags::YEARDAY_ALIGN)
        && (entry.step == 0 || entry.step % consts::YEAR_SECS != 0)
    {
        return Err(anyhow!(
            "year alignment requires a step that is a whole number of years, got {}",
            entry.step
        ));
    }
    if entry.flags.contains(EntryFlags::MONTHDAY_ALIGN)
        && entry.flags.contains(EntryFlags::YEARDAY_ALIGN)
    {
        return Err(anyhow!("month and year alignment are mutually exclusive"));
    }
    Ok(())
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Derive a candidate unique id for an entry. Callers retry while
/// the id collides with the active pool; the counter makes retries
/// converge.
pub fn hash_id(entry: &Entry) -> u64 {
    let mut hasher = DefaultHasher::new();
    entry.subj.hash(&mut hasher);
    entry.trigger.hash(&mut hasher);
    entry.step.hash(&mut hasher);
    entry.expire.hash(&mut hasher);
    ID_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    let id = hasher.finish();
    // 0 is the "all entries" sentinel and may never be assigned
    if id == 0 { 1 } else { id }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitize_clears_local_bits_and_checks_ops() {
        let mut header = EntryHeader {
            flags: EntryFlags(EntryFlags::NEW.0 | EntryFlags::AUTHORIZED.0 | EntryFlags::FINISH.0),
            psize: 10,
            ..EntryHeader::default()
        };
        sanitize_header(&mut header, 1024).expect("sanitize to succeed");
        assert!(!header.flags.contains(EntryFlags::AUTHORIZED));
        assert!(!header.flags.contains(EntryFlags::FINISH));
        assert!(header.flags.contains(EntryFlags::NEW));
    }

    #[test]
    fn sanitize_rejects_bad_op_sets() {
        let mut header = EntryHeader { psize: 10, ..EntryHeader::default() };
        assert!(sanitize_header(&mut header, 1024).is_err());

        let mut header = EntryHeader {
            flags: EntryFlags(EntryFlags::NEW.0 | EntryFlags::DEL.0),
            psize: 10,
            ..EntryHeader::default()
        };
        assert!(sanitize_header(&mut header, 1024).is_err());
    }

    #[test]
    fn sanitize_bounds_the_payload() {
        let mut header = EntryHeader { flags: EntryFlags::GET, ..EntryHeader::default() };
        assert!(sanitize_header(&mut header, 1024).is_err(), "empty payload");

        header.psize = 2048;
        assert!(sanitize_header(&mut header, 1024).is_err(), "oversized payload");
    }

    #[test]
    fn admission_enforces_expiry_ordering() {
        let entry =
            Entry { trigger: 100, step: 0, expire: 100, flags: EntryFlags::NEW, ..Entry::default() };
        assert!(check_admission(&entry, 50).is_err());

        let entry = Entry { trigger: 100, expire: 101, ..Entry::default() };
        check_admission(&entry, 50).expect("valid expiry to pass");

        let entry = Entry { trigger: 100, expire: 0, ..Entry::default() };
        check_admission(&entry, 50).expect("no expiry to pass");
    }

    #[test]
    fn admission_enforces_alignment_contract() {
        let mut flags = EntryFlags::NEW;
        flags.set(EntryFlags::MONTHDAY_ALIGN);

        let entry = Entry {
            trigger: 100,
            step: consts::MONTH_SECS * 2,
            flags,
            ..Entry::default()
        };
        check_admission(&entry, 50).expect("whole month step to pass");

        let entry = Entry { trigger: 100, step: consts::MONTH_SECS + 1, flags, ..Entry::default() };
        assert!(check_admission(&entry, 50).is_err());

        let entry = Entry { trigger: 100, step: 0, flags, ..Entry::default() };
        assert!(check_admission(&entry, 50).is_err());
    }

    #[test]
    fn hashed_ids_differ_for_identical_specs() {
        let entry = Entry { subj: String::from("echo hi"), trigger: 10, ..Entry::default() };
        let a = hash_id(&entry);
        let b = hash_id(&entry);
        assert_ne!(a, 0);
        assert_ne!(a, b, "the counter must break ties");
    }
}
