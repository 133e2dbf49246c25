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

//! Active pool persistence.
//!
//! The whole active pool is snapshotted into one exclusively locked
//! file. The lock is held for the daemon's lifetime so a second
//! instance refuses to start instead of corrupting the pool.
//!
//! File layout, little endian:
//!
//! ```text
//! magic "USCHED\0\x02" | u64 saved_at | u32 count
//! count * ( u64 id | u32 flags | u32 uid | u32 gid
//!         | u32 trigger | u32 step | u32 expire
//!         | u32 subj_size | subj[subj_size] )
//! ```
//!
//! `saved_at` is the wall clock at snapshot time; on reload the
//! difference against the current clock is the drift to compensate.
//! Flags are persisted whole, TRIGGERED included, so negative drift
//! compensation still applies after a restart.

use std::{
    fs::{File, OpenOptions},
    io::{Read as _, Seek as _, SeekFrom, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use nix::fcntl::{Flock, FlockArg};
use tracing::{info, instrument, warn};

use super::{entry::Entry, pool::EntryPool, sched};
use crate::consts;
use usched_protocol::EntryFlags;

const MAGIC: [u8; 8] = *b"USCHED\0\x02";

pub struct Marshal {
    file: Mutex<Flock<File>>,
    path: PathBuf,
    backups: bool,
}

/// What a reload did, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadStats {
    pub armed: usize,
    pub paused: usize,
    pub dropped_lapsed: usize,
    pub dropped_expired: usize,
    pub compensated: usize,
}

impl Marshal {
    /// Open and exclusively lock the serialization file. A held lock
    /// means another daemon owns this pool; refuse to start.
    pub fn open<P: AsRef<Path>>(path: P, backups: bool) -> anyhow::Result<Marshal> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating serialization dir")?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening serialization file {path:?}"))?;

        let file = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            anyhow!("serialization file {path:?} is locked by another daemon ({errno})")
        })?;

        Ok(Marshal { file: Mutex::new(file), path, backups })
    }

    /// Snapshot the active pool. Entries whose triggers predate a
    /// large enough clock change are compensated first (TRIGGERED
    /// entries only for backward drift; relative triggers always).
    /// Returns the ids that were compensated so the caller can shift
    /// the armed scheduler records to match.
    #[instrument(skip_all)]
    pub fn serialize(
        &self,
        apool: &EntryPool,
        delta: i64,
        now: u64,
    ) -> anyhow::Result<Vec<u64>> {
        let mut compensated = Vec::new();
        let mut buf = Vec::new();

        apool.with_all(|entries| -> anyhow::Result<()> {
            if delta.abs() >= consts::DELTA_RELOAD_THRESHOLD {
                for entry in entries.values_mut() {
                    if compensates(entry, delta) {
                        info!(
                            "compensating entry {:#018x} trigger {} by {}s for clock drift",
                            entry.id, entry.trigger, delta
                        );
                        entry.trigger = add_delta(entry.trigger, delta);
                        compensated.push(entry.id);
                    }
                }
            }

            buf.extend_from_slice(&MAGIC);
            buf.write_u64::<LittleEndian>(now)?;
            buf.write_u32::<LittleEndian>(entries.len() as u32)?;

            // stable order keeps snapshots byte-identical for a
            // frozen pool
            let mut ids: Vec<u64> = entries.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                let entry = &entries[&id];
                write_record(&mut buf, entry)?;
            }
            Ok(())
        })?;

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0)).context("rewinding serialization file")?;
        file.set_len(0).context("truncating serialization file")?;
        file.write_all(&buf).context("writing serialization file")?;
        file.sync_all().context("syncing serialization file")?;
        drop(file);

        if self.backups {
            let backup = self.path.with_extension(format!("bak.{now}"));
            if let Err(e) = std::fs::copy(&self.path, &backup) {
                warn!("could not write backup copy {:?}: {}", backup, e);
            }
        }

        Ok(compensated)
    }

    /// Rebuild the active pool from the snapshot. `arm` installs one
    /// entry with the scheduler and returns its handle; an arm
    /// failure here is fatal to the caller since dropping entries on
    /// the floor silently would lose jobs.
    #[instrument(skip_all)]
    pub fn reload(
        &self,
        apool: &EntryPool,
        now: u64,
        mut arm: impl FnMut(&Entry) -> anyhow::Result<u64>,
    ) -> anyhow::Result<ReloadStats> {
        let mut raw = Vec::new();
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(0)).context("rewinding serialization file")?;
            file.read_to_end(&mut raw).context("reading serialization file")?;
        }
        if raw.is_empty() {
            info!("serialization file is empty, starting fresh");
            return Ok(ReloadStats::default());
        }

        let mut r = std::io::Cursor::new(raw.as_slice());
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).context("reading magic")?;
        if magic != MAGIC {
            return Err(anyhow!(
                "serialization file {:?} has an unknown format marker",
                self.path
            ));
        }
        let saved_at = r.read_u64::<LittleEndian>().context("reading snapshot stamp")?;
        let count = r.read_u32::<LittleEndian>().context("reading entry count")?;

        let delta = now as i64 - saved_at as i64;
        let compensate = delta.abs() >= consts::DELTA_RELOAD_THRESHOLD;

        let mut stats = ReloadStats::default();
        for i in 0..count {
            let mut entry = read_record(&mut r).with_context(|| format!("record {i}"))?;

            if compensate && compensates(&entry, delta) {
                entry.trigger = add_delta(entry.trigger, delta);
                stats.compensated += 1;
            }

            if entry.expire != 0 && u64::from(entry.expire) <= now {
                stats.dropped_expired += 1;
                continue;
            }

            if entry.step == 0 {
                if u64::from(entry.trigger) < now {
                    // a one shot whose moment has passed
                    stats.dropped_lapsed += 1;
                    continue;
                }
            } else {
                // roll a recurrent entry forward to its next
                // occurrence at or after now
                let monthday = entry.flags.contains(EntryFlags::MONTHDAY_ALIGN);
                let yearday = entry.flags.contains(EntryFlags::YEARDAY_ALIGN);
                let mut lapsed = false;
                while u64::from(entry.trigger) < now {
                    match sched::advance_trigger(entry.trigger, entry.step, monthday, yearday) {
                        Some(next) if entry.expire == 0 || next < entry.expire => {
                            entry.trigger = next
                        }
                        _ => {
                            lapsed = true;
                            break;
                        }
                    }
                }
                if lapsed {
                    stats.dropped_expired += 1;
                    continue;
                }
            }

            if entry.flags.contains(EntryFlags::PAUSE) {
                // paused entries come back disarmed
                entry.psched_id = 0;
                stats.paused += 1;
            } else {
                entry.psched_id =
                    arm(&entry).with_context(|| format!("re-arming entry {:#018x}", entry.id))?;
                stats.armed += 1;
            }

            let id = entry.id;
            if apool.insert(entry).is_err() {
                return Err(anyhow!("duplicate entry id {id:#018x} in serialization file"));
            }
        }

        info!(
            "reloaded pool: {} armed, {} paused, {} lapsed, {} expired, {} compensated",
            stats.armed, stats.paused, stats.dropped_lapsed, stats.dropped_expired,
            stats.compensated
        );
        Ok(stats)
    }
}

fn compensates(entry: &Entry, delta: i64) -> bool {
    (entry.flags.contains(EntryFlags::TRIGGERED) && delta < 0)
        || entry.flags.contains(EntryFlags::RELATIVE_TRIGGER)
}

fn add_delta(ts: u32, delta: i64) -> u32 {
    u32::try_from((i64::from(ts) + delta).max(0)).unwrap_or(u32::MAX)
}

fn write_record(buf: &mut Vec<u8>, entry: &Entry) -> anyhow::Result<()> {
    buf.write_u64::<LittleEndian>(entry.id)?;
    buf.write_u32::<LittleEndian>(entry.flags.0)?;
    buf.write_u32::<LittleEndian>(entry.uid)?;
    buf.write_u32::<LittleEndian>(entry.gid)?;
    buf.write_u32::<LittleEndian>(entry.trigger)?;
    buf.write_u32::<LittleEndian>(entry.step)?;
    buf.write_u32::<LittleEndian>(entry.expire)?;
    buf.write_u32::<LittleEndian>(entry.subj.len() as u32)?;
    buf.extend_from_slice(entry.subj.as_bytes());
    Ok(())
}

fn read_record(r: &mut std::io::Cursor<&[u8]>) -> anyhow::Result<Entry> {
    let id = r.read_u64::<LittleEndian>()?;
    let flags = EntryFlags(r.read_u32::<LittleEndian>()?);
    let uid = r.read_u32::<LittleEndian>()?;
    let gid = r.read_u32::<LittleEndian>()?;
    let trigger = r.read_u32::<LittleEndian>()?;
    let step = r.read_u32::<LittleEndian>()?;
    let expire = r.read_u32::<LittleEndian>()?;
    let subj_size = r.read_u32::<LittleEndian>()? as usize;
    if subj_size > consts::MAX_PAYLOAD_SIZE {
        return Err(anyhow!("subject of {subj_size} bytes is implausible"));
    }
    let mut subj = vec![0u8; subj_size];
    r.read_exact(&mut subj).context("reading subject")?;
    let subj = String::from_utf8(subj).context("subject is not valid utf8")?;

    Ok(Entry { id, flags, uid, gid, trigger, step, expire, subj, ..Entry::default() })
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn entry(id: u64, trigger: u32, step: u32, expire: u32, flags: EntryFlags) -> Entry {
        Entry {
            id,
            flags,
            uid: 1000,
            gid: 1000,
            trigger,
            step,
            expire,
            subj: format!("job-{id}"),
            psched_id: id + 1000,
            ..Entry::default()
        }
    }

    fn marshal_in(dir: &tempfile::TempDir) -> Marshal {
        Marshal::open(dir.path().join("pool"), false).expect("marshal to open")
    }

    #[test]
    fn second_instance_is_refused() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let _first = marshal_in(&dir);
        let err = Marshal::open(dir.path().join("pool"), false)
            .err()
            .expect("second open must fail");
        assert!(format!("{err}").contains("locked by another daemon"));
    }

    #[test]
    fn round_trip_restores_persistent_fields() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let marshal = marshal_in(&dir);

        let apool = EntryPool::new("apool");
        apool.insert(entry(1, 5000, 60, 0, EntryFlags::NEW)).expect("insert");
        apool.insert(entry(2, 9000, 0, 9500, EntryFlags::NEW)).expect("insert");
        marshal.serialize(&apool, 0, 1000).expect("serialize");

        let restored = EntryPool::new("apool");
        let stats = marshal
            .reload(&restored, 1000, |_| Ok(77))
            .expect("reload to succeed");
        assert_matches!(stats, ReloadStats { armed: 2, paused: 0, .. });

        let e = restored.get_copy(1).expect("entry 1");
        assert_eq!((e.trigger, e.step, e.expire), (5000, 60, 0));
        assert_eq!(e.subj, "job-1");
        assert_eq!(e.uid, 1000);
        assert_eq!(e.psched_id, 77, "handles are re-assigned, not persisted");
        // transient fields come back zeroed
        assert_eq!(e.pid, 0);
        assert_eq!(e.outdata.len(), 0);
    }

    #[test]
    fn snapshots_are_idempotent() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let marshal = marshal_in(&dir);

        let apool = EntryPool::new("apool");
        for id in [9u64, 3, 7, 1] {
            apool.insert(entry(id, 5000 + id as u32, 0, 0, EntryFlags::NEW)).expect("insert");
        }
        marshal.serialize(&apool, 0, 1000).expect("serialize");
        let first = std::fs::read(dir.path().join("pool")).expect("read snapshot");

        let restored = EntryPool::new("apool");
        marshal.reload(&restored, 1000, |_| Ok(1)).expect("reload");
        marshal.serialize(&restored, 0, 1000).expect("serialize again");
        let second = std::fs::read(dir.path().join("pool")).expect("read snapshot");

        assert_eq!(first, second, "serialize/deserialize/serialize must be byte identical");
    }

    #[test]
    fn lapsed_and_expired_records_are_dropped() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let marshal = marshal_in(&dir);

        let apool = EntryPool::new("apool");
        // one shot in the past
        apool.insert(entry(1, 500, 0, 0, EntryFlags::NEW)).expect("insert");
        // expired recurrent
        apool.insert(entry(2, 500, 60, 900, EntryFlags::NEW)).expect("insert");
        // healthy future one shot
        apool.insert(entry(3, 5000, 0, 0, EntryFlags::NEW)).expect("insert");
        marshal.serialize(&apool, 0, 1000).expect("serialize");

        let restored = EntryPool::new("apool");
        let stats = marshal.reload(&restored, 1000, |_| Ok(1)).expect("reload");
        assert_eq!(stats.dropped_lapsed, 1);
        assert_eq!(stats.dropped_expired, 1);
        assert_eq!(stats.armed, 1);
        assert!(restored.contains(3));
        assert_eq!(restored.count(), 1);
    }

    #[test]
    fn recurrent_entries_roll_forward_to_the_clock() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let marshal = marshal_in(&dir);

        // trigger=100 step=60; with the clock at 1000 the next
        // occurrence on the step grid is exactly 1000
        let apool = EntryPool::new("apool");
        apool.insert(entry(1, 100, 60, 0, EntryFlags::NEW)).expect("insert");
        marshal.serialize(&apool, 0, 100).expect("serialize");

        let restored = EntryPool::new("apool");
        marshal.reload(&restored, 1000, |_| Ok(1)).expect("reload");
        // the snapshot stamp moved 900s too, so the relative drift
        // is the full gap; entry 1 is not relative so its trigger
        // only rolls forward on the step grid
        let e = restored.get_copy(1).expect("entry 1");
        assert_eq!(e.trigger, 1000);
        assert_eq!(e.trigger % 60, 100 % 60, "the step grid is preserved");
    }

    #[test]
    fn relative_triggers_are_compensated_for_restart_drift() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let marshal = marshal_in(&dir);

        let mut flags = EntryFlags::NEW;
        flags.set(EntryFlags::RELATIVE_TRIGGER);

        let apool = EntryPool::new("apool");
        apool.insert(entry(1, 1100, 0, 0, flags)).expect("insert");
        // an absolute one shot far enough out to survive the jump
        apool.insert(entry(2, 2000, 0, 0, EntryFlags::NEW)).expect("insert");
        marshal.serialize(&apool, 0, 1000).expect("serialize at t=1000");

        // the wall clock jumped forward 500s across the restart
        let restored = EntryPool::new("apool");
        let stats = marshal.reload(&restored, 1500, |_| Ok(1)).expect("reload");
        assert_eq!(stats.compensated, 1);
        assert_eq!(restored.get_copy(1).expect("entry 1").trigger, 1600);
        assert_eq!(restored.get_copy(2).expect("entry 2").trigger, 2000);
    }

    #[test]
    fn triggered_entries_only_compensate_backward_drift() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let marshal = marshal_in(&dir);

        let mut flags = EntryFlags::NEW;
        flags.set(EntryFlags::TRIGGERED);

        let apool = EntryPool::new("apool");
        apool.insert(entry(1, 2000, 600, 0, flags)).expect("insert");
        marshal.serialize(&apool, 0, 1000).expect("serialize");

        // forward drift: no compensation for an already triggered entry
        let restored = EntryPool::new("apool");
        let stats = marshal.reload(&restored, 1100, |_| Ok(1)).expect("reload");
        assert_eq!(stats.compensated, 0);
        assert_eq!(restored.get_copy(1).expect("entry").trigger, 2000);

        // backward drift: compensated
        let restored = EntryPool::new("apool");
        let stats = marshal.reload(&restored, 900, |_| Ok(1)).expect("reload");
        assert_eq!(stats.compensated, 1);
        assert_eq!(restored.get_copy(1).expect("entry").trigger, 1900);
    }

    #[test]
    fn paused_entries_come_back_disarmed() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let marshal = marshal_in(&dir);

        let mut flags = EntryFlags::NEW;
        flags.set(EntryFlags::PAUSE);

        let apool = EntryPool::new("apool");
        apool.insert(entry(1, 5000, 60, 0, flags)).expect("insert");
        marshal.serialize(&apool, 0, 1000).expect("serialize");

        let restored = EntryPool::new("apool");
        let stats = marshal
            .reload(&restored, 1000, |_| panic!("paused entries must not be armed"))
            .expect("reload");
        assert_eq!(stats.paused, 1);
        assert_eq!(restored.get_copy(1).expect("entry").psched_id, 0);
    }
}
