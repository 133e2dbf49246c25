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

//! usched-protocol defines the binary contract between the usched
//! client and daemon, and the message formats the daemon shares with
//! the executor over its IPC queues.
//!
//! Everything on the socket is fixed layout. Requests are a 76 byte
//! entry header in network byte order, followed by a 64 byte session
//! field, followed by `psize` bytes of payload. Replies are a 4 byte
//! big endian length followed by that many payload bytes. The IPC
//! queues are machine local, so those messages are little endian.

use std::io::{self, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt as _, WriteBytesExt as _};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of the NUL padded username field in the entry header.
pub const USERNAME_SIZE: usize = 32;
/// Size of the session field exchanged after every entry header.
pub const SESSION_SIZE: usize = 64;
/// Size of the fixed entry header on the wire.
pub const ENTRY_HEADER_SIZE: usize = 76;
/// uid/gid value remote requests must carry; the daemon replaces it
/// with the authenticated values.
pub const REMOTE_CRED_SENTINEL: u32 = 0xffff_ffff;
/// Entry id that stands for "all entries owned by the requesting uid"
/// in DEL/PAUSE/GET payloads.
pub const ALL_ENTRIES: u64 = 0;
/// Bytes added to a payload by the AEAD seal.
pub const SEAL_OVERHEAD: usize = 16;

/// The entry flag word.
///
/// Flags split into wire flags, which a client may set, and local
/// flags, which only the daemon manages. Local bits arriving on the
/// wire are cleared on receipt; the daemon never invents wire bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags(pub u32);

impl EntryFlags {
    pub const NEW: EntryFlags = EntryFlags(1 << 0);
    pub const DEL: EntryFlags = EntryFlags(1 << 1);
    pub const GET: EntryFlags = EntryFlags(1 << 2);
    pub const PAUSE: EntryFlags = EntryFlags(1 << 3);
    pub const INIT: EntryFlags = EntryFlags(1 << 4);
    pub const PROGRESS: EntryFlags = EntryFlags(1 << 5);
    pub const AUTHORIZED: EntryFlags = EntryFlags(1 << 6);
    pub const FINISH: EntryFlags = EntryFlags(1 << 7);
    pub const COMPLETE: EntryFlags = EntryFlags(1 << 8);
    pub const TRIGGERED: EntryFlags = EntryFlags(1 << 9);
    pub const RELATIVE_TRIGGER: EntryFlags = EntryFlags(1 << 10);
    pub const RELATIVE_EXPIRE: EntryFlags = EntryFlags(1 << 11);
    pub const MONTHDAY_ALIGN: EntryFlags = EntryFlags(1 << 12);
    pub const YEARDAY_ALIGN: EntryFlags = EntryFlags(1 << 13);

    /// The bits a client is allowed to put on the wire.
    pub fn wire_mask() -> EntryFlags {
        EntryFlags(
            Self::NEW.0
                | Self::DEL.0
                | Self::GET.0
                | Self::PAUSE.0
                | Self::RELATIVE_TRIGGER.0
                | Self::RELATIVE_EXPIRE.0
                | Self::MONTHDAY_ALIGN.0
                | Self::YEARDAY_ALIGN.0,
        )
    }

    pub fn contains(&self, flag: EntryFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn set(&mut self, flag: EntryFlags) {
        self.0 |= flag.0;
    }

    pub fn unset(&mut self, flag: EntryFlags) {
        self.0 &= !flag.0;
    }

    /// Drop every daemon local bit, keeping only what a client is
    /// allowed to send.
    pub fn clear_local(&mut self) {
        self.0 &= Self::wire_mask().0;
    }

    /// Number of operation bits set. A valid request has exactly one.
    pub fn op_count(&self) -> usize {
        [Self::NEW, Self::DEL, Self::GET, Self::PAUSE]
            .iter()
            .filter(|f| self.contains(**f))
            .count()
    }
}

/// The fixed header that starts every request.
///
/// On the wire the id slot carries whatever the client last saw (the
/// daemon keys in-progress requests by connection, not by this value)
/// and the daemon assigns the real id when a NEW entry is admitted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub id: u64,
    pub flags: EntryFlags,
    pub uid: u32,
    pub gid: u32,
    pub trigger: u32,
    pub step: u32,
    pub expire: u32,
    pub psize: u32,
    pub nonce: u64,
    pub username: String,
}

impl EntryHeader {
    pub fn write_to<W>(&self, w: &mut W) -> anyhow::Result<()>
    where
        W: Write,
    {
        w.write_u64::<BigEndian>(self.id)?;
        w.write_u32::<BigEndian>(self.flags.0)?;
        w.write_u32::<BigEndian>(self.uid)?;
        w.write_u32::<BigEndian>(self.gid)?;
        w.write_u32::<BigEndian>(self.trigger)?;
        w.write_u32::<BigEndian>(self.step)?;
        w.write_u32::<BigEndian>(self.expire)?;
        w.write_u32::<BigEndian>(self.psize)?;
        w.write_u64::<BigEndian>(self.nonce)?;

        if self.username.len() >= USERNAME_SIZE {
            return Err(anyhow!(
                "username '{}' exceeds the {} byte field",
                self.username,
                USERNAME_SIZE - 1
            ));
        }
        let mut name = [0u8; USERNAME_SIZE];
        name[..self.username.len()].copy_from_slice(self.username.as_bytes());
        w.write_all(&name)?;

        Ok(())
    }

    pub fn read_from<R>(r: &mut R) -> anyhow::Result<Self>
    where
        R: Read,
    {
        let id = r.read_u64::<BigEndian>()?;
        let flags = EntryFlags(r.read_u32::<BigEndian>()?);
        let uid = r.read_u32::<BigEndian>()?;
        let gid = r.read_u32::<BigEndian>()?;
        let trigger = r.read_u32::<BigEndian>()?;
        let step = r.read_u32::<BigEndian>()?;
        let expire = r.read_u32::<BigEndian>()?;
        let psize = r.read_u32::<BigEndian>()?;
        let nonce = r.read_u64::<BigEndian>()?;

        let mut name = [0u8; USERNAME_SIZE];
        r.read_exact(&mut name)?;
        // the last byte is reserved as a terminator no matter what
        // the peer sent
        name[USERNAME_SIZE - 1] = 0;
        let end = name.iter().position(|b| *b == 0).unwrap_or(0);
        let username = std::str::from_utf8(&name[..end])
            .context("username is not valid utf8")?
            .to_string();

        Ok(EntryHeader { id, flags, uid, gid, trigger, step, expire, psize, nonce, username })
    }
}

/// Read the 64 byte session field that follows every header.
pub fn read_session<R>(r: &mut R) -> io::Result<[u8; SESSION_SIZE]>
where
    R: Read,
{
    let mut session = [0u8; SESSION_SIZE];
    r.read_exact(&mut session)?;
    Ok(session)
}

/// Write a length prefixed reply frame.
pub fn write_frame<W>(w: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: Write,
{
    w.write_u32::<BigEndian>(payload.len() as u32)?;
    w.write_all(payload)?;
    Ok(())
}

/// Read a length prefixed reply frame, refusing anything larger
/// than `limit` bytes.
pub fn read_frame<R>(r: &mut R, limit: usize) -> anyhow::Result<Vec<u8>>
where
    R: Read,
{
    let len = r.read_u32::<BigEndian>()? as usize;
    if len > limit {
        return Err(anyhow!("frame of size {} exceeds size limit of {} bytes", len, limit));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reply payload for an admitted NEW entry.
pub fn encode_new_reply(id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.write_u64::<BigEndian>(id).expect("writing to a Vec cannot fail");
    buf
}

pub fn decode_new_reply(payload: &[u8]) -> anyhow::Result<u64> {
    let mut r = io::Cursor::new(payload);
    let id = r.read_u64::<BigEndian>().context("reading assigned id")?;
    Ok(id)
}

/// DEL and PAUSE request payloads and replies are packed id lists.
pub fn encode_id_list(ids: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        buf.write_u64::<BigEndian>(*id).expect("writing to a Vec cannot fail");
    }
    buf
}

pub fn decode_id_list(payload: &[u8]) -> anyhow::Result<Vec<u64>> {
    if payload.is_empty() || payload.len() % 8 != 0 {
        return Err(anyhow!("id list payload of {} bytes is not a multiple of 8", payload.len()));
    }
    let mut r = io::Cursor::new(payload);
    let mut ids = Vec::with_capacity(payload.len() / 8);
    for _ in 0..payload.len() / 8 {
        ids.push(r.read_u64::<BigEndian>()?);
    }
    Ok(ids)
}

/// Reply payload for DEL/PAUSE: count plus the ids acted on.
pub fn encode_count_reply(ids: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + ids.len() * 8);
    buf.write_u32::<BigEndian>(ids.len() as u32).expect("writing to a Vec cannot fail");
    for id in ids {
        buf.write_u64::<BigEndian>(*id).expect("writing to a Vec cannot fail");
    }
    buf
}

pub fn decode_count_reply(payload: &[u8]) -> anyhow::Result<Vec<u64>> {
    let mut r = io::Cursor::new(payload);
    let count = r.read_u32::<BigEndian>().context("reading reply count")? as usize;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(r.read_u64::<BigEndian>().context("reading reply id")?);
    }
    Ok(ids)
}

/// One entry as reported by a GET reply: the scheduling fields, the
/// most recent execution status, and the persisted subject. Session
/// material and scheduler handles never appear here.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub id: u64,
    pub flags: EntryFlags,
    pub uid: u32,
    pub gid: u32,
    pub trigger: u32,
    pub step: u32,
    pub expire: u32,
    pub pid: u32,
    pub status: u32,
    pub exec_time: u64,
    pub latency: u64,
    pub outdata: Vec<u8>,
    pub username: String,
    pub subj: String,
}

impl EntryRecord {
    fn write_to<W>(&self, w: &mut W) -> anyhow::Result<()>
    where
        W: Write,
    {
        w.write_u64::<BigEndian>(self.id)?;
        w.write_u32::<BigEndian>(self.flags.0)?;
        w.write_u32::<BigEndian>(self.uid)?;
        w.write_u32::<BigEndian>(self.gid)?;
        w.write_u32::<BigEndian>(self.trigger)?;
        w.write_u32::<BigEndian>(self.step)?;
        w.write_u32::<BigEndian>(self.expire)?;
        w.write_u32::<BigEndian>(self.pid)?;
        w.write_u32::<BigEndian>(self.status)?;
        w.write_u64::<BigEndian>(self.exec_time)?;
        w.write_u64::<BigEndian>(self.latency)?;
        w.write_u32::<BigEndian>(self.outdata.len() as u32)?;
        w.write_all(&self.outdata)?;

        if self.username.len() >= USERNAME_SIZE {
            return Err(anyhow!("username '{}' too long for record", self.username));
        }
        let mut name = [0u8; USERNAME_SIZE];
        name[..self.username.len()].copy_from_slice(self.username.as_bytes());
        w.write_all(&name)?;

        w.write_u32::<BigEndian>(self.subj.len() as u32)?;
        w.write_all(self.subj.as_bytes())?;
        // subjects travel with their terminator so fixed size peers
        // can use them in place
        w.write_u8(0)?;

        Ok(())
    }

    fn read_from<R>(r: &mut R, limit: usize) -> anyhow::Result<Self>
    where
        R: Read,
    {
        let id = r.read_u64::<BigEndian>()?;
        let flags = EntryFlags(r.read_u32::<BigEndian>()?);
        let uid = r.read_u32::<BigEndian>()?;
        let gid = r.read_u32::<BigEndian>()?;
        let trigger = r.read_u32::<BigEndian>()?;
        let step = r.read_u32::<BigEndian>()?;
        let expire = r.read_u32::<BigEndian>()?;
        let pid = r.read_u32::<BigEndian>()?;
        let status = r.read_u32::<BigEndian>()?;
        let exec_time = r.read_u64::<BigEndian>()?;
        let latency = r.read_u64::<BigEndian>()?;

        let outdata_len = r.read_u32::<BigEndian>()? as usize;
        if outdata_len > limit {
            return Err(anyhow!("outdata of {} bytes exceeds limit of {}", outdata_len, limit));
        }
        let mut outdata = vec![0u8; outdata_len];
        r.read_exact(&mut outdata)?;

        let mut name = [0u8; USERNAME_SIZE];
        r.read_exact(&mut name)?;
        let end = name.iter().position(|b| *b == 0).unwrap_or(0);
        let username = std::str::from_utf8(&name[..end])
            .context("record username is not valid utf8")?
            .to_string();

        let subj_size = r.read_u32::<BigEndian>()? as usize;
        if subj_size > limit {
            return Err(anyhow!("subject of {} bytes exceeds limit of {}", subj_size, limit));
        }
        let mut subj = vec![0u8; subj_size + 1];
        r.read_exact(&mut subj)?;
        subj.truncate(subj_size);
        let subj = String::from_utf8(subj).context("record subject is not valid utf8")?;

        Ok(EntryRecord {
            id,
            flags,
            uid,
            gid,
            trigger,
            step,
            expire,
            pid,
            status,
            exec_time,
            latency,
            outdata,
            username,
            subj,
        })
    }
}

/// Reply payload for GET: count plus serialized records.
pub fn encode_get_reply(records: &[EntryRecord]) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(records.len() as u32)?;
    for record in records {
        record.write_to(&mut buf)?;
    }
    Ok(buf)
}

pub fn decode_get_reply(payload: &[u8], limit: usize) -> anyhow::Result<Vec<EntryRecord>> {
    let mut r = io::Cursor::new(payload);
    let count = r.read_u32::<BigEndian>().context("reading record count")? as usize;
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        records
            .push(EntryRecord::read_from(&mut r, limit).with_context(|| format!("record {i}"))?);
    }
    Ok(records)
}

/// The message the daemon writes to the executor queue when an
/// entry fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecMessage {
    pub id: u64,
    pub uid: u32,
    pub gid: u32,
    pub subj: String,
}

impl ExecMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.subj.len());
        buf.write_u64::<LittleEndian>(self.id).expect("writing to a Vec cannot fail");
        buf.write_u32::<LittleEndian>(self.uid).expect("writing to a Vec cannot fail");
        buf.write_u32::<LittleEndian>(self.gid).expect("writing to a Vec cannot fail");
        buf.extend_from_slice(self.subj.as_bytes());
        buf
    }

    pub fn decode(msg: &[u8]) -> anyhow::Result<Self> {
        let mut r = io::Cursor::new(msg);
        let id = r.read_u64::<LittleEndian>().context("reading exec message id")?;
        let uid = r.read_u32::<LittleEndian>().context("reading exec message uid")?;
        let gid = r.read_u32::<LittleEndian>().context("reading exec message gid")?;
        let subj = std::str::from_utf8(&msg[16..])
            .context("exec message subject is not valid utf8")?
            .trim_end_matches('\0')
            .to_string();
        Ok(ExecMessage { id, uid, gid, subj })
    }
}

/// The status message the executor sends back after running a job.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatMessage {
    pub id: u64,
    pub pid: u32,
    pub status: u32,
    pub exec_time_ns: u64,
    pub latency_ns: u64,
    pub outdata: Vec<u8>,
}

impl StatMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36 + self.outdata.len());
        buf.write_u64::<LittleEndian>(self.id).expect("writing to a Vec cannot fail");
        buf.write_u32::<LittleEndian>(self.pid).expect("writing to a Vec cannot fail");
        buf.write_u32::<LittleEndian>(self.status).expect("writing to a Vec cannot fail");
        buf.write_u64::<LittleEndian>(self.exec_time_ns).expect("writing to a Vec cannot fail");
        buf.write_u64::<LittleEndian>(self.latency_ns).expect("writing to a Vec cannot fail");
        buf.write_u32::<LittleEndian>(self.outdata.len() as u32)
            .expect("writing to a Vec cannot fail");
        buf.extend_from_slice(&self.outdata);
        buf
    }

    pub fn decode(msg: &[u8], limit: usize) -> anyhow::Result<Self> {
        let mut r = io::Cursor::new(msg);
        let id = r.read_u64::<LittleEndian>().context("reading stat message id")?;
        let pid = r.read_u32::<LittleEndian>().context("reading stat message pid")?;
        let status = r.read_u32::<LittleEndian>().context("reading stat message status")?;
        let exec_time_ns = r.read_u64::<LittleEndian>().context("reading exec time")?;
        let latency_ns = r.read_u64::<LittleEndian>().context("reading latency")?;
        let outdata_len = r.read_u32::<LittleEndian>().context("reading outdata length")? as usize;
        if outdata_len > limit {
            return Err(anyhow!(
                "stat outdata of {} bytes exceeds limit of {} bytes",
                outdata_len,
                limit
            ));
        }
        let mut outdata = vec![0u8; outdata_len];
        r.read_exact(&mut outdata).context("reading outdata")?;
        Ok(StatMessage { id, pid, status, exec_time_ns, latency_ns, outdata })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = EntryHeader {
            id: 0xdead_beef_cafe_f00d,
            flags: EntryFlags(EntryFlags::NEW.0 | EntryFlags::RELATIVE_TRIGGER.0),
            uid: 1001,
            gid: 1001,
            trigger: 1010,
            step: 5,
            expire: 1060,
            psize: 42,
            nonce: 7,
            username: String::from("pailes"),
        };

        let mut buf = Vec::new();
        header.write_to(&mut buf).expect("write to succeed");
        assert_eq!(buf.len(), ENTRY_HEADER_SIZE);
        // byte 31 of the username field must always be the terminator
        assert_eq!(buf[ENTRY_HEADER_SIZE - 1], 0);

        let round_tripped =
            EntryHeader::read_from(&mut io::Cursor::new(&buf)).expect("parse to succeed");
        assert_eq!(header, round_tripped);
    }

    #[test]
    fn header_rejects_long_username() {
        let header = EntryHeader {
            username: String::from_utf8(vec![b'a'; USERNAME_SIZE]).unwrap(),
            ..EntryHeader::default()
        };
        let mut buf = Vec::new();
        assert!(header.write_to(&mut buf).is_err());
    }

    #[test]
    fn local_flags_never_survive_receipt() {
        let mut flags = EntryFlags(u32::MAX);
        flags.clear_local();
        assert!(flags.contains(EntryFlags::NEW));
        assert!(flags.contains(EntryFlags::MONTHDAY_ALIGN));
        assert!(!flags.contains(EntryFlags::AUTHORIZED));
        assert!(!flags.contains(EntryFlags::FINISH));
        assert!(!flags.contains(EntryFlags::TRIGGERED));
    }

    #[test]
    fn op_counting() {
        let mut flags = EntryFlags::default();
        assert_eq!(flags.op_count(), 0);
        flags.set(EntryFlags::NEW);
        assert_eq!(flags.op_count(), 1);
        flags.set(EntryFlags::DEL);
        assert_eq!(flags.op_count(), 2);
    }

    #[test]
    fn frame_size_limit() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[1, 2, 3, 4, 5]).expect("write to succeed");
        let err = read_frame(&mut io::Cursor::new(&buf), 4).expect_err("limit to apply");
        assert!(format!("{err}").contains("exceeds size limit"));
        let ok = read_frame(&mut io::Cursor::new(&buf), 5).expect("read to succeed");
        assert_eq!(ok, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn get_reply_round_trip() {
        let records = vec![
            EntryRecord {
                id: 1,
                flags: EntryFlags::NEW,
                uid: 1000,
                gid: 1000,
                trigger: 100,
                step: 60,
                expire: 0,
                pid: 4242,
                status: 0,
                exec_time: 1_000_000,
                latency: 2_000,
                outdata: b"hi\n".to_vec(),
                username: String::from("alice"),
                subj: String::from("echo hi"),
            },
            EntryRecord { id: 2, subj: String::from("true"), ..EntryRecord::default() },
        ];

        let buf = encode_get_reply(&records).expect("encode to succeed");
        let round_tripped = decode_get_reply(&buf, 4096).expect("decode to succeed");
        assert_eq!(records, round_tripped);
    }

    #[test]
    fn stat_message_outdata_limit() {
        let msg = StatMessage {
            id: 9,
            pid: 1,
            status: 0,
            exec_time_ns: 5,
            latency_ns: 6,
            outdata: vec![0u8; 64],
        };
        let buf = msg.encode();
        assert!(StatMessage::decode(&buf, 32).is_err());
        assert_eq!(StatMessage::decode(&buf, 64).expect("decode to succeed"), msg);
    }
}
