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

//! The connection server.
//!
//! One listening socket per family (UNIX and TCP); each accepted
//! connection gets a worker thread running the request conversation:
//!
//! ```text
//! C -> D  entry header (76) || session (64)
//! D -> C  session (64)                        zeros when local
//! C -> D  session (64) || payload (psize)
//! D -> C  u32 length || reply payload
//!         ... back to the entry header
//! ```
//!
//! While a request is being assembled its entry sits in the
//! receiving pool keyed by connection id; any error or timeout
//! drops the connection and cleans that slot. Replies are written
//! only after the pool mutation they report has landed.

use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread, time,
};

use anyhow::{anyhow, Context};
use tracing::{debug, error, info, instrument, warn};

use super::{
    auth,
    entry::{self, Entry},
    sched::Scheduler,
    Shared,
};
use crate::{config, consts, sec, store::Store};
use usched_protocol::{
    self as protocol, read_session, write_frame, EntryFlags, EntryHeader, ALL_ENTRIES,
    ENTRY_HEADER_SIZE, SESSION_SIZE,
};

/// A client connection on either socket family.
pub enum ClientStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl ClientStream {
    fn is_remote(&self) -> bool {
        matches!(self, ClientStream::Tcp(_))
    }

    fn unix(&self) -> Option<&UnixStream> {
        match self {
            ClientStream::Unix(s) => Some(s),
            ClientStream::Tcp(_) => None,
        }
    }

    fn set_timeouts(&self, timeout: time::Duration) -> io::Result<()> {
        match self {
            ClientStream::Unix(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
            ClientStream::Tcp(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(s) => s.read(buf),
            ClientStream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(s) => s.write(buf),
            ClientStream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Unix(s) => s.flush(),
            ClientStream::Tcp(s) => s.flush(),
        }
    }
}

pub struct Server {
    config: config::Config,
    store: Arc<Store>,
    keys: Arc<sec::KeyPair>,
    shared: Arc<Shared>,
    sched: Arc<Scheduler>,
    conn_counter: AtomicU64,
}

impl Server {
    pub fn new(
        config: config::Config,
        store: Arc<Store>,
        keys: Arc<sec::KeyPair>,
        shared: Arc<Shared>,
        sched: Arc<Scheduler>,
    ) -> Arc<Server> {
        Arc::new(Server { config, store, keys, shared, sched, conn_counter: AtomicU64::new(1) })
    }

    #[instrument(skip_all)]
    pub fn serve_unix(server: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        for stream in listener.incoming() {
            if server.shared.interrupted() {
                info!("unix listener interrupted");
                break;
            }
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&server);
                    thread::spawn(move || server.handle_conn(ClientStream::Unix(stream)));
                }
                Err(err) => error!("accepting unix stream: {:?}", err),
            }
        }
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn serve_tcp(server: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        for stream in listener.incoming() {
            if server.shared.interrupted() {
                info!("tcp listener interrupted");
                break;
            }
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&server);
                    thread::spawn(move || server.handle_conn(ClientStream::Tcp(stream)));
                }
                Err(err) => error!("accepting tcp stream: {:?}", err),
            }
        }
        Ok(())
    }

    fn handle_conn(&self, mut stream: ClientStream) {
        let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_timeouts(self.config.conn_timeout()) {
            warn!("cid {}: setting timeouts: {}", conn_id, e);
            return;
        }

        let res = self.conn_loop(&mut stream, conn_id);
        // drop whatever this connection was still assembling
        if self.shared.rpool.remove(conn_id) {
            debug!("cid {}: cleaned residual receiving entry", conn_id);
        }
        match res {
            Ok(()) => debug!("cid {}: connection closed", conn_id),
            Err(e) => info!("cid {}: connection dropped: {:?}", conn_id, e),
        }
    }

    #[instrument(skip_all, fields(cid = conn_id))]
    fn conn_loop(&self, stream: &mut ClientStream, conn_id: u64) -> anyhow::Result<()> {
        let mut last_nonce: Option<u64> = None;
        loop {
            if self.shared.interrupted() {
                return Ok(());
            }

            let mut raw = [0u8; ENTRY_HEADER_SIZE];
            match stream.read_exact(&mut raw) {
                Ok(()) => {}
                // the peer closing between requests is the normal end
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e).context("reading entry header"),
            }
            let mut header = EntryHeader::read_from(&mut io::Cursor::new(&raw[..]))
                .context("decoding entry header")?;
            entry::sanitize_header(&mut header, consts::MAX_PAYLOAD_SIZE)?;
            let client_session = read_session(stream).context("reading client session")?;

            let staged = Entry::from_header(conn_id, &header);
            self.shared
                .rpool
                .insert(staged)
                .map_err(|_| anyhow!("a request is already in flight on this connection"))?;

            let res = self.serve_request(stream, conn_id, &header, &client_session, &mut last_nonce);
            // the NEW path moves the entry to the active pool; any
            // other outcome leaves it here to be discarded
            self.shared.rpool.remove(conn_id);
            res?;
        }
    }

    fn serve_request(
        &self,
        stream: &mut ClientStream,
        conn_id: u64,
        header: &EntryHeader,
        client_session: &[u8; SESSION_SIZE],
        last_nonce: &mut Option<u64>,
    ) -> anyhow::Result<()> {
        let (payload, session_key) = if stream.is_remote() {
            if let Some(last) = *last_nonce {
                if header.nonce <= last {
                    return Err(anyhow!(
                        "nonce {} does not advance past {} (replay?)",
                        header.nonce,
                        last
                    ));
                }
            }

            let (user, server_session, reply) =
                auth::remote_session_create(&self.store, &self.keys, header, client_session)?;
            stream.write_all(&reply).context("writing session reply")?;
            stream.flush()?;

            let proof = read_session(stream).context("reading session proof")?;
            let sealed = read_payload(stream, header.psize as usize)?;

            let key = session_key_or_drop(server_session, &proof)?;
            self.shared
                .rpool
                .with_entry(conn_id, |e| {
                    e.flags.set(EntryFlags::INIT);
                    e.flags.set(EntryFlags::AUTHORIZED);
                    e.uid = user.uid;
                    e.gid = user.gid;
                    e.username = user.username.clone();
                })
                .ok_or_else(|| anyhow!("staging entry disappeared"))?;

            let clear = key
                .open(header.nonce, sec::DIR_CLIENT, &sealed)
                .context("decrypting request payload")?;
            *last_nonce = Some(header.nonce);
            (clear, Some(key))
        } else {
            // local sessions carry no key material in either
            // direction
            stream.write_all(&[0u8; SESSION_SIZE]).context("writing empty session")?;
            stream.flush()?;

            let _echo = read_session(stream).context("reading session echo")?;
            let payload = read_payload(stream, header.psize as usize)?;

            let unix = stream.unix().expect("local connections are unix sockets");
            auth::authorize_local(header, unix)?;
            self.shared
                .rpool
                .with_entry(conn_id, |e| {
                    e.flags.set(EntryFlags::INIT);
                    e.flags.set(EntryFlags::AUTHORIZED);
                })
                .ok_or_else(|| anyhow!("staging entry disappeared"))?;
            (payload, None)
        };

        // assembly is complete; the request record leaves the
        // receiving pool for good
        let mut staged = self
            .shared
            .rpool
            .pop(conn_id)
            .ok_or_else(|| anyhow!("staging entry disappeared"))?;
        if !staged.flags.contains(EntryFlags::AUTHORIZED) {
            return Err(anyhow!("request reached dispatch without authorization"));
        }
        staged.flags.set(EntryFlags::FINISH);

        let reply = if staged.flags.contains(EntryFlags::NEW) {
            self.op_new(staged, &payload)?
        } else if staged.flags.contains(EntryFlags::DEL) {
            self.op_del(&staged, &payload)?
        } else if staged.flags.contains(EntryFlags::PAUSE) {
            self.op_pause(&staged, &payload)?
        } else if staged.flags.contains(EntryFlags::GET) {
            self.op_get(&staged, &payload)?
        } else {
            return Err(anyhow!("request carries no operation"));
        };

        let out = match &session_key {
            Some(key) => key
                .seal(header.nonce.wrapping_add(1), sec::DIR_DAEMON, &reply)
                .context("encrypting reply")?,
            None => reply,
        };
        write_frame(stream, &out).context("writing reply")?;
        stream.flush().context("flushing reply")?;
        Ok(())
    }

    /// Admit a NEW entry: adopt the subject, assign a unique id, arm
    /// the trigger and move the entry into the active pool. Any
    /// failure after arming disarms again so no orphan trigger is
    /// left behind.
    pub(crate) fn op_new(&self, mut entry: Entry, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let subj = std::str::from_utf8(payload)
            .context("subject is not valid utf8")?
            .trim_end_matches('\0');
        if subj.is_empty() {
            return Err(anyhow!("empty subject"));
        }
        // the subject must survive the trip through the exec queue
        if subj.len() + 16 > self.config.queue_msgsize() {
            return Err(anyhow!(
                "subject of {} bytes cannot fit the executor queue geometry",
                subj.len()
            ));
        }
        entry.subj = String::from(subj);

        entry::check_admission(&entry, unix_now())?;

        let mut id = entry::hash_id(&entry);
        while self.shared.apool.contains(id) {
            id = entry::hash_id(&entry);
        }
        entry.id = id;

        let handle = self
            .sched
            .arm(
                entry.trigger,
                entry.step,
                entry.expire,
                id,
                entry.flags.contains(EntryFlags::MONTHDAY_ALIGN),
                entry.flags.contains(EntryFlags::YEARDAY_ALIGN),
            )
            .context("arming entry")?;
        entry.psched_id = handle;

        if self.shared.apool.insert(entry).is_err() {
            if !self.sched.disarm(handle) {
                // a handle we just armed and cannot find again means
                // the scheduler state is compromised; drain and let
                // the supervisor respawn us
                error!("armed handle {} vanished during admission", handle);
                self.shared.set_fatal();
            }
            return Err(anyhow!("entry id {:#018x} collided at insertion", id));
        }
        self.shared.signal_serialize();
        info!("admitted entry {:#018x}", id);

        Ok(protocol::encode_new_reply(id))
    }

    /// Remove the requester's listed entries. Ids that don't exist,
    /// belong to someone else, or are still being processed are
    /// skipped; the reply reports what was actually removed.
    pub(crate) fn op_del(&self, carrier: &Entry, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let ids = self.expand_id_list(carrier.uid, payload)?;

        let mut deleted = Vec::new();
        for id in ids {
            let handle = self.shared.apool.with_all(|entries| {
                let removable = match entries.get(&id) {
                    Some(e) if e.uid != carrier.uid => {
                        warn!(
                            "unauthorized delete of {:#018x} (owner {}, requester {})",
                            id, e.uid, carrier.uid
                        );
                        false
                    }
                    Some(e) if !e.flags.contains(EntryFlags::FINISH) => {
                        warn!("entry {:#018x} is still being processed", id);
                        false
                    }
                    Some(_) => true,
                    None => {
                        debug!("delete of unknown entry {:#018x}", id);
                        false
                    }
                };
                if removable {
                    entries.remove(&id).map(|e| e.psched_id)
                } else {
                    None
                }
            });
            if let Some(handle) = handle {
                if handle != 0 {
                    self.sched.disarm(handle);
                }
                deleted.push(id);
            }
        }

        if !deleted.is_empty() {
            self.shared.signal_serialize();
        }
        info!("deleted {} entries for uid {}", deleted.len(), carrier.uid);
        Ok(protocol::encode_count_reply(&deleted))
    }

    /// Disarm the requester's listed entries without removing them.
    pub(crate) fn op_pause(&self, carrier: &Entry, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let ids = self.expand_id_list(carrier.uid, payload)?;

        let mut paused = Vec::new();
        for id in ids {
            let handle = self.shared.apool.with_all(|entries| match entries.get_mut(&id) {
                Some(e)
                    if e.uid == carrier.uid
                        && e.flags.contains(EntryFlags::FINISH)
                        && e.psched_id != 0 =>
                {
                    let handle = e.psched_id;
                    e.psched_id = 0;
                    e.flags.set(EntryFlags::PAUSE);
                    Some(handle)
                }
                _ => None,
            });
            if let Some(handle) = handle {
                self.sched.disarm(handle);
                paused.push(id);
            }
        }

        if !paused.is_empty() {
            self.shared.signal_serialize();
        }
        info!("paused {} entries for uid {}", paused.len(), carrier.uid);
        Ok(protocol::encode_count_reply(&paused))
    }

    /// Report the requester's listed entries. Only non-sensitive
    /// fields are copied out.
    pub(crate) fn op_get(&self, carrier: &Entry, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let ids = self.expand_id_list(carrier.uid, payload)?;

        let mut records = Vec::new();
        for id in ids {
            match self.shared.apool.get_copy(id) {
                Some(e) if e.uid == carrier.uid => records.push(e.to_record()),
                Some(e) => {
                    warn!(
                        "unauthorized show of {:#018x} (owner {}, requester {})",
                        id, e.uid, carrier.uid
                    );
                }
                None => debug!("show of unknown entry {:#018x}", id),
            }
        }

        protocol::encode_get_reply(&records)
    }

    /// Decode a request id list, expanding the "all entries" marker
    /// into everything the requester owns.
    fn expand_id_list(&self, uid: u32, payload: &[u8]) -> anyhow::Result<Vec<u64>> {
        let ids = protocol::decode_id_list(payload).context("decoding id list")?;
        if ids.len() == 1 && ids[0] == ALL_ENTRIES {
            return Ok(self.shared.apool.ids_owned_by(uid));
        }
        Ok(ids)
    }
}

fn session_key_or_drop(
    session: sec::ServerSession,
    proof: &[u8; SESSION_SIZE],
) -> anyhow::Result<sec::SessionKey> {
    session.verify(proof).context("verifying session proof")
}

fn read_payload(stream: &mut impl Read, psize: usize) -> anyhow::Result<Vec<u8>> {
    let mut payload = vec![0u8; psize];
    stream.read_exact(&mut payload).context("reading request payload")?;
    Ok(payload)
}

pub(crate) fn unix_now() -> u32 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    fn test_server() -> (tempfile::TempDir, Arc<Server>) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = Arc::new(
            Store::open(dir.path().join("etc"), dir.path().to_path_buf()).expect("store"),
        );
        let keys = Arc::new(sec::KeyPair::generate());
        let (tx, _rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::new(tx));
        let sched = Arc::new(Scheduler::new(1, Box::new(|_| {})));
        let server = Server::new(config::Config::default(), store, keys, shared, sched);
        (dir, server)
    }

    fn armed_entry(server: &Server, uid: u32, subj: &str) -> u64 {
        // the connection loop marks carriers AUTHORIZED and FINISH
        // before dispatching
        let mut flags = EntryFlags::NEW;
        flags.set(EntryFlags::AUTHORIZED);
        flags.set(EntryFlags::FINISH);
        let carrier = Entry {
            uid,
            gid: uid,
            flags,
            trigger: unix_now() + 3600,
            ..Entry::default()
        };
        let reply = server.op_new(carrier, subj.as_bytes()).expect("op_new");
        protocol::decode_new_reply(&reply).expect("assigned id")
    }

    fn carrier(uid: u32) -> Entry {
        let mut flags = EntryFlags::DEL;
        flags.set(EntryFlags::AUTHORIZED);
        flags.set(EntryFlags::FINISH);
        Entry { uid, gid: uid, flags, ..Entry::default() }
    }

    #[test]
    #[timeout(30000)]
    fn new_assigns_unique_ids_and_arms() {
        let (_dir, server) = test_server();

        let a = armed_entry(&server, 1001, "echo a");
        let b = armed_entry(&server, 1001, "echo a");
        assert_ne!(a, b);
        assert_eq!(server.shared.apool.count(), 2);

        let entry = server.shared.apool.get_copy(a).expect("entry in pool");
        assert_ne!(entry.psched_id, 0, "admitted entries are armed");
        assert!(entry.flags.contains(EntryFlags::FINISH));
        assert_eq!(server.sched.armed_count(), 2);
    }

    #[test]
    #[timeout(30000)]
    fn new_rejects_misaligned_calendar_steps() {
        let (_dir, server) = test_server();
        let mut flags = EntryFlags::NEW;
        flags.set(EntryFlags::MONTHDAY_ALIGN);
        let carrier = Entry {
            uid: 1001,
            flags,
            trigger: unix_now() + 60,
            step: consts::MONTH_SECS + 7,
            ..Entry::default()
        };
        let err = server.op_new(carrier, b"echo x").expect_err("misaligned step");
        assert!(format!("{err}").contains("whole number of months"));
        assert_eq!(server.sched.armed_count(), 0, "nothing may stay armed");
    }

    #[test]
    #[timeout(30000)]
    fn del_only_touches_the_requesters_entries() {
        let (_dir, server) = test_server();
        let owned = armed_entry(&server, 1001, "echo mine");
        let other = armed_entry(&server, 1002, "echo theirs");

        // 1002 tries to delete 1001's entry
        let reply = server
            .op_del(&carrier(1002), &protocol::encode_id_list(&[owned]))
            .expect("op_del");
        assert_eq!(protocol::decode_count_reply(&reply).expect("reply"), Vec::<u64>::new());
        assert!(server.shared.apool.contains(owned), "foreign entries stay armed");

        // deleting everything of 1001's only removes 1001's
        let reply = server
            .op_del(&carrier(1001), &protocol::encode_id_list(&[ALL_ENTRIES]))
            .expect("op_del");
        assert_eq!(protocol::decode_count_reply(&reply).expect("reply"), vec![owned]);
        assert!(!server.shared.apool.contains(owned));
        assert!(server.shared.apool.contains(other));
    }

    #[test]
    #[timeout(30000)]
    fn get_reports_only_owned_entries() {
        let (_dir, server) = test_server();
        let owned = armed_entry(&server, 1001, "echo mine");
        let _other = armed_entry(&server, 1002, "echo theirs");

        let mut c = carrier(1001);
        c.flags = EntryFlags::GET;
        let reply = server
            .op_get(&c, &protocol::encode_id_list(&[ALL_ENTRIES]))
            .expect("op_get");
        let records = protocol::decode_get_reply(&reply, consts::MAX_PAYLOAD_SIZE).expect("decode");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, owned);
        assert_eq!(records[0].subj, "echo mine");
    }

    #[test]
    #[timeout(30000)]
    fn pause_disarms_but_keeps_the_entry() {
        let (_dir, server) = test_server();
        let owned = armed_entry(&server, 1001, "echo mine");

        let mut c = carrier(1001);
        c.flags = EntryFlags::PAUSE;
        let reply = server
            .op_pause(&c, &protocol::encode_id_list(&[owned]))
            .expect("op_pause");
        assert_eq!(protocol::decode_count_reply(&reply).expect("reply"), vec![owned]);

        let entry = server.shared.apool.get_copy(owned).expect("entry stays");
        assert_eq!(entry.psched_id, 0);
        assert!(entry.flags.contains(EntryFlags::PAUSE));
        assert_eq!(server.sched.armed_count(), 0);

        // pausing again is a no-op, not an error
        let reply = server
            .op_pause(&c, &protocol::encode_id_list(&[owned]))
            .expect("op_pause");
        assert_eq!(protocol::decode_count_reply(&reply).expect("reply"), Vec::<u64>::new());
    }

    #[test]
    #[timeout(30000)]
    fn local_round_trip_over_a_socketpair() {
        let (_dir, server) = test_server();
        let (daemon_side, mut client_side) =
            UnixStream::pair().expect("socketpair");

        let srv = Arc::clone(&server);
        let handle = thread::spawn(move || {
            srv.handle_conn(ClientStream::Unix(daemon_side));
        });

        // our own credentials are what SO_PEERCRED reports for a
        // socketpair
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let subj = b"echo hi";
        let header = EntryHeader {
            id: 0,
            flags: EntryFlags::NEW,
            uid,
            gid,
            trigger: unix_now() + 3600,
            step: 0,
            expire: 0,
            psize: subj.len() as u32,
            nonce: 1,
            username: String::from("local"),
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).expect("header encode");
        buf.extend_from_slice(&[0u8; SESSION_SIZE]);
        client_side.write_all(&buf).expect("send header+session");

        let session = read_session(&mut client_side).expect("session reply");
        assert_eq!(session, [0u8; SESSION_SIZE], "local sessions are empty");

        client_side.write_all(&[0u8; SESSION_SIZE]).expect("session echo");
        client_side.write_all(subj).expect("payload");

        let reply =
            protocol::read_frame(&mut client_side, consts::MAX_PAYLOAD_SIZE).expect("reply frame");
        let id = protocol::decode_new_reply(&reply).expect("assigned id");
        assert!(server.shared.apool.contains(id), "entry admitted before the reply");

        drop(client_side);
        handle.join().expect("conn thread");
    }
}
