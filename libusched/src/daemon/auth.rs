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

//! Request authorization.
//!
//! Local connections are authorized against the kernel's view of the
//! peer: the uid/gid the client wrote into the header must match
//! SO_PEERCRED exactly, or the request is treated as a protocol
//! manipulation attempt. Remote connections must present the
//! 0xffffffff credential sentinel and go through the password
//! authenticated key exchange; the authenticated user record then
//! overrides whatever the wire said.

use std::os::unix::net::UnixStream;

use anyhow::{anyhow, Context};
use nix::sys::socket::{getsockopt, sockopt};
use tracing::warn;

use crate::{sec, store::Store};
use usched_protocol::{EntryHeader, REMOTE_CRED_SENTINEL, SESSION_SIZE};

/// The OS-reported credentials of a local peer.
pub fn local_peer_creds(stream: &UnixStream) -> anyhow::Result<(u32, u32)> {
    let creds = getsockopt(stream, sockopt::PeerCredentials).context("reading SO_PEERCRED")?;
    Ok((creds.uid(), creds.gid()))
}

/// Authorize a local request: the wire credentials must match the
/// kernel's.
pub fn authorize_local(header: &EntryHeader, stream: &UnixStream) -> anyhow::Result<()> {
    let (uid, gid) = local_peer_creds(stream)?;
    if header.uid != uid || header.gid != gid {
        warn!(
            "local peer uid/gid {}/{} does not match the header's {}/{}",
            uid, gid, header.uid, header.gid
        );
        return Err(anyhow!("header credentials do not match the connecting peer"));
    }
    Ok(())
}

/// Start the remote exchange for a request: check the credential
/// sentinel, look the user up, and produce the server session reply.
pub fn remote_session_create(
    store: &Store,
    keys: &sec::KeyPair,
    header: &EntryHeader,
    client_session: &[u8; SESSION_SIZE],
) -> anyhow::Result<(crate::store::UserRecord, sec::ServerSession, [u8; SESSION_SIZE])> {
    // Remote credentials are never trusted; the user record decides.
    // Well behaved clients send the sentinel, so anything else is
    // worth a note in the log.
    if header.uid != REMOTE_CRED_SENTINEL || header.gid != REMOTE_CRED_SENTINEL {
        warn!(
            "remote request carries uid/gid {}/{} instead of the sentinel; ignoring them",
            header.uid, header.gid
        );
    }

    let user = store
        .user_lookup(&header.username)?
        .ok_or_else(|| anyhow!("unknown user '{}'", header.username))?;

    let (session, reply) = sec::ServerSession::respond(keys, client_session, &user.verifier)
        .context("starting key exchange")?;
    Ok((user, session, reply))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::Category;
    use usched_protocol::EntryFlags;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store =
            Store::open(dir.path().join("etc"), dir.path().join("run")).expect("store to open");
        (dir, store)
    }

    #[test]
    fn wire_credentials_never_win_over_the_user_record() {
        let (_dir, store) = test_store();
        store.user_add("alice", 1001, 1001, "hunter2").expect("add user");
        store.commit(Category::Users).expect("commit");

        let keys = sec::KeyPair::generate();
        // a client claiming uid 0 still authenticates as alice
        let header = EntryHeader {
            flags: EntryFlags::NEW,
            uid: 0,
            gid: 0,
            username: String::from("alice"),
            ..EntryHeader::default()
        };
        let (client, client_session) = sec::ClientSession::start();
        let (user, _, _) = remote_session_create(&store, &keys, &header, &client_session)
            .expect("session create");
        assert_eq!((user.uid, user.gid), (1001, 1001));
        drop(client);
    }

    #[test]
    fn unknown_users_are_rejected() {
        let (_dir, store) = test_store();
        let keys = sec::KeyPair::generate();
        let header = EntryHeader {
            flags: EntryFlags::NEW,
            uid: REMOTE_CRED_SENTINEL,
            gid: REMOTE_CRED_SENTINEL,
            username: String::from("mallory"),
            ..EntryHeader::default()
        };
        assert!(remote_session_create(&store, &keys, &header, &[0u8; SESSION_SIZE]).is_err());
    }

    #[test]
    fn the_full_remote_exchange_authorizes() {
        let (_dir, store) = test_store();
        store.user_add("alice", 1001, 1001, "hunter2").expect("add user");
        store.commit(Category::Users).expect("commit");

        let keys = sec::KeyPair::generate();
        let header = EntryHeader {
            flags: EntryFlags::NEW,
            uid: REMOTE_CRED_SENTINEL,
            gid: REMOTE_CRED_SENTINEL,
            username: String::from("alice"),
            ..EntryHeader::default()
        };

        let (client, client_session) = sec::ClientSession::start();
        let (user, server, reply) =
            remote_session_create(&store, &keys, &header, &client_session)
                .expect("session create");
        assert_eq!(user.uid, 1001);

        let verifier = sec::derive_verifier("alice", "hunter2").expect("verifier");
        let (_, proof) = client.authorize(&reply, &verifier).expect("authorize");
        server.verify(&proof).expect("proof to check out");
    }
}
