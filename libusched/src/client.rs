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

//! The client side: parse a sentence, compile it, ship each entry
//! to the daemon, and render the replies.

use std::{
    io::{Read, Write},
    net::TcpStream,
    os::unix::net::UnixStream,
    path::Path,
    time,
};

use anyhow::{anyhow, Context};
use tracing::{debug, info};

use crate::{consts, logic, parse, sec, user};
use usched_protocol::{
    self as protocol, read_session, EntryFlags, EntryHeader, REMOTE_CRED_SENTINEL, SEAL_OVERHEAD,
    SESSION_SIZE,
};

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

struct RemoteAuth {
    username: String,
    verifier: [u8; sec::VERIFIER_SIZE],
}

/// A connection to the daemon, local or remote.
pub struct Client {
    stream: Stream,
    remote: Option<RemoteAuth>,
    uid: u32,
    gid: u32,
    username: String,
    nonce: u64,
}

impl Client {
    pub fn connect_local<P: AsRef<Path>>(sock: P) -> anyhow::Result<Client> {
        let stream = UnixStream::connect(sock.as_ref()).context("connecting to usched")?;
        stream.set_read_timeout(Some(consts::CONN_TIMEOUT))?;
        let me = user::info().context("resolving user info")?;
        Ok(Client {
            stream: Stream::Unix(stream),
            remote: None,
            uid: me.uid,
            gid: me.gid,
            username: me.user,
            nonce: 1,
        })
    }

    pub fn connect_remote(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Client> {
        let stream = TcpStream::connect((host, port))
            .with_context(|| format!("connecting to usched at {host}:{port}"))?;
        stream.set_read_timeout(Some(consts::CONN_TIMEOUT))?;
        let verifier = sec::derive_verifier(username, password)?;
        Ok(Client {
            stream: Stream::Tcp(stream),
            remote: Some(RemoteAuth { username: String::from(username), verifier }),
            uid: REMOTE_CRED_SENTINEL,
            gid: REMOTE_CRED_SENTINEL,
            username: String::from(username),
            nonce: 1,
        })
    }

    /// Ship one request and return the decrypted reply payload.
    fn submit(
        &mut self,
        flags: EntryFlags,
        trigger: u32,
        step: u32,
        expire: u32,
        payload: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let nonce = self.nonce;
        // each request burns a nonce for the payload and the next
        // one for the reply
        self.nonce += 2;

        let psize = match &self.remote {
            Some(_) => payload.len() + SEAL_OVERHEAD,
            None => payload.len(),
        };
        let header = EntryHeader {
            id: 0,
            flags,
            uid: self.uid,
            gid: self.gid,
            trigger,
            step,
            expire,
            psize: psize as u32,
            nonce,
            username: self.username.clone(),
        };

        let mut out = Vec::with_capacity(protocol::ENTRY_HEADER_SIZE + SESSION_SIZE);
        header.write_to(&mut out)?;

        match &self.remote {
            Some(auth) => {
                let (pake, opening) = sec::ClientSession::start();
                out.extend_from_slice(&opening);
                self.stream.write_all(&out).context("writing request header")?;
                self.stream.flush()?;

                let server_session = read_session(&mut self.stream)
                    .context("reading server session")?;
                let (key, proof) = pake
                    .authorize(&server_session, &auth.verifier)
                    .with_context(|| format!("authorizing as '{}'", auth.username))?;

                let sealed = key.seal(nonce, sec::DIR_CLIENT, payload)?;
                debug_assert_eq!(sealed.len(), psize);

                self.stream.write_all(&proof).context("writing session proof")?;
                self.stream.write_all(&sealed).context("writing payload")?;
                self.stream.flush()?;

                let reply = protocol::read_frame(&mut self.stream, consts::MAX_PAYLOAD_SIZE)
                    .context("reading reply")?;
                key.open(nonce + 1, sec::DIR_DAEMON, &reply).context("decrypting reply")
            }
            None => {
                out.extend_from_slice(&[0u8; SESSION_SIZE]);
                self.stream.write_all(&out).context("writing request header")?;
                self.stream.flush()?;

                let session = read_session(&mut self.stream).context("reading session")?;
                if session != [0u8; SESSION_SIZE] {
                    return Err(anyhow!("daemon sent session material on a local connection"));
                }

                self.stream.write_all(&[0u8; SESSION_SIZE]).context("writing session echo")?;
                self.stream.write_all(payload).context("writing payload")?;
                self.stream.flush()?;

                protocol::read_frame(&mut self.stream, consts::MAX_PAYLOAD_SIZE)
                    .context("reading reply")
            }
        }
    }
}

/// Parse, compile and execute one request sentence against the
/// daemon. Parse and compilation failures never touch the socket,
/// so `connect` only runs for a well formed request.
pub fn request(
    tokens: &[String],
    connect: impl FnOnce() -> anyhow::Result<Client>,
) -> anyhow::Result<()> {
    let reference = time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let req = parse::parse_tokens(tokens, reference).map_err(|e| anyhow!("{e}"))?;
    let compiled = logic::compile(&req).map_err(|e| anyhow!("{e}"))?;

    let mut client = connect()?;
    match compiled {
        logic::Compiled::Run(entries) => {
            for spec in entries {
                info!(
                    "submitting '{}' trigger={} step={} expire={}",
                    spec.subj, spec.trigger, spec.step, spec.expire
                );
                let reply = client.submit(
                    spec.flags,
                    spec.trigger,
                    spec.step,
                    spec.expire,
                    spec.subj.as_bytes(),
                )?;
                let id = protocol::decode_new_reply(&reply)?;
                println!("installed entry {id:#018x}");
            }
        }
        logic::Compiled::Stop(ids) => {
            let reply = client.submit(
                EntryFlags::DEL,
                0,
                0,
                0,
                &protocol::encode_id_list(&ids),
            )?;
            let deleted = protocol::decode_count_reply(&reply)?;
            println!("stopped {} entries", deleted.len());
            for id in deleted {
                println!("  {id:#018x}");
            }
        }
        logic::Compiled::Show(ids) => {
            let reply = client.submit(
                EntryFlags::GET,
                0,
                0,
                0,
                &protocol::encode_id_list(&ids),
            )?;
            let records = protocol::decode_get_reply(&reply, consts::MAX_PAYLOAD_SIZE)?;
            print_records(&records);
        }
    }

    debug!("request complete");
    Ok(())
}

fn print_records(records: &[protocol::EntryRecord]) {
    println!("{} entries", records.len());
    for r in records {
        println!("entry {:#018x}:", r.id);
        println!("  user:     {} (uid {}, gid {})", r.username, r.uid, r.gid);
        println!("  subject:  {}", r.subj);
        println!("  trigger:  {}", r.trigger);
        println!("  step:     {}", r.step);
        println!("  expire:   {}", r.expire);
        if r.pid != 0 {
            println!("  last run: pid {} status {}", r.pid, r.status);
            println!(
                "  timing:   exec {}us, latency {}us",
                r.exec_time / 1000,
                r.latency / 1000
            );
            if !r.outdata.is_empty() {
                println!("  output:   {}", String::from_utf8_lossy(&r.outdata));
            }
        }
    }
}
