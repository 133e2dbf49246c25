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

//! The daemon runtime.
//!
//! Owns every long lived piece: the pools, the scheduler, the
//! marshal and its monitor, the IPC queues, the stat collector, the
//! clock monitor, and the two listeners. There is no global state;
//! everything threads through explicit handles.

use std::{
    fs,
    net::{TcpListener, TcpStream},
    os::unix::{
        fs::PermissionsExt as _,
        net::{UnixListener, UnixStream},
    },
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    thread, time,
};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, instrument, warn};

pub(crate) mod auth;
mod clock;
pub(crate) mod entry;
mod ipc;
mod marshal;
pub(crate) mod pool;
pub(crate) mod sched;
mod server;
mod signals;
mod stat;

use crate::{config, consts, sec, store::Store};
use marshal::Marshal;
use pool::EntryPool;
use sched::Scheduler;
use usched_protocol::{EntryFlags, ExecMessage};

/// State shared between the connection server, the scheduler's
/// dispatch workers, and the background monitors.
pub(crate) struct Shared {
    pub rpool: EntryPool,
    pub apool: Arc<EntryPool>,
    pub terminate: Arc<AtomicBool>,
    pub fatal: Arc<AtomicBool>,
    serialize: Arc<AtomicBool>,
    pub delta_last: Arc<AtomicI64>,
    pub pending_delta: Arc<AtomicI64>,
    marshal_tx: Sender<()>,
}

impl Shared {
    pub fn new(marshal_tx: Sender<()>) -> Shared {
        Shared {
            rpool: EntryPool::new("rpool"),
            apool: Arc::new(EntryPool::new("apool")),
            terminate: Arc::new(AtomicBool::new(false)),
            fatal: Arc::new(AtomicBool::new(false)),
            serialize: Arc::new(AtomicBool::new(false)),
            delta_last: Arc::new(AtomicI64::new(0)),
            pending_delta: Arc::new(AtomicI64::new(0)),
            marshal_tx,
        }
    }

    /// Note a pool mutation and wake the marshal monitor.
    pub fn signal_serialize(&self) {
        self.serialize.store(true, Ordering::Release);
        let _ = self.marshal_tx.send(());
    }

    fn take_serialize(&self) -> bool {
        self.serialize.swap(false, Ordering::AcqRel)
    }

    pub fn interrupted(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Atomically flag termination and wake the monitors. Listener
    /// threads are woken separately by poking their sockets.
    pub fn interrupt(&self) {
        self.terminate.store(true, Ordering::Release);
        let _ = self.marshal_tx.send(());
    }

    /// An invariant was violated mid-dispatch. Flag it, drain, and
    /// let the supervisor respawn us.
    pub fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
        self.interrupt();
    }
}

/// Build the scheduler dispatch callback: on every firing, write an
/// exec message for the executor and fold the scheduler's post-fire
/// state back into the pool entry.
fn make_dispatcher(shared: Arc<Shared>, exec_q: ipc::MessageQueue) -> sched::DispatchFn {
    Box::new(move |ev| {
        let msg = shared
            .apool
            .with_entry(ev.entry_id, |e| {
                if !e.flags.contains(EntryFlags::AUTHORIZED) {
                    warn!("unauthorized entry {:#018x} fired, discarding", e.id);
                    return None;
                }
                e.flags.set(EntryFlags::TRIGGERED);
                if let Some((trigger, step, expire)) = ev.next {
                    e.trigger = trigger;
                    e.step = step;
                    e.expire = expire;
                } else {
                    e.psched_id = 0;
                }
                Some(ExecMessage { id: e.id, uid: e.uid, gid: e.gid, subj: e.subj.clone() })
            })
            .flatten();

        let Some(msg) = msg else {
            // DEL can race an in-flight firing; the entry is simply
            // gone by the time we run
            info!("fired entry {:#018x} is no longer pooled", ev.entry_id);
            return;
        };

        info!(
            "dispatching entry {:#018x} ({}us late)",
            msg.id,
            ev.latency.as_micros()
        );
        if let Err(e) = exec_q.send(&msg.encode()) {
            // the entry stays pooled; a recurrent trigger retries on
            // its next firing
            warn!("exec queue send for {:#018x}: {:?}", msg.id, e);
        }

        if ev.next.is_none() {
            shared.apool.remove(ev.entry_id);
        }
        shared.signal_serialize();
    })
}

/// The marshal monitor: wait for serialize signals, snapshot the
/// pool, and propagate any pending clock compensation into the
/// armed triggers. Runs one final snapshot at termination.
fn marshal_monitor(
    marshal: &Marshal,
    shared: &Shared,
    sched: &Scheduler,
    rx: Receiver<()>,
) {
    info!("marshal monitor running");
    loop {
        let msg = rx.recv_timeout(time::Duration::from_millis(500));
        let terminated = shared.interrupted();

        if shared.take_serialize() || terminated {
            let delta = shared.pending_delta.swap(0, Ordering::AcqRel);
            match marshal.serialize(&shared.apool, delta, u64::from(server::unix_now())) {
                Ok(compensated) => {
                    if delta != 0 && !compensated.is_empty() {
                        sched.compensate(delta, &compensated);
                    }
                    info!("active pool serialized");
                }
                Err(e) => {
                    error!("serializing active pool: {:?}", e);
                    // leave the flag set; the next tick retries
                    shared.serialize.store(true, Ordering::Release);
                }
            }
        }

        if terminated || matches!(msg, Err(RecvTimeoutError::Disconnected)) {
            break;
        }
    }
    info!("marshal monitor exiting");
}

fn wake_listeners(socket: &PathBuf, tcp: Option<u16>) {
    // a throwaway connection gets a blocked accept loop to re-check
    // the terminate flag
    let _ = UnixStream::connect(socket);
    if let Some(port) = tcp {
        let _ = TcpStream::connect(("127.0.0.1", port));
    }
}

#[instrument(skip_all)]
pub fn run(
    config: config::Config,
    runtime_dir: PathBuf,
    socket: PathBuf,
) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    fs::create_dir_all(&runtime_dir).context("creating runtime dir")?;
    let pid_path = runtime_dir.join(consts::PID_FILE);
    fs::write(&pid_path, format!("{}\n", std::process::id())).context("writing pid file")?;

    let config_base = config
        .config_base
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| runtime_dir.join("etc"));
    let store = Arc::new(
        Store::open(config_base.clone(), runtime_dir.clone()).context("opening config store")?,
    );
    let keys = Arc::new(
        sec::KeyPair::load_or_generate(&config_base.join("keys")).context("loading keys")?,
    );

    let serialize_file = config
        .serialize_file
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| runtime_dir.join(consts::SERIALIZE_FILE));
    let marshal = Arc::new(
        Marshal::open(serialize_file, config.serialize_backups.unwrap_or(false))
            .context("opening serialization file")?,
    );

    let (marshal_tx, marshal_rx) = crossbeam_channel::unbounded();
    let shared = Arc::new(Shared::new(marshal_tx));

    let exec_q = ipc::MessageQueue::open(
        &config.exec_queue(),
        true,
        config.queue_msgmax(),
        config.queue_msgsize(),
    )
    .context("opening exec queue")?;
    let sched = Arc::new(Scheduler::new(
        config.sched_workers(),
        make_dispatcher(Arc::clone(&shared), exec_q),
    ));

    // Rebuild the pool before accepting connections. A failure to
    // re-arm is a data integrity problem, so it aborts startup.
    marshal
        .reload(&shared.apool, u64::from(server::unix_now()), |e| {
            sched.arm(
                e.trigger,
                e.step,
                e.expire,
                e.id,
                e.flags.contains(EntryFlags::MONTHDAY_ALIGN),
                e.flags.contains(EntryFlags::YEARDAY_ALIGN),
            )
        })
        .context("reloading the active pool")?;

    // stat collector
    let stat_q = ipc::MessageQueue::open(
        &config.stat_queue(),
        false,
        config.queue_msgmax(),
        config.queue_msgsize(),
    )
    .context("opening stat queue")?;
    let stat_pool = Arc::new(stat::StatPool::new());
    let stat_handle = {
        let apool = Arc::clone(&shared.apool);
        let stats = Arc::clone(&stat_pool);
        let terminate = Arc::clone(&shared.terminate);
        thread::Builder::new()
            .name(String::from("stat-collector"))
            .spawn(move || stat::run_collector(stat_q, apool, stats, terminate))
            .context("spawning stat collector")?
    };

    let reporter_handle = match &config.report_pipe {
        Some(pipe) => {
            let pipe = PathBuf::from(pipe);
            let mode = config
                .report_pipe_mode
                .as_deref()
                .map(|m| u32::from_str_radix(m.trim_start_matches("0o"), 8))
                .transpose()
                .context("parsing report_pipe_mode")?
                .unwrap_or(0o644);
            let stats = Arc::clone(&stat_pool);
            let terminate = Arc::clone(&shared.terminate);
            Some(
                thread::Builder::new()
                    .name(String::from("stat-reporter"))
                    .spawn(move || {
                        if let Err(e) = stat::run_reporter(&pipe, mode, stats, terminate) {
                            error!("stat reporter: {:?}", e);
                        }
                    })
                    .context("spawning stat reporter")?,
            )
        }
        None => None,
    };

    // clock drift monitor
    let clock_handle = {
        let delta_last = Arc::clone(&shared.delta_last);
        let terminate = Arc::clone(&shared.terminate);
        let pending = Arc::clone(&shared.pending_delta);
        let drift_shared = Arc::clone(&shared);
        let drift_sched = Arc::clone(&sched);
        thread::Builder::new()
            .name(String::from("clock-monitor"))
            .spawn(move || {
                clock::run_monitor(delta_last, terminate, move |change| {
                    pending.fetch_add(change, Ordering::AcqRel);
                    drift_shared.signal_serialize();
                    drift_sched.poke();
                })
            })
            .context("spawning clock monitor")?
    };

    // marshal monitor
    let monitor_handle = {
        let marshal = Arc::clone(&marshal);
        let shared = Arc::clone(&shared);
        let sched = Arc::clone(&sched);
        thread::Builder::new()
            .name(String::from("marshal-monitor"))
            .spawn(move || marshal_monitor(&marshal, &shared, &sched, marshal_rx))
            .context("spawning marshal monitor")?
    };

    // listeners
    if socket.exists() {
        fs::remove_file(&socket).context("removing stale socket")?;
    }
    let listener = UnixListener::bind(&socket).context("binding unix socket")?;
    fs::set_permissions(&socket, fs::Permissions::from_mode(0o666))
        .context("opening socket permissions")?;

    let server = server::Server::new(
        config.clone(),
        Arc::clone(&store),
        keys,
        Arc::clone(&shared),
        Arc::clone(&sched),
    );

    let tcp_port = config.tcp_addr.as_ref().map(|_| config.tcp_port());
    let tcp_handle = match &config.tcp_addr {
        Some(addr) => {
            let tcp_listener = TcpListener::bind((addr.as_str(), config.tcp_port()))
                .with_context(|| format!("binding tcp {}:{}", addr, config.tcp_port()))?;
            info!("listening on {}:{}", addr, config.tcp_port());
            let server = Arc::clone(&server);
            Some(
                thread::Builder::new()
                    .name(String::from("tcp-listener"))
                    .spawn(move || {
                        if let Err(e) = server::Server::serve_tcp(server, tcp_listener) {
                            error!("tcp listener: {:?}", e);
                        }
                    })
                    .context("spawning tcp listener")?,
            )
        }
        None => None,
    };

    // signal handling: flag the runtime and wake the accept loops
    {
        let shared = Arc::clone(&shared);
        let socket = socket.clone();
        signals::Handler::new(move || {
            shared.interrupt();
            wake_listeners(&socket, tcp_port);
        })
        .spawn()?;
    }

    info!("listening on {:?}", socket);
    server::Server::serve_unix(server, listener)?;

    // ---- shutdown ----
    info!("draining for shutdown");
    shared.interrupt();
    wake_listeners(&socket, tcp_port);

    if let Some(handle) = tcp_handle {
        if handle.join().is_err() {
            error!("tcp listener panicked");
        }
    }
    if monitor_handle.join().is_err() {
        error!("marshal monitor panicked");
    }
    if stat_handle.join().is_err() {
        error!("stat collector panicked");
    }
    if let Some(handle) = reporter_handle {
        if handle.join().is_err() {
            error!("stat reporter panicked");
        }
    }
    if clock_handle.join().is_err() {
        error!("clock monitor panicked");
    }

    sched.shutdown();

    ipc::MessageQueue::unlink(&config.exec_queue());
    ipc::MessageQueue::unlink(&config.stat_queue());
    let _ = fs::remove_file(&socket);
    let _ = fs::remove_file(&pid_path);

    if shared.fatal.load(Ordering::Acquire) {
        return Err(anyhow::anyhow!(
            "daemon drained after a fatal invariant violation"
        ));
    }
    Ok(())
}
