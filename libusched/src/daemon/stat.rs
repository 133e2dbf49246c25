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

//! The stat collector.
//!
//! The executor reports each finished job on the stat queue. The
//! collector drains it, updates the most recent execution fields of
//! the matching active pool entry, and keeps aggregate counters. A
//! reporter thread periodically renders the aggregates into a named
//! pipe for operators to tail.

use std::{
    collections::HashMap,
    fmt::Write as _,
    io::Write as _,
    os::unix::fs::OpenOptionsExt as _,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread, time,
};

use anyhow::Context;
use nix::sys::stat::Mode;
use tracing::{debug, info, warn};

use super::{ipc::MessageQueue, pool::EntryPool};
use crate::consts;
use usched_protocol::StatMessage;

const IDLE_POLL: time::Duration = time::Duration::from_millis(50);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub runs: u64,
    pub ok: u64,
    pub failed: u64,
    pub latency_min: u64,
    pub latency_max: u64,
    pub latency_total: u64,
    pub exec_min: u64,
    pub exec_max: u64,
    pub exec_total: u64,
}

impl Aggregate {
    fn update(&mut self, msg: &StatMessage) {
        self.runs += 1;
        if msg.status == 0 {
            self.ok += 1;
        } else {
            self.failed += 1;
        }
        if self.runs == 1 {
            self.latency_min = msg.latency_ns;
            self.exec_min = msg.exec_time_ns;
        } else {
            self.latency_min = self.latency_min.min(msg.latency_ns);
            self.exec_min = self.exec_min.min(msg.exec_time_ns);
        }
        self.latency_max = self.latency_max.max(msg.latency_ns);
        self.exec_max = self.exec_max.max(msg.exec_time_ns);
        self.latency_total += msg.latency_ns;
        self.exec_total += msg.exec_time_ns;
    }
}

#[derive(Default)]
pub struct StatPool {
    aggregates: Mutex<HashMap<u64, Aggregate>>,
}

impl StatPool {
    pub fn new() -> StatPool {
        StatPool::default()
    }

    pub fn update(&self, msg: &StatMessage) {
        let mut aggregates = self.aggregates.lock().unwrap();
        aggregates.entry(msg.id).or_default().update(msg);
    }

    pub fn get(&self, id: u64) -> Option<Aggregate> {
        self.aggregates.lock().unwrap().get(&id).cloned()
    }

    /// Render the human readable report the reporter dumps into the
    /// pipe.
    pub fn render_report(&self) -> String {
        let aggregates = self.aggregates.lock().unwrap();
        let mut out = String::new();
        let _ = writeln!(out, "entry               runs       ok     fail  lat(min/avg/max us)  exec(min/avg/max us)");
        let mut ids: Vec<u64> = aggregates.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let a = &aggregates[&id];
            let _ = writeln!(
                out,
                "{:#018x} {:8} {:8} {:8}  {}/{}/{}  {}/{}/{}",
                id,
                a.runs,
                a.ok,
                a.failed,
                a.latency_min / 1000,
                a.latency_total / a.runs.max(1) / 1000,
                a.latency_max / 1000,
                a.exec_min / 1000,
                a.exec_total / a.runs.max(1) / 1000,
                a.exec_max / 1000,
            );
        }
        out
    }
}

/// Apply one stat message to the live entry it belongs to.
pub fn apply(apool: &EntryPool, stats: &StatPool, msg: &StatMessage) -> bool {
    let found = apool
        .with_entry(msg.id, |entry| {
            entry.pid = msg.pid;
            entry.status = msg.status;
            entry.exec_time = msg.exec_time_ns;
            entry.latency = msg.latency_ns;
            entry.outdata = msg.outdata.clone();
            entry.outdata.truncate(consts::MAX_OUTDATA_SIZE);
        })
        .is_some();
    if found {
        stats.update(msg);
        debug!("entry {:#018x} updated (status {})", msg.id, msg.status);
    } else {
        // one shots may complete after their entry retires
        warn!("stat report for unknown entry {:#018x}", msg.id);
    }
    found
}

/// The collector loop: drain the stat queue until the runtime is
/// interrupted and the queue runs dry.
pub fn run_collector(
    queue: MessageQueue,
    apool: Arc<EntryPool>,
    stats: Arc<StatPool>,
    terminate: Arc<AtomicBool>,
) {
    info!("stat collector running");
    loop {
        match queue.recv() {
            Ok(Some(raw)) => match StatMessage::decode(&raw, consts::MAX_OUTDATA_SIZE) {
                Ok(msg) => {
                    apply(&apool, &stats, &msg);
                }
                Err(e) => warn!("discarding malformed stat message: {:?}", e),
            },
            Ok(None) => {
                if terminate.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(IDLE_POLL);
            }
            Err(e) => {
                warn!("stat queue receive: {:?}", e);
                thread::sleep(IDLE_POLL);
            }
        }
    }
    info!("stat collector exiting");
}

/// The reporter loop: periodically rewrite the report pipe. The
/// pipe is opened non-blocking so a missing reader just skips a
/// cycle.
pub fn run_reporter(
    pipe: &Path,
    mode: u32,
    stats: Arc<StatPool>,
    terminate: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    match nix::unistd::mkfifo(pipe, Mode::from_bits_truncate(mode)) {
        Ok(()) => info!("created report pipe {:?}", pipe),
        Err(nix::errno::Errno::EEXIST) => {}
        Err(e) => return Err(e).with_context(|| format!("creating report pipe {pipe:?}")),
    }

    let mut last_dump = time::Instant::now();
    while !terminate.load(Ordering::Acquire) {
        thread::sleep(time::Duration::from_millis(200));
        if last_dump.elapsed() < consts::REPORT_INTERVAL {
            continue;
        }
        last_dump = time::Instant::now();

        // O_NONBLOCK write open fails with ENXIO when nobody has the
        // read side open; that just means nobody is watching.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(pipe);
        match file {
            Ok(mut f) => {
                if let Err(e) = f.write_all(stats.render_report().as_bytes()) {
                    debug!("report write dropped: {}", e);
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {}
            Err(e) => warn!("opening report pipe: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::daemon::entry::Entry;
    use usched_protocol::EntryFlags;

    fn msg(id: u64, status: u32, latency: u64, exec: u64) -> StatMessage {
        StatMessage {
            id,
            pid: 999,
            status,
            exec_time_ns: exec,
            latency_ns: latency,
            outdata: b"out\n".to_vec(),
        }
    }

    #[test]
    fn apply_updates_the_live_entry() {
        let apool = EntryPool::new("apool");
        let stats = StatPool::new();
        apool
            .insert(Entry { id: 5, flags: EntryFlags::NEW, ..Entry::default() })
            .expect("insert");

        assert!(apply(&apool, &stats, &msg(5, 0, 2_000, 1_000_000)));
        let e = apool.get_copy(5).expect("entry");
        assert_eq!(e.pid, 999);
        assert_eq!(e.status, 0);
        assert_eq!(e.latency, 2_000);
        assert_eq!(e.outdata, b"out\n");

        // unknown entries are dropped without touching aggregates
        assert!(!apply(&apool, &stats, &msg(6, 0, 1, 1)));
        assert!(stats.get(6).is_none());
    }

    #[test]
    fn aggregates_track_extremes_and_failures() {
        let stats = StatPool::new();
        stats.update(&msg(1, 0, 10, 100));
        stats.update(&msg(1, 1, 30, 50));
        stats.update(&msg(1, 0, 20, 75));

        let a = stats.get(1).expect("aggregate");
        assert_eq!(a.runs, 3);
        assert_eq!(a.ok, 2);
        assert_eq!(a.failed, 1);
        assert_eq!((a.latency_min, a.latency_max, a.latency_total), (10, 30, 60));
        assert_eq!((a.exec_min, a.exec_max, a.exec_total), (50, 100, 225));
    }

    #[test]
    fn report_lists_every_entry() {
        let stats = StatPool::new();
        stats.update(&msg(2, 0, 10_000, 20_000));
        stats.update(&msg(1, 1, 5_000, 1_000));

        let report = stats.render_report();
        assert!(report.contains("0x0000000000000001"));
        assert!(report.contains("0x0000000000000002"));
        assert!(report.lines().count() == 3, "header plus one line per entry");
    }
}
