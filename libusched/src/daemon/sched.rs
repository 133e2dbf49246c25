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

//! The timestamp scheduler.
//!
//! A timer thread sleeps until the earliest armed trigger, marks due
//! triggers in flight, advances their next occurrence, and hands a
//! fire event to a worker pool which runs the dispatch callback.
//!
//! Guarantees:
//!  - a handle never has two callbacks running at once; a firing
//!    that comes due while the previous one is still running waits
//!    for it to finish
//!  - once the next trigger would reach a non-zero expire, the
//!    handle retires after the in-flight firing and `search`
//!    reports it gone
//!  - `disarm` during an in-flight callback lets the callback
//!    finish and prevents any further firing

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    thread, time,
};

use anyhow::anyhow;
use chrono::{Datelike as _, Local, Months, NaiveDate, NaiveDateTime, TimeZone as _};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::consts;

/// One delivered firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireEvent {
    pub handle: u64,
    pub entry_id: u64,
    /// The trigger timestamp that came due.
    pub scheduled_for: u32,
    /// Delay between the clock reaching the trigger and the event
    /// being dispatched to a worker.
    pub latency: time::Duration,
    /// The handle's schedule after this firing, or None when it
    /// retires (one shot, expiry reached, or trigger overflow).
    pub next: Option<(u32, u32, u32)>,
}

pub type DispatchFn = Box<dyn Fn(&FireEvent) + Send + Sync>;

struct Armed {
    entry_id: u64,
    trigger: u32,
    step: u32,
    expire: u32,
    monthday: bool,
    yearday: bool,
    in_flight: bool,
    retired: bool,
}

#[derive(Default)]
struct State {
    armed: HashMap<u64, Armed>,
    next_handle: u64,
    shutdown: bool,
}

pub struct Scheduler {
    state: Arc<(Mutex<State>, Condvar)>,
    job_tx: Mutex<Option<Sender<FireEvent>>>,
    timer: Mutex<Option<thread::JoinHandle<()>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(workers: usize, dispatch: DispatchFn) -> Scheduler {
        let state = Arc::new((
            Mutex::new(State { next_handle: 1, ..State::default() }),
            Condvar::new(),
        ));
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<FireEvent>();

        let dispatch = Arc::new(dispatch);
        let mut worker_handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let rx: Receiver<FireEvent> = job_rx.clone();
            let state = Arc::clone(&state);
            let dispatch = Arc::clone(&dispatch);
            worker_handles.push(
                thread::Builder::new()
                    .name(format!("sched-worker-{i}"))
                    .spawn(move || {
                        while let Ok(ev) = rx.recv() {
                            (*dispatch)(&ev);
                            Scheduler::complete(&state, ev.handle);
                        }
                    })
                    .expect("spawning scheduler worker"),
            );
        }

        let timer = {
            let state = Arc::clone(&state);
            let job_tx = job_tx.clone();
            thread::Builder::new()
                .name(String::from("sched-timer"))
                .spawn(move || Scheduler::timer_loop(&state, &job_tx))
                .expect("spawning scheduler timer")
        };

        Scheduler {
            state,
            job_tx: Mutex::new(Some(job_tx)),
            timer: Mutex::new(Some(timer)),
            workers: Mutex::new(worker_handles),
        }
    }

    fn now() -> time::Duration {
        time::SystemTime::now().duration_since(time::UNIX_EPOCH).unwrap_or_default()
    }

    fn timer_loop(state: &Arc<(Mutex<State>, Condvar)>, job_tx: &Sender<FireEvent>) {
        let (lock, cvar) = &**state;
        loop {
            let mut fired = Vec::new();
            {
                let mut st = lock.lock().unwrap();
                if st.shutdown {
                    break;
                }

                let now = Scheduler::now();
                let now_secs = now.as_secs();
                for (handle, armed) in st.armed.iter_mut() {
                    if armed.in_flight || armed.retired || u64::from(armed.trigger) > now_secs {
                        continue;
                    }

                    let scheduled_for = armed.trigger;
                    let latency = now
                        .checked_sub(time::Duration::from_secs(u64::from(scheduled_for)))
                        .unwrap_or_default();

                    armed.in_flight = true;
                    if armed.step == 0 {
                        armed.retired = true;
                    } else {
                        match advance_trigger(
                            armed.trigger,
                            armed.step,
                            armed.monthday,
                            armed.yearday,
                        ) {
                            Some(next) if armed.expire == 0 || next < armed.expire => {
                                armed.trigger = next
                            }
                            _ => armed.retired = true,
                        }
                    }

                    let next = if armed.retired {
                        None
                    } else {
                        Some((armed.trigger, armed.step, armed.expire))
                    };
                    fired.push(FireEvent {
                        handle: *handle,
                        entry_id: armed.entry_id,
                        scheduled_for,
                        latency,
                        next,
                    });
                }

                if fired.is_empty() {
                    // Sleep until the earliest live trigger, capped so
                    // wall clock changes are noticed reasonably soon.
                    let deadline = st
                        .armed
                        .values()
                        .filter(|a| !a.in_flight && !a.retired)
                        .map(|a| u64::from(a.trigger))
                        .min();
                    let wait = match deadline {
                        Some(t) => {
                            time::Duration::from_secs((t.saturating_sub(now_secs)).clamp(0, 1))
                        }
                        None => time::Duration::from_millis(500),
                    };
                    let (st_back, _) = cvar.wait_timeout(st, wait).unwrap();
                    drop(st_back);
                    continue;
                }
            }

            // Deliver outside the lock: a worker finishing a job
            // needs the lock to mark completion.
            for ev in fired.drain(..) {
                debug!(
                    "firing handle {} (entry {:#018x}) {}us late",
                    ev.handle,
                    ev.entry_id,
                    ev.latency.as_micros()
                );
                if job_tx.send(ev).is_err() {
                    warn!("dispatch channel closed, timer exiting");
                    return;
                }
            }
        }
        info!("scheduler timer exiting");
    }

    fn complete(state: &Arc<(Mutex<State>, Condvar)>, handle: u64) {
        let (lock, cvar) = &**state;
        let mut st = lock.lock().unwrap();
        let retired = match st.armed.get_mut(&handle) {
            Some(armed) => {
                armed.in_flight = false;
                armed.retired
            }
            None => {
                error!("completion for unknown handle {handle}");
                false
            }
        };
        if retired {
            st.armed.remove(&handle);
        }
        cvar.notify_all();
    }

    /// Arm a trigger. Returns the non-zero scheduler handle.
    pub fn arm(
        &self,
        trigger: u32,
        step: u32,
        expire: u32,
        entry_id: u64,
        monthday: bool,
        yearday: bool,
    ) -> anyhow::Result<u64> {
        if expire != 0 && expire <= trigger {
            return Err(anyhow!("expire {} is not after trigger {}", expire, trigger));
        }

        let (lock, cvar) = &*self.state;
        let mut st = lock.lock().unwrap();
        if st.shutdown {
            return Err(anyhow!("scheduler is shut down"));
        }
        let handle = st.next_handle;
        st.next_handle += 1;
        st.armed.insert(
            handle,
            Armed {
                entry_id,
                trigger,
                step,
                expire,
                monthday,
                yearday,
                in_flight: false,
                retired: false,
            },
        );
        cvar.notify_all();
        Ok(handle)
    }

    /// Cancel a handle. An in-flight callback finishes; there will
    /// be no further firings either way.
    pub fn disarm(&self, handle: u64) -> bool {
        let (lock, cvar) = &*self.state;
        let mut st = lock.lock().unwrap();
        let in_flight = match st.armed.get_mut(&handle) {
            Some(armed) => {
                armed.retired = true;
                armed.in_flight
            }
            None => {
                cvar.notify_all();
                return false;
            }
        };
        // an idle handle comes out now; an in-flight one is removed
        // when its callback completes
        if !in_flight {
            st.armed.remove(&handle);
        }
        cvar.notify_all();
        true
    }

    /// The live schedule of a handle, or None once it has retired.
    pub fn search(&self, handle: u64) -> Option<(u32, u32, u32)> {
        let (lock, _) = &*self.state;
        let st = lock.lock().unwrap();
        st.armed
            .get(&handle)
            .filter(|a| !a.retired)
            .map(|a| (a.trigger, a.step, a.expire))
    }

    /// Shift the triggers of the given entries by a wall clock
    /// drift.
    pub fn compensate(&self, delta: i64, entry_ids: &[u64]) {
        let (lock, cvar) = &*self.state;
        let mut st = lock.lock().unwrap();
        for armed in st.armed.values_mut() {
            if armed.in_flight || armed.retired || !entry_ids.contains(&armed.entry_id) {
                continue;
            }
            armed.trigger = add_signed_clamped(armed.trigger, delta);
            if armed.expire != 0 {
                armed.expire = add_signed_clamped(armed.expire, delta);
            }
        }
        cvar.notify_all();
    }

    /// Wake the timer so it re-reads the wall clock.
    pub fn poke(&self) {
        let (_, cvar) = &*self.state;
        cvar.notify_all();
    }

    pub fn armed_count(&self) -> usize {
        let (lock, _) = &*self.state;
        lock.lock().unwrap().armed.len()
    }

    pub fn shutdown(&self) {
        {
            let (lock, cvar) = &*self.state;
            let mut st = lock.lock().unwrap();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            cvar.notify_all();
        }
        if let Some(timer) = self.timer.lock().unwrap().take() {
            if timer.join().is_err() {
                error!("scheduler timer panicked");
            }
        }
        // closing the channel lets the workers drain and exit
        drop(self.job_tx.lock().unwrap().take());
        for worker in self.workers.lock().unwrap().drain(..) {
            if worker.join().is_err() {
                error!("scheduler worker panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn add_signed_clamped(ts: u32, delta: i64) -> u32 {
    u32::try_from((i64::from(ts) + delta).max(0)).unwrap_or(u32::MAX)
}

/// The next occurrence after a firing. Calendar aligned steps move
/// by whole months or years; everything else is a plain addition.
pub fn advance_trigger(trigger: u32, step: u32, monthday: bool, yearday: bool) -> Option<u32> {
    if monthday || yearday {
        let local = Local.timestamp_opt(i64::from(trigger), 0).single()?.naive_local();
        let advanced = if monthday {
            add_months(local, step / consts::MONTH_SECS)?
        } else {
            add_years_preserving_ordinal(local, step / consts::YEAR_SECS)?
        };
        let ts = Local.from_local_datetime(&advanced).earliest()?.timestamp();
        return u32::try_from(ts).ok();
    }
    trigger.checked_add(step)
}

/// Month advance preserving the day of month, clamping to the end
/// of shorter months.
fn add_months(t: NaiveDateTime, months: u32) -> Option<NaiveDateTime> {
    t.checked_add_months(Months::new(months))
}

/// Year advance preserving the day of year. Day 366 clamps to 365
/// in non-leap target years.
fn add_years_preserving_ordinal(t: NaiveDateTime, years: u32) -> Option<NaiveDateTime> {
    let year = t.year().checked_add(i32::try_from(years).ok()?)?;
    let ordinal = t.ordinal();
    let date = NaiveDate::from_yo_opt(year, ordinal)
        .or_else(|| NaiveDate::from_yo_opt(year, ordinal - 1))?;
    Some(date.and_time(t.time()))
}
