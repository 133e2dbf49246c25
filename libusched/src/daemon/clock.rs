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

//! The clock drift monitor.
//!
//! Samples the wall clock against the monotonic clock and publishes
//! the accumulated divergence. When the divergence moves by more
//! than the compensation threshold in one step (someone set the
//! machine clock), the registered hook fires with the increment so
//! the marshal can compensate persisted triggers and the scheduler
//! can re-read its deadlines.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    thread, time,
};

use tracing::{info, warn};

use crate::consts;

pub fn run_monitor(
    delta_last: Arc<AtomicI64>,
    terminate: Arc<AtomicBool>,
    on_drift: impl Fn(i64) + Send + 'static,
) {
    let base_wall = time::SystemTime::now();
    let base_mono = time::Instant::now();
    let mut reported: i64 = 0;

    info!("clock drift monitor running");
    while !terminate.load(Ordering::Acquire) {
        // sleep in small slices so shutdown stays snappy
        let slice = time::Duration::from_millis(200);
        let mut slept = time::Duration::ZERO;
        while slept < consts::DELTA_SAMPLE_INTERVAL && !terminate.load(Ordering::Acquire) {
            thread::sleep(slice);
            slept += slice;
        }
        if terminate.load(Ordering::Acquire) {
            break;
        }

        let wall_elapsed = match time::SystemTime::now().duration_since(base_wall) {
            Ok(d) => d.as_secs() as i64,
            // the wall clock moved behind our starting point
            Err(e) => -(e.duration().as_secs() as i64),
        };
        let mono_elapsed = base_mono.elapsed().as_secs() as i64;

        let drift = wall_elapsed - mono_elapsed;
        delta_last.store(drift, Ordering::Release);

        let change = drift - reported;
        if change.abs() >= consts::DELTA_RELOAD_THRESHOLD {
            warn!("machine clock moved by {}s (total drift {}s)", change, drift);
            reported = drift;
            on_drift(change);
        }
    }
    info!("clock drift monitor exiting");
}
