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

use std::time;

/// How long the daemon will wait on any single read from a client
/// before dropping the connection and its in-progress entry.
pub const CONN_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Largest request or reply payload the daemon will frame.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Largest job output blob a stat message may carry.
pub const MAX_OUTDATA_SIZE: usize = 8 * 1024;

/// PBKDF2 rounds for user password records.
pub const PBKDF2_ROUNDS: u32 = 10_000;

/// Seconds in the nominal month and year used for relative steps.
/// Steps that are exact multiples of these may request calendar
/// alignment.
pub const MONTH_SECS: u32 = 30 * 86400;
pub const YEAR_SECS: u32 = 365 * 86400;

/// Wall clock drift (seconds, absolute) below which reload skips
/// trigger compensation.
pub const DELTA_RELOAD_THRESHOLD: i64 = 2;

/// How often the clock monitor samples wall vs monotonic time.
pub const DELTA_SAMPLE_INTERVAL: time::Duration = time::Duration::from_secs(5);

/// How often the stat reporter rewrites the report pipe.
pub const REPORT_INTERVAL: time::Duration = time::Duration::from_secs(30);

pub const SOCKET_FILE: &str = "usched.socket";
pub const PID_FILE: &str = "usched-daemon.pid";
pub const SERIALIZE_FILE: &str = "usched.pool";
