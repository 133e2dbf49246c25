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

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use serde_derive::Deserialize;
use tracing::{debug, info};

use super::user;

/// Load the bootstrap config. A path given on the command line must
/// exist; without one, a missing per-user config file just means
/// defaults.
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let path = match config_file {
        Some(explicit) => PathBuf::from(explicit),
        None => default_config_path()?,
    };

    if !path.exists() {
        if config_file.is_some() {
            return Err(anyhow!("config file {} does not exist", path.display()));
        }
        debug!("no config at {}, running on defaults", path.display());
        return Ok(Config::default());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    info!("loaded config from {}", path.display());
    Ok(config)
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let me = user::info().context("resolving the config dir")?;
    let mut path = PathBuf::from(me.home_dir);
    path.extend([".config", "usched", "config.toml"]);
    Ok(path)
}

/// Daemon bootstrap configuration. Everything here is a path or a
/// tuning knob the daemon needs before the admin property store is
/// even open; the store itself carries the operator-editable
/// committed/staged properties.
#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Base directory of the admin configuration tree
    /// (`<base>/<category>/<property>`). Defaults to
    /// `<runtime_dir>/etc`.
    pub config_base: Option<String>,

    /// The address for the TCP listener to bind. When unset the
    /// daemon serves local clients only.
    pub tcp_addr: Option<String>,

    /// The TCP port to bind. Defaults to 7600.
    pub tcp_port: Option<u16>,

    /// Per-read connection timeout, in seconds.
    pub conn_timeout: Option<u64>,

    /// Path of the active pool serialization file. Defaults to
    /// `<runtime_dir>/usched.pool`.
    pub serialize_file: Option<String>,

    /// Keep timestamped backup copies of the serialization file
    /// after each snapshot.
    pub serialize_backups: Option<bool>,

    /// Name of the daemon to executor POSIX message queue.
    /// Must start with a '/'. Defaults to "/uschedq-exec".
    pub exec_queue: Option<String>,

    /// Name of the executor to daemon stat queue.
    /// Defaults to "/uschedq-stat".
    pub stat_queue: Option<String>,

    /// Maximum number of messages either queue may hold.
    pub queue_msgmax: Option<usize>,

    /// Maximum size in bytes of a single queue message. Bounds the
    /// subject length of NEW entries.
    pub queue_msgsize: Option<usize>,

    /// Number of scheduler dispatch workers. Defaults to 4.
    pub sched_workers: Option<usize>,

    /// Path of the named pipe the stat reporter writes aggregate
    /// statistics to. Unset disables the reporter.
    pub report_pipe: Option<String>,

    /// File mode for the report pipe, octal string (e.g. "0644").
    pub report_pipe_mode: Option<String>,
}

impl Config {
    pub fn conn_timeout(&self) -> std::time::Duration {
        self.conn_timeout
            .map(std::time::Duration::from_secs)
            .unwrap_or(super::consts::CONN_TIMEOUT)
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port.unwrap_or(7600)
    }

    pub fn exec_queue(&self) -> String {
        self.exec_queue.clone().unwrap_or_else(|| String::from("/uschedq-exec"))
    }

    pub fn stat_queue(&self) -> String {
        self.stat_queue.clone().unwrap_or_else(|| String::from("/uschedq-stat"))
    }

    pub fn queue_msgmax(&self) -> usize {
        self.queue_msgmax.unwrap_or(64)
    }

    pub fn queue_msgsize(&self) -> usize {
        self.queue_msgsize.unwrap_or(8 * 1024)
    }

    pub fn sched_workers(&self) -> usize {
        self.sched_workers.unwrap_or(4)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            tcp_addr = "0.0.0.0"
            tcp_port = 7600
            "#,
            r#"
            conn_timeout = 10
            serialize_backups = true
            "#,
            r#"
            exec_queue = "/uschedq-exec"
            queue_msgsize = 4096
            "#,
            r#"
            report_pipe = "/run/usched/report"
            report_pipe_mode = "0644"
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.tcp_port(), 7600);
        assert_eq!(config.exec_queue(), "/uschedq-exec");
        assert_eq!(config.sched_workers(), 4);
    }
}
