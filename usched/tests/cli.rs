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

//! CLI smoke tests that don't need a running daemon.

use std::process::Command;

use ntest::timeout;

fn usched() -> Command {
    Command::new(env!("CARGO_BIN_EXE_usched"))
}

fn with_tmp_home(cmd: &mut Command, dir: &tempfile::TempDir) {
    cmd.env("XDG_RUNTIME_DIR", dir.path());
    cmd.env("HOME", dir.path());
}

#[test]
#[timeout(30000)]
fn version_prints_and_exits_zero() {
    let out = usched().arg("version").output().expect("spawning usched");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("usched "), "got: {stdout}");
}

#[test]
#[timeout(30000)]
fn usage_errors_never_need_a_daemon() {
    // a bare `run` is rejected by the parser before any socket is
    // touched, so it fails cleanly even with no daemon around
    let dir = tempfile::tempdir().expect("tmp dir");
    let mut cmd = usched();
    with_tmp_home(&mut cmd, &dir);
    let out = cmd.arg("run").output().expect("spawning usched");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("insufficient arguments"), "got: {stderr}");
}

#[test]
#[timeout(30000)]
fn admin_store_round_trips_without_a_daemon() {
    let dir = tempfile::tempdir().expect("tmp dir");

    let run = |args: &[&str]| {
        let mut cmd = usched();
        with_tmp_home(&mut cmd, &dir);
        let out = cmd.arg("admin").args(args).output().expect("spawning usched");
        assert!(
            out.status.success(),
            "admin {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).to_string()
    };

    // staged values show a trailing star until committed
    let out = run(&["add", "network", "port", "7601"]);
    assert!(out.contains("network.port = 7601*"), "got: {out}");

    run(&["commit", "network"]);
    let out = run(&["show", "network", "port"]);
    assert!(out.contains("network.port = 7601"), "got: {out}");
    assert!(!out.contains('*'), "got: {out}");

    // rollback drops a staged change
    run(&["change", "network", "port", "7602"]);
    run(&["rollback", "network"]);
    let out = run(&["show", "network", "port"]);
    assert!(out.contains("network.port = 7601"), "got: {out}");
}

#[test]
#[timeout(30000)]
fn admin_user_records_stage_and_commit() {
    let dir = tempfile::tempdir().expect("tmp dir");

    let run = |args: &[&str]| {
        let mut cmd = usched();
        with_tmp_home(&mut cmd, &dir);
        let out = cmd.arg("admin").args(args).output().expect("spawning usched");
        assert!(
            out.status.success(),
            "admin {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).to_string()
    };

    run(&["add", "users", "alice", "1001", "1001", "hunter2"]);
    let out = run(&["show", "users"]);
    assert!(out.contains("users.alice"), "got: {out}");
    assert!(out.contains('*'), "uncommitted user must show a star: {out}");

    run(&["commit", "users"]);
    let out = run(&["show", "users"]);
    assert!(out.contains("users.alice"), "got: {out}");
    assert!(!out.contains('*'), "committed user must not show a star: {out}");
}
