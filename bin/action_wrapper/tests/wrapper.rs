// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use regex::Regex;
use tempfile::NamedTempFile;

const ACTION_WRAPPER: &str = env!("CARGO_BIN_EXE_action_wrapper");

struct WrapperOutputs {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
    log: String,
}

fn run_wrapper(script: &str) -> Result<WrapperOutputs> {
    let log_file = NamedTempFile::new()?;

    let output = Command::new(ACTION_WRAPPER)
        .arg("--output")
        .arg(log_file.path())
        .arg("sh")
        .arg("-c")
        .arg(script)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    Ok(WrapperOutputs {
        status: output.status,
        stdout: String::from_utf8(output.stdout)?,
        stderr: String::from_utf8(output.stderr)?,
        log: std::fs::read_to_string(log_file.path())?,
    })
}

#[test]
fn propagates_exit_code_and_tees_output() -> Result<()> {
    let outputs = run_wrapper("echo stdout ONE; echo stderr TWO >&2; exit 40")?;

    assert_eq!(outputs.status.code(), Some(40));

    // Both streams land in the log, and each is echoed on its own stream.
    assert!(outputs.log.contains("stdout ONE\n"), "log: {}", outputs.log);
    assert!(outputs.log.contains("stderr TWO\n"), "log: {}", outputs.log);
    assert!(outputs.stdout.contains("stdout ONE\n"), "stdout: {}", outputs.stdout);
    assert!(outputs.stderr.contains("stderr TWO\n"), "stderr: {}", outputs.stderr);

    let summary_re = Regex::new(r"action_wrapper: Command exited with code 40 \(wall ").unwrap();
    assert!(summary_re.is_match(&outputs.log), "log: {}", outputs.log);
    assert!(summary_re.is_match(&outputs.stderr), "stderr: {}", outputs.stderr);
    Ok(())
}

#[test]
fn successful_command_exits_zero() -> Result<()> {
    let outputs = run_wrapper("exit 0")?;
    assert_eq!(outputs.status.code(), Some(0));
    assert!(
        outputs.log.contains("Command exited with code 0"),
        "log: {}",
        outputs.log
    );
    Ok(())
}

#[test]
fn maps_fatal_signals_to_128_plus_signum() -> Result<()> {
    let outputs = run_wrapper("kill -KILL $$")?;

    assert_eq!(outputs.status.code(), Some(128 + 9));
    assert!(
        outputs.log.contains("Command killed with signal SIGKILL"),
        "log: {}",
        outputs.log
    );
    Ok(())
}

/// Spawns the wrapper and waits until the wrapped script prints "ready".
fn spawn_wrapper_with_marker(script: &str, grace_period: &str) -> Result<std::process::Child> {
    let log_file = NamedTempFile::new()?;
    let mut child = Command::new(ACTION_WRAPPER)
        .arg("--output")
        .arg(log_file.path())
        .arg("--grace-period")
        .arg(grace_period)
        .arg("sh")
        .arg("-c")
        .arg(script)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let stdout = child.stdout.take().context("stdout must be piped")?;
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = lines.next().context("wrapped script never became ready")??;
        if line == "ready" {
            return Ok(child);
        }
    }
}

#[test]
fn forwards_sigterm_to_the_wrapped_process() -> Result<()> {
    let mut child =
        spawn_wrapper_with_marker("trap 'exit 12' TERM; echo ready; while :; do sleep 0.1; done", "30")?;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(child.id() as i32),
        nix::sys::signal::Signal::SIGTERM,
    )?;

    let status = child.wait()?;
    assert_eq!(status.code(), Some(12));
    Ok(())
}

#[test]
fn escalates_to_sigkill_after_grace_period() -> Result<()> {
    let mut child = spawn_wrapper_with_marker(
        "trap '' TERM; echo ready; while :; do sleep 0.1; done",
        "1",
    )?;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(child.id() as i32),
        nix::sys::signal::Signal::SIGTERM,
    )?;

    // The wrapped shell ignores SIGTERM; after the 1s grace period the
    // wrapper SIGKILLs the process group and reports 128+9.
    let status = child.wait()?;
    assert_eq!(status.code(), Some(128 + 9));
    Ok(())
}

#[test]
fn rejects_missing_arguments() -> Result<()> {
    let output = Command::new(ACTION_WRAPPER)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8(output.stderr)?;
    assert!(
        stderr.contains("required arguments were not provided"),
        "unexpected stderr: {stderr}"
    );
    Ok(())
}

#[test]
fn reports_unlaunchable_commands() -> Result<()> {
    let log_file = NamedTempFile::new()?;
    let output = Command::new(ACTION_WRAPPER)
        .arg("--output")
        .arg(log_file.path())
        .arg("/no/such/command")
        .output()?;

    assert!(!output.status.success());
    assert!(!output.stderr.is_empty());
    Ok(())
}

#[test]
fn tee_keeps_up_with_slow_consumers() -> Result<()> {
    // A burst larger than the pipe buffer must not deadlock the wrapper.
    let outputs = run_wrapper("head -c 1000000 /dev/zero | tr '\\0' 'x'; echo; exit 0")?;
    assert_eq!(outputs.status.code(), Some(0));
    assert!(outputs.log.len() >= 1_000_000, "log len: {}", outputs.log.len());
    Ok(())
}
