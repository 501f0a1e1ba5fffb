// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use signal_hook::{
    consts::signal::{SIGCHLD, SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Command, ExitCode, ExitStatus},
    time::Duration,
};
use tracing::instrument;

/// Runs a child process, with some special signal handling:
///   - Forwards SIGTERM to the child process.
///   - Ignores SIGINT while the process is running. SIGINT is normally
///     generated by the terminal when Ctrl+C is pressed and is sent to all
///     processes in the foreground process group, so the child receives it
///     by default and we must not deliver it twice.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run(cmd: &mut Command) -> Result<ExitStatus> {
    // Register the signal handler before spawning so no signal is dropped.
    let mut signals = Signals::new([SIGCHLD, SIGINT, SIGTERM])?;

    let mut child = cmd.spawn()?;

    for signal in signals.forever() {
        match signal {
            SIGCHLD => match &child.try_wait()? {
                Some(status) => return Ok(*status),
                None => continue,
            },
            SIGINT => {}
            SIGTERM => nix::sys::signal::kill(
                Pid::from_raw(child.id().try_into()?),
                Signal::SIGTERM,
            )?,
            _ => unreachable!(),
        }
    }
    unreachable!()
}

/// Like [`run`], but the child is placed in its own process group, both
/// SIGINT and SIGTERM are forwarded to that group, and an unresponsive group
/// is escalated to SIGKILL after `grace`.
///
/// This is the supervision mode used by the action wrapper: the graph tool
/// delivers SIGTERM/SIGINT to the wrapper only, and the wrapper owns the
/// lifetime of everything the wrapped command spawned.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_with_grace(cmd: &mut Command, grace: Duration) -> Result<ExitStatus> {
    let mut signals = Signals::new([SIGCHLD, SIGINT, SIGTERM])?;

    cmd.process_group(0);
    let mut child = cmd.spawn()?;
    let pgid = Pid::from_raw(child.id().try_into()?);

    let mut escalation_armed = false;
    for signal in signals.forever() {
        match signal {
            SIGCHLD => match &child.try_wait()? {
                Some(status) => return Ok(*status),
                None => continue,
            },
            signal @ (SIGINT | SIGTERM) => {
                let forwarded = if signal == SIGINT {
                    Signal::SIGINT
                } else {
                    Signal::SIGTERM
                };
                // The group may already be gone; that's not an error.
                let _ = killpg(pgid, forwarded);

                if !escalation_armed {
                    escalation_armed = true;
                    std::thread::spawn(move || {
                        std::thread::sleep(grace);
                        // Until reaped, the direct child stays a zombie, so
                        // the group id cannot have been recycled.
                        let _ = killpg(pgid, Signal::SIGKILL);
                    });
                }
            }
            _ => unreachable!(),
        }
    }
    unreachable!()
}

#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_and_check(cmd: &mut Command) -> Result<()> {
    let status = run(cmd)?;
    if !status.success() {
        bail!("Command {cmd:?} failed with {status}");
    }

    Ok(())
}

/// Converts [`ExitStatus`] to [`ExitCode`] following the POSIX shell
/// convention: a process killed by signal N exits with 128+N.
///
/// Panics if [`ExitStatus`] does not represent an exited process (e.g. a
/// stopped one). This cannot happen for statuses obtained from
/// [`std::process`] wait-style methods.
pub fn status_to_exit_code(status: &ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        ExitCode::from(code as u8)
    } else if let Some(signal) = status.signal() {
        ExitCode::from(128 + signal as u8)
    } else {
        panic!("ExitStatus does not represent process exit: {:?}", status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_process() -> Result<()> {
        run_and_check(&mut Command::new("true"))?;
        Ok(())
    }

    #[test]
    fn runs_failed_process() -> Result<()> {
        let status = run(&mut Command::new("false"))?;
        assert_eq!(status.code(), Some(1));
        assert!(run_and_check(&mut Command::new("false")).is_err());
        Ok(())
    }

    #[test]
    fn grace_mode_reports_plain_exits() -> Result<()> {
        let status = run_with_grace(
            Command::new("sh").args(["-c", "exit 28"]),
            Duration::from_secs(1),
        )?;
        assert_eq!(status.code(), Some(28));
        Ok(())
    }

    #[test]
    fn observes_signal_deaths() -> Result<()> {
        // status_to_exit_code turns this into 137; ExitCode itself is opaque,
        // so the full mapping is asserted in the action wrapper tests.
        let status = run(Command::new("sh").args(["-c", "kill -KILL $$"]))?;
        assert_eq!(status.signal(), Some(9));
        assert!(status.code().is_none());
        Ok(())
    }
}
