// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use clap::Parser;
use cliutil::handle_top_level_result;
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::TimeValLike;
use processes::status_to_exit_code;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitCode, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const PROGRAM_NAME: &str = "action_wrapper";

#[derive(Parser, Debug)]
#[clap(
    about = "General-purpose supervisor for programs implementing build actions.",
    author, version, long_about = None, trailing_var_arg = true)]
struct Cli {
    /// Streams stdout/stderr of the wrapped process into this log file
    /// while also echoing them to the wrapper's own stdout/stderr.
    #[arg(long)]
    output: PathBuf,

    /// Seconds to wait after forwarding SIGTERM/SIGINT to the wrapped
    /// process before escalating to SIGKILL.
    #[arg(long, default_value_t = 5)]
    grace_period: u64,

    /// Command line of the wrapped process.
    #[arg(required = true)]
    command_line: Vec<String>,
}

/// Copies everything from `reader` into the shared log file and `echo`.
fn tee(
    mut reader: File,
    log: Arc<Mutex<File>>,
    mut echo: impl Write + Send + 'static,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0_u8; 8192];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            // The log interleaves both streams in arrival order.
            {
                let mut log = log.lock().expect("log writer poisoned");
                let _ = log.write_all(&buf[..n]);
            }
            let _ = echo.write_all(&buf[..n]);
            let _ = echo.flush();
        }
    })
}

fn new_pipe() -> Result<(File, OwnedFd)> {
    let (read_fd, write_fd) = nix::unistd::pipe().context("Failed to create a pipe")?;
    // SAFETY: pipe(2) returned freshly created, owned descriptors.
    let (read_fd, write_fd) = unsafe { (OwnedFd::from_raw_fd(read_fd), OwnedFd::from_raw_fd(write_fd)) };
    Ok((File::from(read_fd), write_fd))
}

fn do_main(args: &Cli) -> Result<ExitStatus> {
    let log = Arc::new(Mutex::new(File::create(&args.output).with_context(
        || format!("Failed to create log file {}", args.output.display()),
    )?));

    let (stdout_read, stdout_write) = new_pipe()?;
    let (stderr_read, stderr_write) = new_pipe()?;

    let mut command = Command::new(&args.command_line[0]);
    command
        .args(&args.command_line[1..])
        .stdout(Stdio::from(stdout_write))
        .stderr(Stdio::from(stderr_write));

    let stdout_pump = tee(stdout_read, Arc::clone(&log), std::io::stdout());
    let stderr_pump = tee(stderr_read, Arc::clone(&log), std::io::stderr());

    let start_time = Instant::now();
    let status = processes::run_with_grace(&mut command, Duration::from_secs(args.grace_period))?;
    let elapsed = start_time.elapsed();

    // Dropping the command closes our copies of the pipe write ends, so the
    // pumps see EOF once every descendant holding them has exited.
    drop(command);
    let _ = stdout_pump.join();
    let _ = stderr_pump.join();

    let rusage = getrusage(UsageWho::RUSAGE_CHILDREN)?;
    let times = format!(
        "wall {:.1}s, user {:.1}s, sys {:.1}s",
        elapsed.as_secs_f32(),
        rusage.user_time().num_nanoseconds() as f64 / 1_000_000_000.0,
        rusage.system_time().num_nanoseconds() as f64 / 1_000_000_000.0,
    );

    let summary = if let Some(signal_num) = status.signal() {
        let signal_name = match nix::sys::signal::Signal::try_from(signal_num) {
            Ok(signal) => signal.to_string(),
            Err(_) => signal_num.to_string(),
        };
        format!("{PROGRAM_NAME}: Command killed with signal {signal_name} ({times})")
    } else if let Some(code) = status.code() {
        format!("{PROGRAM_NAME}: Command exited with code {code} ({times})")
    } else {
        unreachable!("Unexpected ExitStatus: {:?}", status);
    };
    eprintln!("{summary}");
    {
        let mut log = log.lock().expect("log writer poisoned");
        let _ = writeln!(log, "{summary}");
    }

    // Propagate the exit status of the command.
    Ok(status)
}

fn main() -> ExitCode {
    let args = Cli::parse();

    // Always enable Rust backtraces.
    std::env::set_var("RUST_BACKTRACE", "1");

    // No cli_main here: the wrapper must not emit preamble logs of its own
    // into the stream it is teeing for the wrapped program.
    let result = do_main(&args);
    handle_top_level_result(result.map(|status| status_to_exit_code(&status)))
}
