// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides functions common to all Rust-based CLI programs.

use itertools::Itertools;
use std::{
    ffi::OsStr,
    fmt::Debug,
    process::{ExitCode, Termination},
};

use anyhow::{bail, Result};

mod config;
mod logging;
mod param_file;
mod stdio_redirector;

pub use crate::config::*;
pub use crate::logging::*;
pub use crate::param_file::expanded_args_os;
pub use crate::stdio_redirector::{RedirectorConfig, StdioRedirector};

/// Exit code for command-line and input validation failures.
pub const EXIT_CODE_INVALID_INPUT: u8 = 2;

/// Wraps a CLI main function to provide the common startup/cleanup logic.
///
/// Most programs should call this at the very beginning of main. The main
/// exception is programs that must stay single-threaded before performing
/// namespace operations (e.g. container_runner calling unshare(2)), which
/// sequence the setup themselves.
pub fn cli_main<F, T, E>(main: F, config: Config) -> ExitCode
where
    F: FnOnce() -> Result<T, E>,
    T: Termination,
    E: Debug,
{
    let _log_guard = config.logging.setup().unwrap();
    if config.log_command_line {
        log_current_command_line();
    }
    let result = main();
    let failure = result.is_err();

    let exit_code = handle_top_level_result(result);

    if failure {
        if let Some(redirector) = config.stdio_redirector {
            redirector.flush_to_real_stderr().unwrap();
        }
    }

    exit_code
}

/// Logs the command line of the current process.
///
/// [`cli_main`] calls this for you.
pub fn log_current_command_line() {
    let escaped_command = std::env::args()
        .map(|s| shell_escape::escape(s.into()))
        .join(" ");
    tracing::info!("COMMAND: {}", escaped_command);
}

/// Handles the top-level [`Result`] and returns the [`ExitCode`] to report.
///
/// [`cli_main`] calls this for you.
pub fn handle_top_level_result<T: Termination, E: Debug>(result: Result<T, E>) -> ExitCode {
    match result {
        Err(error) => {
            eprintln!("FATAL: {}: {:?}", get_current_process_name(), error);
            ExitCode::FAILURE
        }
        Ok(value) => value.report(),
    }
}

/// Returns the current process name, or `__unknown__` if unavailable.
pub(crate) fn get_current_process_name() -> String {
    let current_exe = std::env::current_exe().unwrap_or_default();
    current_exe
        .file_name()
        .unwrap_or(OsStr::new("__unknown__"))
        .to_string_lossy()
        .into_owned()
}

/// Splits a `key=value` command-line spec in two.
pub fn split_key_value(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => bail!("invalid spec: {:?}", spec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_value_works() -> Result<()> {
        assert_eq!(split_key_value("a=b")?, ("a", "b"));
        // Only the first '=' splits, so values may contain '='.
        assert_eq!(split_key_value("a=b=c")?, ("a", "b=c"));
        assert!(split_key_value("ab").is_err());
        assert!(split_key_value("=b").is_err());
        Ok(())
    }
}
