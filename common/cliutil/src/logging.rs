// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// Environment variables naming the log directory and file respectively.
/// Setting both is an error; setting neither disables file logging.
pub const LOG_DIR_ENV: &str = "ALLOY_LOG_DIR";
pub const LOG_FILE_ENV: &str = "ALLOY_LOG_FILE";

/// An environment variable choosing whether to log to the console.
/// If "0", don't log to the console.
pub const CONSOLE_LOG_ENV: &str = "ALLOY_LOG_CONSOLE";

/// A guard object performing cleanups with RAII.
pub struct LogGuard {
    _span_guard: tracing::span::EnteredSpan,
}

/// Configuration for the tracing subscriber installed by `cli_main`.
pub struct LoggingConfig {
    /// The path to write logs to, and a filter for what goes there.
    /// If None, logs are not written to a file.
    pub log_file: Option<(PathBuf, EnvFilter)>,
    /// A filter for which logs are written to the console (stderr).
    /// If None, logs are not written to the console.
    pub console_logger: Option<EnvFilter>,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();

        let log_file = match (std::env::var_os(LOG_FILE_ENV), std::env::var_os(LOG_DIR_ENV)) {
            (Some(_), Some(_)) => {
                bail!("You can't have both {LOG_FILE_ENV} and {LOG_DIR_ENV} set")
            }
            (Some(file), None) => {
                // Subprocesses shouldn't share our log file. If subprocess
                // logging is wanted, the directory variant is the right tool.
                std::env::remove_var(LOG_FILE_ENV);
                Some(PathBuf::from(file))
            }
            (None, Some(dir)) => {
                let name = format!("{}.{timestamp}.log", crate::get_current_process_name());
                Some(Path::new(&dir).join(name))
            }
            (None, None) => None,
        };

        let default_filter = || {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()
                .context("Invalid RUST_LOG filter")
        };

        let console_logger = match std::env::var(CONSOLE_LOG_ENV).ok().as_deref() {
            Some("0") => None,
            _ => Some(default_filter()?),
        };

        let log_file = match log_file {
            Some(log_file) => Some((log_file, default_filter()?)),
            None => None,
        };

        Ok(Self {
            log_file,
            console_logger,
        })
    }

    /// Installs the global tracing subscriber and starts a span named "main".
    pub fn setup(self) -> Result<LogGuard> {
        let mut layers = Vec::new();

        if let Some(filter) = self.console_logger {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        if let Some((log_file, filter)) = self.log_file {
            let f = std::fs::File::create(&log_file)
                .with_context(|| format!("Failed to open log file {log_file:?}"))?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(f)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context("Failed to start tracing; another subscriber is already installed")?;

        let args = std::env::args()
            .map(|s| shell_escape::escape(s.into()))
            .join(" ");
        // Trace level: the environment can be very long and is rarely needed.
        let env = std::env::vars()
            .map(|(key, value)| format!("{}={}", key, value))
            .join("\n");
        let span_guard = tracing::trace_span!("main", args = args, env = env).entered();

        Ok(LogGuard {
            _span_guard: span_guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_to_file_with_filtering() -> Result<()> {
        const INFO_MESSAGE: &str = "log at level info";
        const WARN_MESSAGE: &str = "log at level warn";
        const DEBUG_MESSAGE: &str = "log at level debug";

        let dir = tempfile::tempdir()?;
        let log_file = dir.path().join("out.log");

        {
            // Only a single test can install the global subscriber, so this
            // test covers the whole config surface at once.
            let _guard = LoggingConfig {
                log_file: Some((
                    log_file.clone(),
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::INFO.into())
                        .parse("info")?,
                )),
                console_logger: None,
            }
            .setup()?;

            tracing::warn!("{}", WARN_MESSAGE);
            tracing::info!("{}", INFO_MESSAGE);
            tracing::debug!("{}", DEBUG_MESSAGE);
        }

        let log_content = std::fs::read_to_string(&log_file)?;
        assert!(log_content.contains(INFO_MESSAGE), "{log_content}");
        assert!(log_content.contains(WARN_MESSAGE), "{log_content}");
        assert!(!log_content.contains(DEBUG_MESSAGE), "{log_content}");
        Ok(())
    }
}
