// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{LoggingConfig, RedirectorConfig, StdioRedirector};
use anyhow::Result;

/// Similar to Option::unwrap_or_else, but handles the Result type.
fn unwrap_or_else<T, F>(value: Option<T>, default: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match value {
        Some(value) => Ok(value),
        None => default(),
    }
}

/// Builder for the per-process [`Config`]. Most programs just want
/// `Config::default()`.
#[derive(Default)]
pub struct ConfigBuilder {
    logging: Option<LoggingConfig>,
    redirector: Option<RedirectorConfig>,
    log_command_line: bool,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            logging: None,
            redirector: None,
            log_command_line: true,
        }
    }

    /// Overrides the logging config. Defaults to `LoggingConfig::from_env()`.
    pub fn logging(mut self, cfg: LoggingConfig) -> Self {
        self.logging = Some(cfg);
        self
    }

    /// Overrides the stdio redirection config. Defaults to
    /// `RedirectorConfig::from_env()`.
    pub fn redirector(mut self, cfg: RedirectorConfig) -> Self {
        self.redirector = Some(cfg);
        self
    }

    /// Controls whether to log the command line of the current process.
    pub fn log_command_line(mut self, enable: bool) -> Self {
        self.log_command_line = enable;
        self
    }

    /// Builds a [`Config`] suitable for use with `cli_main`.
    ///
    /// Note that building the config may already have side effects: when
    /// stdio redirection is requested, stdout/stderr are redirected from
    /// this point on.
    pub fn build(self) -> Result<Config> {
        let redirector = unwrap_or_else(self.redirector, || Ok(RedirectorConfig::from_env()))?;
        Ok(Config {
            logging: unwrap_or_else(self.logging, LoggingConfig::from_env)?,
            stdio_redirector: redirector.create()?,
            log_command_line: self.log_command_line,
        })
    }
}

/// The per-process configuration, with defaults applied.
pub struct Config {
    pub(crate) logging: LoggingConfig,
    pub(crate) stdio_redirector: Option<StdioRedirector>,
    pub(crate) log_command_line: bool,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_overrides() {
        let config = ConfigBuilder::new()
            .redirector(RedirectorConfig::DisableRedirection)
            .log_command_line(false)
            .build()
            .unwrap();
        assert!(!config.log_command_line);
        assert!(config.stdio_redirector.is_none());
    }
}
