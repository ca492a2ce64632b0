// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging configuration
//!
//! Represents the `[log]` table of a service configuration file and builds
//! the root [`slog::Logger`] it describes.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::fs::OpenOptions;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode")]
pub enum ConfigLogging {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: ConfigLoggingLevel },

    /// Newline-delimited JSON records written to `path`.
    #[serde(rename = "file")]
    File {
        level: ConfigLoggingLevel,
        path: Utf8PathBuf,
        if_exists: ConfigLoggingIfExists,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum ConfigLoggingIfExists {
    #[serde(rename = "fail")]
    Fail,
    #[serde(rename = "truncate")]
    Truncate,
    #[serde(rename = "append")]
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum ConfigLoggingLevel {
    #[serde(rename = "trace")]
    Trace,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "critical")]
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(config_level: ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}")]
    CreateDirectory {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to open log file {path}")]
    OpenFile {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl ConfigLogging {
    /// Create the root logger based on the requested configuration.
    pub fn to_logger<S: AsRef<str>>(
        &self,
        log_name: S,
    ) -> Result<Logger, LoggingError> {
        let name = log_name.as_ref().to_string();
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, drain, name))
            }

            ConfigLogging::File { level, path, if_exists } => {
                let mut open_options = std::fs::OpenOptions::new();
                open_options.write(true);
                open_options.create(true);

                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }

                let drain = log_drain_for_file(&open_options, path)?;
                Ok(async_root_logger(*level, drain, name))
            }
        }
    }
}

// The async drain takes care of synchronization for both the terminal and
// file drains, which would otherwise need a std::sync::Mutex.
fn async_root_logger<T>(
    level: ConfigLoggingLevel,
    drain: T,
    name: String,
) -> slog::Logger
where
    T: slog::Drain + Send + 'static,
    <T as slog::Drain>::Err: std::fmt::Debug,
{
    let pid = std::process::id();
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    slog::Logger::root(async_drain, o!("name" => name, "pid" => pid))
}

fn log_drain_for_file(
    open_options: &OpenOptions,
    path: &Utf8Path,
) -> Result<slog::Fuse<slog_json::Json<std::fs::File>>, LoggingError> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|err| {
                LoggingError::CreateDirectory { path: parent.to_owned(), err }
            })?;
        }
    }

    let file = open_options.open(path).map_err(|err| {
        LoggingError::OpenFile { path: path.to_owned(), err }
    })?;

    Ok(slog_json::Json::new(file).add_default_keys().build().fuse())
}
