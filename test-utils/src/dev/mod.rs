// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging and polling helpers for tests.

pub mod poll;

use camino::Utf8PathBuf;
use slog::Logger;
use std::sync::atomic::{AtomicU32, Ordering};
use tape_common::logging::{
    ConfigLogging, ConfigLoggingIfExists, ConfigLoggingLevel,
};

static LOG_CONTEXT_ID: AtomicU32 = AtomicU32::new(0);

/// A logger writing to a per-test file, kept around when a test fails.
pub struct LogContext {
    pub log: Logger,
    log_path: Utf8PathBuf,
}

impl LogContext {
    pub fn new(test_name: &str, level: ConfigLoggingLevel) -> LogContext {
        let id = LOG_CONTEXT_ID.fetch_add(1, Ordering::SeqCst);
        let dir = Utf8PathBuf::try_from(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
        let log_path =
            dir.join(format!("{}.{}.{}.log", test_name, std::process::id(), id));
        let config = ConfigLogging::File {
            level,
            path: log_path.clone(),
            if_exists: ConfigLoggingIfExists::Truncate,
        };
        let log = config
            .to_logger(test_name)
            .unwrap_or_else(|e| panic!("creating log for {test_name}: {e}"));
        eprintln!("log file: {}", log_path);
        LogContext { log, log_path }
    }

    /// Removes the log file.  Call this at the end of a test that passed.
    pub fn cleanup_successful(self) {
        let LogContext { log, log_path } = self;
        // Flush the async drain before removing its file.
        drop(log);
        let _ = std::fs::remove_file(&log_path);
    }
}

/// Set up a [`LogContext`] appropriate for a test named `test_name`
pub fn test_setup_log(test_name: &str) -> LogContext {
    LogContext::new(test_name, ConfigLoggingLevel::Trace)
}
