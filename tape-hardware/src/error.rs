// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

/// A command could not even be attempted to completion.
///
/// Hardware refusing an action is not represented here: that is a
/// [`crate::StatusCode`] carried by a [`crate::TapeResponse`].
#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("Command [{command}] did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("I/O error while {context}: {err}")]
    Io { context: String, err: std::io::Error },
}

/// Output of `mtx` or `mt` that does not look like what those tools print.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);
