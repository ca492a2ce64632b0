// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The tagged result returned by every robot and drive command.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Output;

/// Outcome of a hardware command, ordered by severity.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    /// The command did what was asked.
    Ok,
    /// The command succeeded but complained on stderr.
    Warning,
    /// The hardware refused or failed the action.  The caller should look at
    /// the library again with a status query before deciding what to do.
    Ko,
    /// The command died, or printed something we cannot interpret.
    Fatal,
}

impl StatusCode {
    /// Classifies the output of a completed process.
    pub fn from_output(output: &Output) -> Self {
        match output.status.code() {
            Some(0) if output.stderr.iter().all(u8::is_ascii_whitespace) => {
                StatusCode::Ok
            }
            Some(0) => StatusCode::Warning,
            Some(_) => StatusCode::Ko,
            None => StatusCode::Fatal,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Ok => "OK",
            StatusCode::Warning => "WARNING",
            StatusCode::Ko => "KO",
            StatusCode::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

/// Raw diagnostics captured from the command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new<S: Into<String>, E: Into<String>>(
        exit_code: Option<i32>,
        stdout: S,
        stderr: E,
    ) -> Self {
        Self { exit_code, stdout: stdout.into(), stderr: stderr.into() }
    }

    /// A one-line summary fit for recording on a failed queue entry.
    pub fn diagnostic(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        format!("exit status {code}: {detail}")
    }
}

impl From<&Output> for CommandOutput {
    fn from(output: &Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// The result of a robot or drive command: a status, the raw output, and
/// for status queries the parsed state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeResponse<T = ()> {
    pub status: StatusCode,
    pub output: CommandOutput,
    pub entity: Option<T>,
}

impl<T> TapeResponse<T> {
    pub fn new(status: StatusCode, output: CommandOutput) -> Self {
        Self { status, output, entity: None }
    }

    pub fn from_output(output: &Output) -> Self {
        Self::new(StatusCode::from_output(output), CommandOutput::from(output))
    }

    pub fn with_entity(mut self, entity: T) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::Ok
    }

    /// Ok or Warning: the action happened.
    pub fn succeeded(&self) -> bool {
        self.status <= StatusCode::Warning
    }

    /// Drops the entity, keeping status and diagnostics.
    pub fn discard_entity(self) -> TapeResponse {
        TapeResponse { status: self.status, output: self.output, entity: None }
    }
}
