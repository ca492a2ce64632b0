// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drive commands implemented with `mt` and `dd`.

use crate::commands::DriveCommands;
use crate::error::{ExecutionError, ParseError};
use crate::executor::BoxedExecutor;
use crate::response::{StatusCode, TapeResponse};
use crate::state::{DriveStatusFlag, TapeDriveState};
use async_trait::async_trait;
use camino::Utf8Path;
use serde::Deserialize;
use slog::{warn, Logger};
use std::fmt::Write;
use std::str::FromStr;
use std::time::Duration;

pub const MT: &str = "/bin/mt";
pub const DD: &str = "/bin/dd";

/// How to reach one tape drive.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MtDriveConfig {
    /// Data transfer element index in the changer.
    pub index: u32,
    /// Non-rewinding device node, e.g. `/dev/nst0`.
    pub device: String,
    #[serde(default = "MtDriveConfig::default_mt_path")]
    pub mt_path: String,
    #[serde(default = "MtDriveConfig::default_dd_path")]
    pub dd_path: String,
    #[serde(default = "MtDriveConfig::default_block_size")]
    pub block_size: String,
    #[serde(default = "MtDriveConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl MtDriveConfig {
    fn default_mt_path() -> String {
        MT.to_string()
    }

    fn default_dd_path() -> String {
        DD.to_string()
    }

    fn default_block_size() -> String {
        "256k".to_string()
    }

    fn default_timeout_ms() -> u64 {
        60 * 60 * 1000
    }

    pub fn new<S: Into<String>>(index: u32, device: S) -> Self {
        Self {
            index,
            device: device.into(),
            mt_path: Self::default_mt_path(),
            dd_path: Self::default_dd_path(),
            block_size: Self::default_block_size(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub struct MtDrive {
    log: Logger,
    executor: BoxedExecutor,
    config: MtDriveConfig,
}

impl MtDrive {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        config: MtDriveConfig,
    ) -> Self {
        let log = log.new(slog::o!(
            "component" => "MtDrive",
            "drive" => config.index,
            "device" => config.device.clone(),
        ));
        Self { log, executor, config }
    }

    pub fn config(&self) -> &MtDriveConfig {
        &self.config
    }

    async fn mt(&self, args: &[&str]) -> Result<TapeResponse, ExecutionError> {
        let mut command = tokio::process::Command::new(&self.config.mt_path);
        command.arg("-f").arg(&self.config.device).args(args);
        let output =
            self.executor.execute(&mut command, self.config.timeout()).await?;
        Ok(TapeResponse::from_output(&output))
    }

    async fn dd(
        &self,
        input: &str,
        output: &str,
    ) -> Result<TapeResponse, ExecutionError> {
        let mut command = tokio::process::Command::new(&self.config.dd_path);
        command
            .arg(format!("if={input}"))
            .arg(format!("of={output}"))
            .arg(format!("bs={}", self.config.block_size));
        let output =
            self.executor.execute(&mut command, self.config.timeout()).await?;
        // dd reports its transfer statistics on stderr even when it succeeds.
        let mut response = TapeResponse::from_output(&output);
        if response.status == StatusCode::Warning {
            response.status = StatusCode::Ok;
        }
        Ok(response)
    }
}

#[async_trait]
impl DriveCommands for MtDrive {
    async fn status(
        &self,
    ) -> Result<TapeResponse<TapeDriveState>, ExecutionError> {
        let response = self.mt(&["status"]).await?;
        if !response.succeeded() {
            return Ok(TapeResponse::new(response.status, response.output));
        }
        match response.output.stdout.parse::<TapeDriveState>() {
            Ok(state) => Ok(TapeResponse::new(response.status, response.output)
                .with_entity(state)),
            Err(err) => {
                warn!(self.log, "unparseable mt status"; "error" => %err);
                Ok(TapeResponse::new(StatusCode::Fatal, response.output))
            }
        }
    }

    async fn rewind(&self) -> Result<TapeResponse, ExecutionError> {
        self.mt(&["rewind"]).await
    }

    async fn erase(&self) -> Result<TapeResponse, ExecutionError> {
        self.mt(&["erase"]).await
    }

    async fn eject(&self) -> Result<TapeResponse, ExecutionError> {
        self.mt(&["offline"]).await
    }

    async fn move_position(
        &self,
        count: u32,
        backward: bool,
    ) -> Result<TapeResponse, ExecutionError> {
        let op = if backward { "bsf" } else { "fsf" };
        self.mt(&[op, &count.to_string()]).await
    }

    async fn go_to_end(&self) -> Result<TapeResponse, ExecutionError> {
        self.mt(&["eod"]).await
    }

    async fn write_to_tape(
        &self,
        input: &Utf8Path,
    ) -> Result<TapeResponse, ExecutionError> {
        self.dd(input.as_str(), &self.config.device).await
    }

    async fn read_from_tape(
        &self,
        output: &Utf8Path,
    ) -> Result<TapeResponse, ExecutionError> {
        self.dd(&self.config.device, output.as_str()).await
    }
}

impl FromStr for TapeDriveState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let failed_to_parse = |name, err| {
            ParseError(format!("Failed to parse field '{}': {}", name, err))
        };

        let mut state = TapeDriveState::default();
        let mut saw_position = false;
        let mut in_flags = false;

        for line in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if in_flags {
                state.flags.extend(
                    line.split_whitespace()
                        .map(|f| DriveStatusFlag::from_str(f).unwrap_or_else(|e| match e {})),
                );
                continue;
            }
            if line.starts_with("File number=") {
                // "File number=0, block number=0, partition=0."
                for field in line.trim_end_matches('.').split(',') {
                    let Some((key, value)) = field.split_once('=') else {
                        continue;
                    };
                    let value = value.trim();
                    match key.trim() {
                        "File number" => {
                            state.file_number = value
                                .parse()
                                .map_err(|e| failed_to_parse("file number", e))?
                        }
                        "block number" => {
                            state.block_number = value
                                .parse()
                                .map_err(|e| failed_to_parse("block number", e))?
                        }
                        "partition" => {
                            state.partition = value
                                .parse()
                                .map_err(|e| failed_to_parse("partition", e))?
                        }
                        _ => (),
                    }
                }
                saw_position = true;
            } else if line.starts_with("Tape block size")
                || line.starts_with("Density code")
            {
                // "Tape block size 0 bytes. Density code 0x58 (LTO-5)."
                for sentence in line.split(". ") {
                    let sentence = sentence.trim().trim_end_matches('.');
                    if let Some(rest) = sentence.strip_prefix("Tape block size ")
                    {
                        let size = rest.trim_end_matches(" bytes");
                        state.block_size = Some(
                            size.parse()
                                .map_err(|e| failed_to_parse("block size", e))?,
                        );
                    } else if let Some(rest) =
                        sentence.strip_prefix("Density code ")
                    {
                        let mut words = rest.splitn(2, ' ');
                        state.density_code =
                            words.next().map(|c| c.to_string());
                        state.cartridge_type = words
                            .next()
                            .map(|t| t.trim_matches(|c| c == '(' || c == ')'))
                            .filter(|t| !t.is_empty() && *t != "default")
                            .map(|t| t.to_string());
                    }
                }
            } else if let Some(rest) =
                line.strip_prefix("Soft error count since last status=")
            {
                state.soft_error_count = Some(
                    rest.trim()
                        .parse()
                        .map_err(|e| failed_to_parse("soft error count", e))?,
                );
            } else if line.starts_with("General status bits on") {
                in_flags = true;
            }
        }

        if !saw_position {
            return Err(ParseError(
                "Missing 'File number' value in mt status output".to_string(),
            ));
        }
        Ok(state)
    }
}

/// Prints a drive state the way `mt status` does.
pub fn render_mt_status(state: &TapeDriveState) -> String {
    let mut out = String::from("SCSI 2 tape drive:\n");
    let _ = writeln!(
        out,
        "File number={}, block number={}, partition={}.",
        state.file_number, state.block_number, state.partition
    );
    let _ = write!(out, "Tape block size {} bytes.", state.block_size.unwrap_or(0));
    if let Some(density) = &state.density_code {
        let _ = write!(
            out,
            " Density code {} ({}).",
            density,
            state.cartridge_type.as_deref().unwrap_or("default")
        );
    }
    out.push('\n');
    let _ = writeln!(
        out,
        "Soft error count since last status={}",
        state.soft_error_count.unwrap_or(0)
    );
    out.push_str("General status bits on (41010000):\n");
    let flags: Vec<String> = state.flags.iter().map(|f| f.to_string()).collect();
    let _ = writeln!(out, " {}", flags.join(" "));
    out
}
