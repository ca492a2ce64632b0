// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Robot commands implemented with `mtx`.

use crate::commands::RobotCommands;
use crate::error::{ExecutionError, ParseError};
use crate::executor::BoxedExecutor;
use crate::response::{StatusCode, TapeResponse};
use crate::state::{
    SlotKind, TapeCartridge, TapeDrive, TapeLibraryState, TapeSlot,
};
use async_trait::async_trait;
use serde::Deserialize;
use slog::{warn, Logger};
use std::fmt::Write;
use std::str::FromStr;
use std::time::Duration;

pub const MTX: &str = "/usr/sbin/mtx";

/// How to reach one media changer.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MtxRobotConfig {
    /// Changer device, e.g. `/dev/sg5`.
    pub device: String,
    #[serde(default = "MtxRobotConfig::default_mtx_path")]
    pub mtx_path: String,
    #[serde(default = "MtxRobotConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl MtxRobotConfig {
    pub fn new<S: Into<String>>(device: S) -> Self {
        Self {
            device: device.into(),
            mtx_path: Self::default_mtx_path(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }

    fn default_mtx_path() -> String {
        MTX.to_string()
    }

    fn default_timeout_ms() -> u64 {
        5 * 60 * 1000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub struct MtxRobot {
    log: Logger,
    executor: BoxedExecutor,
    config: MtxRobotConfig,
}

impl MtxRobot {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        config: MtxRobotConfig,
    ) -> Self {
        let log = log.new(slog::o!(
            "component" => "MtxRobot",
            "device" => config.device.clone(),
        ));
        Self { log, executor, config }
    }

    fn command(&self, args: &[String]) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.config.mtx_path);
        command.arg("-f").arg(&self.config.device).args(args);
        command
    }

    async fn run(
        &self,
        args: &[String],
    ) -> Result<std::process::Output, ExecutionError> {
        let mut command = self.command(args);
        self.executor.execute(&mut command, self.config.timeout()).await
    }
}

#[async_trait]
impl RobotCommands for MtxRobot {
    async fn status(
        &self,
    ) -> Result<TapeResponse<TapeLibraryState>, ExecutionError> {
        let output = self.run(&["status".to_string()]).await?;
        let response = TapeResponse::from_output(&output);
        if !response.succeeded() {
            return Ok(response);
        }
        match response.output.stdout.parse::<TapeLibraryState>() {
            Ok(state) => Ok(response.with_entity(state)),
            Err(err) => {
                warn!(self.log, "unparseable mtx status"; "error" => %err);
                Ok(TapeResponse::new(StatusCode::Fatal, response.output))
            }
        }
    }

    async fn load_tape(
        &self,
        slot: u32,
        drive: u32,
    ) -> Result<TapeResponse, ExecutionError> {
        let output = self
            .run(&["load".to_string(), slot.to_string(), drive.to_string()])
            .await?;
        Ok(TapeResponse::from_output(&output))
    }

    async fn unload_tape(
        &self,
        slot: u32,
        drive: u32,
    ) -> Result<TapeResponse, ExecutionError> {
        let output = self
            .run(&["unload".to_string(), slot.to_string(), drive.to_string()])
            .await?;
        Ok(TapeResponse::from_output(&output))
    }
}

/// Parses the `:VolumeTag = X:AlternateVolumeTag = Y` tail of an element
/// line.
fn parse_tags<'a, I: Iterator<Item = &'a str>>(
    segments: I,
) -> Result<Option<TapeCartridge>, ParseError> {
    let mut volume_tag = None;
    let mut alternate = None;
    for segment in segments.map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = segment.split_once('=').ok_or_else(|| {
            ParseError(format!("Malformed element attribute '{}'", segment))
        })?;
        let value = value.trim();
        match key.trim() {
            "VolumeTag" if !value.is_empty() => {
                volume_tag = Some(value.to_string())
            }
            "AlternateVolumeTag" if !value.is_empty() => {
                alternate = Some(value.to_string())
            }
            _ => (),
        }
    }
    Ok(volume_tag.map(|tag| TapeCartridge {
        volume_tag: tag,
        alternate_volume_tag: alternate,
    }))
}

fn parse_index(s: &str, what: &str) -> Result<u32, ParseError> {
    s.trim().parse::<u32>().map_err(|e| {
        ParseError(format!("Failed to parse {} index '{}': {}", what, s, e))
    })
}

impl FromStr for TapeLibraryState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Lambda helpers for error handling.
        let expected_field = |name| {
            ParseError(format!("Missing '{}' value in mtx status output", name))
        };
        let failed_to_parse = |name, err| {
            ParseError(format!("Failed to parse field '{}': {}", name, err))
        };

        let mut header = None;
        let mut drives = vec![];
        let mut slots = vec![];

        for line in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("Storage Changer ") {
                // "/dev/sg5:4 Drives, 44 Slots ( 4 Import/Export )"
                let (device, counts) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| expected_field("drive count"))?;
                let mut values = counts.split_whitespace();
                let drive_count = values
                    .next()
                    .ok_or_else(|| expected_field("drive count"))?
                    .parse::<u32>()
                    .map_err(|e| failed_to_parse("drive count", e))?;
                let slot_count = values
                    .nth(1)
                    .ok_or_else(|| expected_field("slot count"))?
                    .parse::<u32>()
                    .map_err(|e| failed_to_parse("slot count", e))?;
                let mailbox_count = match values.nth(2) {
                    Some(v) => v
                        .parse::<u32>()
                        .map_err(|e| failed_to_parse("mailbox count", e))?,
                    None => 0,
                };
                header = Some((
                    device.to_string(),
                    drive_count,
                    slot_count,
                    mailbox_count,
                ));
            } else if let Some(rest) = line.strip_prefix("Data Transfer Element ")
            {
                // "0:Full (Storage Element 1 Loaded):VolumeTag = TAPE-1"
                let (index, tail) = rest
                    .split_once(':')
                    .ok_or_else(|| expected_field("drive state"))?;
                let index = parse_index(index, "drive")?;
                let mut segments = tail.split(':');
                let state = segments
                    .next()
                    .map(str::trim)
                    .ok_or_else(|| expected_field("drive state"))?;
                let (occupied, cartridge, source_slot) = if state
                    .starts_with("Empty")
                {
                    (false, None, None)
                } else if let Some(loaded) = state.strip_prefix("Full") {
                    let source_slot = loaded
                        .trim()
                        .strip_prefix("(Storage Element ")
                        .and_then(|s| s.strip_suffix("Loaded)"))
                        .map(|s| parse_index(s, "source slot"))
                        .transpose()?;
                    let cartridge = parse_tags(segments)?;
                    (true, cartridge, source_slot)
                } else {
                    return Err(ParseError(format!(
                        "Unknown drive state '{}'",
                        state
                    )));
                };
                drives.push(TapeDrive {
                    index,
                    occupied,
                    cartridge,
                    source_slot,
                });
            } else if let Some(rest) = line.strip_prefix("Storage Element ") {
                // "2:Full :VolumeTag=TAPE-2" or "41 IMPORT/EXPORT:Empty"
                let (head, tail) = rest
                    .split_once(':')
                    .ok_or_else(|| expected_field("slot state"))?;
                let mut head = head.split_whitespace();
                let index = parse_index(
                    head.next().ok_or_else(|| expected_field("slot index"))?,
                    "slot",
                )?;
                let kind = match head.next() {
                    Some("IMPORT/EXPORT") => SlotKind::ImportExport,
                    None => SlotKind::Storage,
                    Some(other) => {
                        return Err(ParseError(format!(
                            "Unknown slot kind '{}'",
                            other
                        )))
                    }
                };
                let mut segments = tail.split(':');
                let state = segments
                    .next()
                    .map(str::trim)
                    .ok_or_else(|| expected_field("slot state"))?;
                let (occupied, cartridge) = match state {
                    "Empty" => (false, None),
                    "Full" => (true, parse_tags(segments)?),
                    other => {
                        return Err(ParseError(format!(
                            "Unknown slot state '{}'",
                            other
                        )))
                    }
                };
                slots.push(TapeSlot { index, kind, occupied, cartridge });
            }
        }

        let (device, drive_count, slot_count, mailbox_count) =
            header.ok_or_else(|| expected_field("Storage Changer"))?;
        if drives.len() != drive_count as usize {
            return Err(ParseError(format!(
                "Changer reports {} drives but lists {}",
                drive_count,
                drives.len()
            )));
        }
        Ok(TapeLibraryState {
            device,
            drive_count,
            slot_count,
            mailbox_count,
            drives,
            slots,
        })
    }
}

fn render_tags(out: &mut String, cartridge: &TapeCartridge) {
    let _ = write!(out, ":VolumeTag = {}", cartridge.volume_tag);
    if let Some(alt) = &cartridge.alternate_volume_tag {
        let _ = write!(out, ":AlternateVolumeTag = {}", alt);
    }
}

/// Prints a library state the way `mtx status` does.
pub fn render_mtx_status(state: &TapeLibraryState) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "  Storage Changer {}:{} Drives, {} Slots ( {} Import/Export )\n",
        state.device, state.drive_count, state.slot_count, state.mailbox_count
    );
    for drive in &state.drives {
        let _ = write!(out, "Data Transfer Element {}:", drive.index);
        if drive.occupied {
            out.push_str("Full ");
            if let Some(slot) = drive.source_slot {
                let _ = write!(out, "(Storage Element {} Loaded)", slot);
            }
            if let Some(cartridge) = &drive.cartridge {
                render_tags(&mut out, cartridge);
            }
        } else {
            out.push_str("Empty");
        }
        out.push('\n');
    }
    for slot in &state.slots {
        let _ = write!(out, "      Storage Element {}", slot.index);
        if slot.kind == SlotKind::ImportExport {
            out.push_str(" IMPORT/EXPORT");
        }
        out.push(':');
        if slot.occupied {
            out.push_str("Full ");
            if let Some(cartridge) = &slot.cartridge {
                render_tags(&mut out, cartridge);
            }
        } else {
            out.push_str("Empty");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::{FakeExecutor, Input, OutputExt, StaticHandler};
    use std::process::Output;
    use tape_test_utils::dev::test_setup_log;

    const STATUS: &str = "  Storage Changer /dev/sg5:2 Drives, 4 Slots ( 1 Import/Export )
Data Transfer Element 0:Full (Storage Element 1 Loaded):VolumeTag = TAPE-1
Data Transfer Element 1:Empty
      Storage Element 1:Empty
      Storage Element 2:Full :VolumeTag=TAPE-2
      Storage Element 3:Full :VolumeTag=TAPE-3:AlternateVolumeTag=ALT-3
      Storage Element 4 IMPORT/EXPORT:Full :VolumeTag=TAPE-4
";

    #[test]
    fn test_parse_mtx_status() {
        let state: TapeLibraryState = STATUS.parse().unwrap();
        assert_eq!(state.device, "/dev/sg5");
        assert_eq!(state.drive_count, 2);
        assert_eq!(state.slot_count, 4);
        assert_eq!(state.mailbox_count, 1);

        let drive = state.drive(0).unwrap();
        assert_eq!(drive.cartridge, Some(TapeCartridge::new("TAPE-1")));
        assert_eq!(drive.source_slot, Some(1));
        assert_eq!(state.drive(1).unwrap().cartridge, None);

        assert!(!state.drive(1).unwrap().occupied);
        assert!(!state.slot(1).unwrap().occupied);
        assert_eq!(state.slot(1).unwrap().cartridge, None);
        assert!(state.slot(2).unwrap().occupied);
        assert_eq!(
            state.slot(3).unwrap().cartridge,
            Some(TapeCartridge::new("TAPE-3").with_alternate("ALT-3"))
        );
        let mailbox = state.slot(4).unwrap();
        assert_eq!(mailbox.kind, SlotKind::ImportExport);
        assert_eq!(state.find_slot_of("TAPE-4").unwrap().index, 4);
    }

    #[test]
    fn test_parse_unlabelled_cartridges() {
        let status = "  Storage Changer /dev/sg5:1 Drives, 2 Slots ( 0 Import/Export )
Data Transfer Element 0:Full (Storage Element 1 Loaded)
      Storage Element 1:Empty
      Storage Element 2:Full
";
        let state: TapeLibraryState = status.parse().unwrap();
        let drive = state.drive(0).unwrap();
        assert!(drive.occupied);
        assert_eq!(drive.cartridge, None);
        assert_eq!(drive.source_slot, Some(1));

        assert!(!state.slot(1).unwrap().occupied);
        let slot = state.slot(2).unwrap();
        assert!(slot.occupied);
        assert_eq!(slot.cartridge, None);

        let rendered = render_mtx_status(&state);
        assert_eq!(rendered.parse::<TapeLibraryState>().unwrap(), state);
    }

    #[test]
    fn test_parse_mtx_status_rejects_garbage() {
        assert_eq!(
            "mtx: cannot open SCSI device".parse::<TapeLibraryState>(),
            Err(ParseError(
                "Missing 'Storage Changer' value in mtx status output"
                    .to_string()
            ))
        );
        assert_eq!(
            "Storage Changer /dev/sg5:X Drives, 4 Slots"
                .parse::<TapeLibraryState>(),
            Err(ParseError(
                "Failed to parse field 'drive count': invalid digit found in string"
                    .to_string()
            ))
        );
        let missing_drive = "Storage Changer /dev/sg5:2 Drives, 1 Slots ( 0 Import/Export )
Data Transfer Element 0:Empty
      Storage Element 1:Empty";
        assert!(missing_drive.parse::<TapeLibraryState>().is_err());
    }

    #[test]
    fn test_render_mtx_status_parses_back() {
        let state: TapeLibraryState = STATUS.parse().unwrap();
        let rendered = render_mtx_status(&state);
        assert_eq!(rendered.parse::<TapeLibraryState>().unwrap(), state);
    }

    #[tokio::test]
    async fn test_mtx_robot_commands() {
        let logctx = test_setup_log("test_mtx_robot_commands");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect(
            Input::shell("/usr/sbin/mtx -f /dev/sg5 status"),
            Output::success().set_stdout(STATUS),
        );
        handler.expect_ok("/usr/sbin/mtx -f /dev/sg5 load 2 1");
        handler.expect(
            Input::shell("/usr/sbin/mtx -f /dev/sg5 load 2 1"),
            Output::exited(1).set_stderr("Drive 1 Full (Storage Element 2 loaded)"),
        );
        handler.expect(
            Input::shell("/usr/sbin/mtx -f /dev/sg5 status"),
            Output::success().set_stdout("garbage"),
        );
        handler.register(&executor);

        let config = MtxRobotConfig {
            device: "/dev/sg5".to_string(),
            mtx_path: MTX.to_string(),
            timeout_ms: 1000,
        };
        let robot = MtxRobot::new(&logctx.log, executor.as_executor(), config);

        let status = robot.status().await.unwrap();
        assert!(status.is_ok());
        assert_eq!(status.entity.unwrap().slots.len(), 4);

        assert!(robot.load_tape(2, 1).await.unwrap().is_ok());
        let second = robot.load_tape(2, 1).await.unwrap();
        assert_eq!(second.status, StatusCode::Ko);
        assert!(second.output.stderr.contains("Full"));

        let garbage = robot.status().await.unwrap();
        assert_eq!(garbage.status, StatusCode::Fatal);
        assert!(garbage.entity.is_none());

        drop(robot);
        logctx.cleanup_successful();
    }
}
