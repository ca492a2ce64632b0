// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operations a robot and a drive expose.
//!
//! Every operation is bounded by the timeout its implementation was
//! configured with.  A negative hardware outcome comes back as a
//! [`TapeResponse`] whose status is not `Ok`; only failures to run the
//! command at all are errors.

use crate::error::ExecutionError;
use crate::response::TapeResponse;
use crate::state::{TapeDriveState, TapeLibraryState};
use async_trait::async_trait;
use camino::Utf8Path;
use std::sync::Arc;

/// The mechanical arm moving cartridges between slots and drives.
#[async_trait]
pub trait RobotCommands: Send + Sync {
    /// Inventory of every slot and drive.
    async fn status(
        &self,
    ) -> Result<TapeResponse<TapeLibraryState>, ExecutionError>;

    /// Moves the cartridge in storage element `slot` into drive `drive`.
    async fn load_tape(
        &self,
        slot: u32,
        drive: u32,
    ) -> Result<TapeResponse, ExecutionError>;

    /// Moves the cartridge in drive `drive` into storage element `slot`.
    async fn unload_tape(
        &self,
        slot: u32,
        drive: u32,
    ) -> Result<TapeResponse, ExecutionError>;
}

/// One physical read/write unit.
#[async_trait]
pub trait DriveCommands: Send + Sync {
    async fn status(
        &self,
    ) -> Result<TapeResponse<TapeDriveState>, ExecutionError>;

    async fn rewind(&self) -> Result<TapeResponse, ExecutionError>;

    async fn erase(&self) -> Result<TapeResponse, ExecutionError>;

    /// Takes the drive offline so the robot can pull the cartridge.
    async fn eject(&self) -> Result<TapeResponse, ExecutionError>;

    /// Skips `count` filemarks forward, or backward if `backward` is set.
    async fn move_position(
        &self,
        count: u32,
        backward: bool,
    ) -> Result<TapeResponse, ExecutionError>;

    /// Positions the tape after the last recorded file.
    async fn go_to_end(&self) -> Result<TapeResponse, ExecutionError>;

    /// Appends the contents of `input` as one file at the current position.
    async fn write_to_tape(
        &self,
        input: &Utf8Path,
    ) -> Result<TapeResponse, ExecutionError>;

    /// Copies the file at the current position into `output`.
    async fn read_from_tape(
        &self,
        output: &Utf8Path,
    ) -> Result<TapeResponse, ExecutionError>;
}

pub type BoxedRobotCommands = Arc<dyn RobotCommands>;
pub type BoxedDriveCommands = Arc<dyn DriveCommands>;
