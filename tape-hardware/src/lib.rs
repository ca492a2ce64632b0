// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Commands for tape library robots and drives.
//!
//! Robots are driven with `mtx`, drives with `mt` and `dd`.  Each command
//! returns a [`TapeResponse`]: hardware that refuses an action is a normal
//! outcome, not an error.

pub mod commands;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod mt;
pub mod mtx;
pub mod response;
pub mod state;

pub use commands::{
    BoxedDriveCommands, BoxedRobotCommands, DriveCommands, RobotCommands,
};
pub use error::{ExecutionError, ParseError};
pub use response::{CommandOutput, StatusCode, TapeResponse};
