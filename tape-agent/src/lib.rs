// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cold-storage agent for tape libraries: reconciles the catalog with the
//! hardware and drives archive and restore orders through the drives.

pub mod agent;
pub mod config;
pub mod library;
pub mod manager;
pub mod operator;
pub mod reconciler;
pub mod worker;

pub use agent::{AgentError, RunningTapeAgent, TapeAgent};
pub use config::Config;
