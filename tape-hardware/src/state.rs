// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware state as reported by status queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Labels of a cartridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeCartridge {
    pub volume_tag: String,
    pub alternate_volume_tag: Option<String>,
}

impl TapeCartridge {
    pub fn new<S: Into<String>>(volume_tag: S) -> Self {
        Self { volume_tag: volume_tag.into(), alternate_volume_tag: None }
    }

    pub fn with_alternate<S: Into<String>>(mut self, tag: S) -> Self {
        self.alternate_volume_tag = Some(tag.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Storage,
    /// A mailbox slot used to move cartridges in and out of the library.
    ImportExport,
}

/// A storage element of the changer.  Indexes are 1-based.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeSlot {
    pub index: u32,
    pub kind: SlotKind,
    /// True if the changer reports the element full, labelled or not.
    pub occupied: bool,
    /// Labels read from the cartridge; `None` for a full element whose
    /// barcode could not be read.
    pub cartridge: Option<TapeCartridge>,
}

/// A data transfer element of the changer.  Indexes are 0-based.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeDrive {
    pub index: u32,
    pub occupied: bool,
    pub cartridge: Option<TapeCartridge>,
    /// The storage element the loaded cartridge came from, when the changer
    /// remembers it.
    pub source_slot: Option<u32>,
}

/// What `mtx status` reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeLibraryState {
    pub device: String,
    pub drive_count: u32,
    pub slot_count: u32,
    pub mailbox_count: u32,
    pub drives: Vec<TapeDrive>,
    pub slots: Vec<TapeSlot>,
}

impl TapeLibraryState {
    pub fn drive(&self, index: u32) -> Option<&TapeDrive> {
        self.drives.iter().find(|d| d.index == index)
    }

    pub fn slot(&self, index: u32) -> Option<&TapeSlot> {
        self.slots.iter().find(|s| s.index == index)
    }

    /// Finds the slot currently holding the cartridge labelled `volume_tag`.
    pub fn find_slot_of(&self, volume_tag: &str) -> Option<&TapeSlot> {
        self.slots.iter().find(|s| {
            s.cartridge.as_ref().is_some_and(|c| c.volume_tag == volume_tag)
        })
    }
}

/// Status bits printed by `mt status`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DriveStatusFlag {
    /// Beginning of tape.
    Bot,
    /// At a filemark.
    Eof,
    /// End of tape.
    Eot,
    /// End of recorded data.
    Eod,
    Online,
    /// No cartridge in the drive.
    DrOpen,
    WriteProtected,
    ImmediateReport,
    Other(String),
}

impl FromStr for DriveStatusFlag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BOT" => DriveStatusFlag::Bot,
            "EOF" => DriveStatusFlag::Eof,
            "EOT" => DriveStatusFlag::Eot,
            "EOD" => DriveStatusFlag::Eod,
            "ONLINE" => DriveStatusFlag::Online,
            "DR_OPEN" => DriveStatusFlag::DrOpen,
            "WR_PROT" => DriveStatusFlag::WriteProtected,
            "IM_REP_EN" => DriveStatusFlag::ImmediateReport,
            other => DriveStatusFlag::Other(other.to_string()),
        })
    }
}

impl fmt::Display for DriveStatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriveStatusFlag::Bot => "BOT",
            DriveStatusFlag::Eof => "EOF",
            DriveStatusFlag::Eot => "EOT",
            DriveStatusFlag::Eod => "EOD",
            DriveStatusFlag::Online => "ONLINE",
            DriveStatusFlag::DrOpen => "DR_OPEN",
            DriveStatusFlag::WriteProtected => "WR_PROT",
            DriveStatusFlag::ImmediateReport => "IM_REP_EN",
            DriveStatusFlag::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// What `mt status` reports.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeDriveState {
    /// `-1` when the position is unknown.
    pub file_number: i64,
    pub block_number: i64,
    pub partition: i64,
    pub block_size: Option<u64>,
    pub density_code: Option<String>,
    /// Cartridge generation derived from the density, e.g. `LTO-6`.
    pub cartridge_type: Option<String>,
    pub soft_error_count: Option<u64>,
    pub flags: BTreeSet<DriveStatusFlag>,
}

impl TapeDriveState {
    pub fn has(&self, flag: &DriveStatusFlag) -> bool {
        self.flags.contains(flag)
    }

    /// True if a cartridge is present and ready.
    pub fn is_loaded(&self) -> bool {
        !self.has(&DriveStatusFlag::DrOpen)
    }

    pub fn is_write_protected(&self) -> bool {
        self.has(&DriveStatusFlag::WriteProtected)
    }
}
