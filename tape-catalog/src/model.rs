// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Catalog records and queue messages.

use crate::error::Error;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tape_common::typed_uuid::{QueueEntryUuid, TapeUuid};

/// Enums persisted as text columns.
macro_rules! impl_column_enum {
    ($name:ident { $($variant:ident => $text:literal),* $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)*
                    other => Err(Error::InvalidDocument(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TapeLocationType {
    Drive,
    Slot,
    ImportExport,
}

impl_column_enum!(TapeLocationType {
    Drive => "DRIVE",
    Slot => "SLOT",
    ImportExport => "IMPORT_EXPORT",
});

/// Where a cartridge sits.  Drive indexes are 0-based, slot indexes 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TapeLocation {
    pub location_type: TapeLocationType,
    pub index: u32,
}

impl TapeLocation {
    pub fn drive(index: u32) -> Self {
        Self { location_type: TapeLocationType::Drive, index }
    }

    pub fn slot(index: u32) -> Self {
        Self { location_type: TapeLocationType::Slot, index }
    }

    pub fn import_export(index: u32) -> Self {
        Self { location_type: TapeLocationType::ImportExport, index }
    }

    /// True for locations the robot can load from or unload to.
    pub fn is_storage(&self) -> bool {
        matches!(
            self.location_type,
            TapeLocationType::Slot | TapeLocationType::ImportExport
        )
    }
}

impl fmt::Display for TapeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.location_type, self.index)
    }
}

/// What is on the medium.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TapeState {
    /// Never written by us.
    Empty,
    /// Holds files and accepts more.
    Open,
    /// No more room.
    Full,
    /// Content does not match the catalog; needs an operator.
    Conflict,
}

impl_column_enum!(TapeState {
    Empty => "EMPTY",
    Open => "OPEN",
    Full => "FULL",
    Conflict => "CONFLICT",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Ready,
    Ongoing,
    Error,
    Complete,
}

impl_column_enum!(QueueState {
    Ready => "READY",
    Ongoing => "ONGOING",
    Error => "ERROR",
    Complete => "COMPLETE",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueMessageType {
    TapeCatalog,
    WriteOrder,
    ReadOrder,
}

impl_column_enum!(QueueMessageType {
    TapeCatalog => "TapeCatalog",
    WriteOrder => "WriteOrder",
    ReadOrder => "ReadOrder",
});

/// One physical cartridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeCatalog {
    pub id: TapeUuid,
    /// Volume tag printed on the label; unique within `library`.
    pub code: String,
    pub alternative_code: Option<String>,
    pub library: String,
    pub current_location: TapeLocation,
    pub previous_location: Option<TapeLocation>,
    pub version: i64,
    /// Lease state: a READY tape may be claimed by one drive worker.
    pub queue_state: QueueState,
    pub priority: i32,
    pub tape_state: TapeState,
    /// Bucket the tape is dedicated to once written.
    pub bucket: Option<String>,
    pub cartridge_type: Option<String>,
    pub worm: bool,
    pub file_count: u32,
    pub written_bytes: u64,
    pub current_position: u32,
    pub last_update: DateTime<Utc>,
}

impl TapeCatalog {
    /// A tape first seen at `location`.
    pub fn new<C: Into<String>, L: Into<String>>(
        code: C,
        library: L,
        current_location: TapeLocation,
    ) -> Self {
        Self {
            id: TapeUuid::new_v4(),
            code: code.into(),
            alternative_code: None,
            library: library.into(),
            current_location,
            previous_location: None,
            version: 0,
            queue_state: QueueState::Ready,
            priority: 0,
            tape_state: TapeState::Empty,
            bucket: None,
            cartridge_type: None,
            worm: false,
            file_count: 0,
            written_bytes: 0,
            current_position: 0,
            last_update: Utc::now(),
        }
    }
}

/// Named field changes for a partial update.  `None` leaves a field alone;
/// for nullable fields `Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TapeCatalogUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_code: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_location: Option<TapeLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_location: Option<Option<TapeLocation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tape_state: Option<TapeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cartridge_type: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worm: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_position: Option<u32>,
}

impl TapeCatalogUpdate {
    pub fn is_empty(&self) -> bool {
        *self == TapeCatalogUpdate::default()
    }

    /// Applies the same changes to an in-memory copy.
    pub fn apply_to(&self, tape: &mut TapeCatalog) {
        if let Some(v) = &self.alternative_code {
            tape.alternative_code = v.clone();
        }
        if let Some(v) = &self.library {
            tape.library = v.clone();
        }
        if let Some(v) = self.current_location {
            tape.current_location = v;
        }
        if let Some(v) = self.previous_location {
            tape.previous_location = v;
        }
        if let Some(v) = self.priority {
            tape.priority = v;
        }
        if let Some(v) = self.tape_state {
            tape.tape_state = v;
        }
        if let Some(v) = &self.bucket {
            tape.bucket = v.clone();
        }
        if let Some(v) = &self.cartridge_type {
            tape.cartridge_type = v.clone();
        }
        if let Some(v) = self.worm {
            tape.worm = v;
        }
        if let Some(v) = self.file_count {
            tape.file_count = v;
        }
        if let Some(v) = self.written_bytes {
            tape.written_bytes = v;
        }
        if let Some(v) = self.current_position {
            tape.current_position = v;
        }
    }
}

/// A payload that can be carried by a [`crate::DurableQueue`].
pub trait QueueMessage:
    Serialize + DeserializeOwned + Send + Sync + Unpin + 'static
{
    const MESSAGE_TYPE: QueueMessageType;
}

/// Archive `file_path` onto a tape dedicated to `bucket`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOrder {
    pub bucket: String,
    pub file_path: Utf8PathBuf,
    pub size: u64,
}

impl QueueMessage for WriteOrder {
    const MESSAGE_TYPE: QueueMessageType = QueueMessageType::WriteOrder;
}

/// Copy the file at `file_position` of tape `tape_code` into `output_path`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOrder {
    pub library: String,
    pub tape_code: String,
    pub file_position: u32,
    pub output_path: Utf8PathBuf,
}

impl QueueMessage for ReadOrder {
    const MESSAGE_TYPE: QueueMessageType = QueueMessageType::ReadOrder;
}

/// A queued message and its lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueEntry<T> {
    pub id: QueueEntryUuid,
    pub message_type: QueueMessageType,
    pub state: QueueState,
    pub priority: i32,
    pub created: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Number of times the entry was leased.
    pub attempts: u32,
    /// Diagnostic recorded by the last failure.
    pub last_error: Option<String>,
    pub payload: T,
}

/// Entry counts of one message type, by state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub ongoing: u64,
    pub error: u64,
    pub complete: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_column_enums() {
        assert_eq!(TapeLocationType::ImportExport.as_str(), "IMPORT_EXPORT");
        assert_eq!(
            "IMPORT_EXPORT".parse::<TapeLocationType>().unwrap(),
            TapeLocationType::ImportExport
        );
        assert_eq!("ONGOING".parse::<QueueState>().unwrap(), QueueState::Ongoing);
        let error = "LOST".parse::<TapeState>().unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid document: unknown TapeState 'LOST'"
        );
    }

    #[test]
    fn test_update_apply_and_serialize() {
        let mut tape = TapeCatalog::new("T001", "lib", TapeLocation::slot(3));
        let update = TapeCatalogUpdate {
            current_location: Some(TapeLocation::drive(1)),
            previous_location: Some(Some(TapeLocation::slot(3))),
            alternative_code: Some(None),
            ..Default::default()
        };
        assert!(!update.is_empty());
        assert!(TapeCatalogUpdate::default().is_empty());

        update.apply_to(&mut tape);
        assert_eq!(tape.current_location, TapeLocation::drive(1));
        assert_eq!(tape.previous_location, Some(TapeLocation::slot(3)));

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "alternative_code": null,
                "current_location": {"location_type": "DRIVE", "index": 1},
                "previous_location": {"location_type": "SLOT", "index": 3},
            })
        );
    }
}
