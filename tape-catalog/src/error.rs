// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use tape_common::typed_uuid::TapeUuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tape '{code}' already exists in library '{library}'")]
    AlreadyExists { library: String, code: String },

    #[error("tape {id} still conflicting after {attempts} update attempts")]
    Conflict { id: TapeUuid, attempts: u32 },

    #[error("catalog database error")]
    Database(#[from] sqlx::Error),

    #[error("failed to (de)serialize queue payload")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl Error {
    /// True when a unique index rejected the write.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        }
    }
}
