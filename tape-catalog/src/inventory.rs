// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tape records with optimistic concurrency.
//!
//! Every successful write increments `version`.  Writers state the version
//! they read; a write against any other version matches nothing and reports
//! `false` rather than an error, leaving the caller to re-read and retry.

use crate::criteria::TapeCriteria;
use crate::error::Error;
use crate::model::{
    QueueState, TapeCatalog, TapeCatalogUpdate, TapeLocation,
    TapeLocationType, TapeState,
};
use crate::store::{from_micros, now_micros};
use slog::{debug, info, o, warn, Logger};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tape_common::backoff::{retry_policy_conflict, Backoff};
use tape_common::typed_uuid::TapeUuid;

const TAPE_COLUMNS: &str = "id, library, code, alternative_code, \
    current_location_type, current_location_index, previous_location_type, \
    previous_location_index, version, queue_state, priority, tape_state, \
    bucket, cartridge_type, worm, file_count, written_bytes, \
    current_position, created_at, last_update";

/// Result of [`TapeInventory::update_tape_with_retry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryUpdate {
    /// Changes were written; holds the record as now persisted.
    Updated(TapeCatalog),
    /// The record already matched; nothing was written.
    Unchanged(TapeCatalog),
    NotFound,
}

#[derive(Clone)]
pub struct TapeInventory {
    log: Logger,
    pool: SqlitePool,
}

impl TapeInventory {
    pub(crate) fn new(log: &Logger, pool: SqlitePool) -> Self {
        Self { log: log.new(o!("component" => "TapeInventory")), pool }
    }

    /// Inserts a new record at version 0, whatever `tape.version` says.
    /// Fails with [`Error::AlreadyExists`] when the library already holds a
    /// tape with the same code.
    pub async fn create_tape(&self, tape: &TapeCatalog) -> Result<(), Error> {
        let sql = format!(
            "INSERT INTO tape_catalog ({}) VALUES \
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TAPE_COLUMNS
        );
        let now = now_micros();
        let (previous_type, previous_index) =
            split_location(tape.previous_location);
        let result = sqlx::query(&sql)
            .bind(tape.id.to_string())
            .bind(&tape.library)
            .bind(&tape.code)
            .bind(&tape.alternative_code)
            .bind(tape.current_location.location_type.as_str())
            .bind(i64::from(tape.current_location.index))
            .bind(previous_type)
            .bind(previous_index)
            .bind(0_i64)
            .bind(tape.queue_state.as_str())
            .bind(tape.priority)
            .bind(tape.tape_state.as_str())
            .bind(&tape.bucket)
            .bind(&tape.cartridge_type)
            .bind(tape.worm)
            .bind(i64::from(tape.file_count))
            .bind(to_i64(tape.written_bytes)?)
            .bind(i64::from(tape.current_position))
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                info!(self.log, "tape created";
                    "id" => %tape.id,
                    "library" => &tape.library,
                    "code" => &tape.code,
                    "location" => %tape.current_location,
                );
                Ok(())
            }
            Err(e) if Error::is_unique_violation(&e) => {
                Err(Error::AlreadyExists {
                    library: tape.library.clone(),
                    code: tape.code.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrites the record with `tape` if the stored version still equals
    /// `tape.version`.  Returns whether a record matched.
    pub async fn replace_tape(&self, tape: &TapeCatalog) -> Result<bool, Error> {
        let (previous_type, previous_index) =
            split_location(tape.previous_location);
        let result = sqlx::query(
            "UPDATE tape_catalog SET \
                library = ?, code = ?, alternative_code = ?, \
                current_location_type = ?, current_location_index = ?, \
                previous_location_type = ?, previous_location_index = ?, \
                queue_state = ?, priority = ?, tape_state = ?, bucket = ?, \
                cartridge_type = ?, worm = ?, file_count = ?, \
                written_bytes = ?, current_position = ?, last_update = ?, \
                version = version + 1 \
             WHERE id = ? AND version = ?",
        )
        .bind(&tape.library)
        .bind(&tape.code)
        .bind(&tape.alternative_code)
        .bind(tape.current_location.location_type.as_str())
        .bind(i64::from(tape.current_location.index))
        .bind(previous_type)
        .bind(previous_index)
        .bind(tape.queue_state.as_str())
        .bind(tape.priority)
        .bind(tape.tape_state.as_str())
        .bind(&tape.bucket)
        .bind(&tape.cartridge_type)
        .bind(tape.worm)
        .bind(i64::from(tape.file_count))
        .bind(to_i64(tape.written_bytes)?)
        .bind(i64::from(tape.current_position))
        .bind(now_micros())
        .bind(tape.id.to_string())
        .bind(tape.version)
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_write_error(e, tape))?;

        let matched = result.rows_affected() == 1;
        debug!(self.log, "replace tape";
            "id" => %tape.id,
            "expected_version" => tape.version,
            "matched" => matched,
        );
        Ok(matched)
    }

    /// Applies `changes` if the stored version equals `expected_version`.
    /// Returns whether a record matched.
    pub async fn update_tape(
        &self,
        id: TapeUuid,
        expected_version: i64,
        changes: &TapeCatalogUpdate,
    ) -> Result<bool, Error> {
        self.update_tape_at(id, expected_version, changes, now_micros()).await
    }

    async fn update_tape_at(
        &self,
        id: TapeUuid,
        expected_version: i64,
        changes: &TapeCatalogUpdate,
        now: i64,
    ) -> Result<bool, Error> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "UPDATE tape_catalog SET version = version + 1, last_update = ",
        );
        qb.push_bind(now);
        if let Some(v) = &changes.alternative_code {
            qb.push(", alternative_code = ").push_bind(v.clone());
        }
        if let Some(v) = &changes.library {
            qb.push(", library = ").push_bind(v.clone());
        }
        if let Some(v) = changes.current_location {
            qb.push(", current_location_type = ")
                .push_bind(v.location_type.as_str())
                .push(", current_location_index = ")
                .push_bind(i64::from(v.index));
        }
        if let Some(v) = changes.previous_location {
            let (t, i) = split_location(v);
            qb.push(", previous_location_type = ")
                .push_bind(t)
                .push(", previous_location_index = ")
                .push_bind(i);
        }
        if let Some(v) = changes.priority {
            qb.push(", priority = ").push_bind(v);
        }
        if let Some(v) = changes.tape_state {
            qb.push(", tape_state = ").push_bind(v.as_str());
        }
        if let Some(v) = &changes.bucket {
            qb.push(", bucket = ").push_bind(v.clone());
        }
        if let Some(v) = &changes.cartridge_type {
            qb.push(", cartridge_type = ").push_bind(v.clone());
        }
        if let Some(v) = changes.worm {
            qb.push(", worm = ").push_bind(v);
        }
        if let Some(v) = changes.file_count {
            qb.push(", file_count = ").push_bind(i64::from(v));
        }
        if let Some(v) = changes.written_bytes {
            qb.push(", written_bytes = ").push_bind(to_i64(v)?);
        }
        if let Some(v) = changes.current_position {
            qb.push(", current_position = ").push_bind(i64::from(v));
        }
        qb.push(" WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND version = ")
            .push_bind(expected_version);

        let result = qb.build().execute(&self.pool).await?;

        let matched = result.rows_affected() == 1;
        debug!(self.log, "update tape";
            "id" => %id,
            "expected_version" => expected_version,
            "matched" => matched,
        );
        Ok(matched)
    }

    /// Like [`TapeInventory::update_tape`] against `tape.version`, but also
    /// applies the changes to `tape` and advances its version on success.
    pub async fn apply_update(
        &self,
        tape: &mut TapeCatalog,
        changes: &TapeCatalogUpdate,
    ) -> Result<bool, Error> {
        let now = now_micros();
        let matched =
            self.update_tape_at(tape.id, tape.version, changes, now).await?;
        if matched {
            changes.apply_to(tape);
            tape.version += 1;
            tape.last_update = from_micros(now)?;
        }
        Ok(matched)
    }

    /// Re-reads the record and applies the changes computed from it until a
    /// write matches, at most `max_attempts` times.
    pub async fn update_tape_with_retry<F>(
        &self,
        id: TapeUuid,
        max_attempts: u32,
        mut compute_changes: F,
    ) -> Result<RetryUpdate, Error>
    where
        F: FnMut(&TapeCatalog) -> TapeCatalogUpdate,
    {
        let mut backoff = retry_policy_conflict();
        let mut attempts = 0;
        loop {
            let Some(mut tape) = self.find_tape_by_id(id).await? else {
                return Ok(RetryUpdate::NotFound);
            };
            let changes = compute_changes(&tape);
            if changes.is_empty() {
                return Ok(RetryUpdate::Unchanged(tape));
            }
            if self.apply_update(&mut tape, &changes).await? {
                return Ok(RetryUpdate::Updated(tape));
            }

            attempts += 1;
            if attempts >= max_attempts {
                return Err(Error::Conflict { id, attempts });
            }
            let delay = backoff.next_backoff().unwrap_or_default();
            warn!(self.log, "version conflict, re-reading tape";
                "id" => %id,
                "attempts" => attempts,
                "delay" => ?delay,
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn find_tape_by_id(
        &self,
        id: TapeUuid,
    ) -> Result<Option<TapeCatalog>, Error> {
        let sql =
            format!("SELECT {} FROM tape_catalog WHERE id = ?", TAPE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tape_from_row).transpose()
    }

    pub async fn find_tape_by_code(
        &self,
        library: &str,
        code: &str,
    ) -> Result<Option<TapeCatalog>, Error> {
        let mut tapes = self
            .find_tapes(&TapeCriteria::new().library(library).code(code))
            .await?;
        Ok(tapes.pop())
    }

    /// All tapes matching `criteria`, ordered by library then code.
    pub async fn find_tapes(
        &self,
        criteria: &TapeCriteria,
    ) -> Result<Vec<TapeCatalog>, Error> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM tape_catalog WHERE 1 = 1",
            TAPE_COLUMNS
        ));
        criteria.push_conditions(&mut qb);
        qb.push(" ORDER BY library, code");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(tape_from_row).collect()
    }

    /// Atomically leases one READY tape matching `criteria`, highest
    /// priority first, and returns it in the ONGOING state.
    pub async fn receive_tape(
        &self,
        criteria: &TapeCriteria,
    ) -> Result<Option<TapeCatalog>, Error> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "UPDATE tape_catalog SET queue_state = 'ONGOING', \
             version = version + 1, last_update = ",
        );
        qb.push_bind(now_micros());
        qb.push(
            " WHERE queue_state = 'READY' AND id = \
             (SELECT id FROM tape_catalog WHERE queue_state = 'READY'",
        );
        criteria.push_conditions(&mut qb);
        qb.push(" ORDER BY priority DESC, created_at, rowid LIMIT 1)");
        qb.push(" RETURNING ").push(TAPE_COLUMNS);

        let row = qb.build().fetch_optional(&self.pool).await?;
        let tape = row.as_ref().map(tape_from_row).transpose()?;
        if let Some(tape) = &tape {
            debug!(self.log, "tape leased";
                "id" => %tape.id,
                "code" => &tape.code,
            );
        }
        Ok(tape)
    }

    /// Returns a leased tape to READY.  Returns the number of records
    /// changed.
    pub async fn release_tape(&self, id: TapeUuid) -> Result<u64, Error> {
        self.set_queue_state(id, QueueState::Ready).await
    }

    /// Parks a tape in ERROR so that no worker leases it again until an
    /// operator intervenes.
    pub async fn mark_tape_error(&self, id: TapeUuid) -> Result<u64, Error> {
        self.set_queue_state(id, QueueState::Error).await
    }

    async fn set_queue_state(
        &self,
        id: TapeUuid,
        state: QueueState,
    ) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE tape_catalog SET queue_state = ?, \
             version = version + 1, last_update = ? \
             WHERE id = ? AND queue_state != ?",
        )
        .bind(state.as_str())
        .bind(now_micros())
        .bind(id.to_string())
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn map_write_error(&self, e: sqlx::Error, tape: &TapeCatalog) -> Error {
        if Error::is_unique_violation(&e) {
            Error::AlreadyExists {
                library: tape.library.clone(),
                code: tape.code.clone(),
            }
        } else {
            e.into()
        }
    }
}

fn split_location(
    location: Option<TapeLocation>,
) -> (Option<&'static str>, Option<i64>) {
    match location {
        Some(l) => (Some(l.location_type.as_str()), Some(i64::from(l.index))),
        None => (None, None),
    }
}

fn to_i64(value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| {
        Error::InvalidDocument(format!("value out of range: {}", value))
    })
}

fn column_u32(row: &SqliteRow, name: &str) -> Result<u32, Error> {
    let value: i64 = row.try_get(name)?;
    u32::try_from(value).map_err(|_| {
        Error::InvalidDocument(format!("{} out of range: {}", name, value))
    })
}

fn location_from_columns(
    location_type: Option<String>,
    index: Option<i64>,
) -> Result<Option<TapeLocation>, Error> {
    match (location_type, index) {
        (Some(t), Some(i)) => {
            let location_type: TapeLocationType = t.parse()?;
            let index = u32::try_from(i).map_err(|_| {
                Error::InvalidDocument(format!("location index {}", i))
            })?;
            Ok(Some(TapeLocation { location_type, index }))
        }
        (None, None) => Ok(None),
        _ => Err(Error::InvalidDocument(
            "partially set tape location".to_string(),
        )),
    }
}

fn tape_from_row(row: &SqliteRow) -> Result<TapeCatalog, Error> {
    let id: String = row.try_get("id")?;
    let id = id
        .parse::<TapeUuid>()
        .map_err(|e| Error::InvalidDocument(e.to_string()))?;
    let current_location = location_from_columns(
        row.try_get("current_location_type")?,
        row.try_get("current_location_index")?,
    )?
    .ok_or_else(|| {
        Error::InvalidDocument(format!("tape {} has no location", id))
    })?;
    let previous_location = location_from_columns(
        row.try_get("previous_location_type")?,
        row.try_get("previous_location_index")?,
    )?;
    let queue_state: String = row.try_get("queue_state")?;
    let tape_state: String = row.try_get("tape_state")?;
    let written_bytes: i64 = row.try_get("written_bytes")?;

    Ok(TapeCatalog {
        id,
        code: row.try_get("code")?,
        alternative_code: row.try_get("alternative_code")?,
        library: row.try_get("library")?,
        current_location,
        previous_location,
        version: row.try_get("version")?,
        queue_state: queue_state.parse()?,
        priority: row.try_get("priority")?,
        tape_state: tape_state.parse::<TapeState>()?,
        bucket: row.try_get("bucket")?,
        cartridge_type: row.try_get("cartridge_type")?,
        worm: row.try_get("worm")?,
        file_count: column_u32(row, "file_count")?,
        written_bytes: u64::try_from(written_bytes).map_err(|_| {
            Error::InvalidDocument(format!("written_bytes {}", written_bytes))
        })?,
        current_position: column_u32(row, "current_position")?,
        last_update: from_micros(row.try_get("last_update")?)?,
    })
}
