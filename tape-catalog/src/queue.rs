// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable, typed work queues.
//!
//! Entries move READY -> ONGOING on [`DurableQueue::receive`], then to
//! COMPLETE or ERROR, or back to READY.  Lifecycle operations report how
//! many entries they changed: zero means the entry was missing or not in a
//! state the transition applies to.

use crate::criteria::PayloadFilter;
use crate::error::Error;
use crate::model::{QueueEntry, QueueMessage, QueueState, QueueStats};
use crate::store::{from_micros, now_micros};
use slog::{debug, info, o, Logger};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::marker::PhantomData;
use tape_common::typed_uuid::QueueEntryUuid;

const ENTRY_COLUMNS: &str = "id, message_type, queue_state, priority, \
    created_at, last_update, attempts, last_error, payload";

/// How [`DurableQueue::receive`] picks an entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiveOptions {
    /// Highest priority first when set, otherwise strictly oldest first.
    pub priority_ordered: bool,
    pub filter: PayloadFilter,
    /// JSON merge patch applied to the payload of the leased entry.
    pub update: Option<serde_json::Value>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self { priority_ordered: true, filter: PayloadFilter::new(), update: None }
    }
}

impl ReceiveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fifo(mut self) -> Self {
        self.priority_ordered = false;
        self
    }

    pub fn filter(mut self, filter: PayloadFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn update(mut self, patch: serde_json::Value) -> Self {
        self.update = Some(patch);
        self
    }
}

/// Queue of one message type.
pub struct DurableQueue<T> {
    log: Logger,
    pool: SqlitePool,
    _message: PhantomData<fn() -> T>,
}

impl<T> Clone for DurableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            pool: self.pool.clone(),
            _message: PhantomData,
        }
    }
}

impl<T: QueueMessage> DurableQueue<T> {
    pub(crate) fn new(log: &Logger, pool: SqlitePool) -> Self {
        let log = log.new(o!(
            "component" => "DurableQueue",
            "message_type" => T::MESSAGE_TYPE.as_str(),
        ));
        Self { log, pool, _message: PhantomData }
    }

    /// Enqueues `payload` in the READY state.
    pub async fn add(
        &self,
        payload: &T,
        priority: i32,
    ) -> Result<QueueEntryUuid, Error> {
        let id = QueueEntryUuid::new_v4();
        let payload = serde_json::to_string(payload)?;
        let now = now_micros();
        sqlx::query(
            "INSERT INTO tape_queue (id, message_type, queue_state, \
             priority, created_at, last_update, attempts, payload) \
             VALUES (?, ?, 'READY', ?, ?, ?, 0, ?)",
        )
        .bind(id.to_string())
        .bind(T::MESSAGE_TYPE.as_str())
        .bind(priority)
        .bind(now)
        .bind(now)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        debug!(self.log, "entry added"; "id" => %id, "priority" => priority);
        Ok(id)
    }

    /// Deletes the entry whatever its state.
    pub async fn remove(&self, id: QueueEntryUuid) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM tape_queue WHERE id = ? AND message_type = ?",
        )
        .bind(id.to_string())
        .bind(T::MESSAGE_TYPE.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// ONGOING -> COMPLETE.
    pub async fn complete(&self, id: QueueEntryUuid) -> Result<u64, Error> {
        self.transition(id, &[QueueState::Ongoing], QueueState::Complete, None)
            .await
    }

    /// ONGOING -> ERROR, recording `reason`.
    pub async fn mark_error(
        &self,
        id: QueueEntryUuid,
        reason: &str,
    ) -> Result<u64, Error> {
        self.transition(
            id,
            &[QueueState::Ongoing],
            QueueState::Error,
            Some(reason),
        )
        .await
    }

    /// ONGOING or ERROR -> READY.
    pub async fn mark_ready(&self, id: QueueEntryUuid) -> Result<u64, Error> {
        self.transition(
            id,
            &[QueueState::Ongoing, QueueState::Error],
            QueueState::Ready,
            None,
        )
        .await
    }

    async fn transition(
        &self,
        id: QueueEntryUuid,
        from: &[QueueState],
        to: QueueState,
        reason: Option<&str>,
    ) -> Result<u64, Error> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("UPDATE tape_queue SET queue_state = ");
        qb.push_bind(to.as_str());
        qb.push(", last_update = ").push_bind(now_micros());
        if let Some(reason) = reason {
            qb.push(", last_error = ").push_bind(reason.to_owned());
        }
        qb.push(" WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND message_type = ")
            .push_bind(T::MESSAGE_TYPE.as_str())
            .push(" AND queue_state IN (");
        let mut states = qb.separated(", ");
        for state in from {
            states.push_bind(state.as_str());
        }
        states.push_unseparated(")");

        let changed = qb.build().execute(&self.pool).await?.rows_affected();
        debug!(self.log, "entry transition";
            "id" => %id,
            "to" => %to,
            "changed" => changed,
        );
        Ok(changed)
    }

    /// Atomically leases the first READY entry matching `options`, moving it
    /// to ONGOING and counting the attempt.  Concurrent callers never lease
    /// the same entry.
    pub async fn receive(
        &self,
        options: &ReceiveOptions,
    ) -> Result<Option<QueueEntry<T>>, Error> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "UPDATE tape_queue SET queue_state = 'ONGOING', \
             attempts = attempts + 1, last_update = ",
        );
        qb.push_bind(now_micros());
        if let Some(patch) = &options.update {
            qb.push(", payload = json_patch(payload, ")
                .push_bind(serde_json::to_string(patch)?)
                .push(")");
        }
        qb.push(
            " WHERE queue_state = 'READY' AND seq = \
             (SELECT seq FROM tape_queue WHERE queue_state = 'READY' \
             AND message_type = ",
        )
        .push_bind(T::MESSAGE_TYPE.as_str());
        options.filter.push_conditions(&mut qb);
        if options.priority_ordered {
            qb.push(" ORDER BY priority DESC, created_at, seq LIMIT 1)");
        } else {
            qb.push(" ORDER BY created_at, seq LIMIT 1)");
        }
        qb.push(" RETURNING ").push(ENTRY_COLUMNS);

        let row = qb.build().fetch_optional(&self.pool).await?;
        let entry = row.as_ref().map(entry_from_row::<T>).transpose()?;
        if let Some(entry) = &entry {
            debug!(self.log, "entry leased";
                "id" => %entry.id,
                "attempts" => entry.attempts,
            );
        }
        Ok(entry)
    }

    pub async fn find(
        &self,
        id: QueueEntryUuid,
    ) -> Result<Option<QueueEntry<T>>, Error> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(ENTRY_COLUMNS)
            .push(" FROM tape_queue WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND message_type = ")
            .push_bind(T::MESSAGE_TYPE.as_str());
        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(entry_from_row::<T>).transpose()
    }

    /// Entries in `state` (all states for `None`), in receive order.
    pub async fn list(
        &self,
        state: Option<QueueState>,
    ) -> Result<Vec<QueueEntry<T>>, Error> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(ENTRY_COLUMNS)
            .push(" FROM tape_queue WHERE message_type = ")
            .push_bind(T::MESSAGE_TYPE.as_str());
        if let Some(state) = state {
            qb.push(" AND queue_state = ").push_bind(state.as_str());
        }
        qb.push(" ORDER BY priority DESC, created_at, seq");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row::<T>).collect()
    }

    pub async fn stats(&self) -> Result<QueueStats, Error> {
        let rows = sqlx::query(
            "SELECT queue_state, COUNT(*) AS n FROM tape_queue \
             WHERE message_type = ? GROUP BY queue_state",
        )
        .bind(T::MESSAGE_TYPE.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.try_get("queue_state")?;
            let n: i64 = row.try_get("n")?;
            let n = u64::try_from(n).unwrap_or_default();
            match state.parse::<QueueState>()? {
                QueueState::Ready => stats.ready = n,
                QueueState::Ongoing => stats.ongoing = n,
                QueueState::Error => stats.error = n,
                QueueState::Complete => stats.complete = n,
            }
        }
        Ok(stats)
    }

    /// Moves ERROR entries leased fewer than `max_attempts` times back to
    /// READY.  Returns the number of entries requeued.
    pub async fn requeue_errored(&self, max_attempts: u32) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE tape_queue SET queue_state = 'READY', last_update = ? \
             WHERE message_type = ? AND queue_state = 'ERROR' \
             AND attempts < ?",
        )
        .bind(now_micros())
        .bind(T::MESSAGE_TYPE.as_str())
        .bind(i64::from(max_attempts))
        .execute(&self.pool)
        .await?;
        let requeued = result.rows_affected();
        if requeued > 0 {
            info!(self.log, "requeued errored entries"; "count" => requeued);
        }
        Ok(requeued)
    }

    /// Deletes COMPLETE entries.  Returns the number deleted.
    pub async fn purge_completed(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM tape_queue \
             WHERE message_type = ? AND queue_state = 'COMPLETE'",
        )
        .bind(T::MESSAGE_TYPE.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn entry_from_row<T: QueueMessage>(
    row: &SqliteRow,
) -> Result<QueueEntry<T>, Error> {
    let id: String = row.try_get("id")?;
    let message_type: String = row.try_get("message_type")?;
    let state: String = row.try_get("queue_state")?;
    let attempts: i64 = row.try_get("attempts")?;
    let payload: String = row.try_get("payload")?;
    Ok(QueueEntry {
        id: id
            .parse::<QueueEntryUuid>()
            .map_err(|e| Error::InvalidDocument(e.to_string()))?,
        message_type: message_type.parse()?,
        state: state.parse()?,
        priority: row.try_get("priority")?,
        created: from_micros(row.try_get("created_at")?)?,
        last_update: from_micros(row.try_get("last_update")?)?,
        attempts: u32::try_from(attempts).map_err(|_| {
            Error::InvalidDocument(format!("attempts {}", attempts))
        })?,
        last_error: row.try_get("last_error")?,
        payload: serde_json::from_str(&payload)?,
    })
}
