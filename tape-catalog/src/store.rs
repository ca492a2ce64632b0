// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SQLite-backed catalog store.

use crate::error::Error;
use crate::inventory::TapeInventory;
use crate::model::QueueMessage;
use crate::queue::DurableQueue;
use camino::Utf8PathBuf;
use serde::Deserialize;
use slog::{info, o, Logger};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tape_catalog (
        id TEXT PRIMARY KEY NOT NULL,
        library TEXT NOT NULL,
        code TEXT NOT NULL,
        alternative_code TEXT,
        current_location_type TEXT NOT NULL,
        current_location_index INTEGER NOT NULL,
        previous_location_type TEXT,
        previous_location_index INTEGER,
        version INTEGER NOT NULL,
        queue_state TEXT NOT NULL,
        priority INTEGER NOT NULL,
        tape_state TEXT NOT NULL,
        bucket TEXT,
        cartridge_type TEXT,
        worm INTEGER NOT NULL,
        file_count INTEGER NOT NULL,
        written_bytes INTEGER NOT NULL,
        current_position INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        last_update INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS tape_catalog_library_code
        ON tape_catalog (library, code)",
    "CREATE TABLE IF NOT EXISTS tape_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        message_type TEXT NOT NULL,
        queue_state TEXT NOT NULL,
        priority INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        last_update INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS tape_queue_receive
        ON tape_queue (message_type, queue_state, priority DESC, created_at, seq)",
];

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    /// SQLite database file; created if missing.
    pub database_path: Utf8PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl CatalogConfig {
    pub fn new<P: Into<Utf8PathBuf>>(database_path: P) -> Self {
        Self {
            database_path: database_path.into(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Handle to the catalog database.  Cheap to clone.
#[derive(Clone)]
pub struct CatalogStore {
    log: Logger,
    pool: SqlitePool,
}

impl CatalogStore {
    /// Opens (creating if needed) the database and applies the schema.
    pub async fn open(
        log: &Logger,
        config: &CatalogConfig,
    ) -> Result<CatalogStore, Error> {
        let log = log.new(o!(
            "component" => "CatalogStore",
            "database" => config.database_path.to_string(),
        ));
        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!(log, "catalog opened");

        Ok(CatalogStore { log, pool })
    }

    pub fn inventory(&self) -> TapeInventory {
        TapeInventory::new(&self.log, self.pool.clone())
    }

    pub fn queue<T: QueueMessage>(&self) -> DurableQueue<T> {
        DurableQueue::new(&self.log, self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Microseconds since the epoch, the stored timestamp format.
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

pub(crate) fn from_micros(
    micros: i64,
) -> Result<chrono::DateTime<chrono::Utc>, Error> {
    chrono::DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        Error::InvalidDocument(format!("timestamp out of range: {}", micros))
    })
}


#[cfg(test)]
mod test {
    use super::test_helpers::open_test_store;
    use super::*;
    use crate::model::{TapeCatalog, TapeLocation};
    use tape_test_utils::dev::test_setup_log;

    #[test]
    fn test_config_defaults() {
        let config: CatalogConfig =
            toml::from_str(r#"database_path = "/var/tmp/catalog.db""#)
                .unwrap();
        assert_eq!(config, CatalogConfig::new("/var/tmp/catalog.db"));
        assert_eq!(config.max_connections, 8);
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let logctx = test_setup_log("test_reopen_keeps_data");
        let (dir, store) = open_test_store(&logctx.log).await;
        let tape = TapeCatalog::new("T001", "lib", TapeLocation::slot(1));
        store.inventory().create_tape(&tape).await.unwrap();
        store.close().await;

        let config = CatalogConfig::new(dir.path().join("catalog.db"));
        let store = CatalogStore::open(&logctx.log, &config).await.unwrap();
        let found = store.inventory().find_tape_by_id(tape.id).await.unwrap();
        assert_eq!(found.map(|t| t.code), Some("T001".to_string()));
        store.close().await;
        logctx.cleanup_successful();
    }
}
