// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle of the background tasks: one worker per drive, and a
//! supervisor that gives failed queue entries their bounded retries.

use crate::config::WorkerConfig;
use crate::library::TapeLibrary;
use crate::worker::{ActivityBoard, DriveActivity, DriveWorker};
use display_error_chain::DisplayErrorChain;
use slog::{info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use tape_catalog::{CatalogStore, DurableQueue, ReadOrder, WriteOrder};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Runs the drive workers of one library.
pub struct DriveWorkerManager {
    log: Logger,
    library: Arc<TapeLibrary>,
    board: ActivityBoard,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl DriveWorkerManager {
    pub fn start(
        log: &Logger,
        library: Arc<TapeLibrary>,
        store: &CatalogStore,
        config: &WorkerConfig,
    ) -> Self {
        let log = log.new(o!(
            "component" => "DriveWorkerManager",
            "library" => library.name.clone(),
        ));
        let board = ActivityBoard::default();
        let (shutdown, _) = watch::channel(false);
        let workers = library
            .pool
            .drive_indexes()
            .into_iter()
            .map(|index| {
                let worker = DriveWorker::new(
                    &log,
                    index,
                    library.clone(),
                    store.inventory(),
                    store.queue(),
                    store.queue(),
                    config.clone(),
                    board.clone(),
                );
                tokio::spawn(worker.run(shutdown.subscribe()))
            })
            .collect::<Vec<_>>();
        info!(log, "drive workers started"; "count" => workers.len());
        Self { log, library, board, shutdown, workers }
    }

    pub fn library(&self) -> &Arc<TapeLibrary> {
        &self.library
    }

    /// What each drive is currently holding or claiming.
    pub async fn activity(&self) -> BTreeMap<u32, DriveActivity> {
        self.board.lock().await.clone()
    }

    /// Signals every worker and waits for them to release their tapes.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(self.log, "drive worker did not stop cleanly";
                    "error" => %err,
                );
            }
        }
        info!(self.log, "drive workers stopped");
    }
}

/// Periodically moves ERROR queue entries that still have attempts left
/// back to READY.
pub struct QueueSupervisor {
    log: Logger,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl QueueSupervisor {
    pub fn start(
        log: &Logger,
        store: &CatalogStore,
        config: &WorkerConfig,
    ) -> Self {
        let log = log.new(o!("component" => "QueueSupervisor"));
        let (shutdown, mut rx) = watch::channel(false);
        let writes = store.queue::<WriteOrder>();
        let reads = store.queue::<ReadOrder>();
        let max_attempts = config.retry.max_attempts;
        let interval = config.supervisor_interval();

        let task_log = log.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    result = rx.changed() => {
                        if result.is_err() || *rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if let Err(err) = sweep(&writes, &reads, max_attempts).await {
                    warn!(task_log, "requeue sweep failed";
                        "error" => %DisplayErrorChain::new(&err),
                    );
                }
            }
        });
        info!(log, "queue supervisor started";
            "interval" => ?interval,
            "max_attempts" => max_attempts,
        );
        Self { log, shutdown, task }
    }

    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            warn!(self.log, "queue supervisor did not stop cleanly";
                "error" => %err,
            );
        }
    }
}

/// One requeue pass over both order queues.  Returns the number of entries
/// made READY again.
pub async fn sweep(
    writes: &DurableQueue<WriteOrder>,
    reads: &DurableQueue<ReadOrder>,
    max_attempts: u32,
) -> Result<u64, tape_catalog::Error> {
    let requeued = writes.requeue_errored(max_attempts).await?
        + reads.requeue_errored(max_attempts).await?;
    Ok(requeued)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{HardwareConfig, LibraryConfig};
    use std::time::Duration;
    use tape_catalog::{CatalogConfig, QueueState, ReceiveOptions};
    use tape_common::backoff::RetryPolicy;
    use tape_hardware::executor::FakeExecutor;
    use tape_hardware::fakes::SimulatedLibraryConfig;
    use tape_test_utils::dev::poll::{wait_for_condition, CondCheckError};
    use tape_test_utils::dev::test_setup_log;

    async fn open_store(log: &Logger) -> (camino_tempfile::Utf8TempDir, CatalogStore) {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = CatalogStore::open(
            log,
            &CatalogConfig::new(dir.path().join("catalog.db")),
        )
        .await
        .unwrap();
        (dir, store)
    }

    fn order(dir: &camino_tempfile::Utf8TempDir) -> WriteOrder {
        WriteOrder {
            bucket: "bucket".to_string(),
            file_path: dir.path().join("missing.tar"),
            size: 1,
        }
    }

    #[tokio::test]
    async fn test_sweep_respects_attempt_bound() {
        let logctx = test_setup_log("test_sweep_respects_attempt_bound");
        let (dir, store) = open_store(&logctx.log).await;
        let writes = store.queue::<WriteOrder>();
        let reads = store.queue::<ReadOrder>();
        let id = writes.add(&order(&dir), 0).await.unwrap();

        for attempt in 1..=2 {
            let entry =
                writes.receive(&ReceiveOptions::new()).await.unwrap().unwrap();
            assert_eq!(entry.attempts, attempt);
            writes.mark_error(id, "boom").await.unwrap();
            assert_eq!(sweep(&writes, &reads, 3).await.unwrap(), 1);
        }
        writes.receive(&ReceiveOptions::new()).await.unwrap().unwrap();
        writes.mark_error(id, "boom").await.unwrap();
        assert_eq!(sweep(&writes, &reads, 3).await.unwrap(), 0);

        let entry = writes.find(id).await.unwrap().unwrap();
        assert_eq!(entry.state, QueueState::Error);
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_supervisor_requeues_in_background() {
        let logctx = test_setup_log("test_supervisor_requeues_in_background");
        let (dir, store) = open_store(&logctx.log).await;
        let writes = store.queue::<WriteOrder>();
        let id = writes.add(&order(&dir), 0).await.unwrap();
        writes.receive(&ReceiveOptions::new()).await.unwrap().unwrap();
        writes.mark_error(id, "boom").await.unwrap();

        let config = WorkerConfig {
            supervisor_interval_ms: 10,
            retry: RetryPolicy::with_max_attempts(2),
            ..WorkerConfig::default()
        };
        let supervisor = QueueSupervisor::start(&logctx.log, &store, &config);
        wait_for_condition(
            || {
                let writes = writes.clone();
                async move {
                    match writes.find(id).await? {
                        Some(entry) if entry.state == QueueState::Ready => {
                            Ok(())
                        }
                        _ => Err(CondCheckError::<tape_catalog::Error>::NotYet),
                    }
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();
        supervisor.shutdown().await;

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_manager_runs_one_worker_per_drive() {
        let logctx = test_setup_log("test_manager_runs_one_worker_per_drive");
        let (_dir, store) = open_store(&logctx.log).await;
        let executor = FakeExecutor::new(logctx.log.clone()).as_executor();
        let library = TapeLibrary::from_config(
            &logctx.log,
            &executor,
            &LibraryConfig {
                name: "lib".to_string(),
                full_cartridge_detection_threshold_mb: 1,
                hardware: HardwareConfig::Simulated(
                    SimulatedLibraryConfig::new(3, 6, 0, 1 << 20),
                ),
            },
        )
        .unwrap();
        let config =
            WorkerConfig { poll_interval_ms: 10, ..WorkerConfig::default() };
        let manager = DriveWorkerManager::start(
            &logctx.log,
            Arc::new(library),
            &store,
            &config,
        );
        assert_eq!(manager.library().name, "lib");

        let manager_ref = &manager;
        wait_for_condition(
            move || async move {
                if manager_ref.activity().await.len() == 3 {
                    Ok(())
                } else {
                    Err(CondCheckError::<std::io::Error>::NotYet)
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(manager
            .activity()
            .await
            .values()
            .all(|a| *a == DriveActivity::default()));
        manager.shutdown().await;

        logctx.cleanup_successful();
    }
}
