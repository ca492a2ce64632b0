// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot sequence of the tape agent.

use crate::config::{Config, WorkerConfig};
use crate::library::TapeLibrary;
use crate::manager::{DriveWorkerManager, QueueSupervisor};
use crate::reconciler::{ReconcileError, Reconciler, ReconciliationSummary};
use crate::worker::DriveActivity;
use display_error_chain::DisplayErrorChain;
use slog::{error, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use tape_catalog::{
    CatalogStore, QueueMessage, QueueState, ReadOrder, TapeCriteria,
    WriteOrder,
};
use tape_hardware::executor::HostExecutor;
use tape_pool::{PoolError, PoolOccupancy};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("catalog error")]
    Catalog(#[from] tape_catalog::Error),

    #[error("library {library}: invalid hardware configuration")]
    Pool {
        library: String,
        #[source]
        err: PoolError,
    },
}

/// A catalog and the libraries it describes, before any worker runs.
pub struct TapeAgent {
    log: Logger,
    store: CatalogStore,
    libraries: Vec<Arc<TapeLibrary>>,
    worker: WorkerConfig,
}

impl TapeAgent {
    /// Opens the catalog and builds one resource pool per library.
    pub async fn open(log: &Logger, config: &Config) -> Result<Self, AgentError> {
        let log = log.new(o!("component" => "TapeAgent"));
        let store = CatalogStore::open(&log, &config.catalog).await?;
        let executor = HostExecutor::new(log.clone()).as_executor();
        let libraries = config
            .libraries
            .iter()
            .map(|library| {
                TapeLibrary::from_config(&log, &executor, library)
                    .map(Arc::new)
                    .map_err(|err| AgentError::Pool {
                        library: library.name.clone(),
                        err,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { log, store, libraries, worker: config.worker.clone() })
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn libraries(&self) -> &[Arc<TapeLibrary>] {
        &self.libraries
    }

    /// Reconciles every library with its hardware, in configuration order.
    /// A library that fails is logged and reported; the others still run.
    pub async fn reconcile_all(
        &self,
    ) -> BTreeMap<String, Result<ReconciliationSummary, ReconcileError>> {
        let reconciler = Reconciler::new(
            &self.log,
            self.store.inventory(),
            self.worker.checkout_timeout(),
            self.worker.conflict_retries,
        );
        let mut results = BTreeMap::new();
        for library in &self.libraries {
            let result = reconciler.reconcile(library).await;
            if let Err(err) = &result {
                error!(self.log, "reconciliation failed";
                    "library" => &library.name,
                    "error" => %DisplayErrorChain::new(err),
                );
            }
            results.insert(library.name.clone(), result);
        }
        results
    }

    /// Returns leases held by a previous run to READY.  Only meaningful
    /// before workers start: this process is the only consumer of the
    /// catalog.
    pub async fn recover_leases(&self) -> Result<u64, AgentError> {
        let inventory = self.store.inventory();
        let mut recovered = 0;
        for library in &self.libraries {
            let criteria = TapeCriteria::new()
                .library(library.name.clone())
                .queue_state(QueueState::Ongoing);
            for tape in inventory.find_tapes(&criteria).await? {
                recovered += inventory.release_tape(tape.id).await?;
            }
        }
        recovered += self.requeue_ongoing::<WriteOrder>().await?;
        recovered += self.requeue_ongoing::<ReadOrder>().await?;
        if recovered > 0 {
            warn!(self.log, "recovered leases of a previous run";
                "count" => recovered,
            );
        }
        Ok(recovered)
    }

    async fn requeue_ongoing<T: QueueMessage>(&self) -> Result<u64, AgentError> {
        let queue = self.store.queue::<T>();
        let mut requeued = 0;
        for entry in queue.list(Some(QueueState::Ongoing)).await? {
            requeued += queue.mark_ready(entry.id).await?;
        }
        Ok(requeued)
    }

    /// Recovers stale leases, reconciles, then starts the queue supervisor
    /// and the drive workers of every library that reconciled.  A library
    /// whose catalog could not be checked against its hardware gets no
    /// workers until the next start.
    pub async fn start(self) -> Result<RunningTapeAgent, AgentError> {
        self.recover_leases().await?;
        let results = self.reconcile_all().await;

        let managers: Vec<DriveWorkerManager> = self
            .libraries
            .iter()
            .filter(|library| {
                let reconciled =
                    results.get(&library.name).is_some_and(Result::is_ok);
                if !reconciled {
                    warn!(self.log, "not starting workers";
                        "library" => &library.name,
                    );
                }
                reconciled
            })
            .map(|library| {
                DriveWorkerManager::start(
                    &self.log,
                    library.clone(),
                    &self.store,
                    &self.worker,
                )
            })
            .collect();
        let supervisor =
            QueueSupervisor::start(&self.log, &self.store, &self.worker);
        info!(self.log, "tape agent started";
            "libraries" => self.libraries.len(),
            "serving" => managers.len(),
        );
        Ok(RunningTapeAgent { agent: self, managers, supervisor })
    }
}

/// An agent whose workers are running.
pub struct RunningTapeAgent {
    agent: TapeAgent,
    managers: Vec<DriveWorkerManager>,
    supervisor: QueueSupervisor,
}

impl RunningTapeAgent {
    pub fn store(&self) -> &CatalogStore {
        &self.agent.store
    }

    pub fn occupancy(&self) -> Vec<PoolOccupancy> {
        self.agent.libraries.iter().map(|l| l.pool.occupancy()).collect()
    }

    /// Per library, what each drive is holding or claiming.
    pub async fn activity(
        &self,
    ) -> BTreeMap<String, BTreeMap<u32, DriveActivity>> {
        let mut activity = BTreeMap::new();
        for manager in &self.managers {
            activity
                .insert(manager.library().name.clone(), manager.activity().await);
        }
        activity
    }

    pub async fn shutdown(self) {
        let RunningTapeAgent { agent, managers, supervisor } = self;
        supervisor.shutdown().await;
        for manager in managers {
            manager.shutdown().await;
        }
        agent.store.close().await;
        info!(agent.log, "tape agent stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{HardwareConfig, LibraryConfig};
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tape_catalog::{CatalogConfig, ReceiveOptions, TapeLocation};
    use tape_common::logging::{ConfigLogging, ConfigLoggingLevel};
    use tape_hardware::fakes::SimulatedLibraryConfig;
    use tape_test_utils::dev::poll::{wait_for_condition, CondCheckError};
    use tape_test_utils::dev::test_setup_log;

    fn config(dir: &camino_tempfile::Utf8TempDir) -> Config {
        Config {
            log: ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            },
            catalog: CatalogConfig::new(dir.path().join("catalog.db")),
            worker: WorkerConfig {
                poll_interval_ms: 10,
                supervisor_interval_ms: 50,
                ..WorkerConfig::default()
            },
            libraries: vec![LibraryConfig {
                name: "lib".to_string(),
                full_cartridge_detection_threshold_mb: 1,
                hardware: HardwareConfig::Simulated(
                    SimulatedLibraryConfig::new(2, 6, 3, 1 << 20),
                ),
            }],
        }
    }

    #[tokio::test]
    async fn test_boot_and_archive() {
        let logctx = test_setup_log("test_boot_and_archive");
        let dir = camino_tempfile::tempdir().unwrap();
        let config = config(&dir);
        config.validate().unwrap();

        let agent = TapeAgent::open(&logctx.log, &config).await.unwrap();
        let results = agent.reconcile_all().await;
        assert_eq!(results["lib"].as_ref().unwrap().created.len(), 3);

        let running = agent.start().await.unwrap();
        assert_eq!(running.occupancy()[0].drives.len(), 2);

        let file = dir.path().join("a.tar");
        std::fs::write(&file, vec![7; 64]).unwrap();
        let writes = running.store().queue::<WriteOrder>();
        let id = writes
            .add(
                &WriteOrder {
                    bucket: "bucket".to_string(),
                    file_path: file,
                    size: 64,
                },
                0,
            )
            .await
            .unwrap();
        let writes_ref = &writes;
        wait_for_condition(
            move || async move {
                match writes_ref.find(id).await? {
                    Some(e) if e.state == QueueState::Complete => Ok(()),
                    _ => Err(CondCheckError::<tape_catalog::Error>::NotYet),
                }
            },
            &Duration::from_millis(20),
            &Duration::from_secs(20),
        )
        .await
        .unwrap();

        let activity = running.activity().await;
        assert!(activity["lib"]
            .values()
            .any(|a| a.bucket.as_deref() == Some("bucket")));
        running.shutdown().await;

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_recover_leases() {
        let logctx = test_setup_log("test_recover_leases");
        let dir = camino_tempfile::tempdir().unwrap();
        let config = config(&dir);

        let agent = TapeAgent::open(&logctx.log, &config).await.unwrap();
        assert!(agent.reconcile_all().await["lib"].is_ok());
        let inventory = agent.store().inventory();
        let leased = inventory
            .receive_tape(&TapeCriteria::new().location(TapeLocation::slot(1)))
            .await
            .unwrap()
            .unwrap();
        let reads = agent.store().queue::<ReadOrder>();
        let order = ReadOrder {
            library: "lib".to_string(),
            tape_code: leased.code.clone(),
            file_position: 0,
            output_path: dir.path().join("out"),
        };
        let id = reads.add(&order, 0).await.unwrap();
        reads.receive(&ReceiveOptions::new()).await.unwrap().unwrap();

        assert_eq!(agent.recover_leases().await.unwrap(), 2);
        let tape = inventory.find_tape_by_id(leased.id).await.unwrap().unwrap();
        assert_eq!(tape.queue_state, QueueState::Ready);
        let entry = reads.find(id).await.unwrap().unwrap();
        assert_eq!(entry.state, QueueState::Ready);
        assert_eq!(agent.recover_leases().await.unwrap(), 0);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failed_library_does_not_block_boot() {
        let logctx = test_setup_log("test_failed_library_does_not_block_boot");
        let dir = camino_tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.worker.checkout_timeout_ms = 50;
        config.libraries.push(LibraryConfig {
            name: "lib-2".to_string(),
            full_cartridge_detection_threshold_mb: 1,
            hardware: HardwareConfig::Simulated(SimulatedLibraryConfig::new(
                1,
                4,
                2,
                1 << 20,
            )),
        });

        let agent = TapeAgent::open(&logctx.log, &config).await.unwrap();
        let stuck = agent.libraries()[1].clone();
        let robot = stuck
            .pool
            .checkout_robot_service(Duration::from_secs(1))
            .await
            .unwrap();

        let results = agent.reconcile_all().await;
        assert_eq!(results["lib"].as_ref().unwrap().created.len(), 3);
        assert_matches!(
            &results["lib-2"],
            Err(ReconcileError::RobotUnavailable { library, .. })
                if library == "lib-2"
        );

        let running = agent.start().await.unwrap();
        let activity = running.activity().await;
        assert!(activity.contains_key("lib"));
        assert!(!activity.contains_key("lib-2"));
        let lib2 = running
            .store()
            .inventory()
            .find_tapes(&TapeCriteria::new().library("lib-2"))
            .await
            .unwrap();
        assert!(lib2.is_empty());

        running.shutdown().await;
        stuck.pool.push_robot_service(robot);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_open_rejects_bad_pool() {
        let logctx = test_setup_log("test_open_rejects_bad_pool");
        let dir = camino_tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.libraries[0].hardware =
            HardwareConfig::Mtx { robots: vec![], drives: vec![] };

        let error = TapeAgent::open(&logctx.log, &config).await.err().unwrap();
        assert!(matches!(
            error,
            AgentError::Pool { ref library, .. } if library == "lib"
        ));

        logctx.cleanup_successful();
    }
}
