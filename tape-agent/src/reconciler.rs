// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Merges the placement reported by a library's hardware into the catalog.
//!
//! Runs at boot, before drive workers start.  Tapes may have been moved by
//! hand while the agent was down, so every run re-reads the changer and
//! corrects the catalog with minimal per-tape changes.  Running it twice
//! without hardware changes writes nothing the second time.

use crate::library::TapeLibrary;
use display_error_chain::DisplayErrorChain;
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeSet;
use std::time::Duration;
use tape_catalog::{
    RetryUpdate, TapeCatalog, TapeCatalogUpdate, TapeCriteria, TapeInventory,
    TapeLocation,
};
use tape_hardware::state::{SlotKind, TapeLibraryState};
use tape_hardware::{ExecutionError, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("library {library}: no robot available within {timeout:?}")]
    RobotUnavailable { library: String, timeout: Duration },

    #[error("library {library}: could not query the changer")]
    Execution {
        library: String,
        #[source]
        err: ExecutionError,
    },

    #[error("library {library}: changer status {status}: {diagnostic}")]
    Status { library: String, status: StatusCode, diagnostic: String },

    #[error("catalog update failed")]
    Catalog(#[from] tape_catalog::Error),
}

/// Codes of the tapes each reconciliation outcome applied to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationSummary {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    /// In the catalog for this library but not seen in the hardware.
    pub missing: Vec<String>,
    /// Full elements whose label the changer could not read.
    pub unlabelled: Vec<TapeLocation>,
}

/// A cartridge as placed by the changer.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ObservedTape {
    code: String,
    alternative_code: Option<String>,
    location: TapeLocation,
    /// Storage element a mounted tape came from.
    source: Option<TapeLocation>,
}

pub struct Reconciler {
    log: Logger,
    inventory: TapeInventory,
    checkout_timeout: Duration,
    conflict_retries: u32,
}

impl Reconciler {
    pub fn new(
        log: &Logger,
        inventory: TapeInventory,
        checkout_timeout: Duration,
        conflict_retries: u32,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "Reconciler")),
            inventory,
            checkout_timeout,
            conflict_retries,
        }
    }

    pub async fn reconcile(
        &self,
        library: &TapeLibrary,
    ) -> Result<ReconciliationSummary, ReconcileError> {
        let log = self.log.new(o!("library" => library.name.clone()));
        let state = self.changer_state(library).await?;
        self.check_drives(&log, library, &state).await;

        let observed = observe(&state);
        let mut summary = ReconciliationSummary::default();
        for location in unlabelled(&state) {
            warn!(log, "occupied element has no readable label";
                "location" => %location,
            );
            summary.unlabelled.push(location);
        }
        let mut seen = BTreeSet::new();
        for tape in &observed {
            seen.insert(tape.code.clone());
            self.merge(&log, &library.name, tape, &mut summary).await?;
        }

        let catalog = self
            .inventory
            .find_tapes(&TapeCriteria::new().library(library.name.as_str()))
            .await?;
        for tape in catalog {
            if !seen.contains(&tape.code) {
                warn!(log, "catalog tape not found in library";
                    "code" => &tape.code,
                    "location" => %tape.current_location,
                );
                summary.missing.push(tape.code);
            }
        }

        info!(log, "reconciliation done";
            "created" => summary.created.len(),
            "updated" => summary.updated.len(),
            "unchanged" => summary.unchanged.len(),
            "missing" => summary.missing.len(),
            "unlabelled" => summary.unlabelled.len(),
        );
        Ok(summary)
    }

    async fn changer_state(
        &self,
        library: &TapeLibrary,
    ) -> Result<TapeLibraryState, ReconcileError> {
        let robot = library
            .pool
            .checkout_robot_service(self.checkout_timeout)
            .await
            .ok_or_else(|| ReconcileError::RobotUnavailable {
                library: library.name.clone(),
                timeout: self.checkout_timeout,
            })?;
        let result = robot.commands.status().await;
        library.pool.push_robot_service(robot);

        let response = result.map_err(|err| ReconcileError::Execution {
            library: library.name.clone(),
            err,
        })?;
        let status = response.status;
        match response.entity {
            Some(state) if status != StatusCode::Ko => Ok(state),
            _ => Err(ReconcileError::Status {
                library: library.name.clone(),
                status,
                diagnostic: response.output.diagnostic(),
            }),
        }
    }

    /// Compares each drive's own report with the changer's.  Disagreement is
    /// logged; it never blocks reconciliation.
    async fn check_drives(
        &self,
        log: &Logger,
        library: &TapeLibrary,
        state: &TapeLibraryState,
    ) {
        for index in library.pool.drive_indexes() {
            let drive = match library
                .pool
                .checkout_drive_service(index, self.checkout_timeout)
                .await
            {
                Ok(Some(drive)) => drive,
                Ok(None) => {
                    warn!(log, "drive busy, skipping status"; "drive" => index);
                    continue;
                }
                Err(err) => {
                    warn!(log, "drive missing from pool";
                        "drive" => index,
                        "error" => %DisplayErrorChain::new(&err),
                    );
                    continue;
                }
            };
            let result = drive.commands.status().await;
            library.pool.push_drive_service(drive);

            let changer_full = state
                .drive(index)
                .map(|d| d.occupied)
                .unwrap_or(false);
            match result {
                Ok(response) => match response.entity {
                    Some(drive_state) if response.succeeded() => {
                        if drive_state.is_loaded() != changer_full {
                            warn!(log, "drive and changer disagree";
                                "drive" => index,
                                "drive_loaded" => drive_state.is_loaded(),
                                "changer_full" => changer_full,
                            );
                        } else {
                            debug!(log, "drive status consistent";
                                "drive" => index,
                                "loaded" => changer_full,
                            );
                        }
                    }
                    _ => {
                        warn!(log, "drive status failed";
                            "drive" => index,
                            "status" => %response.status,
                            "output" => response.output.diagnostic(),
                        );
                    }
                },
                Err(err) => {
                    warn!(log, "drive status failed";
                        "drive" => index,
                        "error" => %DisplayErrorChain::new(&err),
                    );
                }
            }
        }
    }

    async fn merge(
        &self,
        log: &Logger,
        library: &str,
        observed: &ObservedTape,
        summary: &mut ReconciliationSummary,
    ) -> Result<(), ReconcileError> {
        let Some(existing) = self.find_existing(library, &observed.code).await?
        else {
            let mut tape = TapeCatalog::new(
                observed.code.as_str(),
                library,
                observed.location,
            );
            tape.alternative_code = observed.alternative_code.clone();
            tape.previous_location = observed.source;
            self.inventory.create_tape(&tape).await?;
            summary.created.push(observed.code.clone());
            return Ok(());
        };

        let outcome = self
            .inventory
            .update_tape_with_retry(existing.id, self.conflict_retries, |current| {
                diff(current, observed, library)
            })
            .await?;
        match outcome {
            RetryUpdate::Updated(tape) => {
                info!(log, "tape corrected";
                    "code" => &tape.code,
                    "location" => %tape.current_location,
                    "version" => tape.version,
                );
                summary.updated.push(observed.code.clone());
            }
            RetryUpdate::Unchanged(_) => {
                summary.unchanged.push(observed.code.clone());
            }
            RetryUpdate::NotFound => {
                // Nothing deletes tapes, so this only happens if an operator
                // intervened mid-run; the next reconciliation recreates it.
                warn!(log, "tape vanished during reconciliation";
                    "code" => &observed.code,
                );
            }
        }
        Ok(())
    }

    /// The record for `code`, preferring `library`; a tape known only to a
    /// single other library is taken to have been moved here.
    async fn find_existing(
        &self,
        library: &str,
        code: &str,
    ) -> Result<Option<TapeCatalog>, ReconcileError> {
        let mut matches =
            self.inventory.find_tapes(&TapeCriteria::new().code(code)).await?;
        if let Some(i) = matches.iter().position(|t| t.library == library) {
            return Ok(Some(matches.swap_remove(i)));
        }
        if matches.len() == 1 {
            return Ok(matches.pop());
        }
        Ok(None)
    }
}

/// Every cartridge the changer reports, drives first.
fn observe(state: &TapeLibraryState) -> Vec<ObservedTape> {
    let slot_location = |index: u32| match state.slot(index).map(|s| s.kind) {
        Some(SlotKind::ImportExport) => TapeLocation::import_export(index),
        _ => TapeLocation::slot(index),
    };

    let drives = state.drives.iter().filter_map(|drive| {
        let cartridge = drive.cartridge.as_ref()?;
        Some(ObservedTape {
            code: cartridge.volume_tag.clone(),
            alternative_code: cartridge.alternate_volume_tag.clone(),
            location: TapeLocation::drive(drive.index),
            source: drive.source_slot.map(slot_location),
        })
    });
    let slots = state.slots.iter().filter_map(|slot| {
        let cartridge = slot.cartridge.as_ref()?;
        Some(ObservedTape {
            code: cartridge.volume_tag.clone(),
            alternative_code: cartridge.alternate_volume_tag.clone(),
            location: slot_location(slot.index),
            source: None,
        })
    });
    drives.chain(slots).collect()
}

/// Elements the changer reports full without a label.  Such a cartridge
/// cannot be matched to the catalog.
fn unlabelled(state: &TapeLibraryState) -> Vec<TapeLocation> {
    let drives = state
        .drives
        .iter()
        .filter(|d| d.occupied && d.cartridge.is_none())
        .map(|d| TapeLocation::drive(d.index));
    let slots = state
        .slots
        .iter()
        .filter(|s| s.occupied && s.cartridge.is_none())
        .map(|s| match s.kind {
            SlotKind::ImportExport => TapeLocation::import_export(s.index),
            SlotKind::Storage => TapeLocation::slot(s.index),
        });
    drives.chain(slots).collect()
}

/// The smallest change that makes `tape` agree with `observed`.
fn diff(
    tape: &TapeCatalog,
    observed: &ObservedTape,
    library: &str,
) -> TapeCatalogUpdate {
    let mut changes = TapeCatalogUpdate::default();
    if tape.library != library {
        changes.library = Some(library.to_string());
    }
    if tape.alternative_code != observed.alternative_code {
        changes.alternative_code = Some(observed.alternative_code.clone());
    }
    if tape.current_location != observed.location {
        changes.current_location = Some(observed.location);
        if observed.source.is_none() {
            changes.previous_location = Some(Some(tape.current_location));
        }
    }
    if observed.source.is_some() && tape.previous_location != observed.source {
        changes.previous_location = Some(observed.source);
    }
    changes
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{HardwareConfig, LibraryConfig};
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use tape_catalog::{CatalogConfig, CatalogStore};
    use tape_hardware::executor::FakeExecutor;
    use tape_hardware::fakes::SimulatedLibraryConfig;
    use tape_hardware::state::TapeCartridge;
    use tape_hardware::RobotCommands;
    use tape_test_utils::dev::test_setup_log;

    struct Harness {
        _dir: Utf8TempDir,
        store: CatalogStore,
        library: TapeLibrary,
        reconciler: Reconciler,
    }

    async fn harness(log: &Logger, config: SimulatedLibraryConfig) -> Harness {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = CatalogStore::open(
            log,
            &CatalogConfig::new(dir.path().join("catalog.db")),
        )
        .await
        .unwrap();
        let executor = FakeExecutor::new(log.clone()).as_executor();
        let library = TapeLibrary::from_config(
            log,
            &executor,
            &LibraryConfig {
                name: "lib".to_string(),
                full_cartridge_detection_threshold_mb: 1,
                hardware: HardwareConfig::Simulated(config),
            },
        )
        .unwrap();
        let reconciler = Reconciler::new(
            log,
            store.inventory(),
            Duration::from_secs(1),
            3,
        );
        Harness { _dir: dir, store, library, reconciler }
    }

    #[tokio::test]
    async fn test_first_sighting_creates_tape() {
        let logctx = test_setup_log("test_first_sighting_creates_tape");
        let h = harness(&logctx.log, SimulatedLibraryConfig::new(1, 12, 0, 1000))
            .await;
        let simulator = h.library.simulator.as_ref().unwrap();
        assert!(simulator.insert_tape(10, TapeCartridge::new("T002")));

        let summary = h.reconciler.reconcile(&h.library).await.unwrap();
        assert_eq!(
            summary,
            ReconciliationSummary {
                created: vec!["T002".to_string()],
                ..Default::default()
            }
        );
        let tape = h
            .store
            .inventory()
            .find_tape_by_code("lib", "T002")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tape.current_location, TapeLocation::slot(10));
        assert_eq!(tape.version, 0);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let logctx = test_setup_log("test_second_run_changes_nothing");
        let h =
            harness(&logctx.log, SimulatedLibraryConfig::new(2, 8, 4, 1000))
                .await;
        let simulator = h.library.simulator.as_ref().unwrap();
        let robot = simulator.robot();
        assert!(robot.load_tape(3, 1).await.unwrap().is_ok());

        let first = h.reconciler.reconcile(&h.library).await.unwrap();
        assert_eq!(first.created.len(), 4);
        let mounted = h
            .store
            .inventory()
            .find_tape_by_code("lib", "TAPE-3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mounted.current_location, TapeLocation::drive(1));
        assert_eq!(mounted.previous_location, Some(TapeLocation::slot(3)));
        assert_eq!(mounted.alternative_code.as_deref(), Some("ALT-TAPE-TAG-3"));

        let second = h.reconciler.reconcile(&h.library).await.unwrap();
        assert!(second.created.is_empty());
        assert!(second.updated.is_empty());
        assert_eq!(second.unchanged.len(), 4);
        let again = h
            .store
            .inventory()
            .find_tape_by_id(mounted.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.version, mounted.version);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_stale_location_corrected() {
        let logctx = test_setup_log("test_stale_location_corrected");
        let h =
            harness(&logctx.log, SimulatedLibraryConfig::new(1, 8, 2, 1000))
                .await;
        let inventory = h.store.inventory();
        h.reconciler.reconcile(&h.library).await.unwrap();

        // An operator moves TAPE-2 by hand while the agent is down.
        let simulator = h.library.simulator.as_ref().unwrap();
        assert!(simulator.operator_move(2, 7));
        let before =
            inventory.find_tape_by_code("lib", "TAPE-2").await.unwrap().unwrap();
        let mut priority_bump = before.clone();
        priority_bump.priority = 9;
        assert!(inventory.replace_tape(&priority_bump).await.unwrap());

        let summary = h.reconciler.reconcile(&h.library).await.unwrap();
        assert_eq!(summary.updated, ["TAPE-2"]);
        assert_eq!(summary.unchanged, ["TAPE-1"]);

        let after =
            inventory.find_tape_by_code("lib", "TAPE-2").await.unwrap().unwrap();
        assert_eq!(after.current_location, TapeLocation::slot(7));
        assert_eq!(after.previous_location, Some(TapeLocation::slot(2)));
        assert_eq!(after.version, before.version + 2);
        // Unrelated fields survive the correction.
        assert_eq!(after.priority, 9);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_missing_tape_reported_not_deleted() {
        let logctx = test_setup_log("test_missing_tape_reported_not_deleted");
        let h =
            harness(&logctx.log, SimulatedLibraryConfig::new(1, 4, 1, 1000))
                .await;
        let inventory = h.store.inventory();
        let ghost = TapeCatalog::new("GHOST", "lib", TapeLocation::slot(3));
        inventory.create_tape(&ghost).await.unwrap();
        let elsewhere = TapeCatalog::new("OTHER", "lib-2", TapeLocation::slot(3));
        inventory.create_tape(&elsewhere).await.unwrap();

        let summary = h.reconciler.reconcile(&h.library).await.unwrap();
        assert_eq!(summary.created, ["TAPE-1"]);
        assert_eq!(summary.missing, ["GHOST"]);
        assert!(inventory.find_tape_by_id(ghost.id).await.unwrap().is_some());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_robot_unavailable() {
        let logctx = test_setup_log("test_robot_unavailable");
        let h =
            harness(&logctx.log, SimulatedLibraryConfig::new(1, 4, 1, 1000))
                .await;
        let reconciler = Reconciler::new(
            &logctx.log,
            h.store.inventory(),
            Duration::from_millis(50),
            3,
        );
        let held = h
            .library
            .pool
            .checkout_robot_service(Duration::from_secs(1))
            .await
            .unwrap();
        assert_matches!(
            reconciler.reconcile(&h.library).await,
            Err(ReconcileError::RobotUnavailable { library, .. })
                if library == "lib"
        );
        h.library.pool.push_robot_service(held);
        reconciler.reconcile(&h.library).await.unwrap();

        logctx.cleanup_successful();
    }

    #[test]
    fn test_unlabelled_elements() {
        let state: TapeLibraryState =
            "  Storage Changer /dev/sg5:2 Drives, 3 Slots ( 1 Import/Export )
Data Transfer Element 0:Full (Storage Element 1 Loaded)
Data Transfer Element 1:Full (Storage Element 2 Loaded):VolumeTag = T002
      Storage Element 1:Empty
      Storage Element 2:Empty
      Storage Element 3 IMPORT/EXPORT:Full
"
            .parse()
            .unwrap();
        assert_eq!(
            unlabelled(&state),
            vec![TapeLocation::drive(0), TapeLocation::import_export(3)]
        );
        let observed = observe(&state);
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].code, "T002");
    }

    #[test]
    fn test_diff_is_minimal() {
        let mut tape = TapeCatalog::new("T1", "lib", TapeLocation::slot(1));
        tape.alternative_code = Some("A1".to_string());
        let observed = ObservedTape {
            code: "T1".to_string(),
            alternative_code: Some("A1".to_string()),
            location: TapeLocation::drive(0),
            source: Some(TapeLocation::slot(1)),
        };
        assert_eq!(
            diff(&tape, &observed, "lib"),
            TapeCatalogUpdate {
                current_location: Some(TapeLocation::drive(0)),
                previous_location: Some(Some(TapeLocation::slot(1))),
                ..Default::default()
            }
        );

        tape.current_location = TapeLocation::drive(0);
        tape.previous_location = Some(TapeLocation::slot(1));
        assert!(diff(&tape, &observed, "lib").is_empty());
        assert_eq!(
            diff(&tape, &observed, "lib-2"),
            TapeCatalogUpdate {
                library: Some("lib-2".to_string()),
                ..Default::default()
            }
        );
    }
}
