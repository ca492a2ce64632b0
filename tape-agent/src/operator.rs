// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tape operations on one checked-out drive.
//!
//! The catalog only records what the hardware confirmed: every location or
//! position change is persisted after an `OK` response, never before.

use crate::library::TapeLibrary;
use camino::Utf8Path;
use display_error_chain::DisplayErrorChain;
use slog::{debug, info, o, warn, Logger};
use std::fmt;
use std::time::Duration;
use tape_catalog::{
    RetryUpdate, TapeCatalog, TapeCatalogUpdate, TapeInventory, TapeLocation,
    TapeState,
};
use tape_common::backoff::{retry_policy_hardware_status, Backoff};
use tape_hardware::state::{SlotKind, TapeDriveState, TapeLibraryState};
use tape_hardware::{ExecutionError, TapeResponse};
use tape_pool::{DriveService, RobotHandle};

const DRIVE_STATUS_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadWriteErrorCode {
    RobotUnavailable,
    CommandFailed,
    CatalogUpdateFailed,
    TapeLocationConflictOnLoad,
    TapeLocationConflictOnUnload,
    NoEmptySlotFound,
    KoOnLoadTape,
    KoOnUnloadTape,
    KoRewindBeforeUnloadTape,
    KoOnRewind,
    KoOnGoToPosition,
    KoOnWriteToTape,
    KoOnEndOfTape,
    KoOnReadFromTape,
    KoOnStatus,
    KoLabelDiscordingNotEmptyTape,
}

impl fmt::Display for ReadWriteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadWriteErrorCode::RobotUnavailable => "ROBOT_UNAVAILABLE",
            ReadWriteErrorCode::CommandFailed => "COMMAND_FAILED",
            ReadWriteErrorCode::CatalogUpdateFailed => "CATALOG_UPDATE_FAILED",
            ReadWriteErrorCode::TapeLocationConflictOnLoad => {
                "TAPE_LOCATION_CONFLICT_ON_LOAD"
            }
            ReadWriteErrorCode::TapeLocationConflictOnUnload => {
                "TAPE_LOCATION_CONFLICT_ON_UNLOAD"
            }
            ReadWriteErrorCode::NoEmptySlotFound => "NO_EMPTY_SLOT_FOUND",
            ReadWriteErrorCode::KoOnLoadTape => "KO_ON_LOAD_TAPE",
            ReadWriteErrorCode::KoOnUnloadTape => "KO_ON_UNLOAD_TAPE",
            ReadWriteErrorCode::KoRewindBeforeUnloadTape => {
                "KO_REWIND_BEFORE_UNLOAD_TAPE"
            }
            ReadWriteErrorCode::KoOnRewind => "KO_ON_REWIND",
            ReadWriteErrorCode::KoOnGoToPosition => "KO_ON_GO_TO_POSITION",
            ReadWriteErrorCode::KoOnWriteToTape => "KO_ON_WRITE_TO_TAPE",
            ReadWriteErrorCode::KoOnEndOfTape => "KO_ON_END_OF_TAPE",
            ReadWriteErrorCode::KoOnReadFromTape => "KO_ON_READ_FROM_TAPE",
            ReadWriteErrorCode::KoOnStatus => "KO_ON_STATUS",
            ReadWriteErrorCode::KoLabelDiscordingNotEmptyTape => {
                "KO_LABEL_DISCORDING_NOT_EMPTY_TAPE"
            }
        };
        f.write_str(s)
    }
}

/// A tape operation that did not complete.  `message` carries the hardware
/// diagnostic or the error chain, for the queue entry and the operator.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ReadWriteError {
    pub code: ReadWriteErrorCode,
    pub message: String,
}

impl ReadWriteError {
    pub fn new<S: Into<String>>(code: ReadWriteErrorCode, message: S) -> Self {
        Self { code, message: message.into() }
    }

    fn from_response<T>(
        code: ReadWriteErrorCode,
        response: &TapeResponse<T>,
    ) -> Self {
        Self::new(
            code,
            format!("{}: {}", response.status, response.output.diagnostic()),
        )
    }

    /// `Ok` when the command reported `OK`, else an error with `code`.
    fn expect_ok(
        code: ReadWriteErrorCode,
        response: &TapeResponse,
    ) -> Result<(), ReadWriteError> {
        if response.is_ok() {
            Ok(())
        } else {
            Err(Self::from_response(code, response))
        }
    }

    fn execution(err: ExecutionError) -> Self {
        Self::new(
            ReadWriteErrorCode::CommandFailed,
            DisplayErrorChain::new(&err).to_string(),
        )
    }

    fn catalog(err: tape_catalog::Error) -> Self {
        Self::new(
            ReadWriteErrorCode::CatalogUpdateFailed,
            DisplayErrorChain::new(&err).to_string(),
        )
    }
}

/// Knobs a [`TapeDriveOperator`] takes from the worker configuration.
#[derive(Clone, Copy, Debug)]
pub struct OperatorSettings {
    pub checkout_timeout: Duration,
    pub conflict_retries: u32,
    pub force_override_non_empty_cartridges: bool,
}

pub struct TapeDriveOperator<'a> {
    log: Logger,
    library: &'a TapeLibrary,
    inventory: &'a TapeInventory,
    drive: &'a DriveService,
    settings: OperatorSettings,
}

impl<'a> TapeDriveOperator<'a> {
    pub fn new(
        log: &Logger,
        library: &'a TapeLibrary,
        inventory: &'a TapeInventory,
        drive: &'a DriveService,
        settings: OperatorSettings,
    ) -> Self {
        let log = log.new(o!("component" => "TapeDriveOperator"));
        Self { log, library, inventory, drive, settings }
    }

    fn drive_location(&self) -> TapeLocation {
        TapeLocation::drive(self.drive.index)
    }

    /// Writes `changes` against the version of `tape` and refreshes it.  A
    /// concurrent writer is absorbed by re-reading, up to the conflict bound.
    pub async fn persist(
        &self,
        tape: &mut TapeCatalog,
        changes: TapeCatalogUpdate,
    ) -> Result<(), ReadWriteError> {
        self.persist_with(tape, |_| changes.clone()).await
    }

    /// Like [`Self::persist`] for changes that depend on the stored record:
    /// `compute` sees `tape` first, then every version re-read after a
    /// conflict.
    pub async fn persist_with<F>(
        &self,
        tape: &mut TapeCatalog,
        mut compute: F,
    ) -> Result<(), ReadWriteError>
    where
        F: FnMut(&TapeCatalog) -> TapeCatalogUpdate,
    {
        let changes = compute(tape);
        let matched = self
            .inventory
            .apply_update(tape, &changes)
            .await
            .map_err(ReadWriteError::catalog)?;
        if matched {
            return Ok(());
        }
        let outcome = self
            .inventory
            .update_tape_with_retry(
                tape.id,
                self.settings.conflict_retries,
                compute,
            )
            .await
            .map_err(ReadWriteError::catalog)?;
        match outcome {
            RetryUpdate::Updated(fresh) | RetryUpdate::Unchanged(fresh) => {
                *tape = fresh;
                Ok(())
            }
            RetryUpdate::NotFound => Err(ReadWriteError::new(
                ReadWriteErrorCode::CatalogUpdateFailed,
                format!("tape {} is no longer in the catalog", tape.code),
            )),
        }
    }

    async fn checkout_robot(&self) -> Result<RobotHandle, ReadWriteError> {
        let timeout = self.settings.checkout_timeout;
        self.library.pool.checkout_robot_service(timeout).await.ok_or_else(
            || {
                ReadWriteError::new(
                    ReadWriteErrorCode::RobotUnavailable,
                    format!("no robot within {:?}", timeout),
                )
            },
        )
    }

    /// Moves `tape` from its storage slot into this drive, then rewinds.
    pub async fn load_tape(
        &self,
        tape: &mut TapeCatalog,
    ) -> Result<(), ReadWriteError> {
        let source = tape.current_location;
        if !source.is_storage() {
            return Err(ReadWriteError::new(
                ReadWriteErrorCode::TapeLocationConflictOnLoad,
                format!("tape {} is in {}", tape.code, source),
            ));
        }

        let robot = self.checkout_robot().await?;
        let result =
            robot.commands.load_tape(source.index, self.drive.index).await;
        self.library.pool.push_robot_service(robot);

        let response = result.map_err(ReadWriteError::execution)?;
        ReadWriteError::expect_ok(ReadWriteErrorCode::KoOnLoadTape, &response)?;
        self.persist(
            tape,
            TapeCatalogUpdate {
                current_location: Some(self.drive_location()),
                previous_location: Some(Some(source)),
                current_position: Some(0),
                ..Default::default()
            },
        )
        .await?;
        info!(self.log, "tape loaded"; "code" => &tape.code, "from" => %source);

        self.rewind(tape).await
    }

    /// Ejects `tape` and puts it back where it came from, or in the first
    /// empty storage slot if that is unknown.
    pub async fn unload_tape(
        &self,
        tape: &mut TapeCatalog,
    ) -> Result<(), ReadWriteError> {
        let destination = match tape.previous_location {
            Some(location) if location.is_storage() => location,
            Some(location) => {
                return Err(ReadWriteError::new(
                    ReadWriteErrorCode::TapeLocationConflictOnUnload,
                    format!("tape {} came from {}", tape.code, location),
                ));
            }
            None => self.find_empty_slot().await?,
        };

        let response =
            self.drive.commands.eject().await.map_err(ReadWriteError::execution)?;
        ReadWriteError::expect_ok(
            ReadWriteErrorCode::KoRewindBeforeUnloadTape,
            &response,
        )?;

        let robot = self.checkout_robot().await?;
        let result = robot
            .commands
            .unload_tape(destination.index, self.drive.index)
            .await;
        self.library.pool.push_robot_service(robot);

        let response = result.map_err(ReadWriteError::execution)?;
        ReadWriteError::expect_ok(ReadWriteErrorCode::KoOnUnloadTape, &response)?;
        self.persist(
            tape,
            TapeCatalogUpdate {
                current_location: Some(destination),
                previous_location: Some(Some(self.drive_location())),
                current_position: Some(0),
                ..Default::default()
            },
        )
        .await?;
        info!(self.log, "tape unloaded";
            "code" => &tape.code,
            "to" => %destination,
        );
        Ok(())
    }

    async fn find_empty_slot(&self) -> Result<TapeLocation, ReadWriteError> {
        let robot = self.checkout_robot().await?;
        let result = robot.commands.status().await;
        self.library.pool.push_robot_service(robot);

        let response = result.map_err(ReadWriteError::execution)?;
        let succeeded = response.succeeded();
        let state = match response.entity {
            Some(state) if succeeded => state,
            _ => {
                return Err(ReadWriteError::new(
                    ReadWriteErrorCode::NoEmptySlotFound,
                    response.output.diagnostic(),
                ))
            }
        };
        first_empty_storage_slot(&state)
            .map(TapeLocation::slot)
            .ok_or_else(|| {
                ReadWriteError::new(
                    ReadWriteErrorCode::NoEmptySlotFound,
                    "every storage slot is full",
                )
            })
    }

    pub async fn rewind(
        &self,
        tape: &mut TapeCatalog,
    ) -> Result<(), ReadWriteError> {
        let response =
            self.drive.commands.rewind().await.map_err(ReadWriteError::execution)?;
        ReadWriteError::expect_ok(ReadWriteErrorCode::KoOnRewind, &response)?;
        if tape.current_position != 0 {
            self.persist(
                tape,
                TapeCatalogUpdate {
                    current_position: Some(0),
                    ..Default::default()
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Positions the mounted tape at the start of file `position`.
    pub async fn go_to_position(
        &self,
        tape: &mut TapeCatalog,
        position: u32,
    ) -> Result<(), ReadWriteError> {
        if position == tape.current_position {
            return Ok(());
        }
        if position == 0 {
            return self.rewind(tape).await;
        }

        let offset = i64::from(position) - i64::from(tape.current_position);
        let count = u32::try_from(offset.unsigned_abs()).unwrap_or(u32::MAX);
        debug!(self.log, "moving tape";
            "code" => &tape.code,
            "from" => tape.current_position,
            "to" => position,
        );
        let response = self
            .drive
            .commands
            .move_position(count, offset < 0)
            .await
            .map_err(ReadWriteError::execution)?;
        ReadWriteError::expect_ok(ReadWriteErrorCode::KoOnGoToPosition, &response)?;
        self.persist(
            tape,
            TapeCatalogUpdate {
                current_position: Some(position),
                ..Default::default()
            },
        )
        .await
    }

    /// Appends `file` (of `size` bytes) after the last file of the mounted
    /// tape and returns its file position.
    ///
    /// A write that fails once the tape holds at least the library's full
    /// cartridge threshold marks the tape `FULL` and reports
    /// `KoOnEndOfTape`; any other failure marks it `CONFLICT`.
    pub async fn write(
        &self,
        tape: &mut TapeCatalog,
        file: &Utf8Path,
        size: u64,
    ) -> Result<u32, ReadWriteError> {
        let position = tape.file_count;
        self.go_to_position(tape, position).await?;

        let response = self
            .drive
            .commands
            .write_to_tape(file)
            .await
            .map_err(ReadWriteError::execution)?;
        if !response.is_ok() {
            // Only for the log; the decision below does not depend on it.
            if let Err(e) = self.drive_status().await {
                warn!(self.log, "no drive status after failed write";
                    "error" => %e,
                );
            }
            let threshold =
                self.library.full_cartridge_detection_threshold_bytes;
            let (state, code) =
                if tape.written_bytes.saturating_add(size) >= threshold {
                    (TapeState::Full, ReadWriteErrorCode::KoOnEndOfTape)
                } else {
                    (TapeState::Conflict, ReadWriteErrorCode::KoOnWriteToTape)
                };
            warn!(self.log, "write failed";
                "code" => &tape.code,
                "tape_state" => %state,
                "output" => response.output.diagnostic(),
            );
            self.persist(
                tape,
                TapeCatalogUpdate { tape_state: Some(state), ..Default::default() },
            )
            .await?;
            return Err(ReadWriteError::from_response(code, &response));
        }

        let file_count = position + 1;
        self.persist_with(tape, |current| TapeCatalogUpdate {
            file_count: Some(file_count),
            current_position: Some(file_count),
            written_bytes: Some(current.written_bytes.saturating_add(size)),
            tape_state: Some(TapeState::Open),
            ..Default::default()
        })
        .await?;
        info!(self.log, "file written";
            "code" => &tape.code,
            "position" => position,
            "size" => size,
        );
        Ok(position)
    }

    /// Copies file `position` of the mounted tape to `output`.
    pub async fn read(
        &self,
        tape: &mut TapeCatalog,
        position: u32,
        output: &Utf8Path,
    ) -> Result<(), ReadWriteError> {
        self.go_to_position(tape, position).await?;
        let response = self
            .drive
            .commands
            .read_from_tape(output)
            .await
            .map_err(ReadWriteError::execution)?;
        ReadWriteError::expect_ok(ReadWriteErrorCode::KoOnReadFromTape, &response)?;
        self.persist(
            tape,
            TapeCatalogUpdate {
                current_position: Some(position + 1),
                ..Default::default()
            },
        )
        .await?;
        debug!(self.log, "file read"; "code" => &tape.code, "position" => position);
        Ok(())
    }

    /// Checks that a tape the catalog believes blank really is, and records
    /// its cartridge type and write protection.
    pub async fn ensure_tape_is_empty(
        &self,
        tape: &mut TapeCatalog,
    ) -> Result<(), ReadWriteError> {
        // Skipping one file must fail on a blank tape.
        let response = self
            .drive
            .commands
            .move_position(1, false)
            .await
            .map_err(ReadWriteError::execution)?;
        if response.is_ok() {
            if self.settings.force_override_non_empty_cartridges {
                warn!(self.log, "overriding non-empty cartridge";
                    "code" => &tape.code,
                );
                let response = self
                    .drive
                    .commands
                    .rewind()
                    .await
                    .map_err(ReadWriteError::execution)?;
                ReadWriteError::expect_ok(
                    ReadWriteErrorCode::KoOnRewind,
                    &response,
                )?;
            } else {
                self.persist_with(tape, |current| TapeCatalogUpdate {
                    current_position: Some(current.current_position + 1),
                    ..Default::default()
                })
                .await?;
                return Err(ReadWriteError::new(
                    ReadWriteErrorCode::KoLabelDiscordingNotEmptyTape,
                    format!("tape {} is labelled empty but holds data", tape.code),
                ));
            }
        }

        let status = self.drive_status().await?;
        self.persist(
            tape,
            TapeCatalogUpdate {
                cartridge_type: Some(status.cartridge_type.clone()),
                worm: Some(status.is_write_protected()),
                current_position: Some(0),
                ..Default::default()
            },
        )
        .await
    }

    /// Drive status, retried a few times since drives report transient
    /// failures while settling.
    pub async fn drive_status(&self) -> Result<TapeDriveState, ReadWriteError> {
        let mut backoff = retry_policy_hardware_status();
        let mut attempt = 1;
        loop {
            let error = match self.drive.commands.status().await {
                Ok(response) => {
                    if response.succeeded() {
                        if let Some(state) = response.entity {
                            return Ok(state);
                        }
                    }
                    ReadWriteError::from_response(
                        ReadWriteErrorCode::KoOnStatus,
                        &response,
                    )
                }
                Err(err) => ReadWriteError::execution(err),
            };
            if attempt >= DRIVE_STATUS_ATTEMPTS {
                return Err(error);
            }
            debug!(self.log, "drive status failed, retrying";
                "attempt" => attempt,
                "error" => %error,
            );
            attempt += 1;
            tokio::time::sleep(backoff.next_backoff().unwrap_or_default())
                .await;
        }
    }
}

/// A full element without a readable label is not a free slot.
fn first_empty_storage_slot(state: &TapeLibraryState) -> Option<u32> {
    state
        .slots
        .iter()
        .find(|s| s.kind == SlotKind::Storage && !s.occupied)
        .map(|s| s.index)
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
    use tape_pool::DriveHandle;
    use tape_test_utils::dev::test_setup_log;

    struct Harness {
        dir: Utf8TempDir,
        inventory: TapeInventory,
        library: TapeLibrary,
    }

    impl Harness {
        async fn new(log: &Logger, sim: SimulatedLibraryConfig) -> Harness {
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
                    hardware: HardwareConfig::Simulated(sim.clone()),
                },
            )
            .unwrap();
            let inventory = store.inventory();
            for i in 1..=sim.tapes {
                let tape = TapeCatalog::new(
                    SimulatedLibraryConfig::volume_tag(i),
                    "lib",
                    TapeLocation::slot(i),
                );
                inventory.create_tape(&tape).await.unwrap();
            }
            Harness { dir, inventory, library }
        }

        async fn drive(&self, index: u32) -> DriveHandle {
            self.library
                .pool
                .checkout_drive_service(index, Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap()
        }

        async fn tape(&self, code: &str) -> TapeCatalog {
            self.inventory.find_tape_by_code("lib", code).await.unwrap().unwrap()
        }

        fn operator<'a>(
            &'a self,
            log: &Logger,
            drive: &'a DriveHandle,
            force: bool,
        ) -> TapeDriveOperator<'a> {
            TapeDriveOperator::new(
                log,
                &self.library,
                &self.inventory,
                drive,
                OperatorSettings {
                    checkout_timeout: Duration::from_secs(1),
                    conflict_retries: 3,
                    force_override_non_empty_cartridges: force,
                },
            )
        }

        fn file(&self, name: &str, len: usize) -> camino::Utf8PathBuf {
            let path = self.dir.path().join(name);
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            std::fs::write(&path, data).unwrap();
            path
        }
    }

    #[test]
    fn test_unlabelled_slot_is_not_empty() {
        let state: TapeLibraryState =
            "  Storage Changer /dev/sg5:1 Drives, 3 Slots ( 1 Import/Export )
Data Transfer Element 0:Empty
      Storage Element 1:Full
      Storage Element 2:Empty
      Storage Element 3 IMPORT/EXPORT:Empty
"
            .parse()
            .unwrap();
        assert_eq!(first_empty_storage_slot(&state), Some(2));

        let full: TapeLibraryState =
            "  Storage Changer /dev/sg5:1 Drives, 2 Slots ( 1 Import/Export )
Data Transfer Element 0:Empty
      Storage Element 1:Full
      Storage Element 2 IMPORT/EXPORT:Empty
"
            .parse()
            .unwrap();
        assert_eq!(first_empty_storage_slot(&full), None);
    }

    #[tokio::test]
    async fn test_persist_recomputes_after_conflict() {
        let logctx = test_setup_log("test_persist_recomputes_after_conflict");
        let h = Harness::new(
            &logctx.log,
            SimulatedLibraryConfig::new(1, 4, 1, 1 << 20),
        )
        .await;
        let drive = h.drive(0).await;
        let operator = h.operator(&logctx.log, &drive, false);

        let mut stale = h.tape("TAPE-1").await;
        assert!(h
            .inventory
            .update_tape(
                stale.id,
                stale.version,
                &TapeCatalogUpdate {
                    written_bytes: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap());

        operator
            .persist_with(&mut stale, |current| TapeCatalogUpdate {
                written_bytes: Some(current.written_bytes + 10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stale.written_bytes, 110);
        assert_eq!(stale.version, 2);
        let stored = h.tape("TAPE-1").await;
        assert_eq!(stored.written_bytes, 110);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_load_updates_catalog_only_on_ok() {
        let logctx = test_setup_log("test_load_updates_catalog_only_on_ok");
        let h = Harness::new(
            &logctx.log,
            SimulatedLibraryConfig::new(1, 4, 2, 1 << 20),
        )
        .await;
        let drive = h.drive(0).await;
        let operator = h.operator(&logctx.log, &drive, false);

        let mut first = h.tape("TAPE-1").await;
        operator.load_tape(&mut first).await.unwrap();
        assert_eq!(first.current_location, TapeLocation::drive(0));
        assert_eq!(first.previous_location, Some(TapeLocation::slot(1)));
        assert_eq!(h.tape("TAPE-1").await, first);

        // The drive is full: the robot refuses and the catalog keeps the
        // tape where it was.
        let mut second = h.tape("TAPE-2").await;
        let error = operator.load_tape(&mut second).await.unwrap_err();
        assert_eq!(error.code, ReadWriteErrorCode::KoOnLoadTape);
        assert!(error.message.starts_with("KO: exit status 1"));
        assert_eq!(h.tape("TAPE-2").await.current_location, TapeLocation::slot(2));
        assert_eq!(h.tape("TAPE-2").await.version, 0);

        // Loading a tape the catalog already places in a drive is refused
        // before touching the hardware.
        assert_matches!(
            operator.load_tape(&mut first).await,
            Err(ReadWriteError {
                code: ReadWriteErrorCode::TapeLocationConflictOnLoad,
                ..
            })
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unload_returns_tape() {
        let logctx = test_setup_log("test_unload_returns_tape");
        let h = Harness::new(
            &logctx.log,
            SimulatedLibraryConfig::new(1, 4, 2, 1 << 20),
        )
        .await;
        let drive = h.drive(0).await;
        let operator = h.operator(&logctx.log, &drive, false);

        let mut tape = h.tape("TAPE-2").await;
        operator.load_tape(&mut tape).await.unwrap();
        operator.unload_tape(&mut tape).await.unwrap();
        assert_eq!(tape.current_location, TapeLocation::slot(2));
        assert_eq!(tape.previous_location, Some(TapeLocation::drive(0)));
        let simulator = h.library.simulator.as_ref().unwrap();
        assert_eq!(simulator.state().find_slot_of("TAPE-2").unwrap().index, 2);

        // Without a known origin the tape goes to the first empty slot.
        operator.load_tape(&mut tape).await.unwrap();
        let changes = TapeCatalogUpdate {
            previous_location: Some(None),
            ..Default::default()
        };
        assert!(h.inventory.apply_update(&mut tape, &changes).await.unwrap());
        operator.unload_tape(&mut tape).await.unwrap();
        assert_eq!(tape.current_location, TapeLocation::slot(2));

        // A tape whose origin is another drive cannot be put back.
        operator.load_tape(&mut tape).await.unwrap();
        let changes = TapeCatalogUpdate {
            previous_location: Some(Some(TapeLocation::drive(3))),
            ..Default::default()
        };
        assert!(h.inventory.apply_update(&mut tape, &changes).await.unwrap());
        assert_matches!(
            operator.unload_tape(&mut tape).await,
            Err(ReadWriteError {
                code: ReadWriteErrorCode::TapeLocationConflictOnUnload,
                ..
            })
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let logctx = test_setup_log("test_write_then_read");
        let h = Harness::new(
            &logctx.log,
            SimulatedLibraryConfig::new(1, 4, 1, 1 << 20),
        )
        .await;
        let drive = h.drive(0).await;
        let operator = h.operator(&logctx.log, &drive, false);

        let mut tape = h.tape("TAPE-1").await;
        operator.load_tape(&mut tape).await.unwrap();
        operator.ensure_tape_is_empty(&mut tape).await.unwrap();
        assert_eq!(tape.cartridge_type.as_deref(), Some("LTO-6"));
        assert!(!tape.worm);

        let a = h.file("a.tar", 300);
        let b = h.file("b.tar", 500);
        assert_eq!(operator.write(&mut tape, &a, 300).await.unwrap(), 0);
        assert_eq!(operator.write(&mut tape, &b, 500).await.unwrap(), 1);
        assert_eq!(tape.file_count, 2);
        assert_eq!(tape.current_position, 2);
        assert_eq!(tape.written_bytes, 800);
        assert_eq!(tape.tape_state, TapeState::Open);

        let out = h.dir.path().join("out.tar");
        operator.read(&mut tape, 0, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), std::fs::read(&a).unwrap());
        assert_eq!(tape.current_position, 1);
        operator.read(&mut tape, 1, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), std::fs::read(&b).unwrap());

        assert_matches!(
            operator.read(&mut tape, 2, &out).await,
            Err(ReadWriteError { code: ReadWriteErrorCode::KoOnReadFromTape, .. })
        );
        assert_eq!(h.tape("TAPE-1").await, tape);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failed_write_marks_tape() {
        let logctx = test_setup_log("test_failed_write_marks_tape");
        let h = Harness::new(
            &logctx.log,
            SimulatedLibraryConfig::new(2, 4, 2, 1_500_000),
        )
        .await;
        let big = h.file("big.tar", 1_000_000);
        let huge = h.file("huge.tar", 1_600_000);

        // Past the full-cartridge threshold: the tape is full.
        let drive = h.drive(0).await;
        let operator = h.operator(&logctx.log, &drive, false);
        let mut tape = h.tape("TAPE-1").await;
        operator.load_tape(&mut tape).await.unwrap();
        operator.write(&mut tape, &big, 1_000_000).await.unwrap();
        let error = operator.write(&mut tape, &big, 1_000_000).await.unwrap_err();
        assert_eq!(error.code, ReadWriteErrorCode::KoOnEndOfTape);
        assert!(error.message.contains("No space left on device"));
        assert_eq!(tape.tape_state, TapeState::Full);
        assert_eq!(tape.file_count, 1);

        // Below it: the tape no longer matches the catalog.
        let drive = h.drive(1).await;
        let operator = h.operator(&logctx.log, &drive, false);
        let mut tape = h.tape("TAPE-2").await;
        operator.load_tape(&mut tape).await.unwrap();
        let error = operator.write(&mut tape, &huge, 100).await.unwrap_err();
        assert_eq!(error.code, ReadWriteErrorCode::KoOnWriteToTape);
        assert_eq!(h.tape("TAPE-2").await.tape_state, TapeState::Conflict);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_ensure_tape_is_empty() {
        let logctx = test_setup_log("test_ensure_tape_is_empty");
        let h = Harness::new(
            &logctx.log,
            SimulatedLibraryConfig::new(2, 4, 2, 1 << 20),
        )
        .await;
        let simulator = h.library.simulator.as_ref().unwrap();
        assert!(simulator.preload_files("TAPE-1", vec![vec![1; 10]]));
        assert!(simulator.preload_files("TAPE-2", vec![vec![2; 10]]));

        let drive = h.drive(0).await;
        let operator = h.operator(&logctx.log, &drive, false);
        let mut tape = h.tape("TAPE-1").await;
        operator.load_tape(&mut tape).await.unwrap();
        assert_matches!(
            operator.ensure_tape_is_empty(&mut tape).await,
            Err(ReadWriteError {
                code: ReadWriteErrorCode::KoLabelDiscordingNotEmptyTape,
                ..
            })
        );
        assert_eq!(tape.current_position, 1);

        let drive = h.drive(1).await;
        let operator = h.operator(&logctx.log, &drive, true);
        let mut tape = h.tape("TAPE-2").await;
        operator.load_tape(&mut tape).await.unwrap();
        operator.ensure_tape_is_empty(&mut tape).await.unwrap();
        assert_eq!(tape.current_position, 0);
        assert_eq!(tape.cartridge_type.as_deref(), Some("LTO-6"));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_drive_status_reports_door() {
        let logctx = test_setup_log("test_drive_status_reports_door");
        let h = Harness::new(
            &logctx.log,
            SimulatedLibraryConfig::new(1, 4, 1, 1 << 20),
        )
        .await;
        let drive = h.drive(0).await;
        let operator = h.operator(&logctx.log, &drive, false);

        // An empty drive still answers status, with the door open.
        let state = operator.drive_status().await.unwrap();
        assert!(!state.is_loaded());

        let mut tape = h.tape("TAPE-1").await;
        operator.load_tape(&mut tape).await.unwrap();
        let state = operator.drive_status().await.unwrap();
        assert!(state.is_loaded());
        assert_eq!(state.file_number, 0);

        logctx.cleanup_successful();
    }
}
