// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-drive loop that turns queued orders into tape operations.
//!
//! A worker keeps the tape it last used mounted and leased (ONGOING in the
//! catalog) until an order needs another one.  It prefers, in order:
//!
//! 1. read orders for the mounted tape,
//! 2. write orders the mounted tape can take,
//! 3. write or read orders for anything else, as configured.
//!
//! Workers of one library share an [`ActivityBoard`] so that two drives do
//! not fill the same bucket or fight over the same tape.

use crate::config::{WorkerConfig, WorkerPriority};
use crate::library::TapeLibrary;
use crate::operator::{
    OperatorSettings, ReadWriteError, ReadWriteErrorCode, TapeDriveOperator,
};
use display_error_chain::DisplayErrorChain;
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use tape_catalog::{
    DurableQueue, PayloadFilter, QueueEntry, QueueState, ReadOrder,
    ReceiveOptions, TapeCatalog, TapeCatalogUpdate, TapeCriteria,
    TapeInventory, TapeLocation, TapeLocationType, TapeState, WriteOrder,
};
use tape_common::backoff::{Backoff, ExponentialBackoff};
use tape_pool::{DriveService, PoolError};
use tokio::sync::{watch, Mutex};

const STORAGE_LOCATIONS: [TapeLocationType; 2] =
    [TapeLocationType::Slot, TapeLocationType::ImportExport];

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("catalog access failed")]
    Catalog(#[from] tape_catalog::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("drive {drive} holds a cartridge the catalog does not place there")]
    DriveOccupied { drive: u32 },

    #[error("drive {drive} could not be checked out")]
    DriveUnavailable { drive: u32 },

    #[error("tape operation failed")]
    Operation(#[from] ReadWriteError),
}

/// What one drive is working with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriveActivity {
    pub tape_code: Option<String>,
    pub bucket: Option<String>,
}

/// Per-library map from drive index to its current activity.  Order
/// selection holds the lock so that claims are exclusive.
pub type ActivityBoard = Arc<Mutex<BTreeMap<u32, DriveActivity>>>;

enum Order {
    Write(QueueEntry<WriteOrder>),
    Read(QueueEntry<ReadOrder>),
}

#[derive(Debug, PartialEq, Eq)]
enum StepOutcome {
    /// An order was handled; look for the next one right away.
    Worked,
    /// Nothing could be done; wait for the poll interval.
    Idle,
}

pub struct DriveWorker {
    log: Logger,
    drive_index: u32,
    library: Arc<TapeLibrary>,
    inventory: TapeInventory,
    writes: DurableQueue<WriteOrder>,
    reads: DurableQueue<ReadOrder>,
    config: WorkerConfig,
    board: ActivityBoard,
    /// The leased tape sitting in this drive.
    tape: Option<TapeCatalog>,
}

impl DriveWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: &Logger,
        drive_index: u32,
        library: Arc<TapeLibrary>,
        inventory: TapeInventory,
        writes: DurableQueue<WriteOrder>,
        reads: DurableQueue<ReadOrder>,
        config: WorkerConfig,
        board: ActivityBoard,
    ) -> Self {
        let log = log.new(o!(
            "component" => "DriveWorker",
            "drive" => drive_index,
        ));
        Self {
            log,
            drive_index,
            library,
            inventory,
            writes,
            reads,
            config,
            board,
            tape: None,
        }
    }

    /// Processes orders until `shutdown` flips to true or its sender goes
    /// away.  The mounted tape stays in the drive but its lease is released.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(self.log, "drive worker started");
        if let Err(err) = self.adopt_mounted_tape().await {
            warn!(self.log, "could not adopt mounted tape";
                "error" => %DisplayErrorChain::new(&err),
            );
        }

        let mut backoff: Option<ExponentialBackoff> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match self.step().await {
                Ok(StepOutcome::Worked) => {
                    backoff = None;
                    continue;
                }
                Ok(StepOutcome::Idle) => {
                    backoff = None;
                    self.config.poll_interval()
                }
                Err(err) => {
                    let backoff = backoff
                        .get_or_insert_with(|| self.config.retry.backoff());
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.retry.max_interval());
                    warn!(self.log, "drive worker step failed";
                        "error" => %DisplayErrorChain::new(&err),
                        "retry_in" => ?delay,
                    );
                    delay
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                result = shutdown.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(tape) = self.tape.take() {
            if let Err(err) = self.inventory.release_tape(tape.id).await {
                warn!(self.log, "could not release mounted tape";
                    "code" => &tape.code,
                    "error" => %DisplayErrorChain::new(&err),
                );
            }
        }
        self.publish(None).await;
        info!(self.log, "drive worker stopped");
    }

    /// Leases the tape the catalog places in this drive, if any.
    async fn adopt_mounted_tape(&mut self) -> Result<(), WorkerError> {
        let criteria = TapeCriteria::new()
            .library(self.library.name.clone())
            .location(TapeLocation::drive(self.drive_index));
        if let Some(tape) = self.inventory.receive_tape(&criteria).await? {
            info!(self.log, "adopted mounted tape"; "code" => &tape.code);
            self.tape = Some(tape);
        }
        self.publish(self.tape.as_ref()).await;
        Ok(())
    }

    /// Handles one order.  An order whose processing fails is left in
    /// ERROR with the failure as its diagnostic; the queue supervisor
    /// decides whether it is attempted again.
    async fn step(&mut self) -> Result<StepOutcome, WorkerError> {
        let Some(order) = self.next_order().await? else {
            return Ok(StepOutcome::Idle);
        };
        let outcome = self.process(&order).await;
        if let Err(err) = &outcome {
            self.fail_order(&order, err).await;
        }
        outcome
    }

    async fn process(
        &mut self,
        order: &Order,
    ) -> Result<StepOutcome, WorkerError> {
        let drive = self
            .library
            .pool
            .checkout_drive_service(
                self.drive_index,
                self.config.checkout_timeout(),
            )
            .await;
        let drive = match drive {
            Ok(Some(drive)) => drive,
            Ok(None) => {
                self.publish(self.tape.as_ref()).await;
                return Err(WorkerError::DriveUnavailable {
                    drive: self.drive_index,
                });
            }
            Err(err) => {
                self.publish(self.tape.as_ref()).await;
                return Err(err.into());
            }
        };

        let mut mounted = self.tape.take();
        let outcome = match order {
            Order::Write(entry) => {
                self.process_write(&drive, entry, &mut mounted).await
            }
            Order::Read(entry) => {
                self.process_read(&drive, entry, &mut mounted).await
            }
        };
        self.library.pool.push_drive_service(drive);
        self.tape = mounted;
        self.publish(self.tape.as_ref()).await;
        outcome
    }

    async fn fail_order(&self, order: &Order, err: &WorkerError) {
        let reason = DisplayErrorChain::new(err).to_string();
        let result = match order {
            Order::Write(entry) => {
                self.writes.mark_error(entry.id, &reason).await
            }
            Order::Read(entry) => self.reads.mark_error(entry.id, &reason).await,
        };
        if let Err(mark_err) = result {
            warn!(self.log, "could not record order failure";
                "reason" => &reason,
                "error" => %DisplayErrorChain::new(&mark_err),
            );
        }
    }

    fn operator<'a>(&'a self, drive: &'a DriveService) -> TapeDriveOperator<'a> {
        TapeDriveOperator::new(
            &self.log,
            &self.library,
            &self.inventory,
            drive,
            OperatorSettings {
                checkout_timeout: self.config.checkout_timeout(),
                conflict_retries: self.config.conflict_retries,
                force_override_non_empty_cartridges: self
                    .config
                    .force_override_non_empty_cartridges,
            },
        )
    }

    /// Records what this drive holds.
    async fn publish(&self, tape: Option<&TapeCatalog>) {
        let activity = DriveActivity {
            tape_code: tape.map(|t| t.code.clone()),
            bucket: tape.and_then(|t| t.bucket.clone()),
        };
        self.board.lock().await.insert(self.drive_index, activity);
    }

    /// Leases the next order this drive should handle and claims its bucket
    /// or tape on the board.
    async fn next_order(&self) -> Result<Option<Order>, WorkerError> {
        let mut board = self.board.lock().await;
        let others = board
            .iter()
            .filter(|(index, _)| **index != self.drive_index)
            .map(|(_, activity)| activity);
        let busy_codes: Vec<String> =
            others.clone().filter_map(|a| a.tape_code.clone()).collect();
        let busy_buckets: Vec<String> =
            others.filter_map(|a| a.bucket.clone()).collect();

        let order = self.select_order(&busy_codes, &busy_buckets).await?;
        if let Some(order) = &order {
            let claim = board.entry(self.drive_index).or_default();
            match order {
                Order::Write(entry) => {
                    claim.bucket = Some(entry.payload.bucket.clone());
                }
                Order::Read(entry) => {
                    claim.tape_code = Some(entry.payload.tape_code.clone());
                }
            }
        }
        Ok(order)
    }

    async fn select_order(
        &self,
        busy_codes: &[String],
        busy_buckets: &[String],
    ) -> Result<Option<Order>, WorkerError> {
        let library = self.library.name.as_str();

        if let Some(tape) = &self.tape {
            let filter = PayloadFilter::new()
                .eq("library", library)
                .eq("tape_code", tape.code.as_str());
            let options = ReceiveOptions::new().filter(filter);
            if let Some(entry) = self.reads.receive(&options).await? {
                return Ok(Some(Order::Read(entry)));
            }

            if matches!(tape.tape_state, TapeState::Empty | TapeState::Open) {
                let filter = match &tape.bucket {
                    Some(bucket) => PayloadFilter::new().eq("bucket", bucket.as_str()),
                    None => PayloadFilter::new()
                        .not_in("bucket", busy_buckets.iter().cloned()),
                };
                let options = ReceiveOptions::new().filter(filter);
                if let Some(entry) = self.writes.receive(&options).await? {
                    return Ok(Some(Order::Write(entry)));
                }
            }
        }

        let writes = ReceiveOptions::new().filter(
            PayloadFilter::new().not_in("bucket", busy_buckets.iter().cloned()),
        );
        let reads = ReceiveOptions::new().filter(
            PayloadFilter::new()
                .eq("library", library)
                .not_in("tape_code", busy_codes.iter().cloned()),
        );
        let order = match self.config.priority {
            WorkerPriority::Write => match self.writes.receive(&writes).await? {
                Some(entry) => Some(Order::Write(entry)),
                None => self.reads.receive(&reads).await?.map(Order::Read),
            },
            WorkerPriority::Read => match self.reads.receive(&reads).await? {
                Some(entry) => Some(Order::Read(entry)),
                None => self.writes.receive(&writes).await?.map(Order::Write),
            },
        };
        Ok(order)
    }

    async fn process_write(
        &self,
        drive: &DriveService,
        entry: &QueueEntry<WriteOrder>,
        mounted: &mut Option<TapeCatalog>,
    ) -> Result<StepOutcome, WorkerError> {
        let order = &entry.payload;
        let log = self.log.new(o!(
            "order" => entry.id.to_string(),
            "bucket" => order.bucket.clone(),
        ));

        if !tokio::fs::try_exists(&order.file_path).await.unwrap_or(false) {
            let reason = format!("file not found: {}", order.file_path);
            warn!(log, "write order failed"; "reason" => &reason);
            self.writes.mark_error(entry.id, &reason).await?;
            return Ok(StepOutcome::Worked);
        }

        let operator = self.operator(drive);
        if mounted.as_ref().is_some_and(|t| !can_write(t, &order.bucket)) {
            self.unmount(&operator, mounted).await?;
        }

        if mounted.is_none() {
            let Some(tape) = self.lease_writable_tape(&order.bucket).await?
            else {
                info!(log, "no writable tape available");
                self.writes.mark_ready(entry.id).await?;
                return Ok(StepOutcome::Idle);
            };
            self.load_leased(&operator, tape, mounted).await?;
        }
        let Some(tape) = mounted.as_mut() else {
            self.writes.mark_ready(entry.id).await?;
            return Ok(StepOutcome::Idle);
        };

        if tape.tape_state == TapeState::Empty {
            if let Err(err) = operator.ensure_tape_is_empty(tape).await {
                if err.code == ReadWriteErrorCode::KoLabelDiscordingNotEmptyTape
                {
                    warn!(log, "tape is not blank, marking it conflicting";
                        "code" => &tape.code,
                    );
                    let changes = TapeCatalogUpdate {
                        tape_state: Some(TapeState::Conflict),
                        ..Default::default()
                    };
                    operator.persist(tape, changes).await?;
                    self.writes.mark_ready(entry.id).await?;
                    return Ok(StepOutcome::Worked);
                }
                return Err(err.into());
            }
            if tape.bucket.is_none() {
                let changes = TapeCatalogUpdate {
                    bucket: Some(Some(order.bucket.clone())),
                    ..Default::default()
                };
                operator.persist(tape, changes).await?;
            }
        }

        match operator.write(tape, &order.file_path, order.size).await {
            Ok(position) => {
                self.writes.complete(entry.id).await?;
                info!(log, "write order completed";
                    "code" => &tape.code,
                    "position" => position,
                    "file" => %order.file_path,
                );
                Ok(StepOutcome::Worked)
            }
            Err(err) if err.code == ReadWriteErrorCode::KoOnEndOfTape => {
                info!(log, "tape full, requeueing order"; "code" => &tape.code);
                self.writes.mark_ready(entry.id).await?;
                Ok(StepOutcome::Worked)
            }
            Err(err) if err.code == ReadWriteErrorCode::KoOnWriteToTape => {
                warn!(log, "write order failed";
                    "code" => &tape.code,
                    "error" => %err,
                );
                self.writes.mark_error(entry.id, &err.to_string()).await?;
                Ok(StepOutcome::Worked)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn process_read(
        &self,
        drive: &DriveService,
        entry: &QueueEntry<ReadOrder>,
        mounted: &mut Option<TapeCatalog>,
    ) -> Result<StepOutcome, WorkerError> {
        let order = &entry.payload;
        let log = self.log.new(o!(
            "order" => entry.id.to_string(),
            "tape" => order.tape_code.clone(),
        ));
        let operator = self.operator(drive);

        let on_drive = mounted.as_ref().is_some_and(|t| {
            t.code == order.tape_code && t.library == order.library
        });
        if on_drive {
            if let Some(tape) = mounted.as_ref() {
                if order.file_position >= tape.file_count {
                    return self.reject_read(&log, entry, tape).await;
                }
            }
        } else {
            let criteria = TapeCriteria::new()
                .library(order.library.clone())
                .code(order.tape_code.clone());
            let Some(target) = self.inventory.receive_tape(&criteria).await?
            else {
                return self.read_target_unavailable(&log, entry).await;
            };
            if order.file_position >= target.file_count {
                self.inventory.release_tape(target.id).await?;
                return self.reject_read(&log, entry, &target).await;
            }
            if let Err(err) = self.unmount(&operator, mounted).await {
                self.inventory.release_tape(target.id).await?;
                return Err(err);
            }
            self.load_leased(&operator, target, mounted).await?;
        }
        let Some(tape) = mounted.as_mut() else {
            self.reads.mark_ready(entry.id).await?;
            return Ok(StepOutcome::Idle);
        };

        match operator
            .read(tape, order.file_position, &order.output_path)
            .await
        {
            Ok(()) => {
                self.reads.complete(entry.id).await?;
                info!(log, "read order completed";
                    "position" => order.file_position,
                    "output" => %order.output_path,
                );
                Ok(StepOutcome::Worked)
            }
            Err(err) if err.code == ReadWriteErrorCode::KoOnReadFromTape => {
                warn!(log, "read order failed"; "error" => %err);
                self.reads.mark_error(entry.id, &err.to_string()).await?;
                Ok(StepOutcome::Worked)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn reject_read(
        &self,
        log: &Logger,
        entry: &QueueEntry<ReadOrder>,
        tape: &TapeCatalog,
    ) -> Result<StepOutcome, WorkerError> {
        let reason = format!(
            "file {} is past the last file of tape {} ({} files)",
            entry.payload.file_position, tape.code, tape.file_count
        );
        warn!(log, "read order failed"; "reason" => &reason);
        self.reads.mark_error(entry.id, &reason).await?;
        Ok(StepOutcome::Worked)
    }

    /// The tape a read order wants could not be leased: fail the order if
    /// the tape is unknown or parked, otherwise wait for it to be released.
    async fn read_target_unavailable(
        &self,
        log: &Logger,
        entry: &QueueEntry<ReadOrder>,
    ) -> Result<StepOutcome, WorkerError> {
        let order = &entry.payload;
        let tape = self
            .inventory
            .find_tape_by_code(&order.library, &order.tape_code)
            .await?;
        let reason = match tape {
            None => Some(format!(
                "tape {} is not in the catalog of library {}",
                order.tape_code, order.library
            )),
            Some(tape) if tape.queue_state == QueueState::Error => {
                Some(format!("tape {} is parked in error", tape.code))
            }
            Some(_) => None,
        };
        match reason {
            Some(reason) => {
                warn!(log, "read order failed"; "reason" => &reason);
                self.reads.mark_error(entry.id, &reason).await?;
                Ok(StepOutcome::Worked)
            }
            None => {
                debug!(log, "tape busy, requeueing read order");
                self.reads.mark_ready(entry.id).await?;
                Ok(StepOutcome::Idle)
            }
        }
    }

    /// Leases an open tape of `bucket`, else a blank one.
    async fn lease_writable_tape(
        &self,
        bucket: &str,
    ) -> Result<Option<TapeCatalog>, WorkerError> {
        let in_storage = TapeCriteria::new()
            .library(self.library.name.clone())
            .location_types(STORAGE_LOCATIONS);
        let candidates = [
            in_storage
                .clone()
                .tape_states([TapeState::Open])
                .bucket(Some(bucket)),
            in_storage
                .clone()
                .tape_states([TapeState::Empty])
                .bucket(Some(bucket)),
            in_storage.tape_states([TapeState::Empty]).bucket(None),
        ];
        for criteria in &candidates {
            if let Some(tape) = self.inventory.receive_tape(criteria).await? {
                return Ok(Some(tape));
            }
        }
        Ok(None)
    }

    /// Loads the leased `tape` into this drive.  On failure the tape is
    /// released, parked in error if the robot refused it, or kept as
    /// mounted if it did reach the drive.
    async fn load_leased(
        &self,
        operator: &TapeDriveOperator<'_>,
        mut tape: TapeCatalog,
        mounted: &mut Option<TapeCatalog>,
    ) -> Result<(), WorkerError> {
        if let Err(err) = self.ensure_drive_free(operator).await {
            self.inventory.release_tape(tape.id).await?;
            return Err(err);
        }
        match operator.load_tape(&mut tape).await {
            Ok(()) => {
                *mounted = Some(tape);
                Ok(())
            }
            Err(err) => {
                if tape.current_location == TapeLocation::drive(self.drive_index)
                {
                    *mounted = Some(tape);
                } else if err.code == ReadWriteErrorCode::KoOnLoadTape {
                    warn!(self.log, "robot refused tape, parking it";
                        "code" => &tape.code,
                        "error" => %err,
                    );
                    self.inventory.mark_tape_error(tape.id).await?;
                } else {
                    self.inventory.release_tape(tape.id).await?;
                }
                Err(err.into())
            }
        }
    }

    async fn ensure_drive_free(
        &self,
        operator: &TapeDriveOperator<'_>,
    ) -> Result<(), WorkerError> {
        match operator.drive_status().await {
            Ok(state) if state.is_loaded() => {
                Err(WorkerError::DriveOccupied { drive: self.drive_index })
            }
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(self.log, "no drive status before load"; "error" => %err);
                Ok(())
            }
        }
    }

    /// Puts the mounted tape back in storage and releases its lease.
    async fn unmount(
        &self,
        operator: &TapeDriveOperator<'_>,
        mounted: &mut Option<TapeCatalog>,
    ) -> Result<(), WorkerError> {
        let Some(mut tape) = mounted.take() else {
            return Ok(());
        };
        if let Err(err) = operator.unload_tape(&mut tape).await {
            *mounted = Some(tape);
            return Err(err.into());
        }
        self.inventory.release_tape(tape.id).await?;
        Ok(())
    }
}

fn can_write(tape: &TapeCatalog, bucket: &str) -> bool {
    let same_bucket = tape.bucket.as_deref() == Some(bucket);
    match tape.tape_state {
        TapeState::Empty => tape.bucket.is_none() || same_bucket,
        TapeState::Open => same_bucket,
        TapeState::Full | TapeState::Conflict => false,
    }
}
