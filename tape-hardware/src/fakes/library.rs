// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory tape library.
//!
//! One changer, `drives` drives, `slots` storage slots followed by
//! `mailboxes` import/export slots.  Cartridges `TAPE-i` (alternate label
//! `ALT-TAPE-TAG-i`) start in slots `1..=tapes`.  The simulated robot and
//! drives refuse the same things real ones do, and report it the same way:
//! with a `KO` response rather than an error.

use crate::commands::{DriveCommands, RobotCommands};
use crate::error::ExecutionError;
use crate::mt::render_mt_status;
use crate::mtx::render_mtx_status;
use crate::response::{CommandOutput, StatusCode, TapeResponse};
use crate::state::{
    DriveStatusFlag, SlotKind, TapeCartridge, TapeDrive, TapeDriveState,
    TapeLibraryState, TapeSlot,
};
use async_trait::async_trait;
use camino::Utf8Path;
use serde::Deserialize;
use slog::{debug, o, Logger};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SimulatedLibraryConfig {
    #[serde(default = "SimulatedLibraryConfig::default_device")]
    pub device: String,
    pub drives: u32,
    pub slots: u32,
    #[serde(default)]
    pub mailboxes: u32,
    pub tapes: u32,
    pub capacity_bytes: u64,
    #[serde(default = "SimulatedLibraryConfig::default_cartridge_type")]
    pub cartridge_type: String,
    /// Added to every mechanical or media operation.
    #[serde(default)]
    pub delay_ms: u64,
}

impl SimulatedLibraryConfig {
    fn default_device() -> String {
        "/dev/sim-changer".to_string()
    }

    fn default_cartridge_type() -> String {
        "LTO-6".to_string()
    }

    pub fn new(drives: u32, slots: u32, tapes: u32, capacity_bytes: u64) -> Self {
        Self {
            device: Self::default_device(),
            drives,
            slots,
            mailboxes: 0,
            tapes,
            capacity_bytes,
            cartridge_type: Self::default_cartridge_type(),
            delay_ms: 0,
        }
    }

    pub fn volume_tag(i: u32) -> String {
        format!("TAPE-{i}")
    }

    pub fn alternate_volume_tag(i: u32) -> String {
        format!("ALT-TAPE-TAG-{i}")
    }
}

struct SimTape {
    cartridge: TapeCartridge,
    files: Vec<Vec<u8>>,
}

impl SimTape {
    fn used_before(&self, position: usize) -> u64 {
        self.files.iter().take(position).map(|f| f.len() as u64).sum()
    }
}

#[derive(Default)]
struct SimDrive {
    tape: Option<usize>,
    source_slot: Option<u32>,
    ejected: bool,
    position: usize,
}

impl SimDrive {
    /// The tape, if one is loaded and online.
    fn online_tape(&self) -> Option<usize> {
        if self.ejected {
            None
        } else {
            self.tape
        }
    }
}

struct LibraryInner {
    tapes: Vec<SimTape>,
    /// Element `i` is storage element `i + 1`.
    slots: Vec<Option<usize>>,
    drives: Vec<SimDrive>,
}

pub struct SimulatedLibrary {
    log: Logger,
    config: SimulatedLibraryConfig,
    inner: Mutex<LibraryInner>,
}

fn ok(stdout: String) -> TapeResponse {
    TapeResponse::new(StatusCode::Ok, CommandOutput::new(Some(0), stdout, ""))
}

fn ko<S: Into<String>>(exit_code: i32, stderr: S) -> TapeResponse {
    TapeResponse::new(StatusCode::Ko, CommandOutput::new(Some(exit_code), "", stderr))
}

impl SimulatedLibrary {
    pub fn new(log: &Logger, config: SimulatedLibraryConfig) -> Arc<Self> {
        let log = log.new(o!(
            "component" => "SimulatedLibrary",
            "device" => config.device.clone(),
        ));
        let slot_count = (config.slots + config.mailboxes) as usize;
        let tape_count = (config.tapes as usize).min(config.slots as usize);
        let tapes = (1..=tape_count as u32)
            .map(|i| SimTape {
                cartridge: TapeCartridge::new(
                    SimulatedLibraryConfig::volume_tag(i),
                )
                .with_alternate(SimulatedLibraryConfig::alternate_volume_tag(i)),
                files: vec![],
            })
            .collect();
        let mut slots = vec![None; slot_count];
        for (i, slot) in slots.iter_mut().take(tape_count).enumerate() {
            *slot = Some(i);
        }
        let drives =
            (0..config.drives).map(|_| SimDrive::default()).collect();
        Arc::new(Self {
            log,
            config,
            inner: Mutex::new(LibraryInner { tapes, slots, drives }),
        })
    }

    pub fn robot(self: &Arc<Self>) -> Arc<SimulatedRobot> {
        Arc::new(SimulatedRobot { library: self.clone() })
    }

    pub fn drive(self: &Arc<Self>, index: u32) -> Arc<SimulatedDrive> {
        Arc::new(SimulatedDrive { library: self.clone(), index })
    }

    pub fn config(&self) -> &SimulatedLibraryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LibraryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn settle(&self) {
        if self.config.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.delay_ms))
                .await;
        }
    }

    /// Snapshot of the changer inventory.
    pub fn state(&self) -> TapeLibraryState {
        let inner = self.lock();
        let drives = inner
            .drives
            .iter()
            .enumerate()
            .map(|(i, d)| TapeDrive {
                index: i as u32,
                occupied: d.tape.is_some(),
                cartridge: d.tape.map(|t| inner.tapes[t].cartridge.clone()),
                source_slot: d.tape.and(d.source_slot),
            })
            .collect();
        let slots = inner
            .slots
            .iter()
            .enumerate()
            .map(|(i, t)| TapeSlot {
                index: i as u32 + 1,
                kind: if i < self.config.slots as usize {
                    SlotKind::Storage
                } else {
                    SlotKind::ImportExport
                },
                occupied: t.is_some(),
                cartridge: t.map(|t| inner.tapes[t].cartridge.clone()),
            })
            .collect();
        TapeLibraryState {
            device: self.config.device.clone(),
            drive_count: self.config.drives,
            slot_count: self.config.slots + self.config.mailboxes,
            mailbox_count: self.config.mailboxes,
            drives,
            slots,
        }
    }

    /// Moves a cartridge between two slots, the way an operator would with
    /// the library door open.  Returns false if the move is impossible.
    pub fn operator_move(&self, from_slot: u32, to_slot: u32) -> bool {
        let mut inner = self.lock();
        let (Some(from), Some(to)) = (
            (from_slot as usize).checked_sub(1),
            (to_slot as usize).checked_sub(1),
        ) else {
            return false;
        };
        if from >= inner.slots.len() || to >= inner.slots.len() {
            return false;
        }
        match (inner.slots[from], inner.slots[to]) {
            (Some(tape), None) => {
                inner.slots[from] = None;
                inner.slots[to] = Some(tape);
                true
            }
            _ => false,
        }
    }

    /// Places a new cartridge in an empty slot.
    pub fn insert_tape(&self, slot: u32, cartridge: TapeCartridge) -> bool {
        let mut inner = self.lock();
        let Some(index) = (slot as usize).checked_sub(1) else {
            return false;
        };
        if inner.slots.get(index).map_or(true, Option::is_some) {
            return false;
        }
        let tape = inner.tapes.len();
        inner.tapes.push(SimTape { cartridge, files: vec![] });
        inner.slots[index] = Some(tape);
        true
    }

    /// Writes `files` onto the tape labelled `volume_tag`, as if it had been
    /// written elsewhere.
    pub fn preload_files(&self, volume_tag: &str, files: Vec<Vec<u8>>) -> bool {
        let mut inner = self.lock();
        match inner
            .tapes
            .iter_mut()
            .find(|t| t.cartridge.volume_tag == volume_tag)
        {
            Some(tape) => {
                tape.files = files;
                true
            }
            None => false,
        }
    }

    fn load(&self, slot: u32, drive: u32) -> TapeResponse {
        let mut inner = self.lock();
        let slot_index = slot as usize;
        if slot_index == 0 || slot_index > inner.slots.len() {
            return ko(1, format!("source Element Address {slot} out of range"));
        }
        let Some(sim_drive) = inner.drives.get(drive as usize) else {
            return ko(1, format!("Data Transfer Element {drive} out of range"));
        };
        if let Some(loaded) = sim_drive.tape {
            let source = sim_drive
                .source_slot
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".to_string());
            debug!(self.log, "load into full drive"; "drive" => drive, "tape" => loaded);
            return ko(
                1,
                format!("Drive {drive} Full (Storage Element {source} loaded)"),
            );
        }
        let Some(tape) = inner.slots[slot_index - 1].take() else {
            return ko(1, format!("source Element Address {slot} is Empty"));
        };
        inner.drives[drive as usize] = SimDrive {
            tape: Some(tape),
            source_slot: Some(slot),
            ejected: false,
            position: 0,
        };
        ok(format!("Loading media from Storage Element {slot} into drive {drive}...done\n"))
    }

    fn unload(&self, slot: u32, drive: u32) -> TapeResponse {
        let mut inner = self.lock();
        let slot_index = slot as usize;
        if slot_index == 0 || slot_index > inner.slots.len() {
            return ko(1, format!("destination Element Address {slot} out of range"));
        }
        let Some(sim_drive) = inner.drives.get(drive as usize) else {
            return ko(1, format!("Data Transfer Element {drive} out of range"));
        };
        let Some(tape) = sim_drive.tape else {
            return ko(1, format!("Data Transfer Element {drive} is Empty"));
        };
        if !sim_drive.ejected {
            return ko(
                1,
                format!("Unloading Data Transfer Element {drive} failed: medium not ejected"),
            );
        }
        if inner.slots[slot_index - 1].is_some() {
            return ko(1, format!("destination Element Address {slot} is Already Full"));
        }
        inner.slots[slot_index - 1] = Some(tape);
        inner.drives[drive as usize] = SimDrive::default();
        ok(format!(
            "Unloading drive {drive} into Storage Element {slot}...done\n"
        ))
    }

    fn drive_state(&self, drive: u32) -> Option<TapeDriveState> {
        let inner = self.lock();
        let sim_drive = inner.drives.get(drive as usize)?;
        let mut flags = BTreeSet::from([DriveStatusFlag::ImmediateReport]);
        let state = match sim_drive.online_tape() {
            None => {
                flags.insert(DriveStatusFlag::DrOpen);
                TapeDriveState {
                    file_number: -1,
                    block_number: -1,
                    partition: 0,
                    block_size: Some(0),
                    density_code: None,
                    cartridge_type: None,
                    soft_error_count: Some(0),
                    flags,
                }
            }
            Some(tape) => {
                let tape = &inner.tapes[tape];
                flags.insert(DriveStatusFlag::Online);
                if sim_drive.position == 0 {
                    flags.insert(DriveStatusFlag::Bot);
                } else {
                    flags.insert(DriveStatusFlag::Eof);
                }
                if sim_drive.position >= tape.files.len() {
                    flags.insert(DriveStatusFlag::Eod);
                }
                if tape.used_before(tape.files.len()) >= self.config.capacity_bytes
                {
                    flags.insert(DriveStatusFlag::Eot);
                }
                TapeDriveState {
                    file_number: sim_drive.position as i64,
                    block_number: 0,
                    partition: 0,
                    block_size: Some(0),
                    density_code: Some("0x5a".to_string()),
                    cartridge_type: Some(self.config.cartridge_type.clone()),
                    soft_error_count: Some(0),
                    flags,
                }
            }
        };
        Some(state)
    }

    /// Runs `f` against drive `drive` holding an online tape.
    fn with_online_tape<F>(&self, drive: u32, f: F) -> TapeResponse
    where
        F: FnOnce(&mut SimDrive, &mut SimTape) -> TapeResponse,
    {
        let mut inner = self.lock();
        let LibraryInner { tapes, drives, .. } = &mut *inner;
        let Some(sim_drive) = drives.get_mut(drive as usize) else {
            return ko(2, format!("/dev/sim-nst{drive}: No such device"));
        };
        let Some(tape) = sim_drive.online_tape() else {
            return ko(2, format!("/dev/sim-nst{drive}: No medium found"));
        };
        f(sim_drive, &mut tapes[tape])
    }
}

pub struct SimulatedRobot {
    library: Arc<SimulatedLibrary>,
}

#[async_trait]
impl RobotCommands for SimulatedRobot {
    async fn status(
        &self,
    ) -> Result<TapeResponse<TapeLibraryState>, ExecutionError> {
        let state = self.library.state();
        let stdout = render_mtx_status(&state);
        Ok(TapeResponse::new(
            StatusCode::Ok,
            CommandOutput::new(Some(0), stdout, ""),
        )
        .with_entity(state))
    }

    async fn load_tape(
        &self,
        slot: u32,
        drive: u32,
    ) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        Ok(self.library.load(slot, drive))
    }

    async fn unload_tape(
        &self,
        slot: u32,
        drive: u32,
    ) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        Ok(self.library.unload(slot, drive))
    }
}

pub struct SimulatedDrive {
    library: Arc<SimulatedLibrary>,
    index: u32,
}

impl SimulatedDrive {
    fn device(&self) -> String {
        format!("/dev/sim-nst{}", self.index)
    }
}

#[async_trait]
impl DriveCommands for SimulatedDrive {
    async fn status(
        &self,
    ) -> Result<TapeResponse<TapeDriveState>, ExecutionError> {
        match self.library.drive_state(self.index) {
            Some(state) => Ok(TapeResponse::new(
                StatusCode::Ok,
                CommandOutput::new(Some(0), render_mt_status(&state), ""),
            )
            .with_entity(state)),
            None => Ok(TapeResponse::new(
                StatusCode::Ko,
                CommandOutput::new(
                    Some(2),
                    "",
                    format!("{}: No such device", self.device()),
                ),
            )),
        }
    }

    async fn rewind(&self) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        Ok(self.library.with_online_tape(self.index, |drive, _| {
            drive.position = 0;
            ok(String::new())
        }))
    }

    async fn erase(&self) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        Ok(self.library.with_online_tape(self.index, |drive, tape| {
            tape.files.clear();
            drive.position = 0;
            ok(String::new())
        }))
    }

    async fn eject(&self) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        Ok(self.library.with_online_tape(self.index, |drive, _| {
            drive.ejected = true;
            drive.position = 0;
            ok(String::new())
        }))
    }

    async fn move_position(
        &self,
        count: u32,
        backward: bool,
    ) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        let device = self.device();
        Ok(self.library.with_online_tape(self.index, |drive, tape| {
            let count = count as usize;
            if backward {
                if count > drive.position {
                    drive.position = 0;
                    return ko(2, format!("{device}: Input/output error"));
                }
                drive.position -= count;
            } else {
                if drive.position + count > tape.files.len() {
                    drive.position = tape.files.len();
                    return ko(2, format!("{device}: Input/output error"));
                }
                drive.position += count;
            }
            ok(String::new())
        }))
    }

    async fn go_to_end(&self) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        Ok(self.library.with_online_tape(self.index, |drive, tape| {
            drive.position = tape.files.len();
            ok(String::new())
        }))
    }

    async fn write_to_tape(
        &self,
        input: &Utf8Path,
    ) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        let data = match tokio::fs::read(input).await {
            Ok(data) => data,
            Err(err) => {
                return Ok(ko(1, format!("dd: failed to open '{input}': {err}")))
            }
        };
        let device = self.device();
        let capacity = self.library.config.capacity_bytes;
        Ok(self.library.with_online_tape(self.index, move |drive, tape| {
            // Writing at a position discards everything after it.
            tape.files.truncate(drive.position);
            let used = tape.used_before(drive.position);
            if used + data.len() as u64 > capacity {
                return ko(
                    1,
                    format!("dd: error writing '{device}': No space left on device"),
                );
            }
            let len = data.len();
            tape.files.push(data);
            drive.position += 1;
            ok(format!("{len} bytes copied\n"))
        }))
    }

    async fn read_from_tape(
        &self,
        output: &Utf8Path,
    ) -> Result<TapeResponse, ExecutionError> {
        self.library.settle().await;
        let device = self.device();
        let mut data = None;
        let response = self.library.with_online_tape(self.index, |drive, tape| {
            match tape.files.get(drive.position) {
                Some(file) => {
                    data = Some(file.clone());
                    drive.position += 1;
                    ok(String::new())
                }
                None => ko(1, format!("dd: error reading '{device}': Input/output error")),
            }
        });
        let Some(data) = data else {
            return Ok(response);
        };
        if let Err(err) = tokio::fs::write(output, &data).await {
            return Ok(ko(1, format!("dd: failed to open '{output}': {err}")));
        }
        Ok(ok(format!("{} bytes copied\n", data.len())))
    }
}
