// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Construction of per-library resource pools from configuration.

use crate::config::{HardwareConfig, LibraryConfig};
use slog::{info, o, Logger};
use std::sync::Arc;
use tape_hardware::executor::BoxedExecutor;
use tape_hardware::fakes::SimulatedLibrary;
use tape_hardware::mt::MtDrive;
use tape_hardware::mtx::MtxRobot;
use tape_pool::{DriveService, PoolError, RobotService, TapeLibraryPool};

/// One configured library: its pool plus the settings workers need.
pub struct TapeLibrary {
    pub name: String,
    pub pool: Arc<TapeLibraryPool>,
    pub full_cartridge_detection_threshold_bytes: u64,
    /// Present when the library is simulated.
    pub simulator: Option<Arc<SimulatedLibrary>>,
}

impl TapeLibrary {
    pub fn from_config(
        log: &Logger,
        executor: &BoxedExecutor,
        config: &LibraryConfig,
    ) -> Result<Self, PoolError> {
        let log = log.new(o!("library" => config.name.clone()));
        let (robots, drives, simulator) = match &config.hardware {
            HardwareConfig::Mtx { robots, drives } => {
                let robots = robots
                    .iter()
                    .enumerate()
                    .map(|(index, robot)| RobotService {
                        index,
                        device: robot.device.clone(),
                        commands: Arc::new(MtxRobot::new(
                            &log,
                            executor.clone(),
                            robot.clone(),
                        )),
                    })
                    .collect();
                let drives = drives
                    .iter()
                    .map(|drive| DriveService {
                        index: drive.index,
                        device: drive.device.clone(),
                        commands: Arc::new(MtDrive::new(
                            &log,
                            executor.clone(),
                            drive.clone(),
                        )),
                    })
                    .collect();
                (robots, drives, None)
            }
            HardwareConfig::Simulated(sim) => {
                let library = SimulatedLibrary::new(&log, sim.clone());
                let robots = vec![RobotService {
                    index: 0,
                    device: sim.device.clone(),
                    commands: library.robot(),
                }];
                let drives = (0..sim.drives)
                    .map(|index| DriveService {
                        index,
                        device: format!("/dev/sim-nst{}", index),
                        commands: library.drive(index),
                    })
                    .collect();
                (robots, drives, Some(library))
            }
        };

        let pool = TapeLibraryPool::new(&log, &config.name, robots, drives)?;
        info!(log, "library configured";
            "drives" => ?pool.drive_indexes(),
            "simulated" => simulator.is_some(),
        );
        Ok(Self {
            name: config.name.clone(),
            pool: Arc::new(pool),
            full_cartridge_detection_threshold_bytes: config
                .full_cartridge_detection_threshold_bytes(),
            simulator,
        })
    }
}
