// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusive access to the robot and drives of one tape library.
//!
//! A [`TapeLibraryPool`] is built once per library from configuration and
//! never resized.  Checking out a resource yields a handle; the resource goes
//! back to the pool when the handle is pushed back or dropped, so an early
//! return or a panic in the holder cannot starve later callers.

use slog::{debug, o, warn, Logger};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tape_hardware::{BoxedDriveCommands, BoxedRobotCommands};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("library {0} has no robot configured")]
    NoRobot(String),

    #[error("library {0} has no drive configured")]
    NoDrive(String),

    #[error("library {library} configures drive {index} more than once")]
    DuplicateDrive { library: String, index: u32 },

    #[error("library {library} has no drive {index}")]
    UnknownDrive { library: String, index: u32 },
}

/// A media changer arm.
pub struct RobotService {
    /// Position of this robot in the library configuration.
    pub index: usize,
    pub device: String,
    pub commands: BoxedRobotCommands,
}

/// A drive, addressed by its data transfer element index.
pub struct DriveService {
    pub index: u32,
    pub device: String,
    pub commands: BoxedDriveCommands,
}

struct RobotSlots {
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<RobotService>>,
}

/// Holds one robot until dropped or pushed back.
pub struct RobotHandle {
    service: Option<RobotService>,
    slots: Arc<RobotSlots>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for RobotHandle {
    type Target = RobotService;

    fn deref(&self) -> &RobotService {
        // `service` is only taken in `drop`.
        self.service.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for RobotHandle {
    fn drop(&mut self) {
        // Return the robot before the permit is released.
        if let Some(service) = self.service.take() {
            self.slots
                .idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push_back(service);
        }
    }
}

/// Holds one drive until dropped or pushed back.
pub struct DriveHandle {
    service: Arc<DriveService>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for DriveHandle {
    type Target = DriveService;

    fn deref(&self) -> &DriveService {
        &self.service
    }
}

struct DriveSlot {
    semaphore: Arc<Semaphore>,
    service: Arc<DriveService>,
}

/// Who holds what, for the administrative layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolOccupancy {
    pub library: String,
    pub robots_total: usize,
    pub robots_available: usize,
    /// Drive index and whether it is checked out.
    pub drives: Vec<(u32, bool)>,
}

pub struct TapeLibraryPool {
    log: Logger,
    library: String,
    robot_count: usize,
    robots: Arc<RobotSlots>,
    drives: BTreeMap<u32, DriveSlot>,
}

impl TapeLibraryPool {
    pub fn new(
        log: &Logger,
        library: &str,
        robots: Vec<RobotService>,
        drives: Vec<DriveService>,
    ) -> Result<Self, PoolError> {
        if robots.is_empty() {
            return Err(PoolError::NoRobot(library.to_string()));
        }
        if drives.is_empty() {
            return Err(PoolError::NoDrive(library.to_string()));
        }

        let mut drive_slots = BTreeMap::new();
        for drive in drives {
            let index = drive.index;
            let slot = DriveSlot {
                semaphore: Arc::new(Semaphore::new(1)),
                service: Arc::new(drive),
            };
            if drive_slots.insert(index, slot).is_some() {
                return Err(PoolError::DuplicateDrive {
                    library: library.to_string(),
                    index,
                });
            }
        }

        let robot_count = robots.len();
        let log = log.new(o!(
            "component" => "TapeLibraryPool",
            "library" => library.to_string(),
        ));
        debug!(log, "created pool";
            "robots" => robot_count,
            "drives" => ?drive_slots.keys().collect::<Vec<_>>(),
        );
        Ok(Self {
            log,
            library: library.to_string(),
            robot_count,
            robots: Arc::new(RobotSlots {
                semaphore: Arc::new(Semaphore::new(robot_count)),
                idle: Mutex::new(robots.into()),
            }),
            drives: drive_slots,
        })
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    /// Indexes of the drives in this library, ascending.
    pub fn drive_indexes(&self) -> Vec<u32> {
        self.drives.keys().copied().collect()
    }

    /// Waits up to `timeout` for a free robot.  `None` means none became
    /// free in time.
    pub async fn checkout_robot_service(
        &self,
        timeout: Duration,
    ) -> Option<RobotHandle> {
        let acquire = self.robots.semaphore.clone().acquire_owned();
        let permit = match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            // We never close the semaphore.
            Ok(Err(_)) => return None,
            Err(_) => {
                warn!(self.log, "no robot available"; "timeout" => ?timeout);
                return None;
            }
        };
        // Holding a permit guarantees an idle robot.
        let service = self
            .robots
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()?;
        debug!(self.log, "checked out robot"; "robot" => service.index);
        Some(RobotHandle {
            service: Some(service),
            slots: self.robots.clone(),
            _permit: permit,
        })
    }

    /// Waits up to `timeout` for drive `index`.  `Ok(None)` means another
    /// holder kept it for the whole time.
    pub async fn checkout_drive_service(
        &self,
        index: u32,
        timeout: Duration,
    ) -> Result<Option<DriveHandle>, PoolError> {
        let slot = self.drives.get(&index).ok_or_else(|| {
            PoolError::UnknownDrive { library: self.library.clone(), index }
        })?;
        let acquire = slot.semaphore.clone().acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => {
                debug!(self.log, "checked out drive"; "drive" => index);
                Ok(Some(DriveHandle {
                    service: slot.service.clone(),
                    _permit: permit,
                }))
            }
            // We never close the semaphore.
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                debug!(self.log, "drive unavailable";
                    "drive" => index,
                    "timeout" => ?timeout,
                );
                Ok(None)
            }
        }
    }

    pub fn push_robot_service(&self, handle: RobotHandle) {
        debug!(self.log, "pushed robot"; "robot" => handle.index);
        drop(handle);
    }

    pub fn push_drive_service(&self, handle: DriveHandle) {
        debug!(self.log, "pushed drive"; "drive" => handle.index);
        drop(handle);
    }

    pub fn occupancy(&self) -> PoolOccupancy {
        PoolOccupancy {
            library: self.library.clone(),
            robots_total: self.robot_count,
            robots_available: self.robots.semaphore.available_permits(),
            drives: self
                .drives
                .iter()
                .map(|(index, slot)| {
                    (*index, slot.semaphore.available_permits() == 0)
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Instant;
    use tape_hardware::fakes::{SimulatedLibrary, SimulatedLibraryConfig};
    use tape_test_utils::dev::test_setup_log;

    fn simulated_pool(log: &Logger, robots: usize, drives: u32) -> TapeLibraryPool {
        let library = SimulatedLibrary::new(
            log,
            SimulatedLibraryConfig::new(drives, 10, 4, 1 << 20),
        );
        let robots = (0..robots)
            .map(|index| RobotService {
                index,
                device: "/dev/sim-changer".to_string(),
                commands: library.robot(),
            })
            .collect();
        let drives = (0..drives)
            .map(|index| DriveService {
                index,
                device: format!("/dev/sim-nst{index}"),
                commands: library.drive(index),
            })
            .collect();
        TapeLibraryPool::new(log, "lib-1", robots, drives).unwrap()
    }

    #[tokio::test]
    async fn test_pool_configuration_errors() {
        let logctx = test_setup_log("test_pool_configuration_errors");
        let library = SimulatedLibrary::new(
            &logctx.log,
            SimulatedLibraryConfig::new(2, 10, 4, 1 << 20),
        );
        let robot = || RobotService {
            index: 0,
            device: "changer".to_string(),
            commands: library.robot(),
        };
        let drive = |index| DriveService {
            index,
            device: format!("nst{index}"),
            commands: library.drive(index),
        };

        assert_matches!(
            TapeLibraryPool::new(&logctx.log, "lib", vec![], vec![drive(0)])
                .err(),
            Some(PoolError::NoRobot(_))
        );
        assert_matches!(
            TapeLibraryPool::new(&logctx.log, "lib", vec![robot()], vec![])
                .err(),
            Some(PoolError::NoDrive(_))
        );
        assert_matches!(
            TapeLibraryPool::new(
                &logctx.log,
                "lib",
                vec![robot()],
                vec![drive(1), drive(1)]
            )
            .err(),
            Some(PoolError::DuplicateDrive { index: 1, .. })
        );

        let pool = TapeLibraryPool::new(
            &logctx.log,
            "lib",
            vec![robot()],
            vec![drive(0), drive(1)],
        )
        .unwrap();
        assert_matches!(
            pool.checkout_drive_service(7, Duration::from_millis(10))
                .await
                .err(),
            Some(PoolError::UnknownDrive { index: 7, .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_robot_exclusive() {
        let logctx = test_setup_log("test_robot_exclusive");
        let pool = simulated_pool(&logctx.log, 1, 2);

        let robot = pool
            .checkout_robot_service(Duration::from_millis(100))
            .await
            .expect("robot should be free");
        assert_eq!(pool.occupancy().robots_available, 0);
        assert!(pool
            .checkout_robot_service(Duration::from_millis(50))
            .await
            .is_none());

        pool.push_robot_service(robot);
        assert_eq!(pool.occupancy().robots_available, 1);
        let again = pool.checkout_robot_service(Duration::from_millis(50)).await;
        assert!(again.is_some());

        // Dropping a handle returns the robot too.
        drop(again);
        assert!(pool
            .checkout_robot_service(Duration::from_millis(50))
            .await
            .is_some());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_drive_checkout_times_out() {
        let logctx = test_setup_log("test_drive_checkout_times_out");
        let pool = simulated_pool(&logctx.log, 1, 3);

        let held = pool
            .checkout_drive_service(2, Duration::from_millis(100))
            .await
            .unwrap()
            .expect("drive 2 should be free");
        assert_eq!(held.index, 2);
        assert_eq!(pool.occupancy().drives, vec![(0, false), (1, false), (2, true)]);

        let start = Instant::now();
        let second = pool
            .checkout_drive_service(2, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(second.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));

        // Other drives are independent.
        assert!(pool
            .checkout_drive_service(1, Duration::from_millis(10))
            .await
            .unwrap()
            .is_some());

        pool.push_drive_service(held);
        logctx.cleanup_successful();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drive_checkout_blocks_until_push() {
        let logctx = test_setup_log("test_drive_checkout_blocks_until_push");
        let pool = Arc::new(simulated_pool(&logctx.log, 1, 1));

        let held = pool
            .checkout_drive_service(0, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let waiter = {
            let pool = pool.clone();
            let released = released.clone();
            tokio::spawn(async move {
                let handle = pool
                    .checkout_drive_service(0, Duration::from_secs(30))
                    .await
                    .unwrap()
                    .unwrap();
                // The second holder only gets in after the first pushed.
                assert!(released.load(std::sync::atomic::Ordering::SeqCst));
                pool.push_drive_service(handle);
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());
        released.store(true, std::sync::atomic::Ordering::SeqCst);
        pool.push_drive_service(held);
        waiter.await.unwrap();

        logctx.cleanup_successful();
    }
}
