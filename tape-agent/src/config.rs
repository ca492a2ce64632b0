// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with tape agent configuration

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tape_catalog::CatalogConfig;
use tape_common::backoff::RetryPolicy;
use tape_common::logging::ConfigLogging;
use tape_hardware::fakes::SimulatedLibraryConfig;
use tape_hardware::mt::MtDriveConfig;
use tape_hardware::mtx::MtxRobotConfig;

/// Configuration for a tape agent process.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log: ConfigLogging,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub libraries: Vec<LibraryConfig>,
}

/// Which kind of order a drive worker looks for first when its mounted tape
/// has nothing pending.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPriority {
    #[default]
    Write,
    Read,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Idle delay between two empty queue polls.
    #[serde(default = "WorkerConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for checking out the robot or a drive.
    #[serde(default = "WorkerConfig::default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
    /// Bounded retry for queue entries parked in ERROR.
    #[serde(default = "WorkerConfig::default_retry")]
    pub retry: RetryPolicy,
    /// Attempts at a version-checked catalog update before giving up.
    #[serde(default = "WorkerConfig::default_conflict_retries")]
    pub conflict_retries: u32,
    /// Period of the ERROR-requeue supervisor.
    #[serde(default = "WorkerConfig::default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,
    #[serde(default)]
    pub priority: WorkerPriority,
    /// Allow writing over cartridges that are not blank on first use.
    #[serde(default)]
    pub force_override_non_empty_cartridges: bool,
}

impl WorkerConfig {
    fn default_poll_interval_ms() -> u64 {
        1_000
    }

    fn default_checkout_timeout_ms() -> u64 {
        60_000
    }

    fn default_retry() -> RetryPolicy {
        RetryPolicy::with_max_attempts(3)
    }

    fn default_conflict_retries() -> u32 {
        5
    }

    fn default_supervisor_interval_ms() -> u64 {
        60_000
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            checkout_timeout_ms: Self::default_checkout_timeout_ms(),
            retry: Self::default_retry(),
            conflict_retries: Self::default_conflict_retries(),
            supervisor_interval_ms: Self::default_supervisor_interval_ms(),
            priority: WorkerPriority::default(),
            force_override_non_empty_cartridges: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LibraryConfig {
    pub name: String,
    /// A failed write past this many megabytes marks the tape full instead
    /// of conflicting.
    pub full_cartridge_detection_threshold_mb: u64,
    pub hardware: HardwareConfig,
}

impl LibraryConfig {
    pub fn full_cartridge_detection_threshold_bytes(&self) -> u64 {
        self.full_cartridge_detection_threshold_mb.saturating_mul(1_000_000)
    }
}

/// How the robot and drives of a library are reached.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HardwareConfig {
    /// Real hardware driven through `mtx`, `mt` and `dd`.
    Mtx { robots: Vec<MtxRobotConfig>, drives: Vec<MtDriveConfig> },
    /// In-memory library.
    Simulated(SimulatedLibraryConfig),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.libraries.is_empty() {
            return invalid("no library configured".to_string());
        }
        if self.worker.retry.max_attempts == 0 {
            return invalid("worker.retry.max_attempts must be positive".into());
        }
        if self.worker.conflict_retries == 0 {
            return invalid("worker.conflict_retries must be positive".into());
        }
        if self.worker.checkout_timeout_ms == 0 {
            return invalid("worker.checkout_timeout_ms must be positive".into());
        }
        if self.worker.poll_interval_ms == 0
            || self.worker.supervisor_interval_ms == 0
        {
            return invalid("worker intervals must be positive".into());
        }

        let mut names = BTreeSet::new();
        for library in &self.libraries {
            if !names.insert(library.name.as_str()) {
                return invalid(format!("duplicate library '{}'", library.name));
            }
            if library.full_cartridge_detection_threshold_mb == 0 {
                return invalid(format!(
                    "library '{}': full_cartridge_detection_threshold_mb \
                     must be positive",
                    library.name
                ));
            }
            match &library.hardware {
                HardwareConfig::Mtx { robots, drives } => {
                    if robots.is_empty() {
                        return invalid(format!(
                            "library '{}' has no robot",
                            library.name
                        ));
                    }
                    if robots.iter().any(|r| r.timeout_ms == 0)
                        || drives.iter().any(|d| d.timeout_ms == 0)
                    {
                        return invalid(format!(
                            "library '{}': command timeouts must be positive",
                            library.name
                        ));
                    }
                    let mut indexes = BTreeSet::new();
                    for drive in drives {
                        if !indexes.insert(drive.index) {
                            return invalid(format!(
                                "library '{}' configures drive {} twice",
                                library.name, drive.index
                            ));
                        }
                    }
                }
                HardwareConfig::Simulated(sim) => {
                    if sim.tapes > sim.slots {
                        return invalid(format!(
                            "library '{}': {} tapes do not fit in {} slots",
                            library.name, sim.tapes, sim.slots
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
