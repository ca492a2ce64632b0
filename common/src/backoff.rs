// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use serde::Deserialize;
use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a backoff policy for re-reading a catalog record after an
/// optimistic-concurrency conflict.  Conflicts resolve as soon as the
/// competing writer is done, so the intervals are short.
pub fn retry_policy_conflict() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(5);
    const MAX_INTERVAL: Duration = Duration::from_millis(200);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL)
}

/// Return a backoff policy for hardware status queries, which are known to
/// report transient failures while the mechanics settle.
pub fn retry_policy_hardware_status() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(20);
    const MAX_INTERVAL: Duration = Duration::from_millis(20);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL)
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..backoff::ExponentialBackoff::default()
    }
}

/// Bounded retry policy for operations the caller chooses to re-attempt,
/// e.g. queue entries parked in the ERROR state.
///
/// Deployments set this from configuration; nothing in the workspace
/// hardcodes the bound.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of attempts allowed, including the first one.  An entry
    /// that has been attempted this many times stays in ERROR for operator
    /// inspection.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "RetryPolicy::default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    /// Upper bound on the delay between retries.
    #[serde(default = "RetryPolicy::default_max_interval_ms")]
    pub max_interval_ms: u64,
}

impl RetryPolicy {
    fn default_initial_interval_ms() -> u64 {
        1_000
    }

    fn default_max_interval_ms() -> u64 {
        60_000
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Self::default_max_interval_ms(),
        }
    }

    /// Returns true if an operation that has already been attempted
    /// `attempts` times may be attempted again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// The exponential backoff schedule between attempts.
    pub fn backoff(&self) -> ::backoff::ExponentialBackoff {
        policy_with_max(self.initial_interval(), self.max_interval())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_max_attempts(3)
    }
}
