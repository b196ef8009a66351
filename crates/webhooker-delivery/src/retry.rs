//! Polynomial backoff with a wide jitter window.
//!
//! The n-th failed execution waits `n^5` seconds plus a uniformly random
//! jitter before the next one. Early retries are dominated by the jitter
//! (half a minute to ten minutes), later ones by the polynomial term: the
//! ninth failure waits roughly sixteen hours. After the tenth execution the
//! job is discarded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff schedule for failed deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySchedule {
    /// Maximum number of executions, including the first.
    pub max_attempts: u32,

    /// Exponent applied to the execution number.
    pub exponent: u32,

    /// Inclusive lower bound of the jitter window.
    pub jitter_min: Duration,

    /// Exclusive upper bound of the jitter window.
    pub jitter_max: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            exponent: 5,
            jitter_min: Duration::from_secs(30),
            jitter_max: Duration::from_secs(600),
        }
    }
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the job again at the given time.
    Retry {
        /// When the next execution may start
        next_attempt_at: DateTime<Utc>,
    },
    /// Discard the job.
    GiveUp {
        /// Why the job is being dropped
        reason: String,
    },
}

impl RetrySchedule {
    /// Deterministic part of the delay after execution `attempt_number`.
    ///
    /// Saturates instead of overflowing for absurd inputs.
    pub fn base_delay(&self, attempt_number: u32) -> Duration {
        Duration::from_secs(u64::from(attempt_number).saturating_pow(self.exponent))
    }

    /// Full delay after execution `attempt_number`: base plus jitter.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        self.base_delay(attempt_number).saturating_add(self.jitter())
    }

    /// Decides what to do after execution `attempt_number` (1-based) failed
    /// at `failed_at`.
    pub fn decide(&self, attempt_number: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted", self.max_attempts),
            };
        }

        let Ok(delay) = chrono::Duration::from_std(self.delay_for(attempt_number)) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        match failed_at.checked_add_signed(delay) {
            Some(next_attempt_at) => RetryDecision::Retry { next_attempt_at },
            None => RetryDecision::GiveUp { reason: "retry time out of range".to_string() },
        }
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }

        let millis = rand::rng().random_range(
            duration_millis(self.jitter_min)..duration_millis(self.jitter_max),
        );
        Duration::from_millis(millis)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
