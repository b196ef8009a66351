//! Result of one delivery execution.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why the worker did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The attempt no longer exists.
    AttemptMissing,
    /// The owning subscriber no longer exists.
    SubscriberMissing,
    /// The subscriber was disabled after the attempt was queued.
    SubscriberDisabled,
    /// The subscriber stopped listening to the event.
    NotSubscribed,
}

/// Why a delivery stopped for good without a 2xx.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// TLS handshake or certificate failure.
    Tls,
    /// Connection refused, reset or unresolvable host.
    Connection,
    /// No response within the request timeout.
    Timeout,
    /// Tunnel service reported the tunnel no longer exists.
    TunnelNotFound,
    /// Tunnel service timed out reaching the developer machine.
    TunnelGatewayTimeout,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tls => "tls error",
            Self::Connection => "connection error",
            Self::Timeout => "timeout",
            Self::TunnelNotFound => "tunnel not found",
            Self::TunnelGatewayTimeout => "tunnel gateway timeout",
        };
        f.write_str(s)
    }
}

/// What happened when the worker ran an attempt.
///
/// Only [`DeliveryOutcome::Retry`] asks the queue for another execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Nothing was sent.
    Skipped(SkipReason),
    /// The subscriber answered 2xx.
    Delivered {
        /// Response status.
        status: u16,
    },
    /// The attempt failed and will not be retried.
    Terminal {
        /// Failure classification.
        reason: TerminalReason,
        /// Whether this execution flipped the subscriber to disabled.
        subscriber_disabled: bool,
    },
    /// The attempt failed and should run again after backoff.
    Retry {
        /// Human-readable cause, for logs.
        reason: String,
    },
}

impl DeliveryOutcome {
    /// Whether the queue should schedule another execution.
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}
