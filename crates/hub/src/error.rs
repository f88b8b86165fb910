//! Why an action did not take effect.
//!
//! None of these are fatal. The engine records every rejection in the
//! ledger, logs it, and carries on with the next channel and the next tick.

use thiserror::Error;

use crate::budget::ResourceId;
use crate::channel::ChannelId;

/// The actuator write failed or never confirmed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("no output wired for channel '{0}'")]
    UnknownOutput(ChannelId),
    #[error("hardware write failed: {0}")]
    Hardware(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejected {
    #[error("unknown channel '{0}'")]
    UnknownChannel(ChannelId),

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error(
        "daily limit exceeded for '{resource}': {used:.1} used + {requested:.1} requested > {limit:.1}"
    )]
    DailyLimitExceeded {
        resource: ResourceId,
        used: f64,
        requested: f64,
        limit: f64,
    },

    #[error("'{resource}' has run continuously for {ran_secs}s (max {max_secs}s)")]
    ContinuousRunExceeded {
        resource: ResourceId,
        ran_secs: u64,
        max_secs: u64,
    },

    #[error("'{resource}' is locked out after a safety shutoff for another {remaining_secs}s")]
    SafetyLockout {
        resource: ResourceId,
        remaining_secs: u64,
    },

    #[error("manual override active on '{channel}' for another {remaining_secs}s")]
    OverrideActive {
        channel: ChannelId,
        remaining_secs: u64,
    },

    #[error("cannot dispense {0} ml")]
    InvalidVolume(f64),

    #[error("override of {secs}s is out of range (1..={max_secs}s)")]
    InvalidOverride { secs: u64, max_secs: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Rejected {
    /// True for rejections that come from a safety budget.
    pub fn is_budget(&self) -> bool {
        matches!(
            self,
            Self::DailyLimitExceeded { .. }
                | Self::ContinuousRunExceeded { .. }
                | Self::SafetyLockout { .. }
        )
    }
}
