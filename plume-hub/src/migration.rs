//! Per-sensor move from the legacy API generation to the current one.
//!
//! ```text
//! LegacyActive --Deprecated--> NeedsApiKey --KeySupplied--> Validating --Confirmed--> Upgraded
//!      |                            ^                           |
//!      +--------KeySupplied---------|---------------------------+
//!                                   +---------Rejected----------+
//! ```
//!
//! `Upgraded` is terminal. A validation that fails without upstream refusing
//! the key is abandoned by the coordinator, which restores the state it held
//! before `KeySupplied`.

use plume_core::{ApiGeneration, CredentialRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    LegacyActive,
    NeedsApiKey,
    Validating { credential: CredentialRef },
    Upgraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationEvent {
    /// The legacy endpoint stopped serving this sensor, or an operator forced
    /// the migration.
    Deprecated,
    /// A key was supplied by the user or found already validated.
    KeySupplied(CredentialRef),
    /// The key can read this sensor on the current API.
    Confirmed,
    /// The key was refused for this sensor.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MigrationError {
    #[error("invalid migration transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: MigrationState,
        event: MigrationEvent,
    },
}

impl MigrationState {
    pub fn initial(generation: ApiGeneration) -> Self {
        match generation {
            ApiGeneration::Legacy => Self::LegacyActive,
            ApiGeneration::Current => Self::Upgraded,
        }
    }

    pub fn apply(self, event: MigrationEvent) -> Result<Self, MigrationError> {
        use MigrationEvent as E;
        use MigrationState as S;

        match (self, event) {
            (S::LegacyActive | S::NeedsApiKey, E::Deprecated) => Ok(S::NeedsApiKey),
            (S::LegacyActive | S::NeedsApiKey, E::KeySupplied(credential)) => {
                Ok(S::Validating { credential })
            }
            (S::Validating { .. }, E::Confirmed) => Ok(S::Upgraded),
            (S::Validating { .. }, E::Rejected) => Ok(S::NeedsApiKey),
            (from, event) => Err(MigrationError::InvalidTransition { from, event }),
        }
    }

    /// Whether the coordinator should include the sensor in scheduled polls.
    pub fn is_pollable(self) -> bool {
        matches!(self, Self::LegacyActive | Self::Upgraded)
    }

    /// API generation polls go through in this state, if any.
    pub fn generation(self) -> Option<ApiGeneration> {
        match self {
            Self::LegacyActive => Some(ApiGeneration::Legacy),
            Self::Upgraded => Some(ApiGeneration::Current),
            Self::NeedsApiKey | Self::Validating { .. } => None,
        }
    }
}
