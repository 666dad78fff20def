use std::time::Duration;

use plume_core::SensorId;
use thiserror::Error;

/// Why the upstream refused a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRejection {
    /// The key is unknown, revoked or restricted (HTTP 401/403).
    Forbidden,
    /// The key is valid but not a READ key.
    NotReadKey,
    /// The sensor does not exist or is hidden from this key (HTTP 404).
    SensorNotFound,
    /// The per-sensor read key does not match the sensor.
    BadReadKey,
}

impl std::fmt::Display for CredentialRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Forbidden => "key is invalid or restricted",
            Self::NotReadKey => "key is not a READ key",
            Self::SensorNotFound => "sensor not found for this key",
            Self::BadReadKey => "sensor read key does not match",
        };
        f.write_str(reason)
    }
}

/// Error type for upstream operations.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("credential rejected: {0}")]
    InvalidCredential(CredentialRejection),

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream returned error status {status}")]
    Server { status: u16 },

    #[error("legacy endpoint is no longer serving data")]
    Deprecated,

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

/// Coarse classification the coordinator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidCredential,
    RateLimited,
    TransientNetworkFailure,
    MalformedResponse,
    Deprecated,
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredential(_) => ErrorKind::InvalidCredential,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Request(e) if e.is_decode() => ErrorKind::MalformedResponse,
            Self::Request(_) | Self::Server { .. } => ErrorKind::TransientNetworkFailure,
            Self::Malformed(_) | Self::BadRequest(_) => ErrorKind::MalformedResponse,
            Self::Deprecated => ErrorKind::Deprecated,
        }
    }
}

/// A single row that could not be normalized. Never fails the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row for sensor {sensor_id:?} skipped: {reason}")]
pub struct RowError {
    pub sensor_id: Option<SensorId>,
    pub reason: String,
}

impl RowError {
    pub fn new(sensor_id: Option<SensorId>, reason: impl Into<String>) -> Self {
        Self {
            sensor_id,
            reason: reason.into(),
        }
    }
}
