//! Client side of the sensor network's two API generations.
//!
//! Both generations sit behind the [`Upstream`] contract: the coordinator
//! hands over a [`BatchRequest`] for one credential group and gets back one
//! normalized [`SensorRow`] (or [`RowError`]) per returned sensor.

pub mod current;
pub mod error;
pub mod http;
pub mod legacy;
pub mod mock;

use async_trait::async_trait;
use plume_core::{ApiGeneration, BoxStr, SensorId, SensorRow};

pub use error::{CredentialRejection, ErrorKind, RowError, UpstreamError};
pub use http::{Endpoint, HttpUpstream, SensorEndpoint, UpstreamConfig};
pub use mock::SimulatedUpstream;

/// One upstream call covering every sensor of a credential group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub generation: ApiGeneration,
    /// v1 API key, or the legacy station key for hidden legacy sensors.
    pub credential: Option<BoxStr>,
    pub sensors: Vec<SensorId>,
    /// Per-sensor read keys of hidden v1 sensors in the batch.
    pub read_keys: Vec<BoxStr>,
    pub include_device_info: bool,
}

impl BatchRequest {
    pub fn new(generation: ApiGeneration, credential: Option<BoxStr>) -> Self {
        Self {
            generation,
            credential,
            sensors: Vec::new(),
            read_keys: Vec::new(),
            include_device_info: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    pub rows: Vec<Result<SensorRow, RowError>>,
}

/// Configuration of a sensor as reported by the current API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub sensor_id: SensorId,
    pub name: BoxStr,
    pub hidden: bool,
    /// Read key to poll with when the sensor is hidden.
    pub read_key: Option<BoxStr>,
}

#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Fetch the latest rows for every sensor in the request.
    async fn fetch(&self, request: &BatchRequest) -> Result<BatchResponse, UpstreamError>;

    /// Confirm `api_key` is a READ key on the current API.
    async fn check_read_key(&self, api_key: &str) -> Result<(), UpstreamError>;

    /// Confirm `sensor_id` is readable with `api_key` and return its
    /// configuration.
    async fn lookup_sensor(
        &self,
        api_key: &str,
        sensor_id: SensorId,
        read_key: Option<&str>,
    ) -> Result<SensorConfig, UpstreamError>;
}
