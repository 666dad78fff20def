pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use plume_core::{ApiCredential, CredentialRef, SensorId, SensorRegistration};

/// Persisted sensor registrations and the credentials they reference.
#[async_trait]
pub trait SensorStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert or replace a registration.
    async fn save_sensor(&self, registration: &SensorRegistration) -> Result<(), Self::Error>;

    async fn remove_sensor(&self, sensor_id: SensorId) -> Result<(), Self::Error>;

    /// All registrations, ordered by sensor id.
    async fn load_sensors(&self) -> Result<Vec<SensorRegistration>, Self::Error>;

    async fn save_credential(
        &self,
        id: CredentialRef,
        credential: &ApiCredential,
    ) -> Result<(), Self::Error>;

    async fn remove_credential(&self, id: CredentialRef) -> Result<(), Self::Error>;

    async fn load_credentials(&self) -> Result<Vec<(CredentialRef, ApiCredential)>, Self::Error>;
}
