use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use plume_core::{ApiCredential, CredentialRef, SensorId, SensorRegistration};
use thiserror::Error;

use super::SensorStore;

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("internal error: {0}")]
    Internal(String),
}

/// Store that forgets everything on restart. Used by tests and by the
/// default configuration.
#[derive(Clone, Default)]
pub struct MemoryStore {
    sensors: Arc<Mutex<HashMap<SensorId, SensorRegistration>>>,
    credentials: Arc<Mutex<HashMap<CredentialRef, ApiCredential>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SensorStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn save_sensor(&self, registration: &SensorRegistration) -> Result<(), Self::Error> {
        let mut map = self
            .sensors
            .lock()
            .map_err(|_| MemoryStoreError::Internal("sensors mutex poisoned".into()))?;

        map.insert(registration.sensor_id, registration.clone());
        Ok(())
    }

    async fn remove_sensor(&self, sensor_id: SensorId) -> Result<(), Self::Error> {
        let mut map = self
            .sensors
            .lock()
            .map_err(|_| MemoryStoreError::Internal("sensors mutex poisoned".into()))?;

        map.remove(&sensor_id);
        Ok(())
    }

    async fn load_sensors(&self) -> Result<Vec<SensorRegistration>, Self::Error> {
        let map = self
            .sensors
            .lock()
            .map_err(|_| MemoryStoreError::Internal("sensors mutex poisoned".into()))?;

        let mut sensors: Vec<_> = map.values().cloned().collect();
        sensors.sort_by_key(|r| r.sensor_id);
        Ok(sensors)
    }

    async fn save_credential(
        &self,
        id: CredentialRef,
        credential: &ApiCredential,
    ) -> Result<(), Self::Error> {
        let mut map = self
            .credentials
            .lock()
            .map_err(|_| MemoryStoreError::Internal("credentials mutex poisoned".into()))?;

        map.insert(id, credential.clone());
        Ok(())
    }

    async fn remove_credential(&self, id: CredentialRef) -> Result<(), Self::Error> {
        let mut map = self
            .credentials
            .lock()
            .map_err(|_| MemoryStoreError::Internal("credentials mutex poisoned".into()))?;

        map.remove(&id);
        Ok(())
    }

    async fn load_credentials(&self) -> Result<Vec<(CredentialRef, ApiCredential)>, Self::Error> {
        let map = self
            .credentials
            .lock()
            .map_err(|_| MemoryStoreError::Internal("credentials mutex poisoned".into()))?;

        Ok(map.iter().map(|(id, c)| (*id, c.clone())).collect())
    }
}
