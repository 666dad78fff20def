//! Polling coordinator.
//!
//! Owns the sensor registry and one [`NowCastCalculator`] per sensor. Every
//! tick it groups pollable sensors by credential, sends one batch request
//! per group, and publishes a result for each sensor it hears about.

mod tick;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use plume_core::{
    ApiGeneration, CredentialKind, CredentialRef, DeviceInfo, Publication, RetainReason,
    SensorId, SensorRegistration, SensorSnapshot, UnavailableReason,
};
use plume_nowcast::{NowCastCalculator, NowCastSettings};
use plume_upstream::{ErrorKind, Upstream, UpstreamError};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialError, CredentialStore};
use crate::migration::{MigrationError, MigrationEvent, MigrationState};
use crate::publisher::Publisher;
use crate::store::SensorStore;

pub use tick::TickReport;

/// Interval between scheduled polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(300);
/// Readings older than this are published as unavailable.
pub const STALE_AFTER: Duration = Duration::from_secs(2 * 3600);
/// Device metadata is requested at most this often.
pub const DEVICE_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("sensor {0} is not registered")]
    UnknownSensor(SensorId),
    #[error("sensor {0} is already registered")]
    AlreadyRegistered(SensorId),
}

impl CoordinatorError {
    /// Whether upstream refused the key itself, as opposed to failing to
    /// answer.
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::Upstream(e) | Self::Credential(CredentialError::Upstream(e)) => {
                e.kind() == ErrorKind::InvalidCredential
            }
            Self::Credential(_) => true,
            _ => false,
        }
    }
}

fn store_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> CoordinatorError {
    CoordinatorError::Store(Box::new(e))
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    pub settings: NowCastSettings,
    /// Batch requests allowed in flight at once.
    pub max_in_flight: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            settings: NowCastSettings::default(),
            max_in_flight: 4,
        }
    }
}

#[derive(Debug)]
struct SensorState {
    calculator: NowCastCalculator,
    last_snapshot: Option<SensorSnapshot>,
    last_polled: Option<Timestamp>,
    device: Option<DeviceInfo>,
    degraded_warned: bool,
}

impl SensorState {
    fn new(settings: NowCastSettings) -> Self {
        Self {
            calculator: NowCastCalculator::new(settings),
            last_snapshot: None,
            last_polled: None,
            device: None,
            degraded_warned: false,
        }
    }
}

struct SensorEntry {
    registration: SensorRegistration,
    migration: MigrationState,
    /// Last key upstream refused for this sensor. Not retried automatically.
    rejected_credential: Option<CredentialRef>,
    // Locked by the tick and by migration, never across an await.
    state: Arc<std::sync::Mutex<SensorState>>,
}

impl SensorEntry {
    fn new(
        registration: SensorRegistration,
        migration: MigrationState,
        settings: NowCastSettings,
    ) -> Self {
        Self {
            registration,
            migration,
            rejected_credential: None,
            state: Arc::new(std::sync::Mutex::new(SensorState::new(settings))),
        }
    }
}

type ClaimCounts = std::sync::Mutex<HashMap<CredentialRef, usize>>;

/// Keeps a credential from being pruned while a registration that will
/// reference it is still being confirmed. Released on drop.
struct CredentialClaim<'a> {
    claims: &'a ClaimCounts,
    id: CredentialRef,
}

impl<'a> CredentialClaim<'a> {
    fn new(claims: &'a ClaimCounts, id: CredentialRef) -> Self {
        *claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_insert(0) += 1;
        Self { claims, id }
    }
}

impl Drop for CredentialClaim<'_> {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = claims.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                claims.remove(&self.id);
            }
        }
    }
}

struct Inner<U, S> {
    upstream: U,
    store: S,
    settings: NowCastSettings,
    max_in_flight: usize,
    sensors: RwLock<HashMap<SensorId, SensorEntry>>,
    credentials: CredentialStore,
    claims: ClaimCounts,
    // Serializes claiming a credential against pruning.
    credential_lock: Mutex<()>,
    publisher: Arc<Publisher>,
    tick_lock: Mutex<()>,
    last_device_refresh: std::sync::Mutex<Option<Timestamp>>,
}

pub struct Coordinator<U, S> {
    inner: Arc<Inner<U, S>>,
}

impl<U, S> Clone for Coordinator<U, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U: Upstream, S: SensorStore> Coordinator<U, S> {
    /// Build a coordinator from the registrations and credentials already in
    /// `store`.
    pub async fn load(
        upstream: U,
        store: S,
        options: CoordinatorOptions,
    ) -> Result<Self, CoordinatorError> {
        let credentials = CredentialStore::new();
        for (id, credential) in store.load_credentials().await.map_err(store_error)? {
            credentials.restore(id, credential).await;
        }

        // Migration state is not stored. A sensor that was waiting for a key
        // reloads as legacy, gets the legacy 410 again on its first poll and
        // goes back to waiting (or reuses a known key) from there.
        let mut sensors = HashMap::new();
        for registration in store.load_sensors().await.map_err(store_error)? {
            let migration = MigrationState::initial(registration.api_generation);
            sensors.insert(
                registration.sensor_id,
                SensorEntry::new(registration, migration, options.settings),
            );
        }

        info!(sensors = sensors.len(), "Loaded sensor registry");

        Ok(Self {
            inner: Arc::new(Inner {
                upstream,
                store,
                settings: options.settings,
                max_in_flight: options.max_in_flight.max(1),
                sensors: RwLock::new(sensors),
                credentials,
                claims: ClaimCounts::default(),
                credential_lock: Mutex::new(()),
                publisher: Arc::new(Publisher::new()),
                tick_lock: Mutex::new(()),
                last_device_refresh: std::sync::Mutex::new(None),
            }),
        })
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        Arc::clone(&self.inner.publisher)
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    /// Registrations with their migration state, ordered by sensor id.
    pub async fn registrations(&self) -> Vec<(SensorRegistration, MigrationState)> {
        let sensors = self.inner.sensors.read().await;
        let mut all: Vec<_> = sensors
            .values()
            .map(|entry| (entry.registration.clone(), entry.migration))
            .collect();
        all.sort_by_key(|(registration, _)| registration.sensor_id);
        all
    }

    pub async fn migration_state(&self, sensor_id: SensorId) -> Option<MigrationState> {
        let sensors = self.inner.sensors.read().await;
        sensors.get(&sensor_id).map(|entry| entry.migration)
    }

    /// Register a sensor on the current API.
    ///
    /// The key and the sensor are checked upstream before anything is
    /// stored. A key that was validated earlier is not checked again.
    pub async fn add_sensor(
        &self,
        sensor_id: SensorId,
        api_key: &str,
        read_key: Option<&str>,
    ) -> Result<SensorRegistration, CoordinatorError> {
        if self.inner.sensors.read().await.contains_key(&sensor_id) {
            return Err(CoordinatorError::AlreadyRegistered(sensor_id));
        }

        let claim = self.claim_key(api_key).await;
        let result = self.register(sensor_id, claim.id, read_key).await;
        drop(claim);

        if result.is_err() {
            self.discard_unused_credentials().await;
        }
        result
    }

    async fn register(
        &self,
        sensor_id: SensorId,
        credential_ref: CredentialRef,
        read_key: Option<&str>,
    ) -> Result<SensorRegistration, CoordinatorError> {
        let config = self.confirm(credential_ref, sensor_id, read_key).await?;

        let registration = SensorRegistration {
            sensor_id,
            api_generation: ApiGeneration::Current,
            credential_ref: Some(credential_ref),
            label: config.name,
            read_key: config.read_key.or_else(|| read_key.map(Into::into)),
            last_seen: None,
            poll_interval_override: None,
        };

        {
            let mut sensors = self.inner.sensors.write().await;
            if sensors.contains_key(&sensor_id) {
                return Err(CoordinatorError::AlreadyRegistered(sensor_id));
            }
            sensors.insert(
                sensor_id,
                SensorEntry::new(registration.clone(), MigrationState::Upgraded, self.inner.settings),
            );
        }

        let persisted = match self.persist_credential(credential_ref).await {
            Ok(()) => self
                .inner
                .store
                .save_sensor(&registration)
                .await
                .map_err(store_error),
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            self.inner.sensors.write().await.remove(&sensor_id);
            return Err(e);
        }

        info!(sensor = %sensor_id, label = %registration.label, "Sensor added");
        Ok(registration)
    }

    /// Unregister a sensor and drop credentials nothing references anymore.
    pub async fn remove_sensor(&self, sensor_id: SensorId) -> Result<(), CoordinatorError> {
        if self.inner.sensors.write().await.remove(&sensor_id).is_none() {
            return Err(CoordinatorError::UnknownSensor(sensor_id));
        }

        self.inner
            .store
            .remove_sensor(sensor_id)
            .await
            .map_err(store_error)?;
        self.inner.publisher.remove(sensor_id);
        self.prune_credentials().await?;

        info!(sensor = %sensor_id, "Sensor removed");
        Ok(())
    }

    /// Limit how often a sensor is polled. `None` polls it every tick.
    pub async fn set_poll_interval(
        &self,
        sensor_id: SensorId,
        seconds: Option<u64>,
    ) -> Result<(), CoordinatorError> {
        let registration = {
            let mut sensors = self.inner.sensors.write().await;
            let entry = sensors
                .get_mut(&sensor_id)
                .ok_or(CoordinatorError::UnknownSensor(sensor_id))?;
            entry.registration.poll_interval_override = seconds;
            entry.registration.clone()
        };

        self.inner
            .store
            .save_sensor(&registration)
            .await
            .map_err(store_error)
    }

    /// Mark a legacy sensor as no longer served by the legacy endpoint. It
    /// leaves scheduled polls and its last result is kept visible until a
    /// key is supplied.
    pub async fn deprecate_legacy(&self, sensor_id: SensorId) -> Result<MigrationState, CoordinatorError> {
        let mut sensors = self.inner.sensors.write().await;
        let entry = sensors
            .get_mut(&sensor_id)
            .ok_or(CoordinatorError::UnknownSensor(sensor_id))?;

        entry.migration = entry.migration.apply(MigrationEvent::Deprecated)?;
        self.publish_awaiting_key(sensor_id, entry);

        warn!(sensor = %sensor_id, "Legacy API no longer serves sensor, API key required");
        Ok(entry.migration)
    }

    /// Move a legacy sensor to the current API.
    ///
    /// With no `api_key`, the single validated key already known is reused.
    /// If there is none, the sensor waits in [`MigrationState::NeedsApiKey`].
    /// A refused key also leaves it waiting; any other upstream failure puts
    /// it back where it started so the next tick can try again. The sensor's
    /// history carries over on success.
    pub async fn migrate_sensor(
        &self,
        sensor_id: SensorId,
        api_key: Option<&str>,
    ) -> Result<MigrationState, CoordinatorError> {
        let claim = match api_key {
            Some(key) => self.claim_key(key).await,
            None => match self.claim_shared_key().await {
                Some(claim) => claim,
                None => {
                    let mut sensors = self.inner.sensors.write().await;
                    let entry = sensors
                        .get_mut(&sensor_id)
                        .ok_or(CoordinatorError::UnknownSensor(sensor_id))?;
                    entry.migration = entry.migration.apply(MigrationEvent::Deprecated)?;
                    self.publish_awaiting_key(sensor_id, entry);
                    info!(sensor = %sensor_id, "No API key available, waiting for one");
                    return Ok(entry.migration);
                }
            },
        };

        let result = self.upgrade(sensor_id, claim.id).await;
        drop(claim);

        match result {
            Ok(state) => {
                self.prune_credentials().await?;
                Ok(state)
            }
            Err(e) => {
                self.discard_unused_credentials().await;
                Err(e)
            }
        }
    }

    async fn upgrade(
        &self,
        sensor_id: SensorId,
        credential_ref: CredentialRef,
    ) -> Result<MigrationState, CoordinatorError> {
        let (prior, read_key) = {
            let mut sensors = self.inner.sensors.write().await;
            let entry = sensors
                .get_mut(&sensor_id)
                .ok_or(CoordinatorError::UnknownSensor(sensor_id))?;

            let prior = entry.migration;
            entry.migration = prior.apply(MigrationEvent::KeySupplied(credential_ref))?;
            self.publish_awaiting_key(sensor_id, entry);
            (prior, entry.registration.read_key.clone())
        };

        debug!(sensor = %sensor_id, credential = %credential_ref, "Validating API key");
        let confirmed = self.confirm(credential_ref, sensor_id, read_key.as_deref()).await;

        let mut sensors = self.inner.sensors.write().await;
        let entry = sensors
            .get_mut(&sensor_id)
            .ok_or(CoordinatorError::UnknownSensor(sensor_id))?;

        let config = match confirmed {
            Ok(config) => config,
            Err(e) if e.is_rejection() => {
                entry.migration = entry.migration.apply(MigrationEvent::Rejected)?;
                entry.rejected_credential = Some(credential_ref);
                self.publish_awaiting_key(sensor_id, entry);
                warn!(sensor = %sensor_id, error = %e, "API key rejected, waiting for another");
                return Err(e);
            }
            Err(e) => {
                entry.migration = prior;
                warn!(
                    sensor = %sensor_id,
                    error = %e,
                    state = ?prior,
                    "API key check failed, retrying next tick"
                );
                return Err(e);
            }
        };

        entry.migration = entry.migration.apply(MigrationEvent::Confirmed)?;
        entry.rejected_credential = None;
        entry.registration.api_generation = ApiGeneration::Current;
        entry.registration.credential_ref = Some(credential_ref);
        if config.read_key.is_some() {
            entry.registration.read_key = config.read_key;
        }
        let registration = entry.registration.clone();
        drop(sensors);

        self.persist_credential(credential_ref).await?;
        self.inner
            .store
            .save_sensor(&registration)
            .await
            .map_err(store_error)?;

        info!(sensor = %sensor_id, "Sensor upgraded to current API");
        Ok(MigrationState::Upgraded)
    }

    /// Poll every due sensor once.
    pub async fn refresh(&self) -> TickReport {
        self.refresh_at(Timestamp::now()).await
    }

    /// Poll loop. Runs until `cancel` fires; a tick in progress is abandoned
    /// and its pending requests are aborted.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancelled poll in progress");
                    break;
                }
                report = self.refresh() => {
                    debug!(?report, "Poll finished");
                }
            }
        }

        info!("Coordinator stopped");
    }

    async fn confirm(
        &self,
        credential_ref: CredentialRef,
        sensor_id: SensorId,
        read_key: Option<&str>,
    ) -> Result<plume_upstream::SensorConfig, CoordinatorError> {
        let credential = self
            .inner
            .credentials
            .validate(credential_ref, &self.inner.upstream)
            .await?;

        Ok(self
            .inner
            .upstream
            .lookup_sensor(&credential.value, sensor_id, read_key)
            .await?)
    }

    async fn persist_credential(&self, id: CredentialRef) -> Result<(), CoordinatorError> {
        let credential = self
            .inner
            .credentials
            .get(id)
            .await
            .ok_or(CredentialError::NotFound(id))?;
        self.inner
            .store
            .save_credential(id, &credential)
            .await
            .map_err(store_error)
    }

    /// Insert `api_key` and claim it before a prune can see it unreferenced.
    async fn claim_key(&self, api_key: &str) -> CredentialClaim<'_> {
        let _guard = self.inner.credential_lock.lock().await;
        let (id, _) = self
            .inner
            .credentials
            .insert(CredentialKind::V1ReadKey, api_key)
            .await;
        CredentialClaim::new(&self.inner.claims, id)
    }

    async fn claim_shared_key(&self) -> Option<CredentialClaim<'_>> {
        let _guard = self.inner.credential_lock.lock().await;
        let id = self.inner.credentials.shared_read_key().await?;
        Some(CredentialClaim::new(&self.inner.claims, id))
    }

    async fn discard_unused_credentials(&self) {
        if let Err(e) = self.prune_credentials().await {
            warn!(error = %e, "Failed to drop unused credentials");
        }
    }

    /// Drop credentials no registration, validation in progress or claim
    /// refers to.
    async fn prune_credentials(&self) -> Result<(), CoordinatorError> {
        let _guard = self.inner.credential_lock.lock().await;
        let mut referenced: HashSet<_> = {
            let sensors = self.inner.sensors.read().await;
            sensors
                .values()
                .flat_map(|entry| {
                    let pending = match entry.migration {
                        MigrationState::Validating { credential } => Some(credential),
                        _ => None,
                    };
                    entry.registration.credential_ref.into_iter().chain(pending)
                })
                .collect()
        };
        referenced.extend(
            self.inner
                .claims
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .copied(),
        );

        for id in self.inner.credentials.retain_referenced(&referenced).await {
            debug!(credential = %id, "Dropping unreferenced credential");
            self.inner
                .store
                .remove_credential(id)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }

    fn publish_awaiting_key(&self, sensor_id: SensorId, entry: &SensorEntry) {
        let state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
        let publication = match &state.last_snapshot {
            Some(snapshot) => Publication::Retained {
                snapshot: snapshot.clone(),
                reason: RetainReason::AwaitingApiKey,
            },
            None => Publication::Unavailable {
                reason: UnavailableReason::AwaitingApiKey,
                last_seen: entry.registration.last_seen,
            },
        };
        self.inner.publisher.publish(sensor_id, publication);
    }
}
