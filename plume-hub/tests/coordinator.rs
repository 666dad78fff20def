use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jiff::{Timestamp, ToSpan};
use plume_core::*;
use plume_hub::coordinator::{Coordinator, CoordinatorError, CoordinatorOptions};
use plume_hub::credentials::CredentialError;
use plume_hub::migration::MigrationState;
use plume_hub::store::SensorStore;
use plume_hub::store::memory::MemoryStore;
use plume_upstream::{
    BatchRequest, BatchResponse, CredentialRejection, RowError, SensorConfig, Upstream,
    UpstreamError,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const GOOD_KEY: &str = "key-a";
const OTHER_KEY: &str = "key-b";

#[derive(Clone)]
enum ScriptedRow {
    Reading { pm: f64, at: Timestamp },
    Malformed,
}

#[derive(Default)]
struct Script {
    rows: HashMap<SensorId, ScriptedRow>,
    requests: Vec<BatchRequest>,
    key_checks: usize,
    failing: bool,
    rate_limited: bool,
    legacy_deprecated: bool,
    /// Sensor lookups that answer 503 before lookups succeed again.
    lookup_failures: usize,
}

/// Upstream double that answers from a script and records every call.
#[derive(Clone)]
struct FakeUpstream {
    script: Arc<Mutex<Script>>,
    good_keys: Arc<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
    key_gate: Option<Arc<Semaphore>>,
    aborted: Arc<AtomicUsize>,
}

/// Counts fetches dropped before they answered.
struct FetchGuard {
    aborted: Arc<AtomicUsize>,
    answered: bool,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if !self.answered {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl FakeUpstream {
    fn new() -> Self {
        Self {
            script: Arc::default(),
            good_keys: Arc::new(HashSet::from([GOOD_KEY.to_string(), OTHER_KEY.to_string()])),
            gate: None,
            key_gate: None,
            aborted: Arc::default(),
        }
    }

    /// Key checks are counted, then each one waits for a permit of its own.
    fn key_gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut upstream = Self::new();
        upstream.key_gate = Some(Arc::clone(&gate));
        (upstream, gate)
    }

    /// Batch fetches are recorded, then block until the returned semaphore
    /// gets a permit.
    fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut upstream = Self::new();
        upstream.gate = Some(Arc::clone(&gate));
        (upstream, gate)
    }

    fn set_reading(&self, id: u64, pm: f64, at: Timestamp) {
        let mut script = self.script.lock().unwrap();
        script.rows.insert(SensorId(id), ScriptedRow::Reading { pm, at });
    }

    fn set_malformed(&self, id: u64) {
        let mut script = self.script.lock().unwrap();
        script.rows.insert(SensorId(id), ScriptedRow::Malformed);
    }

    fn set_failing(&self, failing: bool) {
        self.script.lock().unwrap().failing = failing;
    }

    fn set_rate_limited(&self, rate_limited: bool) {
        self.script.lock().unwrap().rate_limited = rate_limited;
    }

    fn deprecate_legacy(&self) {
        self.script.lock().unwrap().legacy_deprecated = true;
    }

    fn fail_lookups(&self, count: usize) {
        self.script.lock().unwrap().lookup_failures = count;
    }

    fn aborted_fetches(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<BatchRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    fn key_checks(&self) -> usize {
        self.script.lock().unwrap().key_checks
    }
}

fn row(id: SensorId, pm: f64, at: Timestamp) -> SensorRow {
    let mut row = SensorRow::new(id, at);
    row.pm2_5_cf_1 = Some(ChannelReading::dual(id, ReadingKind::Pm2_5, pm, pm, at));
    row.pm2_5_atm = Some(ChannelReading::dual(id, ReadingKind::Pm2_5, pm * 0.7, pm * 0.7, at));
    row.humidity = Some(40.0);
    row
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn fetch(&self, request: &BatchRequest) -> Result<BatchResponse, UpstreamError> {
        self.script.lock().unwrap().requests.push(request.clone());
        let mut guard = FetchGuard {
            aborted: Arc::clone(&self.aborted),
            answered: false,
        };

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }

        let answer = self.answer(request);
        guard.answered = true;
        answer
    }

    async fn check_read_key(&self, api_key: &str) -> Result<(), UpstreamError> {
        self.script.lock().unwrap().key_checks += 1;
        if let Some(gate) = &self.key_gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.good_keys.contains(api_key) {
            Ok(())
        } else {
            Err(UpstreamError::InvalidCredential(CredentialRejection::Forbidden))
        }
    }

    async fn lookup_sensor(
        &self,
        api_key: &str,
        sensor_id: SensorId,
        _read_key: Option<&str>,
    ) -> Result<SensorConfig, UpstreamError> {
        {
            let mut script = self.script.lock().unwrap();
            if script.lookup_failures > 0 {
                script.lookup_failures -= 1;
                return Err(UpstreamError::Server { status: 503 });
            }
        }

        if !self.good_keys.contains(api_key) {
            return Err(UpstreamError::InvalidCredential(CredentialRejection::SensorNotFound));
        }

        Ok(SensorConfig {
            sensor_id,
            name: format!("sensor {sensor_id}").into(),
            hidden: false,
            read_key: None,
        })
    }
}

impl FakeUpstream {
    fn answer(&self, request: &BatchRequest) -> Result<BatchResponse, UpstreamError> {
        let script = self.script.lock().unwrap();

        if script.failing {
            return Err(UpstreamError::Server { status: 503 });
        }
        if script.rate_limited {
            return Err(UpstreamError::RateLimited { retry_after: None });
        }

        match request.generation {
            ApiGeneration::Legacy if script.legacy_deprecated => {
                return Err(UpstreamError::Deprecated);
            }
            ApiGeneration::Current => {
                let key = request.credential.as_deref().unwrap_or_default();
                if !self.good_keys.contains(key) {
                    return Err(UpstreamError::InvalidCredential(CredentialRejection::Forbidden));
                }
            }
            ApiGeneration::Legacy => {}
        }

        let rows = request
            .sensors
            .iter()
            .filter_map(|id| match script.rows.get(id)? {
                ScriptedRow::Reading { pm, at } => Some(Ok(row(*id, *pm, *at))),
                ScriptedRow::Malformed => Some(Err(RowError::new(Some(*id), "pm2.5 is not a number"))),
            })
            .collect();

        Ok(BatchResponse { rows })
    }
}

fn t0() -> Timestamp {
    Timestamp::from_second(1_772_359_200).unwrap()
}

fn legacy_registration(id: u64) -> SensorRegistration {
    SensorRegistration {
        sensor_id: SensorId(id),
        api_generation: ApiGeneration::Legacy,
        credential_ref: None,
        label: format!("legacy {id}").into(),
        read_key: None,
        last_seen: None,
        poll_interval_override: None,
    }
}

async fn start(
    upstream: &FakeUpstream,
    store: &MemoryStore,
) -> Coordinator<FakeUpstream, MemoryStore> {
    start_with(upstream, store, CoordinatorOptions::default()).await
}

async fn start_with(
    upstream: &FakeUpstream,
    store: &MemoryStore,
    options: CoordinatorOptions,
) -> Coordinator<FakeUpstream, MemoryStore> {
    Coordinator::load(upstream.clone(), store.clone(), options)
        .await
        .unwrap()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn published(
    coordinator: &Coordinator<FakeUpstream, MemoryStore>,
    id: u64,
) -> Option<Publication> {
    coordinator.publisher().current(SensorId(id))
}

#[tokio::test]
async fn sensors_sharing_a_key_share_one_request() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    for id in 1..=10 {
        coordinator.add_sensor(SensorId(id), GOOD_KEY, None).await.unwrap();
        upstream.set_reading(id, 20.0, t0());
    }
    // validated once, then reused
    assert_eq!(upstream.key_checks(), 1);

    let report = coordinator.refresh_at(t0()).await;
    assert_eq!(report.requests, 1);
    assert_eq!(report.updated, 10);

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].sensors, (1..=10).map(SensorId).collect::<Vec<_>>());
    assert_eq!(requests[0].credential.as_deref(), Some(GOOD_KEY));

    for id in 1..=10 {
        let publication = published(&coordinator, id).unwrap();
        assert!(publication.is_available(), "sensor {id}: {publication:?}");
        let snapshot = publication.snapshot().unwrap();
        assert!(snapshot.aqi.aqi().is_some());
        assert!(matches!(snapshot.aqi.status, AqiStatus::Calculating { .. }));
    }
}

#[tokio::test]
async fn one_request_per_credential_group() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    for id in 1..=10 {
        let key = if id <= 5 { GOOD_KEY } else { OTHER_KEY };
        coordinator.add_sensor(SensorId(id), key, None).await.unwrap();
        upstream.set_reading(id, 20.0, t0());
    }
    assert_eq!(upstream.key_checks(), 2);

    let report = coordinator.refresh_at(t0()).await;
    assert_eq!(report.requests, 2);
    assert_eq!(report.updated, 10);

    let mut sizes: Vec<_> = upstream.requests().iter().map(|r| r.sensors.len()).collect();
    sizes.sort();
    assert_eq!(sizes, vec![5, 5]);
}

#[tokio::test]
async fn stale_row_is_published_unavailable() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    coordinator.add_sensor(SensorId(2), GOOD_KEY, None).await.unwrap();
    upstream.set_reading(1, 20.0, t0() - 3.hours());
    upstream.set_reading(2, 20.0, t0() - 10.minutes());

    let report = coordinator.refresh_at(t0()).await;
    assert_eq!(report.stale, 1);
    assert_eq!(report.updated, 1);

    assert_eq!(
        published(&coordinator, 1),
        Some(Publication::Unavailable {
            reason: UnavailableReason::StaleUpstream,
            last_seen: Some(t0() - 3.hours()),
        })
    );
    assert!(published(&coordinator, 2).unwrap().is_available());
}

#[tokio::test]
async fn malformed_row_does_not_affect_batch() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    for id in 1..=3 {
        coordinator.add_sensor(SensorId(id), GOOD_KEY, None).await.unwrap();
        upstream.set_reading(id, 15.0, t0());
    }
    upstream.set_malformed(2);

    let report = coordinator.refresh_at(t0()).await;
    assert_eq!(report.malformed_rows, 1);
    assert_eq!(report.updated, 2);

    assert!(published(&coordinator, 1).unwrap().is_available());
    assert!(published(&coordinator, 3).unwrap().is_available());
    assert!(!published(&coordinator, 2).is_some_and(|p| p.is_available()));
}

#[tokio::test]
async fn missing_row_without_history_is_no_data() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();

    coordinator.refresh_at(t0()).await;
    assert_eq!(
        published(&coordinator, 1),
        Some(Publication::Unavailable {
            reason: UnavailableReason::NoData,
            last_seen: None,
        })
    );
}

#[tokio::test]
async fn transient_failure_keeps_previous_result_until_stale() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    upstream.set_reading(1, 20.0, t0());
    coordinator.refresh_at(t0()).await;
    let before = published(&coordinator, 1).unwrap();
    assert!(before.is_available());

    upstream.set_failing(true);
    let report = coordinator.refresh_at(t0() + 5.minutes()).await;
    assert_eq!(report.failed_requests, 1);
    assert_eq!(published(&coordinator, 1), Some(before));

    let report = coordinator.refresh_at(t0() + 3.hours()).await;
    assert_eq!(report.stale, 1);
    assert_eq!(
        published(&coordinator, 1),
        Some(Publication::Unavailable {
            reason: UnavailableReason::StaleUpstream,
            last_seen: Some(t0()),
        })
    );
}

#[tokio::test]
async fn sensor_added_mid_tick_joins_next_tick() {
    let (upstream, gate) = FakeUpstream::gated();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    upstream.set_reading(1, 20.0, t0());
    upstream.set_reading(2, 20.0, t0());

    let tick = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.refresh_at(t0()).await })
    };

    // wait until the batch is in flight
    tokio::time::timeout(Duration::from_secs(5), async {
        while upstream.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    coordinator.add_sensor(SensorId(2), GOOD_KEY, None).await.unwrap();
    gate.add_permits(1);

    let report = tick.await.unwrap();
    assert_eq!(report.updated, 1);
    assert!(published(&coordinator, 2).is_none());

    let report = coordinator.refresh_at(t0() + 5.minutes()).await;
    assert_eq!(report.updated, 2);
    let requests = upstream.requests();
    assert_eq!(requests.last().unwrap().sensors, vec![SensorId(1), SensorId(2)]);
}

#[tokio::test]
async fn invalid_key_is_rejected_before_registration() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    let result = coordinator.add_sensor(SensorId(1), "not-a-key", None).await;
    assert!(matches!(
        result,
        Err(CoordinatorError::Credential(CredentialError::Upstream(
            UpstreamError::InvalidCredential(_)
        )))
    ));

    assert!(coordinator.registrations().await.is_empty());
    assert!(coordinator.credentials().entries().await.is_empty());
    assert!(store.load_sensors().await.unwrap().is_empty());
    assert!(store.load_credentials().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_add_is_rejected() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    assert!(matches!(
        coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await,
        Err(CoordinatorError::AlreadyRegistered(SensorId(1)))
    ));
}

#[tokio::test]
async fn registrations_and_keys_are_persisted() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    let registration = coordinator.add_sensor(SensorId(9), GOOD_KEY, None).await.unwrap();
    assert_eq!(registration.api_generation, ApiGeneration::Current);
    assert_eq!(&*registration.label, "sensor 9");

    let credentials = store.load_credentials().await.unwrap();
    assert_eq!(credentials.len(), 1);
    assert!(credentials[0].1.validated);
    assert_eq!(store.load_sensors().await.unwrap(), vec![registration]);

    // a restart does not need to check the key again
    let restarted = start(&upstream, &store).await;
    restarted.add_sensor(SensorId(10), GOOD_KEY, None).await.unwrap();
    assert_eq!(upstream.key_checks(), 1);
}

#[tokio::test]
async fn removing_last_sensor_drops_its_key() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    coordinator.add_sensor(SensorId(2), GOOD_KEY, None).await.unwrap();

    coordinator.remove_sensor(SensorId(1)).await.unwrap();
    assert_eq!(store.load_credentials().await.unwrap().len(), 1);

    coordinator.remove_sensor(SensorId(2)).await.unwrap();
    assert!(coordinator.credentials().entries().await.is_empty());
    assert!(store.load_credentials().await.unwrap().is_empty());

    assert!(matches!(
        coordinator.remove_sensor(SensorId(2)).await,
        Err(CoordinatorError::UnknownSensor(SensorId(2)))
    ));
}

#[tokio::test]
async fn deprecation_retains_last_result_until_key_supplied() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    store.save_sensor(&legacy_registration(5)).await.unwrap();
    let coordinator = start(&upstream, &store).await;

    upstream.set_reading(5, 20.0, t0());
    coordinator.refresh_at(t0()).await;
    let snapshot = published(&coordinator, 5).unwrap().snapshot().cloned().unwrap();
    assert_eq!(upstream.requests()[0].generation, ApiGeneration::Legacy);

    upstream.deprecate_legacy();
    let report = coordinator.refresh_at(t0() + 5.minutes()).await;
    assert_eq!(report.deprecated, 1);
    assert_eq!(
        coordinator.migration_state(SensorId(5)).await,
        Some(MigrationState::NeedsApiKey)
    );
    assert_eq!(
        published(&coordinator, 5),
        Some(Publication::Retained {
            snapshot,
            reason: RetainReason::AwaitingApiKey,
        })
    );

    // not polled while waiting for a key
    let requests = upstream.requests().len();
    coordinator.refresh_at(t0() + 10.minutes()).await;
    assert_eq!(upstream.requests().len(), requests);

    assert_eq!(
        coordinator.migrate_sensor(SensorId(5), Some(GOOD_KEY)).await.unwrap(),
        MigrationState::Upgraded
    );
    let (registration, _) = coordinator.registrations().await.remove(0);
    assert_eq!(registration.api_generation, ApiGeneration::Current);
    assert_eq!(store.load_sensors().await.unwrap(), vec![registration]);

    upstream.set_reading(5, 20.0, t0() + 15.minutes());
    coordinator.refresh_at(t0() + 15.minutes()).await;
    assert_eq!(upstream.requests().last().unwrap().generation, ApiGeneration::Current);

    // second accepted sample: the history survived the upgrade
    let publication = published(&coordinator, 5).unwrap();
    assert!(publication.is_available());
    assert_eq!(
        publication.snapshot().unwrap().aqi.status,
        AqiStatus::Calculating {
            seconds_remaining: 10 * 300
        }
    );
}

#[tokio::test]
async fn deprecated_sensor_reuses_known_key() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    store.save_sensor(&legacy_registration(5)).await.unwrap();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    upstream.deprecate_legacy();

    let report = coordinator.refresh_at(t0()).await;
    assert_eq!(report.deprecated, 1);
    assert_eq!(
        coordinator.migration_state(SensorId(5)).await,
        Some(MigrationState::Upgraded)
    );
    assert_eq!(upstream.key_checks(), 1);
}

#[tokio::test]
async fn rejected_key_returns_to_needs_api_key() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    store.save_sensor(&legacy_registration(5)).await.unwrap();
    let coordinator = start(&upstream, &store).await;

    assert_eq!(
        coordinator.deprecate_legacy(SensorId(5)).await.unwrap(),
        MigrationState::NeedsApiKey
    );

    assert!(coordinator.migrate_sensor(SensorId(5), Some("bad-key")).await.is_err());
    assert_eq!(
        coordinator.migration_state(SensorId(5)).await,
        Some(MigrationState::NeedsApiKey)
    );
    assert!(coordinator.credentials().entries().await.is_empty());
    assert_eq!(
        published(&coordinator, 5),
        Some(Publication::Unavailable {
            reason: UnavailableReason::AwaitingApiKey,
            last_seen: None,
        })
    );

    // no key known: stays put without touching the network
    assert_eq!(
        coordinator.migrate_sensor(SensorId(5), None).await.unwrap(),
        MigrationState::NeedsApiKey
    );
}

#[tokio::test]
async fn upgraded_sensor_cannot_migrate_again() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    assert!(matches!(
        coordinator.migrate_sensor(SensorId(1), Some(GOOD_KEY)).await,
        Err(CoordinatorError::Migration(_))
    ));
    assert_eq!(
        coordinator.migration_state(SensorId(1)).await,
        Some(MigrationState::Upgraded)
    );
}

#[tokio::test]
async fn poll_interval_override_skips_ticks() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    coordinator.set_poll_interval(SensorId(1), Some(900)).await.unwrap();
    upstream.set_reading(1, 20.0, t0());

    assert_eq!(coordinator.refresh_at(t0()).await.requests, 1);
    assert_eq!(coordinator.refresh_at(t0() + 5.minutes()).await.requests, 0);
    assert_eq!(coordinator.refresh_at(t0() + 15.minutes()).await.requests, 1);
}

#[tokio::test]
async fn device_info_is_refreshed_daily() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    upstream.set_reading(1, 20.0, t0());

    coordinator.refresh_at(t0()).await;
    coordinator.refresh_at(t0() + 5.minutes()).await;
    coordinator.refresh_at(t0() + 24.hours()).await;

    let flags: Vec<_> = upstream
        .requests()
        .iter()
        .map(|r| r.include_device_info)
        .collect();
    assert_eq!(flags, vec![true, false, true]);
}

#[tokio::test]
async fn run_loop_stops_on_cancel() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;
    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    // the first tick fires immediately
    tokio::time::timeout(Duration::from_secs(5), async {
        while upstream.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn cancel_drops_fetch_in_flight() {
    let (upstream, _gate) = FakeUpstream::gated();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;
    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    // the fetch never answers while the gate stays shut
    wait_until(|| !upstream.requests().is_empty()).await;
    assert_eq!(upstream.aborted_fetches(), 0);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    wait_until(|| upstream.aborted_fetches() == 1).await;
    assert_eq!(upstream.requests().len(), 1);
}

#[tokio::test]
async fn rate_limited_poll_keeps_previous_result() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    upstream.set_reading(1, 20.0, t0());
    coordinator.refresh_at(t0()).await;
    let before = published(&coordinator, 1).unwrap();

    upstream.set_rate_limited(true);
    let report = coordinator.refresh_at(t0() + 5.minutes()).await;
    assert_eq!(report.requests, 1);
    assert_eq!(report.failed_requests, 1);
    // no retry inside the tick
    assert_eq!(upstream.requests().len(), 2);
    assert_eq!(published(&coordinator, 1), Some(before));

    upstream.set_rate_limited(false);
    let report = coordinator.refresh_at(t0() + 10.minutes()).await;
    assert_eq!(report.updated, 1);
}

#[tokio::test]
async fn max_in_flight_bounds_concurrent_fetches() {
    for (max_in_flight, in_flight) in [(1, 1), (4, 2)] {
        let (upstream, gate) = FakeUpstream::gated();
        let store = MemoryStore::new();
        let options = CoordinatorOptions {
            max_in_flight,
            ..CoordinatorOptions::default()
        };
        let coordinator = start_with(&upstream, &store, options).await;
        coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
        coordinator.add_sensor(SensorId(2), OTHER_KEY, None).await.unwrap();

        let tick = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh_at(t0()).await })
        };

        wait_until(|| upstream.requests().len() == in_flight).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(upstream.requests().len(), in_flight, "limit {max_in_flight}");

        gate.add_permits(1);
        assert_eq!(tick.await.unwrap().requests, 2);
    }
}

#[tokio::test]
async fn transient_lookup_failure_retries_migration() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    store.save_sensor(&legacy_registration(5)).await.unwrap();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    upstream.deprecate_legacy();
    upstream.fail_lookups(1);

    let report = coordinator.refresh_at(t0()).await;
    assert_eq!(report.deprecated, 1);
    assert_eq!(
        coordinator.migration_state(SensorId(5)).await,
        Some(MigrationState::LegacyActive)
    );
    // the shared key survives the failed attempt
    assert_eq!(coordinator.credentials().entries().await.len(), 1);

    let report = coordinator.refresh_at(t0() + 5.minutes()).await;
    assert_eq!(report.deprecated, 1);
    assert_eq!(
        coordinator.migration_state(SensorId(5)).await,
        Some(MigrationState::Upgraded)
    );
}

#[tokio::test]
async fn waiting_sensor_picks_up_new_key() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    store.save_sensor(&legacy_registration(5)).await.unwrap();
    let coordinator = start(&upstream, &store).await;

    upstream.deprecate_legacy();
    coordinator.refresh_at(t0()).await;
    assert_eq!(
        coordinator.migration_state(SensorId(5)).await,
        Some(MigrationState::NeedsApiKey)
    );

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    upstream.set_reading(5, 20.0, t0() + 5.minutes());

    let report = coordinator.refresh_at(t0() + 5.minutes()).await;
    assert_eq!(report.resumed, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(
        coordinator.migration_state(SensorId(5)).await,
        Some(MigrationState::Upgraded)
    );

    let last = upstream.requests().pop().unwrap();
    assert_eq!(last.generation, ApiGeneration::Current);
    assert_eq!(last.sensors, vec![SensorId(1), SensorId(5)]);
}

#[tokio::test]
async fn key_being_checked_survives_concurrent_remove() {
    let (upstream, key_gate) = FakeUpstream::key_gated();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    key_gate.add_permits(1);
    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();

    let adding = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.add_sensor(SensorId(9), OTHER_KEY, None).await })
    };
    wait_until(|| upstream.key_checks() == 2).await;

    // prunes every credential it thinks is unused
    coordinator.remove_sensor(SensorId(1)).await.unwrap();
    key_gate.add_permits(1);

    let registration = adding.await.unwrap().unwrap();
    assert_eq!(store.load_sensors().await.unwrap(), vec![registration]);

    let credentials = store.load_credentials().await.unwrap();
    assert_eq!(credentials.len(), 1);
    assert_eq!(&*credentials[0].1.value, OTHER_KEY);
    assert_eq!(coordinator.credentials().entries().await.len(), 1);
}

#[tokio::test]
async fn last_seen_is_saved_after_each_poll() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    let coordinator = start(&upstream, &store).await;

    coordinator.add_sensor(SensorId(1), GOOD_KEY, None).await.unwrap();
    upstream.set_reading(1, 20.0, t0() - 1.minutes());
    coordinator.refresh_at(t0()).await;
    assert_eq!(
        store.load_sensors().await.unwrap()[0].last_seen,
        Some(t0() - 1.minutes())
    );

    upstream.set_reading(1, 20.0, t0() + 4.minutes());
    coordinator.refresh_at(t0() + 5.minutes()).await;
    assert_eq!(
        store.load_sensors().await.unwrap()[0].last_seen,
        Some(t0() + 4.minutes())
    );
}

#[tokio::test]
async fn restart_rediscovers_waiting_sensor() {
    let upstream = FakeUpstream::new();
    let store = MemoryStore::new();
    store.save_sensor(&legacy_registration(5)).await.unwrap();
    let coordinator = start(&upstream, &store).await;

    upstream.deprecate_legacy();
    coordinator.refresh_at(t0()).await;
    assert_eq!(
        coordinator.migration_state(SensorId(5)).await,
        Some(MigrationState::NeedsApiKey)
    );
    drop(coordinator);

    let restarted = start(&upstream, &store).await;
    assert_eq!(
        restarted.migration_state(SensorId(5)).await,
        Some(MigrationState::LegacyActive)
    );

    let report = restarted.refresh_at(t0() + 5.minutes()).await;
    assert_eq!(report.deprecated, 1);
    assert_eq!(
        restarted.migration_state(SensorId(5)).await,
        Some(MigrationState::NeedsApiKey)
    );
    assert_eq!(
        published(&restarted, 5),
        Some(Publication::Unavailable {
            reason: UnavailableReason::AwaitingApiKey,
            last_seen: None,
        })
    );
}
