use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use jiff::Timestamp;
use plume_core::{
    ApiGeneration, BoxStr, ConfidenceTag, CredentialRef, Publication, SensorId,
    SensorRegistration, SensorRow, SensorSnapshot, UnavailableReason,
};
use plume_nowcast::Pm25Reading;
use plume_upstream::{BatchRequest, BatchResponse, ErrorKind, Upstream, UpstreamError};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{Coordinator, DEVICE_REFRESH_INTERVAL, STALE_AFTER};
use crate::migration::MigrationState;
use crate::store::SensorStore;

/// Outcome counts of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub requests: usize,
    pub failed_requests: usize,
    pub updated: usize,
    pub stale: usize,
    pub malformed_rows: usize,
    pub deprecated: usize,
    /// Waiting sensors that picked up a known key this tick.
    pub resumed: usize,
}

/// Sensors sharing one upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    /// Public legacy sensors share `None`; hidden ones group by station key.
    Legacy(Option<CredentialRef>),
    Current(CredentialRef),
}

struct PlannedRequest {
    key: GroupKey,
    request: BatchRequest,
}

fn age_secs(now: Timestamp, then: Timestamp) -> i64 {
    now.as_second() - then.as_second()
}

fn is_stale(now: Timestamp, last_seen: Timestamp) -> bool {
    age_secs(now, last_seen) > STALE_AFTER.as_secs() as i64
}

fn is_degraded(tag: ConfidenceTag) -> bool {
    matches!(
        tag,
        ConfidenceTag::SingleChannelABad | ConfidenceTag::SingleChannelBBad | ConfidenceTag::Invalid
    )
}

impl<U: Upstream, S: SensorStore> Coordinator<U, S> {
    /// Poll as of `now`. Ticks never overlap; a second caller waits for the
    /// one in progress.
    pub async fn refresh_at(&self, now: Timestamp) -> TickReport {
        let _tick = self.inner.tick_lock.lock().await;
        let mut report = TickReport {
            resumed: self.resume_migrations().await,
            ..TickReport::default()
        };

        let include_device_info = {
            let last = self
                .inner
                .last_device_refresh
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            last.is_none_or(|at| age_secs(now, at) >= DEVICE_REFRESH_INTERVAL.as_secs() as i64)
        };

        let planned = self.plan(now, include_device_info).await;
        if planned.is_empty() {
            debug!("No sensors due");
            return report;
        }

        let semaphore = Arc::new(Semaphore::new(self.inner.max_in_flight));
        let mut in_flight = JoinSet::new();
        for PlannedRequest { key, request } in planned {
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            in_flight.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = inner.upstream.fetch(&request).await;
                (key, request, result)
            });
        }

        let mut deprecated = Vec::new();
        let mut touched = Vec::new();
        let mut any_succeeded = false;

        while let Some(joined) = in_flight.join_next().await {
            let (key, request, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = ?e, "Poll task failed");
                    report.failed_requests += 1;
                    continue;
                }
            };
            report.requests += 1;

            match result {
                Ok(response) => {
                    any_succeeded = true;
                    self.apply_response(&request, response, now, &mut report, &mut touched)
                        .await;
                }
                Err(e) => {
                    report.failed_requests += 1;
                    self.handle_failure(key, &request, &e, now, &mut report).await;
                    if e.kind() == ErrorKind::Deprecated {
                        deprecated.extend(request.sensors.iter().copied());
                    }
                }
            }
        }

        for registration in &touched {
            if let Err(e) = self.inner.store.save_sensor(registration).await {
                warn!(sensor = %registration.sensor_id, error = %e, "Failed to save last seen time");
            }
        }

        if include_device_info && any_succeeded {
            *self
                .inner
                .last_device_refresh
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(now);
        }

        for sensor_id in deprecated {
            report.deprecated += 1;
            // Reuse a known key when there is exactly one; otherwise the
            // sensor waits for the user.
            if let Err(e) = self.migrate_sensor(sensor_id, None).await {
                warn!(sensor = %sensor_id, error = %e, "Automatic migration failed");
            }
        }

        info!(
            requests = report.requests,
            failed = report.failed_requests,
            updated = report.updated,
            stale = report.stale,
            malformed = report.malformed_rows,
            resumed = report.resumed,
            "Poll complete"
        );
        report
    }

    /// Sensors waiting for a key take the single validated one if it has
    /// appeared since, unless it was already refused for them.
    async fn resume_migrations(&self) -> usize {
        let Some(shared) = self.inner.credentials.shared_read_key().await else {
            return 0;
        };

        let waiting: Vec<SensorId> = {
            let sensors = self.inner.sensors.read().await;
            let mut waiting: Vec<_> = sensors
                .iter()
                .filter(|(_, entry)| {
                    entry.migration == MigrationState::NeedsApiKey
                        && entry.rejected_credential != Some(shared)
                })
                .map(|(id, _)| *id)
                .collect();
            waiting.sort();
            waiting
        };

        let mut resumed = 0;
        for sensor_id in waiting {
            match self.migrate_sensor(sensor_id, None).await {
                Ok(MigrationState::Upgraded) => resumed += 1,
                Ok(_) => {}
                Err(e) => warn!(sensor = %sensor_id, error = %e, "Resumed migration failed"),
            }
        }
        resumed
    }

    async fn plan(&self, now: Timestamp, include_device_info: bool) -> Vec<PlannedRequest> {
        let mut groups: BTreeMap<GroupKey, (Vec<SensorId>, Vec<BoxStr>)> = BTreeMap::new();

        {
            let sensors = self.inner.sensors.read().await;
            for (id, entry) in sensors.iter() {
                let Some(generation) = entry.migration.generation() else {
                    continue;
                };

                if let Some(interval) = entry.registration.poll_interval_override {
                    let state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
                    let due = state
                        .last_polled
                        .is_none_or(|at| age_secs(now, at) >= interval as i64);
                    if !due {
                        continue;
                    }
                }

                let key = match (generation, entry.registration.credential_ref) {
                    (ApiGeneration::Legacy, credential) => GroupKey::Legacy(credential),
                    (ApiGeneration::Current, Some(credential)) => GroupKey::Current(credential),
                    (ApiGeneration::Current, None) => {
                        warn!(sensor = %id, "Sensor has no API key, skipping");
                        continue;
                    }
                };

                let (ids, read_keys) = groups.entry(key).or_default();
                ids.push(*id);
                if let Some(read_key) = &entry.registration.read_key {
                    read_keys.push(read_key.clone());
                }
            }
        }

        let mut planned = Vec::with_capacity(groups.len());
        for (key, (mut sensors, read_keys)) in groups {
            let (generation, credential) = match key {
                GroupKey::Legacy(id) => (ApiGeneration::Legacy, id),
                GroupKey::Current(id) => (ApiGeneration::Current, Some(id)),
            };

            let credential = match credential {
                Some(id) => match self.inner.credentials.get(id).await {
                    Some(credential) => Some(credential.value),
                    None => {
                        warn!(credential = %id, sensors = sensors.len(), "Credential missing, skipping group");
                        continue;
                    }
                },
                None => None,
            };

            sensors.sort();
            let mut request = BatchRequest::new(generation, credential);
            request.sensors = sensors;
            // legacy station keys go in the credential, not per sensor
            if generation == ApiGeneration::Current {
                request.read_keys = read_keys;
            }
            request.include_device_info = include_device_info;
            planned.push(PlannedRequest { key, request });
        }

        planned
    }

    async fn apply_response(
        &self,
        request: &BatchRequest,
        response: BatchResponse,
        now: Timestamp,
        report: &mut TickReport,
        touched: &mut Vec<SensorRegistration>,
    ) {
        let requested: HashSet<SensorId> = request.sensors.iter().copied().collect();
        let mut seen = HashSet::new();

        for row in response.rows {
            match row {
                Ok(row) if requested.contains(&row.sensor_id) => {
                    seen.insert(row.sensor_id);
                    touched.extend(self.apply_row(row, now, report).await);
                }
                Ok(row) => {
                    debug!(sensor = %row.sensor_id, "Ignoring row for sensor not in batch");
                }
                Err(e) => {
                    report.malformed_rows += 1;
                    if let Some(id) = e.sensor_id {
                        seen.insert(id);
                    }
                    warn!(sensor = ?e.sensor_id, reason = %e.reason, "Skipping malformed row");
                }
            }
        }

        for sensor_id in request.sensors.iter().filter(|id| !seen.contains(*id)) {
            debug!(sensor = %sensor_id, "No row returned");
            self.check_staleness(*sensor_id, now, true, report).await;
        }
    }

    /// Returns the registration when its last seen time moved.
    async fn apply_row(
        &self,
        mut row: SensorRow,
        now: Timestamp,
        report: &mut TickReport,
    ) -> Option<SensorRegistration> {
        let sensor_id = row.sensor_id;
        let state = {
            let sensors = self.inner.sensors.read().await;
            match sensors.get(&sensor_id) {
                // removed or migrating since the batch was planned
                Some(entry) if entry.migration.is_pollable() => Arc::clone(&entry.state),
                _ => return None,
            }
        };

        let last_seen = row.last_seen;
        let publication = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.last_polled = Some(now);

            match row.device.take() {
                Some(device) => {
                    state.device = Some(device.clone());
                    row.device = Some(device);
                }
                None => row.device = state.device.clone(),
            }

            if is_stale(now, last_seen) {
                report.stale += 1;
                Publication::Unavailable {
                    reason: UnavailableReason::StaleUpstream,
                    last_seen: Some(last_seen),
                }
            } else if let Some(cf_1) = row.pm2_5_cf_1 {
                let aqi = state.calculator.update(&Pm25Reading {
                    cf_1,
                    atm: row.pm2_5_atm,
                    humidity: row.humidity,
                });

                if is_degraded(aqi.confidence) {
                    if !state.degraded_warned {
                        warn!(sensor = %sensor_id, confidence = ?aqi.confidence, "Sensor channel degraded");
                        state.degraded_warned = true;
                    }
                } else if state.degraded_warned {
                    info!(sensor = %sensor_id, confidence = ?aqi.confidence, "Sensor channels recovered");
                    state.degraded_warned = false;
                }

                report.updated += 1;
                let snapshot = SensorSnapshot { aqi, row };
                state.last_snapshot = Some(snapshot.clone());
                Publication::Available(snapshot)
            } else {
                Publication::Unavailable {
                    reason: UnavailableReason::NoData,
                    last_seen: Some(last_seen),
                }
            }
        };

        self.inner.publisher.publish(sensor_id, publication);

        let mut sensors = self.inner.sensors.write().await;
        let entry = sensors.get_mut(&sensor_id)?;
        if entry.registration.last_seen == Some(last_seen) {
            return None;
        }
        entry.registration.last_seen = Some(last_seen);
        Some(entry.registration.clone())
    }

    /// A sensor got no fresh row this tick. Its previous result stays
    /// published unless the last reading is older than [`STALE_AFTER`].
    async fn check_staleness(
        &self,
        sensor_id: SensorId,
        now: Timestamp,
        missing_row: bool,
        report: &mut TickReport,
    ) {
        let (state, registered_last_seen) = {
            let sensors = self.inner.sensors.read().await;
            match sensors.get(&sensor_id) {
                Some(entry) if entry.migration.is_pollable() => {
                    (Arc::clone(&entry.state), entry.registration.last_seen)
                }
                _ => return,
            }
        };

        let publication = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if missing_row {
                state.last_polled = Some(now);
            }

            let last_seen = state
                .last_snapshot
                .as_ref()
                .map(|snapshot| snapshot.row.last_seen)
                .or(registered_last_seen);

            match last_seen {
                Some(at) if is_stale(now, at) => {
                    report.stale += 1;
                    Some(Publication::Unavailable {
                        reason: UnavailableReason::StaleUpstream,
                        last_seen: Some(at),
                    })
                }
                Some(_) => None,
                None if missing_row => Some(Publication::Unavailable {
                    reason: UnavailableReason::NoData,
                    last_seen: None,
                }),
                None => None,
            }
        };

        if let Some(publication) = publication {
            self.inner.publisher.publish(sensor_id, publication);
        }
    }

    async fn handle_failure(
        &self,
        key: GroupKey,
        request: &BatchRequest,
        e: &UpstreamError,
        now: Timestamp,
        report: &mut TickReport,
    ) {
        match e.kind() {
            ErrorKind::RateLimited => {
                warn!(group = ?key, error = %e, "Rate limited, retrying next tick");
            }
            ErrorKind::TransientNetworkFailure => {
                warn!(group = ?key, error = %e, "Upstream unreachable, keeping last results");
            }
            ErrorKind::MalformedResponse => {
                warn!(group = ?key, error = %e, "Malformed upstream response");
            }
            ErrorKind::InvalidCredential => {
                error!(group = ?key, error = %e, "Upstream rejected credential");
            }
            ErrorKind::Deprecated => {
                warn!(group = ?key, sensors = request.sensors.len(), "Legacy API deprecated");
                return;
            }
        }

        for sensor_id in &request.sensors {
            self.check_staleness(*sensor_id, now, false, report).await;
        }
    }
}
