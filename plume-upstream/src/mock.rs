use async_trait::async_trait;
use plume_core::{ApiGeneration, ChannelFlags, ChannelReading, DeviceInfo, ReadingKind, SensorId, SensorRow};
use rand::Rng;
use tracing::debug;

use crate::{
    BatchRequest, BatchResponse, CredentialRejection, SensorConfig, Upstream, UpstreamError,
};

/// Upstream that makes up plausible readings, for running without network
/// access or an API key.
pub struct SimulatedUpstream {
    /// Typical PM2.5 level (ug/m3) readings wander around.
    baseline: f64,
}

impl SimulatedUpstream {
    pub fn new(baseline: f64) -> Self {
        Self {
            baseline: baseline.max(0.0),
        }
    }

    fn generate_row(&self, sensor_id: SensorId, include_device_info: bool) -> SensorRow {
        let mut rng = rand::rng();
        let now = jiff::Timestamp::now();

        // stable per-sensor offset so stations differ from each other
        let offset = (sensor_id.0 % 17) as f64 - 8.0;
        let level = (self.baseline + offset + rng.random_range(-3.0..3.0)).max(0.0);

        let mut channel_b = (level + rng.random_range(-1.5..1.5)).max(0.0);
        let mut flags = ChannelFlags::Normal;
        if rng.random_ratio(2, 100) {
            channel_b = 0.0;
            flags = ChannelFlags::BDowngraded;
        }

        let dual = |kind, scale: f64| {
            ChannelReading::dual(sensor_id, kind, level * scale, channel_b * scale, now)
        };

        let mut row = SensorRow::new(sensor_id, now);
        row.label = Some(format!("Simulated {sensor_id}").into());
        row.pm2_5_cf_1 = Some(dual(ReadingKind::Pm2_5, 1.0));
        row.pm2_5_atm = Some(dual(ReadingKind::Pm2_5, 0.7));
        row.pm1_0_atm = Some(dual(ReadingKind::Pm1_0, 0.5));
        row.pm10_0_atm = Some(dual(ReadingKind::Pm10_0, 1.2));
        row.humidity = Some(rng.random_range(25.0..70.0));
        row.temperature = Some(rng.random_range(60.0..90.0));
        row.pressure = Some(rng.random_range(1000.0..1025.0));
        row.channel_flags = Some(flags);
        row.upstream_confidence = Some(if flags == ChannelFlags::Normal { 100 } else { 50 });

        if include_device_info {
            row.device = Some(DeviceInfo {
                model: Some("PA-II".into()),
                hardware: Some("2.0+BME280+PMSX003-B+PMSX003-A".into()),
                firmware_version: Some("7.02".into()),
                rssi: Some(rng.random_range(-80..-40)),
                uptime_seconds: Some(rng.random_range(3600..864_000)),
            });
        }

        row.apply_housing_corrections();
        row
    }
}

impl Default for SimulatedUpstream {
    fn default() -> Self {
        Self::new(12.0)
    }
}

#[async_trait]
impl Upstream for SimulatedUpstream {
    async fn fetch(&self, request: &BatchRequest) -> Result<BatchResponse, UpstreamError> {
        if request.generation == ApiGeneration::Current && request.credential.is_none() {
            return Err(UpstreamError::BadRequest("missing API key".into()));
        }

        debug!(
            generation = request.generation.as_str(),
            sensors = request.sensors.len(),
            "Simulating batch"
        );

        let rows = request
            .sensors
            .iter()
            .map(|&id| Ok(self.generate_row(id, request.include_device_info)))
            .collect();

        Ok(BatchResponse { rows })
    }

    async fn check_read_key(&self, api_key: &str) -> Result<(), UpstreamError> {
        if api_key.trim().is_empty() {
            return Err(UpstreamError::InvalidCredential(
                CredentialRejection::Forbidden,
            ));
        }
        Ok(())
    }

    async fn lookup_sensor(
        &self,
        api_key: &str,
        sensor_id: SensorId,
        read_key: Option<&str>,
    ) -> Result<SensorConfig, UpstreamError> {
        self.check_read_key(api_key).await?;

        Ok(SensorConfig {
            sensor_id,
            name: format!("Simulated {sensor_id}").into(),
            hidden: read_key.is_some(),
            read_key: read_key.map(Into::into),
        })
    }
}
