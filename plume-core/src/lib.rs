use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type BoxStr = Box<str>;

/// Upstream station index of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId(pub u64);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SensorId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(SensorId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialRef(pub Ulid);

impl CredentialRef {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CredentialRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    Pm1_0,
    Pm2_5,
    Pm10_0,
    Humidity,
    Temperature,
    Pressure,
}

impl ReadingKind {
    pub fn is_particulate(self) -> bool {
        matches!(self, Self::Pm1_0 | Self::Pm2_5 | Self::Pm10_0)
    }
}

/// One sample from the two lasers of a sensor. `channel_b` is `None` for
/// single-channel hardware and for environmental readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelReading {
    pub sensor_id: SensorId,
    pub kind: ReadingKind,
    pub channel_a: f64,
    pub channel_b: Option<f64>,
    pub timestamp: jiff::Timestamp,
}

impl ChannelReading {
    pub fn dual(
        sensor_id: SensorId,
        kind: ReadingKind,
        channel_a: f64,
        channel_b: f64,
        timestamp: jiff::Timestamp,
    ) -> Self {
        Self {
            sensor_id,
            kind,
            channel_a,
            channel_b: Some(channel_b),
            timestamp,
        }
    }

    pub fn single(
        sensor_id: SensorId,
        kind: ReadingKind,
        channel_a: f64,
        timestamp: jiff::Timestamp,
    ) -> Self {
        Self {
            sensor_id,
            kind,
            channel_a,
            channel_b: None,
            timestamp,
        }
    }

    pub fn is_single_channel(&self) -> bool {
        self.channel_b.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTag {
    Good,
    Questionable,
    Single,
    SingleChannelABad,
    SingleChannelBBad,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AqiStatus {
    Calculating { seconds_remaining: u32 },
    Stable,
}

/// Output of the NowCast calculator for one reading.
///
/// `value` and `raw_value` are `None` when there is not enough usable data;
/// when present they are finite and never negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AqiResult {
    pub value: Option<NotNan<f64>>,
    pub raw_value: Option<NotNan<f64>>,
    pub corrected_pm2_5: Option<NotNan<f64>>,
    pub status: AqiStatus,
    pub confidence: ConfidenceTag,
}

impl AqiResult {
    pub fn aqi(&self) -> Option<f64> {
        self.value.map(NotNan::into_inner)
    }

    pub fn raw_aqi(&self) -> Option<f64> {
        self.raw_value.map(NotNan::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiGeneration {
    Legacy,
    Current,
}

impl ApiGeneration {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Current => "current",
        }
    }
}

impl FromStr for ApiGeneration {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "current" => Ok(Self::Current),
            other => Err(UnknownVariant(other.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub BoxStr);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRegistration {
    pub sensor_id: SensorId,
    pub api_generation: ApiGeneration,
    pub credential_ref: Option<CredentialRef>,
    pub label: BoxStr,
    /// Per-sensor read key for hidden sensors.
    pub read_key: Option<BoxStr>,
    pub last_seen: Option<jiff::Timestamp>,
    /// Minimum seconds between polls of this sensor.
    pub poll_interval_override: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    LegacyStationKey,
    V1ReadKey,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LegacyStationKey => "legacy_station_key",
            Self::V1ReadKey => "v1_read_key",
        }
    }
}

impl FromStr for CredentialKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy_station_key" => Ok(Self::LegacyStationKey),
            "v1_read_key" => Ok(Self::V1ReadKey),
            other => Err(UnknownVariant(other.into())),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredential {
    pub kind: CredentialKind,
    pub value: BoxStr,
    pub validated: bool,
}

// keys never end up in logs
impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("kind", &self.kind)
            .field("value", &"<redacted>")
            .field("validated", &self.validated)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelFlags {
    Normal,
    ADowngraded,
    BDowngraded,
    BothDowngraded,
}

impl ChannelFlags {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Normal" => Some(Self::Normal),
            "A-Downgraded" => Some(Self::ADowngraded),
            "B-Downgraded" => Some(Self::BDowngraded),
            "A+B-Downgraded" => Some(Self::BothDowngraded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: Option<BoxStr>,
    pub hardware: Option<BoxStr>,
    pub firmware_version: Option<BoxStr>,
    pub rssi: Option<i64>,
    pub uptime_seconds: Option<u64>,
}

/// Housing sensors read this much warmer (F) than ambient.
pub const TEMPERATURE_HOUSING_OFFSET: f64 = 8.0;
/// Housing sensors read this much drier (%) than ambient.
pub const HUMIDITY_HOUSING_OFFSET: f64 = 4.0;

/// Normalized per-sensor row from either upstream API generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRow {
    pub sensor_id: SensorId,
    pub label: Option<BoxStr>,
    pub last_seen: jiff::Timestamp,
    pub pm2_5_cf_1: Option<ChannelReading>,
    pub pm2_5_atm: Option<ChannelReading>,
    pub pm1_0_atm: Option<ChannelReading>,
    pub pm10_0_atm: Option<ChannelReading>,
    pub humidity: Option<f64>,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub channel_flags: Option<ChannelFlags>,
    pub upstream_confidence: Option<u8>,
    pub device: Option<DeviceInfo>,
}

impl SensorRow {
    pub fn new(sensor_id: SensorId, last_seen: jiff::Timestamp) -> Self {
        Self {
            sensor_id,
            label: None,
            last_seen,
            pm2_5_cf_1: None,
            pm2_5_atm: None,
            pm1_0_atm: None,
            pm10_0_atm: None,
            humidity: None,
            temperature: None,
            pressure: None,
            channel_flags: None,
            upstream_confidence: None,
            device: None,
        }
    }

    /// Shift housing temperature and humidity to ambient estimates.
    pub fn apply_housing_corrections(&mut self) {
        if let Some(temperature) = self.temperature {
            self.temperature = Some(temperature - TEMPERATURE_HOUSING_OFFSET);
        }

        if let Some(humidity) = self.humidity {
            self.humidity = Some((humidity + HUMIDITY_HOUSING_OFFSET).min(100.0));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub aqi: AqiResult,
    pub row: SensorRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainReason {
    AwaitingApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    StaleUpstream,
    NoData,
    AwaitingApiKey,
}

/// What the entity layer sees for one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "availability", rename_all = "snake_case")]
pub enum Publication {
    Pending,
    Available(SensorSnapshot),
    /// Last known values, visibly marked as no longer updating.
    Retained {
        snapshot: SensorSnapshot,
        reason: RetainReason,
    },
    Unavailable {
        reason: UnavailableReason,
        last_seen: Option<jiff::Timestamp>,
    },
}

impl Publication {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn snapshot(&self) -> Option<&SensorSnapshot> {
        match self {
            Self::Available(snapshot) | Self::Retained { snapshot, .. } => Some(snapshot),
            Self::Pending | Self::Unavailable { .. } => None,
        }
    }
}
