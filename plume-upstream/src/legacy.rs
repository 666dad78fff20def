//! Legacy `json?show=` endpoint.
//!
//! Rows come back one per laser: the A row carries the station id, the B row
//! carries the same readings under its own id with `ParentID` pointing at A.
//! Numeric fields may arrive as either numbers or strings.

use plume_core::{BoxStr, ChannelReading, DeviceInfo, ReadingKind, SensorId, SensorRow};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{BatchRequest, BatchResponse, RowError, UpstreamError};

#[derive(Debug, Deserialize)]
struct Envelope {
    results: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
enum Loose {
    Number(f64),
    Text(LooseText),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LooseText(Option<f64>);

impl<'de> Deserialize<'de> for LooseText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Ok(Self(text.trim().parse().ok()))
    }
}

impl Loose {
    fn value(self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(n),
            Self::Text(LooseText(n)) => n,
        }
        .filter(|n| n.is_finite())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyRow {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(rename = "ParentID")]
    parent_id: Option<u64>,
    #[serde(rename = "Label")]
    label: Option<String>,
    #[serde(rename = "LastSeen")]
    last_seen: Option<i64>,
    #[serde(rename = "Type")]
    model: Option<String>,
    #[serde(rename = "Version")]
    version: Option<String>,
    #[serde(rename = "RSSI")]
    rssi: Option<Loose>,
    #[serde(rename = "Uptime")]
    uptime: Option<Loose>,
    pm2_5_cf_1: Option<Loose>,
    pm2_5_atm: Option<Loose>,
    pm1_0_atm: Option<Loose>,
    pm10_0_atm: Option<Loose>,
    humidity: Option<Loose>,
    temp_f: Option<Loose>,
    pressure: Option<Loose>,
}

/// Query parameters for one legacy batch.
pub fn query(request: &BatchRequest) -> Vec<(&'static str, String)> {
    let show = request
        .sensors
        .iter()
        .map(SensorId::to_string)
        .collect::<Vec<_>>()
        .join("|");

    let mut params = vec![("show", show)];
    if let Some(key) = &request.credential {
        params.push(("key", key.to_string()));
    }
    params
}

pub fn parse_response(body: &[u8], include_device_info: bool) -> Result<BatchResponse, UpstreamError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| UpstreamError::Malformed(e.to_string()))?;
    let results = envelope
        .results
        .ok_or_else(|| UpstreamError::Malformed("missing results".into()))?;

    let mut rows: Vec<Result<(LegacyRow, Option<LegacyRow>), RowError>> = Vec::new();
    let mut channel_b = Vec::new();

    for value in results {
        let id = value.get("ID").and_then(Value::as_u64).map(SensorId);
        match serde_json::from_value::<LegacyRow>(value) {
            Ok(row) if row.parent_id.is_some() => channel_b.push(row),
            Ok(row) => rows.push(Ok((row, None))),
            Err(e) => rows.push(Err(RowError::new(id, e.to_string()))),
        }
    }

    for b in channel_b {
        let parent = rows.iter_mut().find_map(|row| match row {
            Ok((a, slot)) if Some(a.id) == b.parent_id => Some(slot),
            _ => None,
        });
        match parent {
            Some(slot) => *slot = Some(b),
            None => debug!(id = b.id, parent = ?b.parent_id, "Channel B row without parent"),
        }
    }

    let rows = rows
        .into_iter()
        .map(|row| row.and_then(|(a, b)| normalize(a, b, include_device_info)))
        .collect();

    Ok(BatchResponse { rows })
}

fn normalize(a: LegacyRow, b: Option<LegacyRow>, include_device_info: bool) -> Result<SensorRow, RowError> {
    let sensor_id = SensorId(a.id);
    let last_seen = a
        .last_seen
        .ok_or_else(|| RowError::new(Some(sensor_id), "missing LastSeen"))
        .and_then(|secs| {
            jiff::Timestamp::from_second(secs)
                .map_err(|e| RowError::new(Some(sensor_id), e.to_string()))
        })?;

    let channels = |kind: ReadingKind, field: fn(&LegacyRow) -> Option<Loose>| {
        let a_value = field(&a).and_then(Loose::value)?;
        let b_value = b.as_ref().and_then(field).and_then(Loose::value);
        Some(ChannelReading {
            sensor_id,
            kind,
            channel_a: a_value,
            channel_b: b_value,
            timestamp: last_seen,
        })
    };

    let mut row = SensorRow::new(sensor_id, last_seen);
    row.label = a.label.as_deref().map(BoxStr::from);
    row.pm2_5_cf_1 = channels(ReadingKind::Pm2_5, |r| r.pm2_5_cf_1);
    row.pm2_5_atm = channels(ReadingKind::Pm2_5, |r| r.pm2_5_atm);
    row.pm1_0_atm = channels(ReadingKind::Pm1_0, |r| r.pm1_0_atm);
    row.pm10_0_atm = channels(ReadingKind::Pm10_0, |r| r.pm10_0_atm);
    row.humidity = a.humidity.and_then(Loose::value);
    row.temperature = a.temp_f.and_then(Loose::value);
    row.pressure = a.pressure.and_then(Loose::value);

    if include_device_info {
        row.device = Some(DeviceInfo {
            model: a.model.as_deref().map(BoxStr::from),
            hardware: None,
            firmware_version: a.version.as_deref().map(BoxStr::from),
            rssi: a.rssi.and_then(Loose::value).map(|v| v as i64),
            uptime_seconds: a.uptime.and_then(Loose::value).map(|v| v.max(0.0) as u64),
        });
    }

    row.apply_housing_corrections();
    Ok(row)
}
