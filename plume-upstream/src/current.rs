//! v1 API (`/v1/sensors`, `/v1/keys`).
//!
//! Batched responses are positional: `fields` names the columns and each
//! entry of `data` is one sensor's values in that order. Columns are resolved
//! per response since the API may drop fields it no longer serves.

use std::collections::HashMap;

use plume_core::{BoxStr, ChannelFlags, ChannelReading, DeviceInfo, ReadingKind, SensorId, SensorRow};
use serde::Deserialize;
use serde_json::Value;

use crate::{BatchRequest, BatchResponse, CredentialRejection, RowError, SensorConfig, UpstreamError};

pub const API_KEY_HEADER: &str = "X-API-Key";

pub const SENSOR_FIELDS: &[&str] = &[
    "name",
    "last_seen",
    "humidity",
    "temperature",
    "pressure",
    "pm1.0_atm_a",
    "pm1.0_atm_b",
    "pm2.5_atm_a",
    "pm2.5_atm_b",
    "pm2.5_cf_1_a",
    "pm2.5_cf_1_b",
    "pm10.0_atm_a",
    "pm10.0_atm_b",
    "channel_flags",
    "confidence",
];

pub const DEVICE_FIELDS: &[&str] = &["model", "hardware", "firmware_version", "rssi", "uptime"];

const CONFIG_FIELDS: &str = "name,primary_key_a,private";

#[derive(Debug, Deserialize)]
struct SensorsResponse {
    fields: Vec<String>,
    #[serde(default)]
    channel_flags: Vec<String>,
    data: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    api_key_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SensorLookupResponse {
    sensor: SensorLookup,
}

#[derive(Debug, Deserialize)]
struct SensorLookup {
    sensor_index: u64,
    name: Option<String>,
    #[serde(default)]
    private: Option<Value>,
    primary_key_a: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error: Option<String>,
    pub description: Option<String>,
}

/// A parsed batch plus any requested fields the response left out.
#[derive(Debug)]
pub struct Parsed {
    pub response: BatchResponse,
    pub missing_fields: Vec<BoxStr>,
}

pub fn requested_fields(include_device_info: bool) -> Vec<&'static str> {
    let mut fields = SENSOR_FIELDS.to_vec();
    if include_device_info {
        fields.extend_from_slice(DEVICE_FIELDS);
    }
    fields
}

/// Query parameters for one v1 batch.
pub fn query(request: &BatchRequest) -> Vec<(&'static str, String)> {
    let show_only = request
        .sensors
        .iter()
        .map(SensorId::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut params = vec![
        ("fields", requested_fields(request.include_device_info).join(",")),
        ("show_only", show_only),
    ];

    if !request.read_keys.is_empty() {
        let mut keys: Vec<&str> = request.read_keys.iter().map(|k| &**k).collect();
        keys.sort_unstable();
        keys.dedup();
        params.push(("read_keys", keys.join(",")));
    }

    params
}

pub fn lookup_query(read_key: Option<&str>) -> Vec<(&'static str, String)> {
    let mut params = vec![("fields", CONFIG_FIELDS.to_string())];
    if let Some(key) = read_key {
        params.push(("read_key", key.to_string()));
    }
    params
}

pub fn parse_response(body: &[u8], include_device_info: bool) -> Result<Parsed, UpstreamError> {
    let response: SensorsResponse =
        serde_json::from_slice(body).map_err(|e| UpstreamError::Malformed(e.to_string()))?;

    let columns: HashMap<&str, usize> = response
        .fields
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    if !columns.contains_key("sensor_index") {
        return Err(UpstreamError::Malformed("missing sensor_index column".into()));
    }

    let missing_fields = requested_fields(include_device_info)
        .into_iter()
        .filter(|field| !columns.contains_key(*field))
        .map(BoxStr::from)
        .collect();

    let reader = Columns {
        positions: &columns,
        channel_flags: &response.channel_flags,
    };

    let rows = response
        .data
        .iter()
        .map(|values| reader.row(values, include_device_info))
        .collect();

    Ok(Parsed {
        response: BatchResponse { rows },
        missing_fields,
    })
}

struct Columns<'a> {
    positions: &'a HashMap<&'a str, usize>,
    channel_flags: &'a [String],
}

impl Columns<'_> {
    fn get<'v>(&self, values: &'v [Value], field: &str) -> Option<&'v Value> {
        let index = *self.positions.get(field)?;
        values.get(index).filter(|v| !v.is_null())
    }

    fn float(&self, values: &[Value], field: &str) -> Option<f64> {
        self.get(values, field)
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
    }

    fn text(&self, values: &[Value], field: &str) -> Option<BoxStr> {
        self.get(values, field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(BoxStr::from)
    }

    fn channels(
        &self,
        values: &[Value],
        sensor_id: SensorId,
        kind: ReadingKind,
        prefix: &str,
        timestamp: jiff::Timestamp,
    ) -> Option<ChannelReading> {
        let a = self.float(values, &format!("{prefix}_a"));
        let b = self.float(values, &format!("{prefix}_b"));

        // a lone B channel is still a usable single-channel reading
        let (channel_a, channel_b) = match (a, b) {
            (Some(a), b) => (a, b),
            (None, Some(b)) => (b, None),
            (None, None) => return None,
        };

        Some(ChannelReading {
            sensor_id,
            kind,
            channel_a,
            channel_b,
            timestamp,
        })
    }

    fn row(&self, values: &[Value], include_device_info: bool) -> Result<SensorRow, RowError> {
        let sensor_id = self
            .get(values, "sensor_index")
            .and_then(Value::as_u64)
            .map(SensorId)
            .ok_or_else(|| RowError::new(None, "missing sensor_index"))?;

        let last_seen = self
            .get(values, "last_seen")
            .and_then(Value::as_i64)
            .ok_or_else(|| RowError::new(Some(sensor_id), "missing last_seen"))
            .and_then(|secs| {
                jiff::Timestamp::from_second(secs)
                    .map_err(|e| RowError::new(Some(sensor_id), e.to_string()))
            })?;

        let mut row = SensorRow::new(sensor_id, last_seen);
        row.label = self.text(values, "name");
        row.pm2_5_cf_1 = self.channels(values, sensor_id, ReadingKind::Pm2_5, "pm2.5_cf_1", last_seen);
        row.pm2_5_atm = self.channels(values, sensor_id, ReadingKind::Pm2_5, "pm2.5_atm", last_seen);
        row.pm1_0_atm = self.channels(values, sensor_id, ReadingKind::Pm1_0, "pm1.0_atm", last_seen);
        row.pm10_0_atm = self.channels(values, sensor_id, ReadingKind::Pm10_0, "pm10.0_atm", last_seen);
        row.humidity = self.float(values, "humidity");
        row.temperature = self.float(values, "temperature");
        row.pressure = self.float(values, "pressure");
        row.upstream_confidence = self
            .get(values, "confidence")
            .and_then(Value::as_u64)
            .and_then(|c| u8::try_from(c).ok());
        row.channel_flags = self
            .get(values, "channel_flags")
            .and_then(Value::as_u64)
            .and_then(|i| self.channel_flags.get(i as usize))
            .and_then(|label| ChannelFlags::from_label(label));

        if include_device_info {
            row.device = Some(DeviceInfo {
                model: self.text(values, "model"),
                hardware: self.text(values, "hardware"),
                firmware_version: self.text(values, "firmware_version"),
                rssi: self.get(values, "rssi").and_then(Value::as_i64),
                uptime_seconds: self.get(values, "uptime").and_then(Value::as_u64),
            });
        }

        row.apply_housing_corrections();
        Ok(row)
    }
}

pub fn parse_keys(body: &[u8]) -> Result<(), UpstreamError> {
    let keys: KeysResponse =
        serde_json::from_slice(body).map_err(|e| UpstreamError::Malformed(e.to_string()))?;

    match keys.api_key_type.as_deref() {
        Some("READ") => Ok(()),
        _ => Err(UpstreamError::InvalidCredential(CredentialRejection::NotReadKey)),
    }
}

pub fn parse_lookup(body: &[u8]) -> Result<SensorConfig, UpstreamError> {
    let lookup: SensorLookupResponse =
        serde_json::from_slice(body).map_err(|e| UpstreamError::Malformed(e.to_string()))?;
    let sensor = lookup.sensor;

    let hidden = match &sensor.private {
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => s == "1",
        Some(Value::Bool(b)) => *b,
        _ => false,
    };

    Ok(SensorConfig {
        sensor_id: SensorId(sensor.sensor_index),
        name: sensor
            .name
            .map(BoxStr::from)
            .unwrap_or_else(|| sensor.sensor_index.to_string().into()),
        hidden,
        read_key: sensor.primary_key_a.filter(|_| hidden).map(BoxStr::from),
    })
}

/// Map a 400 response body onto the error the API means by it.
pub fn bad_request(body: &[u8]) -> UpstreamError {
    let parsed: Option<ApiErrorBody> = serde_json::from_slice(body).ok();
    match parsed {
        Some(ApiErrorBody {
            error: Some(error), ..
        }) if error == "InvalidDataReadKeyError" => {
            UpstreamError::InvalidCredential(CredentialRejection::BadReadKey)
        }
        Some(ApiErrorBody {
            description: Some(description),
            ..
        }) => UpstreamError::BadRequest(description),
        _ => UpstreamError::BadRequest(String::from_utf8_lossy(body).into_owned()),
    }
}
