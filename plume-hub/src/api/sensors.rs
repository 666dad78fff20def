use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use plume_core::{Publication, SensorId, SensorRegistration};
use plume_upstream::{ErrorKind, Upstream};
use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorError;
use crate::credentials::CredentialError;
use crate::migration::MigrationState;
use crate::store::SensorStore;

use super::ApiState;

/// Request body for adding a sensor.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddSensorRequest {
    pub sensor_id: u64,
    /// Account READ key.
    pub api_key: String,
    /// Per-sensor read key, required for hidden sensors.
    pub read_key: Option<String>,
}

/// Request body for moving a legacy sensor to the current API.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MigrateSensorRequest {
    /// Omit to reuse the single validated key already known.
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SensorResponse {
    pub id: u64,
    pub label: String,
    pub api_generation: String,
    pub migration: MigrationState,
    pub last_seen: Option<String>,
    pub publication: Publication,
}

impl SensorResponse {
    fn new(
        registration: SensorRegistration,
        migration: MigrationState,
        publication: Publication,
    ) -> Self {
        Self {
            id: registration.sensor_id.0,
            label: registration.label.to_string(),
            api_generation: registration.api_generation.as_str().to_string(),
            migration,
            last_seen: registration.last_seen.map(|t| t.to_string()),
            publication,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSensorsResponse {
    pub sensors: Vec<SensorResponse>,
    pub total: usize,
}

fn parse_id(id: &str) -> Result<SensorId, Response> {
    id.parse::<SensorId>()
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid sensor ID").into_response())
}

fn error_response(e: CoordinatorError) -> Response {
    let status = match &e {
        CoordinatorError::UnknownSensor(_) => StatusCode::NOT_FOUND,
        CoordinatorError::AlreadyRegistered(_) | CoordinatorError::Migration(_) => {
            StatusCode::CONFLICT
        }
        CoordinatorError::Upstream(u) | CoordinatorError::Credential(CredentialError::Upstream(u)) => {
            match u.kind() {
                ErrorKind::InvalidCredential => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            }
        }
        CoordinatorError::Credential(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoordinatorError::Store(_) => {
            tracing::error!(error = ?e, "Store operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (status, e.to_string()).into_response()
}

/// List every registered sensor with its latest publication.
///
/// GET /api/sensors
pub async fn list_sensors<U, S>(State(state): State<ApiState<U, S>>) -> impl IntoResponse
where
    U: Upstream,
    S: SensorStore,
{
    let publisher = state.coordinator.publisher();
    let sensors: Vec<_> = state
        .coordinator
        .registrations()
        .await
        .into_iter()
        .map(|(registration, migration)| {
            let publication = publisher
                .current(registration.sensor_id)
                .unwrap_or(Publication::Pending);
            SensorResponse::new(registration, migration, publication)
        })
        .collect();

    let total = sensors.len();
    (StatusCode::OK, Json(ListSensorsResponse { sensors, total }))
}

/// GET /api/sensors/:id
pub async fn get_sensor<U, S>(
    State(state): State<ApiState<U, S>>,
    Path(id): Path<String>,
) -> impl IntoResponse
where
    U: Upstream,
    S: SensorStore,
{
    let sensor_id = match parse_id(&id) {
        Ok(sensor_id) => sensor_id,
        Err(response) => return response,
    };

    let found = state
        .coordinator
        .registrations()
        .await
        .into_iter()
        .find(|(registration, _)| registration.sensor_id == sensor_id);

    match found {
        Some((registration, migration)) => {
            let publication = state
                .coordinator
                .publisher()
                .current(sensor_id)
                .unwrap_or(Publication::Pending);
            (
                StatusCode::OK,
                Json(SensorResponse::new(registration, migration, publication)),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Sensor not found").into_response(),
    }
}

/// Register a sensor on the current API.
///
/// POST /api/sensors
pub async fn add_sensor<U, S>(
    State(state): State<ApiState<U, S>>,
    Json(request): Json<AddSensorRequest>,
) -> impl IntoResponse
where
    U: Upstream,
    S: SensorStore,
{
    let sensor_id = SensorId(request.sensor_id);
    match state
        .coordinator
        .add_sensor(sensor_id, &request.api_key, request.read_key.as_deref())
        .await
    {
        Ok(registration) => (
            StatusCode::CREATED,
            Json(SensorResponse::new(
                registration,
                MigrationState::Upgraded,
                Publication::Pending,
            )),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/sensors/:id
pub async fn remove_sensor<U, S>(
    State(state): State<ApiState<U, S>>,
    Path(id): Path<String>,
) -> impl IntoResponse
where
    U: Upstream,
    S: SensorStore,
{
    let sensor_id = match parse_id(&id) {
        Ok(sensor_id) => sensor_id,
        Err(response) => return response,
    };

    match state.coordinator.remove_sensor(sensor_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/sensors/:id/migrate
pub async fn migrate_sensor<U, S>(
    State(state): State<ApiState<U, S>>,
    Path(id): Path<String>,
    Json(request): Json<MigrateSensorRequest>,
) -> impl IntoResponse
where
    U: Upstream,
    S: SensorStore,
{
    let sensor_id = match parse_id(&id) {
        Ok(sensor_id) => sensor_id,
        Err(response) => return response,
    };

    match state
        .coordinator
        .migrate_sensor(sensor_id, request.api_key.as_deref())
        .await
    {
        Ok(migration) => (StatusCode::OK, Json(migration)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Poll now instead of waiting for the next tick.
///
/// POST /api/refresh
pub async fn refresh<U, S>(State(state): State<ApiState<U, S>>) -> impl IntoResponse
where
    U: Upstream,
    S: SensorStore,
{
    let report = state.coordinator.refresh().await;
    (StatusCode::OK, Json(report))
}
