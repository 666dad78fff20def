pub mod sensors;

use axum::{
    Router,
    routing::{get, post},
};
use plume_upstream::Upstream;

use crate::coordinator::Coordinator;
use crate::store::SensorStore;

/// Shared state for API handlers.
pub struct ApiState<U, S> {
    pub coordinator: Coordinator<U, S>,
}

impl<U, S> Clone for ApiState<U, S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

/// Create the full API router with all endpoints.
pub fn api_router<U, S>(coordinator: Coordinator<U, S>) -> Router
where
    U: Upstream,
    S: SensorStore,
{
    let state = ApiState { coordinator };

    Router::new()
        .route(
            "/api/sensors",
            get(sensors::list_sensors::<U, S>).post(sensors::add_sensor::<U, S>),
        )
        .route(
            "/api/sensors/{id}",
            get(sensors::get_sensor::<U, S>).delete(sensors::remove_sensor::<U, S>),
        )
        .route(
            "/api/sensors/{id}/migrate",
            post(sensors::migrate_sensor::<U, S>),
        )
        .route("/api/refresh", post(sensors::refresh::<U, S>))
        .with_state(state)
}
