//! API v0 endpoints.
//!
//! Version 0 signals an unstable API. Everything here is read-only.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use utoipa_axum::{router::OpenApiRouter, routes};

use super::convert;
use super::server::SharedState;
use crate::api_client::types::{
    AuditState, DeviceState, FleetState, RuleState, StrategyView, TransitionState,
};

/// Build the v0 API routes with OpenAPI metadata.
pub fn routes() -> OpenApiRouter<SharedState> {
    OpenApiRouter::new()
        .routes(routes!(health))
        .routes(routes!(get_fleet))
        .routes(routes!(get_devices))
        .routes(routes!(get_device))
        .routes(routes!(get_strategy))
        .routes(routes!(get_transitions))
        .routes(routes!(get_rules))
        .routes(routes!(get_audit))
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = OK, description = "Server is running", body = String),
    ),
)]
async fn health() -> &'static str {
    "OK"
}

/// Fleet summary: strategy, devices and the last cycle.
#[utoipa::path(
    get,
    path = "/fleet",
    tag = "fleet",
    responses(
        (status = OK, description = "Fleet summary", body = FleetState),
    ),
)]
async fn get_fleet(State(state): State<SharedState>) -> Json<FleetState> {
    Json(convert::fleet_state(&state.controller.view()))
}

/// Every configured device with its latest telemetry.
#[utoipa::path(
    get,
    path = "/devices",
    tag = "devices",
    responses(
        (status = OK, description = "List of devices", body = Vec<DeviceState>),
    ),
)]
async fn get_devices(State(state): State<SharedState>) -> Json<Vec<DeviceState>> {
    Json(
        state
            .controller
            .devices()
            .iter()
            .map(|(device, telemetry)| convert::device_state(device, telemetry))
            .collect(),
    )
}

/// Return a single device by id, or 404 if not found.
#[utoipa::path(
    get,
    path = "/devices/{id}",
    tag = "devices",
    params(
        ("id" = String, Path, description = "Device id"),
    ),
    responses(
        (status = OK, description = "Device details", body = DeviceState),
        (status = NOT_FOUND, description = "Device not found"),
    ),
)]
async fn get_device(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceState>, StatusCode> {
    state
        .controller
        .devices()
        .iter()
        .find(|(device, _)| device.id.as_str() == id)
        .map(|(device, telemetry)| Json(convert::device_state(device, telemetry)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Active band, override and the band table.
#[utoipa::path(
    get,
    path = "/strategy",
    tag = "strategy",
    responses(
        (status = OK, description = "Strategy state", body = StrategyView),
    ),
)]
async fn get_strategy(State(state): State<SharedState>) -> Json<StrategyView> {
    let view = state.controller.view();
    Json(convert::strategy_view(&view.strategy, &view.bands))
}

/// Band transitions since startup, oldest first.
#[utoipa::path(
    get,
    path = "/strategy/transitions",
    tag = "strategy",
    responses(
        (status = OK, description = "Transition history", body = Vec<TransitionState>),
    ),
)]
async fn get_transitions(State(state): State<SharedState>) -> Json<Vec<TransitionState>> {
    Json(
        state
            .controller
            .transitions()
            .iter()
            .map(TransitionState::from)
            .collect(),
    )
}

/// Rule evaluations from the last cycle, in evaluation order.
#[utoipa::path(
    get,
    path = "/rules",
    tag = "rules",
    responses(
        (status = OK, description = "Rule evaluations", body = Vec<RuleState>),
    ),
)]
async fn get_rules(State(state): State<SharedState>) -> Json<Vec<RuleState>> {
    Json(
        state
            .controller
            .rule_evaluations()
            .iter()
            .map(RuleState::from)
            .collect(),
    )
}

/// Recently dispatched actions, oldest first.
#[utoipa::path(
    get,
    path = "/audit",
    tag = "audit",
    responses(
        (status = OK, description = "Audit trail", body = Vec<AuditState>),
    ),
)]
async fn get_audit(State(state): State<SharedState>) -> Json<Vec<AuditState>> {
    Json(
        state
            .controller
            .recent_audit()
            .iter()
            .map(AuditState::from)
            .collect(),
    )
}
