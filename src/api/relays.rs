//! Relay control and status endpoints.

use crate::api::auth::Principal;
use crate::api::error::ApiError;
use crate::api::AppState;
use crate::bus::{RelayOp, RelayReply};
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn switch_body(reply: RelayReply) -> Value {
    match reply {
        RelayReply::Switched(outcome) => json!({
            "id": outcome.id,
            "status": if outcome.confirmed { "success" } else { "error" },
            "state": outcome.state.as_u8(),
        }),
        RelayReply::Pulsed(outcome) => json!({
            "id": outcome.id,
            "status": "success",
            "initial_state": outcome.initial_state.as_u8(),
            "duration": outcome.duration,
        }),
    }
}

/// `POST /io/{id}/state/on`
pub async fn turn_on(
    _principal: Principal,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let reply = state.bus.relay_command(RelayOp::On, &id, None).await?;
    Ok(Json(switch_body(reply)))
}

/// `POST /io/{id}/state/off`
pub async fn turn_off(
    _principal: Principal,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let reply = state.bus.relay_command(RelayOp::Off, &id, None).await?;
    Ok(Json(switch_body(reply)))
}

/// `POST /io/{id}/state/pulse`: duration comes from the relay's configured
/// `pulse_time`.
pub async fn pulse(
    _principal: Principal,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let reply = state.bus.relay_command(RelayOp::Pulse, &id, None).await?;
    Ok(Json(switch_body(reply)))
}

/// `GET /io/relays/state`
pub async fn all_states(
    _principal: Principal,
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, u8>>, ApiError> {
    let states = state.bus.relay_states(None).await?;
    Ok(Json(
        states.into_iter().map(|(id, s)| (id, s.as_u8())).collect(),
    ))
}

/// `GET /io/relays/enabled/state`
pub async fn enabled_states(
    _principal: Principal,
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, u8>>, ApiError> {
    let enabled: Vec<String> = state
        .config
        .effective()
        .relays
        .iter()
        .filter(|r| r.enabled)
        .map(|r| r.id.clone())
        .collect();
    let states = state.bus.relay_states(Some(enabled)).await?;
    Ok(Json(
        states.into_iter().map(|(id, s)| (id, s.as_u8())).collect(),
    ))
}

/// `GET /io/rules/status`: the rule table with latch state and timestamps.
pub async fn rule_status(
    _principal: Principal,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let table = state.bus.rule_status().await?;
    let mut body = serde_json::Map::new();
    for row in table {
        body.insert(row.id.clone(), serde_json::to_value(&row).unwrap_or(Value::Null));
    }
    Ok(Json(Value::Object(body)))
}

/// `GET /io/sensors/health`: per-sensor failure counters and flags.
pub async fn sensor_health(
    _principal: Principal,
    State(state): State<AppState>,
) -> Json<Value> {
    Json(json!({ "sensors": state.poller.health_snapshot() }))
}
