//! Configuration endpoints.
//!
//! Reads return deep copies of the effective document; writes go through
//! the command bus so they share the dispatcher's ordering and deadlines
//! with everything else that mutates state.

use crate::api::auth::Principal;
use crate::api::error::ApiError;
use crate::api::AppState;
use crate::error::ControlError;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::Value;

/// `GET /config`: the effective document.
pub async fn get_full(
    _principal: Principal,
    State(state): State<AppState>,
) -> Json<Value> {
    Json(state.config.effective_value())
}

/// `GET /config/{section}`
pub async fn get_section(
    _principal: Principal,
    State(state): State<AppState>,
    Path(section): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .config
        .section(&section)
        .map(Json)
        .ok_or_else(|| ControlError::NotFound(format!("config section '{section}'")).into())
}

/// `POST /config` (admin): replace the custom overlay with the submitted
/// document.
pub async fn update_full(
    principal: Principal,
    State(state): State<AppState>,
    Json(doc): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    principal.require_admin()?;
    let updated = state.bus.update_config_full(doc).await?;
    Ok(Json(updated))
}

/// `POST /config/{section}` (admin)
pub async fn update_section(
    principal: Principal,
    State(state): State<AppState>,
    Path(section): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    principal.require_admin()?;
    let updated = state.bus.update_config_section(&section, body).await?;
    Ok(Json(updated))
}

/// `POST /config/revert` (admin): drop the custom overlay.
pub async fn revert(
    principal: Principal,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    principal.require_admin()?;
    let doc = state.bus.revert_config().await?;
    Ok(Json(doc))
}
