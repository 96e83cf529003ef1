//! Device-level endpoints.

use crate::api::auth::Principal;
use crate::api::error::ApiError;
use crate::api::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

/// `POST /device/reboot` (admin): arm the watchdog for a supervised
/// reboot. The response goes out before the board actually resets.
pub async fn reboot(
    principal: Principal,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    principal.require_admin()?;
    warn!(by = %principal.username, "reboot requested");
    state.bus.reboot().await?;
    Ok(Json(json!({ "message": "Reboot initiated" })))
}
