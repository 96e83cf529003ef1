//! HTTP/WebSocket surface.
//!
//! The handlers are a thin translation layer: parse and authenticate, call
//! into the core through the command bus or a cache snapshot, map errors to
//! the wire taxonomy. No business logic lives here.

pub mod auth;
pub mod config;
pub mod device;
pub mod error;
pub mod relays;
pub mod timeseries;
pub mod ws;

pub use auth::{AuthContext, Principal, Role};
pub use error::ApiError;

use crate::bus::ControlHandle;
use crate::config::ConfigManager;
use crate::sensor::SensorPoller;
use crate::store::InfluxQuery;
use crate::stream::StreamHub;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub bus: ControlHandle,
    pub config: Arc<ConfigManager>,
    pub hub: StreamHub,
    pub poller: Arc<SensorPoller>,
    pub query: InfluxQuery,
    pub bucket: String,
    pub auth: Arc<AuthContext>,
}

/// Assemble the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Authentication
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        // Configuration
        .route("/config", get(config::get_full).post(config::update_full))
        .route("/config/revert", post(config::revert))
        .route(
            "/config/:section",
            get(config::get_section).post(config::update_section),
        )
        // Relay control and status
        .route("/io/relays/state", get(relays::all_states))
        .route("/io/relays/enabled/state", get(relays::enabled_states))
        .route("/io/relays/state/ws", get(ws::relay_states))
        .route("/io/relays/enabled/state/ws", get(ws::enabled_relay_states))
        .route("/io/rules/status", get(relays::rule_status))
        .route("/io/sensors/health", get(relays::sensor_health))
        .route("/io/:id/state/on", post(relays::turn_on))
        .route("/io/:id/state/off", post(relays::turn_off))
        .route("/io/:id/state/pulse", post(relays::pulse))
        // Time series
        .route("/timeseries/query", get(timeseries::query))
        // Device
        .route("/device/reboot", post(device::reboot))
        .route("/device/usage", get(ws::usage))
        // Sensor streams
        .route("/sensor/ina260/:id", get(ws::power_sensor))
        .route("/sensor/sht30/environmental", get(ws::environmental))
        // Aggregates
        .route("/dashboard/ws", get(ws::dashboard))
        .route("/settings/ws", get(ws::settings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
