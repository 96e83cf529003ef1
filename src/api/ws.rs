//! WebSocket streaming endpoints.
//!
//! Every endpoint follows the same shape: authenticate on connect (a token
//! presented in the query string; a bad one gets a single text frame and a
//! 1008 close), then loop at the client-chosen interval emitting one JSON
//! frame per iteration from the hub's snapshot methods. Send failures end
//! the loop; clients are isolated from one another and from the control
//! paths.

use crate::api::AppState;
use crate::stream::clamp_interval;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub token: Option<String>,
    /// Interval in milliseconds, clamped to server policy.
    pub interval: Option<u64>,
}

impl StreamParams {
    fn interval(&self) -> Duration {
        clamp_interval(self.interval.unwrap_or(1000))
    }
}

/// Authenticate a connection that presented a token. Absent tokens pass;
/// parity with the HTTP layer is enforced where deployments need it via
/// the reverse proxy.
async fn authenticate(socket: &mut WebSocket, state: &AppState, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return true;
    };
    if state.auth.verify_token(token).is_ok() {
        return true;
    }
    let _ = socket
        .send(Message::Text("Authentication failed".to_string()))
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication failed".into(),
        })))
        .await;
    false
}

/// Shared per-connection loop: emit one frame per interval until the peer
/// goes away or the hub signals shutdown, in which case the socket is
/// closed with the normal-closure code before the loop exits.
async fn stream_loop<F>(
    mut socket: WebSocket,
    state: AppState,
    params: StreamParams,
    endpoint: &'static str,
    frame: F,
) where
    F: Fn(&AppState) -> Option<Value>,
{
    if !authenticate(&mut socket, &state, params.token.as_deref()).await {
        return;
    }
    let _guard = state.hub.register(endpoint);
    let mut shutdown = state.hub.subscribe_shutdown();
    let mut ticker = tokio::time::interval(params.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(frame) = frame(&state) else {
                    continue; // nothing sampled yet
                };
                let text = frame.to_string();
                if socket.send(Message::Text(text)).await.is_err() {
                    debug!(endpoint, "send failed, closing stream");
                    break;
                }
            }
            received = socket.recv() => {
                match received {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {} // ignore client chatter
                }
            }
            _ = shutdown.recv() => {
                debug!(endpoint, "server shutting down, closing stream");
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "server shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// `GET /device/usage` (WebSocket): CPU/mem/disk snapshots.
pub async fn usage(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        stream_loop(socket, state, params, "device/usage", |state| {
            state.hub.usage_frame()
        })
    })
}

/// `GET /sensor/ina260/{id}` (WebSocket): one power sensor stream.
pub async fn power_sensor(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        stream_loop(socket, state, params, "sensor/ina260", move |state| {
            state.hub.sensor_frame(&id)
        })
    })
}

/// `GET /sensor/sht30/environmental` (WebSocket).
pub async fn environmental(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        stream_loop(socket, state, params, "sensor/sht30", |state| {
            state.hub.sensor_frame("environmental")
        })
    })
}

/// `GET /io/relays/state/ws` (WebSocket): all relay states.
pub async fn relay_states(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        stream_loop(socket, state, params, "io/relays/state", |state| {
            Some(state.hub.relay_frame(false))
        })
    })
}

/// `GET /io/relays/enabled/state/ws` (WebSocket): enabled relays only.
pub async fn enabled_relay_states(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        stream_loop(socket, state, params, "io/relays/enabled", |state| {
            Some(state.hub.relay_frame(true))
        })
    })
}

/// `GET /dashboard/ws` (WebSocket): aggregate of relay states, main power
/// and environmental sensors.
pub async fn dashboard(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        stream_loop(socket, state, params, "dashboard", |state| {
            Some(state.hub.dashboard_frame())
        })
    })
}

/// `GET /settings/ws` (WebSocket): effective config plus relay states.
pub async fn settings(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        stream_loop(socket, state, params, "settings", |state| {
            Some(state.hub.settings_frame())
        })
    })
}
