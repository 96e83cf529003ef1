//! Live stream hub: snapshot frames for WebSocket clients.
//!
//! The hub never pushes: each connection runs its own loop at a
//! client-chosen period and *samples* the latest-sample cache, the
//! relay-state cache and the usage cache. Reads are non-blocking snapshots,
//! so a slow or dead client can never back-pressure the sensor or rule
//! paths. Frame assembly lives here; the socket loop lives in the API
//! layer.

use crate::config::ConfigManager;
use crate::relay::RelayState;
use crate::sensor::Sample;
use crate::system::UsageCache;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Server policy bounds on the client-chosen streaming period.
pub const MIN_INTERVAL: Duration = Duration::from_millis(500);
pub const MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Clamp a client-requested interval (milliseconds) into policy bounds.
pub fn clamp_interval(ms: u64) -> Duration {
    Duration::from_millis(ms).clamp(MIN_INTERVAL, MAX_INTERVAL)
}

#[derive(Clone)]
pub struct StreamHub {
    latest: Arc<DashMap<String, Sample>>,
    relay_states: Arc<DashMap<String, RelayState>>,
    usage: UsageCache,
    config: Arc<ConfigManager>,
    connections: Arc<AtomicUsize>,
    shutdown: broadcast::Sender<()>,
}

impl StreamHub {
    pub fn new(
        latest: Arc<DashMap<String, Sample>>,
        relay_states: Arc<DashMap<String, RelayState>>,
        usage: UsageCache,
        config: Arc<ConfigManager>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            latest,
            relay_states,
            usage,
            config,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// Track a connection for the lifetime of the returned guard.
    pub fn register(&self, endpoint: &'static str) -> ConnectionGuard {
        let now = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(endpoint, connections = now, "stream client connected");
        ConnectionGuard {
            connections: self.connections.clone(),
            endpoint,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Receiver every connection loop selects on; fires once at shutdown
    /// so the loop can close its socket with a normal-closure code.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Tell every live connection to send its close frame and exit.
    pub fn close_all(&self) {
        let listening = self.shutdown.receiver_count();
        info!(connections = listening, "closing stream connections");
        let _ = self.shutdown.send(());
    }

    /// Latest sample for one source, or `None` before the first read.
    pub fn sensor_frame(&self, source: &str) -> Option<Value> {
        self.latest
            .get(source)
            .map(|sample| serde_json::to_value(sample.value()).unwrap_or(Value::Null))
    }

    /// Current relay states, optionally restricted to enabled relays.
    pub fn relay_frame(&self, enabled_only: bool) -> Value {
        let enabled: Option<Vec<String>> = enabled_only.then(|| {
            self.config
                .effective()
                .relays
                .iter()
                .filter(|r| r.enabled)
                .map(|r| r.id.clone())
                .collect()
        });
        let mut states = BTreeMap::new();
        for entry in self.relay_states.iter() {
            if let Some(enabled) = &enabled {
                if !enabled.contains(entry.key()) {
                    continue;
                }
            }
            states.insert(entry.key().clone(), entry.value().as_u8());
        }
        json!({ "relay_states": states })
    }

    pub fn usage_frame(&self) -> Option<Value> {
        let snapshot = self.usage.read().ok()?.clone()?;
        serde_json::to_value(snapshot).ok()
    }

    /// Aggregate frame for the dashboard: enabled relay states plus the
    /// main power sensor and the environmental sensor.
    pub fn dashboard_frame(&self) -> Value {
        let mut frame = self.relay_frame(true);
        if let Value::Object(map) = &mut frame {
            map.insert(
                "sensors".to_string(),
                json!({
                    "main": self.sensor_frame("main").unwrap_or(Value::Null),
                    "environmental": self
                        .sensor_frame("environmental")
                        .unwrap_or(Value::Null),
                }),
            );
        }
        frame
    }

    /// Aggregate frame for the settings page: effective config plus relay
    /// states.
    pub fn settings_frame(&self) -> Value {
        let mut relay_frame = self.relay_frame(false);
        let states = relay_frame
            .get_mut("relay_states")
            .map(Value::take)
            .unwrap_or(Value::Null);
        json!({
            "config": self.config.effective_value(),
            "relay_states": states,
        })
    }
}

/// Decrements the connection count on drop.
pub struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
    endpoint: &'static str,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let now = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(endpoint = self.endpoint, connections = now, "stream client disconnected");
    }
}
