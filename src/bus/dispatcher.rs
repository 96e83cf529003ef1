//! Command dispatcher: the actor that routes bus commands to components.
//!
//! Relay commands are spawned so the bus stays responsive while hardware
//! settles; per-relay serialization is the authority's job, not the
//! dispatcher's. Config commands run inline (the manager has its own
//! ordering), and reboot arms the watchdog behind the shared debounce key.

use crate::bus::{Command, RelayOp, RelayReply};
use crate::config::ConfigManager;
use crate::hardware::Watchdog;
use crate::relay::RelayAuthority;
use crate::rules::{engine::rule_status, LatchStore};
use crate::store::KvCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const REBOOT_DEBOUNCE_KEY: &str = "system_reboot_scheduled";
const REBOOT_DEBOUNCE: Duration = Duration::from_secs(60);

pub struct Dispatcher {
    authority: Arc<RelayAuthority>,
    config: Arc<ConfigManager>,
    latches: Arc<LatchStore>,
    cache: Arc<dyn KvCache>,
    watchdog: Watchdog,
}

impl Dispatcher {
    pub fn new(
        authority: Arc<RelayAuthority>,
        config: Arc<ConfigManager>,
        latches: Arc<LatchStore>,
        cache: Arc<dyn KvCache>,
        watchdog: Watchdog,
    ) -> Self {
        Self {
            authority,
            config,
            latches,
            cache,
            watchdog,
        }
    }

    /// Process commands until every sender is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<Command>) {
        info!("command dispatcher started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Relay {
                    op,
                    id,
                    duration,
                    respond,
                } => {
                    let authority = self.authority.clone();
                    tokio::spawn(async move {
                        let result = match op {
                            RelayOp::On => {
                                authority.turn_on(&id).await.map(RelayReply::Switched)
                            }
                            RelayOp::Off => {
                                authority.turn_off(&id).await.map(RelayReply::Switched)
                            }
                            RelayOp::Pulse => {
                                authority.pulse(&id, duration).await.map(RelayReply::Pulsed)
                            }
                        };
                        let _ = respond.send(result);
                    });
                }

                Command::RelayStates { ids, respond } => {
                    let authority = self.authority.clone();
                    tokio::spawn(async move {
                        let states = authority.get_all(ids.as_deref()).await;
                        let _ = respond.send(states);
                    });
                }

                Command::RuleStatus { respond } => {
                    let doc = self.config.effective();
                    let _ = respond.send(rule_status(&doc.tasks, &self.latches));
                }

                Command::ConfigFull { doc, respond } => {
                    let result = self
                        .config
                        .update_full(doc)
                        .await
                        .map(|_| self.config.effective_value());
                    let _ = respond.send(result);
                }

                Command::ConfigSection {
                    name,
                    section,
                    respond,
                } => {
                    let result = self.config.update_section(&name, section).await;
                    let _ = respond.send(result);
                }

                Command::ConfigRevert { respond } => {
                    let result = self
                        .config
                        .revert_to_defaults()
                        .await
                        .map(|_| self.config.effective_value());
                    let _ = respond.send(result);
                }

                Command::Reboot { respond } => {
                    let _ = respond.send(self.reboot().await);
                }
            }
        }
        info!("command dispatcher stopped");
    }

    async fn reboot(&self) -> crate::error::AppResult<()> {
        if self.cache.exists(REBOOT_DEBOUNCE_KEY).await.unwrap_or(false) {
            warn!("reboot already scheduled, ignoring request");
            return Ok(());
        }
        let _ = self
            .cache
            .set(REBOOT_DEBOUNCE_KEY, "1", Some(REBOOT_DEBOUNCE))
            .await;
        self.watchdog.arm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ControlHandle;
    use crate::hardware::MockHardware;
    use crate::relay::RelayState;
    use crate::sensor::SensorCatalog;
    use crate::store::MemoryCache;
    use serde_json::json;

    async fn harness() -> (ControlHandle, Arc<RelayAuthority>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let default_path = dir.path().join("config.json");
        std::fs::write(
            &default_path,
            json!({
                "relays": [
                    {"id": "relay_3", "gpio_line": 17, "polarity": "normally_open",
                     "enabled": true, "pulse_time": 5},
                    {"id": "relay_4", "gpio_line": 4, "polarity": "normally_open",
                     "enabled": true, "pulse_time": 5}
                ]
            })
            .to_string(),
        )
        .unwrap();
        let config = Arc::new(
            ConfigManager::load(
                default_path,
                dir.path().join("custom.json"),
                SensorCatalog::default(),
            )
            .await
            .unwrap(),
        );

        let hardware = Arc::new(MockHardware::new());
        let authority = Arc::new(RelayAuthority::new(hardware));
        authority.apply_config(&config.effective().relays).await;

        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let latches = Arc::new(LatchStore::new(cache.clone()));
        let watchdog = Watchdog::new(dir.path().join("watchdog"));
        let dispatcher = Dispatcher::new(
            authority.clone(),
            config,
            latches,
            cache,
            watchdog,
        );

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(dispatcher.run(rx));
        (ControlHandle::new(tx), authority, dir)
    }

    #[tokio::test]
    async fn test_relay_command_round_trip() {
        let (bus, authority, _dir) = harness().await;
        let reply = bus
            .relay_command(RelayOp::On, "relay_3", None)
            .await
            .unwrap();
        match reply {
            RelayReply::Switched(outcome) => {
                assert!(outcome.confirmed);
                assert_eq!(outcome.state, RelayState::On);
            }
            RelayReply::Pulsed(_) => panic!("expected switch reply"),
        }
        assert_eq!(authority.get("relay_3").await.unwrap(), RelayState::On);
    }

    #[tokio::test]
    async fn test_unknown_relay_maps_to_not_found() {
        let (bus, _authority, _dir) = harness().await;
        let err = bus
            .relay_command(RelayOp::On, "relay_9", None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ControlError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_relay_states_query() {
        let (bus, _authority, _dir) = harness().await;
        bus.relay_command(RelayOp::On, "relay_4", None).await.unwrap();
        let states = bus.relay_states(None).await.unwrap();
        assert_eq!(states["relay_4"], RelayState::On);
        assert_eq!(states["relay_3"], RelayState::Off);
    }

    #[tokio::test]
    async fn test_reboot_is_debounced() {
        let (bus, _authority, dir) = harness().await;
        std::fs::write(dir.path().join("watchdog"), b"").unwrap();
        bus.reboot().await.unwrap();
        std::fs::write(dir.path().join("watchdog"), b"").unwrap();
        bus.reboot().await.unwrap();
        // Second request hit the debounce window and never armed.
        assert_eq!(std::fs::read(dir.path().join("watchdog")).unwrap(), b"");
    }
}
