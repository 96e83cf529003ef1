//! Single-writer authority for every relay.
//!
//! All relay mutations in the process funnel through [`RelayAuthority`].
//! Each relay id owns a gate (an async mutex); two commands against the same
//! id serialize, commands against distinct ids run in parallel. The state
//! cache `Q` is updated only after the physical write has been confirmed by
//! a read-back.
//!
//! The authority is a passive executor: at startup it snapshots whatever
//! level each configured line currently carries and caches the logical
//! translation without forcing a change. The scheduler owns driving relays
//! toward their desired state.

use crate::config::RelayConfig;
use crate::error::{AppResult, ControlError};
use crate::hardware::Hardware;
use crate::relay::{Polarity, PulseOutcome, RelayState, SwitchOutcome};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wiring attributes a slot needs to drive its line. Refreshed on config
/// reload while the gate (and any in-flight command) stays untouched.
#[derive(Debug, Clone)]
struct Wiring {
    line: u8,
    polarity: Polarity,
    enabled: bool,
    pulse_time: u64,
}

struct RelaySlot {
    gate: tokio::sync::Mutex<()>,
    wiring: RwLock<Wiring>,
}

impl RelaySlot {
    fn wiring(&self) -> Wiring {
        self.wiring
            .read()
            .map(|w| w.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

pub struct RelayAuthority {
    hardware: Arc<dyn Hardware>,
    slots: DashMap<String, Arc<RelaySlot>>,
    /// Last-observed logical state per relay (the `Q` cache).
    states: Arc<DashMap<String, RelayState>>,
}

impl RelayAuthority {
    pub fn new(hardware: Arc<dyn Hardware>) -> Self {
        Self {
            hardware,
            slots: DashMap::new(),
            states: Arc::new(DashMap::new()),
        }
    }

    /// Shared handle to the relay-state cache, read by the hub and the
    /// scheduler.
    pub fn state_cache(&self) -> Arc<DashMap<String, RelayState>> {
        self.states.clone()
    }

    /// Register or refresh every configured relay. New relays get their
    /// current hardware level snapshotted into `Q`; existing relays keep
    /// their gate so in-flight commands stay serialized across reloads.
    pub async fn apply_config(&self, relays: &[RelayConfig]) {
        for relay in relays {
            let wiring = Wiring {
                line: relay.gpio_line,
                polarity: relay.polarity,
                enabled: relay.enabled,
                pulse_time: relay.pulse_time,
            };
            match self.slots.get(&relay.id) {
                Some(slot) => {
                    if let Ok(mut current) = slot.wiring.write() {
                        *current = wiring;
                    }
                }
                None => {
                    self.slots.insert(
                        relay.id.clone(),
                        Arc::new(RelaySlot {
                            gate: tokio::sync::Mutex::new(()),
                            wiring: RwLock::new(wiring.clone()),
                        }),
                    );
                    match self.hardware.read_line(wiring.line).await {
                        Ok(level) => {
                            let state = wiring.polarity.state_for(level);
                            info!(relay = %relay.id, line = wiring.line, %state,
                                "registered relay, snapshotted state");
                            self.states.insert(relay.id.clone(), state);
                            // Claim the line as an output at its present level.
                            if let Err(e) = self
                                .hardware
                                .configure_output(wiring.line, level)
                                .await
                            {
                                warn!(relay = %relay.id, error = %e,
                                    "failed to claim relay line as output");
                            }
                        }
                        Err(e) => {
                            warn!(relay = %relay.id, line = wiring.line, error = %e,
                                "could not snapshot relay state");
                        }
                    }
                }
            }
        }
    }

    fn slot(&self, id: &str) -> AppResult<Arc<RelaySlot>> {
        self.slots
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| ControlError::NotFound(format!("relay '{id}'")))
    }

    /// Write the level for `state` and confirm by read-back. Caller must
    /// hold the relay's gate.
    async fn apply_state(&self, id: &str, wiring: &Wiring, state: RelayState) -> AppResult<SwitchOutcome> {
        apply_state(self.hardware.as_ref(), &self.states, id, wiring, state).await
    }

    pub async fn turn_on(&self, id: &str) -> AppResult<SwitchOutcome> {
        let slot = self.slot(id)?;
        let _gate = slot.gate.lock().await;
        let wiring = slot.wiring();
        self.apply_state(id, &wiring, RelayState::On).await
    }

    pub async fn turn_off(&self, id: &str) -> AppResult<SwitchOutcome> {
        let slot = self.slot(id)?;
        let _gate = slot.gate.lock().await;
        let wiring = slot.wiring();
        self.apply_state(id, &wiring, RelayState::Off).await
    }

    /// Toggle now and schedule the reverse toggle after `duration` seconds.
    /// The submission returns immediately; the restore re-enters the gate
    /// and abandons with a warning if another command moved the relay in
    /// the meantime.
    pub async fn pulse(&self, id: &str, duration: Option<u64>) -> AppResult<PulseOutcome> {
        let slot = self.slot(id)?;
        let wiring = slot.wiring();
        let duration = duration.unwrap_or(wiring.pulse_time).max(1);

        let initial = {
            let _gate = slot.gate.lock().await;
            let initial = wiring
                .polarity
                .state_for(self.hardware.read_line(wiring.line).await?);
            self.apply_state(id, &wiring, initial.toggled()).await?;
            initial
        };

        let hardware = self.hardware.clone();
        let states = self.states.clone();
        let relay_id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration)).await;
            restore_after_pulse(hardware, states, slot, &relay_id, initial).await;
        });

        Ok(PulseOutcome {
            id: id.to_string(),
            initial_state: initial,
            duration,
        })
    }

    /// Read the relay's current logical state from hardware and refresh `Q`.
    pub async fn get(&self, id: &str) -> AppResult<RelayState> {
        let slot = self.slot(id)?;
        let wiring = slot.wiring();
        let state = wiring
            .polarity
            .state_for(self.hardware.read_line(wiring.line).await?);
        self.states.insert(id.to_string(), state);
        Ok(state)
    }

    /// Current logical state for the given ids (or every known relay when
    /// `ids` is `None`). Unreachable relays are omitted from the result.
    pub async fn get_all(&self, ids: Option<&[String]>) -> HashMap<String, RelayState> {
        let targets: Vec<String> = match ids {
            Some(ids) => ids.to_vec(),
            None => self.slots.iter().map(|e| e.key().clone()).collect(),
        };
        let mut out = HashMap::new();
        for id in targets {
            match self.get(&id).await {
                Ok(state) => {
                    out.insert(id, state);
                }
                Err(e) => {
                    warn!(relay = %id, error = %e, "skipping unreadable relay");
                }
            }
        }
        out
    }

    /// Ids of relays currently flagged enabled in the configuration.
    pub fn enabled_ids(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|e| e.value().wiring().enabled)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Configured pulse duration for a relay, if known.
    pub fn pulse_time(&self, id: &str) -> Option<u64> {
        self.slots.get(id).map(|s| s.wiring().pulse_time)
    }
}

/// Drive the line and confirm by read-back, updating `Q` with whatever the
/// hardware reports.
async fn apply_state(
    hardware: &dyn Hardware,
    states: &DashMap<String, RelayState>,
    id: &str,
    wiring: &Wiring,
    state: RelayState,
) -> AppResult<SwitchOutcome> {
    hardware
        .write_line(wiring.line, wiring.polarity.level_for(state))
        .await?;
    let observed = wiring.polarity.state_for(hardware.read_line(wiring.line).await?);
    let confirmed = observed == state;
    if confirmed {
        debug!(relay = %id, %state, "relay switched");
    } else {
        warn!(relay = %id, commanded = %state, observed = %observed,
            "read-back disagrees with commanded state");
    }
    states.insert(id.to_string(), observed);
    Ok(SwitchOutcome {
        id: id.to_string(),
        state: observed,
        confirmed,
    })
}

/// Second half of a pulse. Runs as its own task and re-enters the gate.
async fn restore_after_pulse(
    hardware: Arc<dyn Hardware>,
    states: Arc<DashMap<String, RelayState>>,
    slot: Arc<RelaySlot>,
    id: &str,
    initial: RelayState,
) {
    let _gate = slot.gate.lock().await;
    let wiring = slot.wiring();
    let current = match hardware.read_line(wiring.line).await {
        Ok(level) => wiring.polarity.state_for(level),
        Err(e) => {
            warn!(relay = %id, error = %e, "pulse restore could not read relay");
            return;
        }
    };
    if current != initial.toggled() {
        warn!(relay = %id, expected = %initial.toggled(), found = %current,
            "relay moved during pulse, leaving it alone");
        return;
    }
    if let Err(e) = apply_state(hardware.as_ref(), &states, id, &wiring, initial).await {
        warn!(relay = %id, error = %e, "pulse restore failed");
    }
}
