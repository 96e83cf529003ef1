//! Typed command bus between the API layer and the core.
//!
//! Commands carry a oneshot responder; the dispatcher routes them to the
//! relay authority, the config manager, the latch store or the watchdog.
//! Deadlines are enforced here on the awaiting side: the callee may still
//! complete after a timeout fires, so callers treat post-timeout state as
//! unknown and re-read.

pub mod dispatcher;

pub use dispatcher::Dispatcher;

use crate::error::{AppResult, ControlError};
use crate::relay::{PulseOutcome, RelayState, SwitchOutcome};
use crate::rules::RuleStatus;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Deadline for commands that touch hardware.
pub const HARDWARE_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for configuration updates (validation + disk + fan-out).
pub const CONFIG_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOp {
    On,
    Off,
    Pulse,
}

/// Reply to a relay command.
#[derive(Debug, Clone)]
pub enum RelayReply {
    Switched(SwitchOutcome),
    Pulsed(PulseOutcome),
}

/// Commands accepted by the dispatcher.
pub enum Command {
    Relay {
        op: RelayOp,
        id: String,
        duration: Option<u64>,
        respond: oneshot::Sender<AppResult<RelayReply>>,
    },
    RelayStates {
        ids: Option<Vec<String>>,
        respond: oneshot::Sender<HashMap<String, RelayState>>,
    },
    RuleStatus {
        respond: oneshot::Sender<Vec<RuleStatus>>,
    },
    ConfigFull {
        doc: Value,
        respond: oneshot::Sender<AppResult<Value>>,
    },
    ConfigSection {
        name: String,
        section: Value,
        respond: oneshot::Sender<AppResult<Value>>,
    },
    ConfigRevert {
        respond: oneshot::Sender<AppResult<Value>>,
    },
    Reboot {
        respond: oneshot::Sender<AppResult<()>>,
    },
}

impl Command {
    pub fn relay(
        op: RelayOp,
        id: impl Into<String>,
        duration: Option<u64>,
    ) -> (Self, oneshot::Receiver<AppResult<RelayReply>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Relay {
                op,
                id: id.into(),
                duration,
                respond: tx,
            },
            rx,
        )
    }

    pub fn relay_states(
        ids: Option<Vec<String>>,
    ) -> (Self, oneshot::Receiver<HashMap<String, RelayState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RelayStates { ids, respond: tx }, rx)
    }

    pub fn rule_status() -> (Self, oneshot::Receiver<Vec<RuleStatus>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RuleStatus { respond: tx }, rx)
    }

    pub fn config_full(doc: Value) -> (Self, oneshot::Receiver<AppResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ConfigFull { doc, respond: tx }, rx)
    }

    pub fn config_section(
        name: impl Into<String>,
        section: Value,
    ) -> (Self, oneshot::Receiver<AppResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ConfigSection {
                name: name.into(),
                section,
                respond: tx,
            },
            rx,
        )
    }

    pub fn config_revert() -> (Self, oneshot::Receiver<AppResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ConfigRevert { respond: tx }, rx)
    }

    pub fn reboot() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Reboot { respond: tx }, rx)
    }
}

/// Cloneable sender side of the bus.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Command>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn submit<R>(
        &self,
        command: Command,
        rx: oneshot::Receiver<R>,
        deadline: Duration,
        what: &str,
    ) -> AppResult<R> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ControlError::Internal("command bus closed".into()))?;
        match tokio::time::timeout(deadline, rx).await {
            Err(_) => Err(ControlError::Timeout(what.to_string())),
            Ok(Err(_)) => Err(ControlError::Internal(format!(
                "{what}: dispatcher dropped the reply"
            ))),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    pub async fn relay_command(
        &self,
        op: RelayOp,
        id: &str,
        duration: Option<u64>,
    ) -> AppResult<RelayReply> {
        let (command, rx) = Command::relay(op, id, duration);
        self.submit(command, rx, HARDWARE_DEADLINE, "relay command")
            .await?
    }

    pub async fn relay_states(
        &self,
        ids: Option<Vec<String>>,
    ) -> AppResult<HashMap<String, RelayState>> {
        let (command, rx) = Command::relay_states(ids);
        self.submit(command, rx, HARDWARE_DEADLINE, "relay state query")
            .await
    }

    pub async fn rule_status(&self) -> AppResult<Vec<RuleStatus>> {
        let (command, rx) = Command::rule_status();
        self.submit(command, rx, HARDWARE_DEADLINE, "rule status query")
            .await
    }

    pub async fn update_config_full(&self, doc: Value) -> AppResult<Value> {
        let (command, rx) = Command::config_full(doc);
        self.submit(command, rx, CONFIG_DEADLINE, "config update").await?
    }

    pub async fn update_config_section(&self, name: &str, section: Value) -> AppResult<Value> {
        let (command, rx) = Command::config_section(name, section);
        self.submit(command, rx, CONFIG_DEADLINE, "config section update")
            .await?
    }

    pub async fn revert_config(&self) -> AppResult<Value> {
        let (command, rx) = Command::config_revert();
        self.submit(command, rx, CONFIG_DEADLINE, "config revert").await?
    }

    pub async fn reboot(&self) -> AppResult<()> {
        let (command, rx) = Command::reboot();
        self.submit(command, rx, HARDWARE_DEADLINE, "reboot").await?
    }
}
