//! Automation rules: predicates over sensor fields, edge-triggered actions.

pub mod engine;
pub mod latch;

pub use engine::RuleEngine;
pub use latch::{LatchSnapshot, LatchStore};

use serde::{Deserialize, Serialize};

/// Comparison operator of a rule predicate. The grammar is closed: there is
/// no user-defined scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Ge => value >= threshold,
            CompareOp::Le => value <= threshold,
            CompareOp::Eq => value == threshold,
            CompareOp::Ne => value != threshold,
        }
    }
}

/// Desired relay state of an `io` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoState {
    On,
    Off,
    Pulse,
}

/// An action fired on the not-triggered → triggered edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    /// Drive a relay. `pulse` uses the target relay's configured pulse
    /// duration.
    Io { target: String, state: IoState },
    /// Emit a structured log line, persisted best-effort to the cache.
    Log { message: Option<String> },
    /// Arm the watchdog (debounced).
    Reboot,
}

/// A configured automation rule. Stored in the `tasks` section of the
/// configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Source id the rule listens to (a sensor id such as `relay_3` or
    /// `environmental`).
    pub source: String,
    /// Field within that source's samples (`voltage`, `temperature`, ...).
    pub field: String,
    pub operator: CompareOp,
    pub value: f64,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// One row of the rule status table: the configured rule plus its latch.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub id: String,
    pub name: String,
    pub source: String,
    pub field: String,
    pub operator: CompareOp,
    pub value: f64,
    pub actions_count: usize,
    pub triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cleared: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_evaluation() {
        assert!(CompareOp::Gt.evaluate(11.0, 10.0));
        assert!(!CompareOp::Gt.evaluate(10.0, 10.0));
        assert!(CompareOp::Ge.evaluate(10.0, 10.0));
        assert!(CompareOp::Ne.evaluate(1.0, 2.0));
    }

    #[test]
    fn test_action_wire_format() {
        let action: Action = serde_json::from_str(
            r#"{"type": "io", "target": "relay_6", "state": "on"}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            Action::Io {
                target: "relay_6".into(),
                state: IoState::On
            }
        );

        let rule: Rule = serde_json::from_str(
            r#"{
                "id": "t1", "name": "over-temp", "source": "environmental",
                "field": "temperature", "operator": ">", "value": 80,
                "actions": [{"type": "reboot"}]
            }"#,
        )
        .unwrap();
        assert_eq!(rule.operator, CompareOp::Gt);
        assert_eq!(rule.actions, vec![Action::Reboot]);
    }
}
