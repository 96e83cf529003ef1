//! Configuration document: schema, validation, merge, hot-reload.
//!
//! Two JSON documents live on disk: a read-only default and a writable
//! custom overlay. The effective configuration is the deep merge of custom
//! onto default ([`merge`]), validated both structurally (typed
//! deserialization) and semantically (`validate`). The manager owns the
//! merged snapshot and fans changes out to listeners.

pub mod manager;
pub mod merge;

pub use manager::ConfigManager;

use crate::error::{AppResult, ControlError};
use crate::relay::{Polarity, RelayState};
use crate::rules::{Action, Rule};
use crate::schedule::Schedule;
use crate::sensor::SensorCatalog;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The validated configuration document. Section names double as the keys
/// accepted by the per-section API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    #[serde(default)]
    pub general: GeneralSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub date_time: DateTimeSection,
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub tasks: Vec<Rule>,
    #[serde(default)]
    pub email: EmailSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    pub system_name: String,
    /// Sensor poll period, seconds.
    pub sensor_poll_secs: u64,
    /// Schedule check period, seconds.
    pub schedule_check_secs: u64,
    /// Housekeeping period, seconds.
    pub housekeeping_secs: u64,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            system_name: "powerd".to_string(),
            sensor_poll_secs: 5,
            schedule_check_secs: 60,
            housekeeping_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkSection {
    pub dhcp: bool,
    pub ip_address: Option<String>,
    pub subnet_mask: Option<String>,
    pub gateway: Option<String>,
    pub dns_servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateTimeSection {
    /// "ntp" or "manual".
    pub mode: String,
    pub ntp_server: Option<String>,
    /// Minutes east of UTC, informational; schedules run on local time.
    pub utc_offset: i32,
}

impl Default for DateTimeSection {
    fn default() -> Self {
        Self {
            mode: "ntp".to_string(),
            ntp_server: None,
            utc_offset: 0,
        }
    }
}

/// Dashboard presentation hints for one relay; opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DashboardHints {
    pub display: bool,
    pub index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub gpio_line: u8,
    pub polarity: Polarity,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_pulse_time")]
    pub pulse_time: u64,
    /// Driven by the first housekeeping tick for relays without a schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_state: Option<RelayState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<DashboardHints>,
}

fn default_pulse_time() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EmailSection {
    pub enabled: bool,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<u16>,
    pub username: Option<String>,
    pub recipients: Vec<String>,
}

/// Section names accepted by the per-section read/write API.
pub const SECTIONS: &[&str] = &["general", "network", "date_time", "relays", "tasks", "email"];

/// Semantic checks on top of the typed schema. Every error is a
/// `Validation` so the API surfaces it as 4xx.
pub fn validate(doc: &ConfigDocument, catalog: &SensorCatalog) -> AppResult<()> {
    let mut relay_ids = HashSet::new();
    let mut gpio_lines = HashSet::new();
    for relay in &doc.relays {
        if !relay_ids.insert(relay.id.as_str()) {
            return Err(ControlError::Validation(format!(
                "duplicate relay id '{}'",
                relay.id
            )));
        }
        if !gpio_lines.insert(relay.gpio_line) {
            return Err(ControlError::Validation(format!(
                "gpio line {} assigned to more than one relay",
                relay.gpio_line
            )));
        }
        if relay.pulse_time < 1 {
            return Err(ControlError::Validation(format!(
                "relay '{}': pulse_time must be at least 1 second",
                relay.id
            )));
        }
        if let Some(schedule) = &relay.schedule {
            for (label, text) in [("on_time", &schedule.on_time), ("off_time", &schedule.off_time)]
            {
                if Schedule::parse_time(text).is_none() {
                    return Err(ControlError::Validation(format!(
                        "relay '{}': {label} '{text}' is not HH:MM",
                        relay.id
                    )));
                }
            }
        }
    }

    let mut rule_ids = HashSet::new();
    for rule in &doc.tasks {
        if !rule_ids.insert(rule.id.as_str()) {
            return Err(ControlError::Validation(format!(
                "duplicate rule id '{}'",
                rule.id
            )));
        }
        if !catalog.resolves(&rule.source, &rule.field) {
            return Err(ControlError::Validation(format!(
                "rule '{}': no sensor declares {}.{}",
                rule.id, rule.source, rule.field
            )));
        }
        for action in &rule.actions {
            if let Action::Io { target, .. } = action {
                if !relay_ids.contains(target.as_str()) {
                    return Err(ControlError::Validation(format!(
                        "rule '{}': io action targets unknown relay '{target}'",
                        rule.id
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{CompareOp, IoState};
    use crate::sensor::{SensorConfig, SensorKind};

    fn catalog() -> SensorCatalog {
        SensorCatalog::new(vec![
            SensorConfig {
                id: "relay_1".into(),
                kind: SensorKind::Power,
                address: 0x44,
                enabled: true,
            },
            SensorConfig {
                id: "environmental".into(),
                kind: SensorKind::Environmental,
                address: 0x45,
                enabled: true,
            },
        ])
    }

    fn doc() -> ConfigDocument {
        ConfigDocument {
            relays: vec![RelayConfig {
                id: "relay_1".into(),
                name: "Camera".into(),
                gpio_line: 22,
                polarity: Polarity::NormallyClosed,
                enabled: true,
                pulse_time: 5,
                boot_state: None,
                schedule: None,
                dashboard: None,
            }],
            tasks: vec![Rule {
                id: "t1".into(),
                name: "over-temp".into(),
                source: "environmental".into(),
                field: "temperature".into(),
                operator: CompareOp::Gt,
                value: 80.0,
                actions: vec![Action::Io {
                    target: "relay_1".into(),
                    state: IoState::On,
                }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_document_passes() {
        assert!(validate(&doc(), &catalog()).is_ok());
    }

    #[test]
    fn test_duplicate_gpio_line_rejected() {
        let mut bad = doc();
        let mut second = bad.relays[0].clone();
        second.id = "relay_2".into();
        bad.relays.push(second);
        assert!(matches!(
            validate(&bad, &catalog()),
            Err(ControlError::Validation(_))
        ));
    }

    #[test]
    fn test_unresolved_rule_field_rejected() {
        let mut bad = doc();
        bad.tasks[0].field = "pressure".into();
        assert!(validate(&bad, &catalog()).is_err());
    }

    #[test]
    fn test_io_action_unknown_target_rejected() {
        let mut bad = doc();
        bad.tasks[0].actions = vec![Action::Io {
            target: "relay_9".into(),
            state: IoState::Pulse,
        }];
        assert!(validate(&bad, &catalog()).is_err());
    }

    #[test]
    fn test_bad_schedule_time_rejected() {
        let mut bad = doc();
        bad.relays[0].schedule = Some(Schedule {
            enabled: true,
            on_time: "8am".into(),
            off_time: "17:00".into(),
            days_mask: 4,
        });
        assert!(validate(&bad, &catalog()).is_err());
    }
}
