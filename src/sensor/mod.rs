//! Sensor descriptors, samples and drivers.
//!
//! Two sensor kinds exist on the board: INA260 power monitors (one per
//! relay plus the main rail) and a single SHT30 environmental sensor. Each
//! kind declares the field names rules may reference; configuration
//! validation rejects rules whose `(source, field)` pair no sensor
//! declares.

pub mod ina260;
pub mod poller;
pub mod sht30;

pub use ina260::Ina260;
pub use poller::SensorPoller;
pub use sht30::Sht30;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Power,
    Environmental,
}

impl SensorKind {
    /// Field names samples of this kind carry and rules may reference.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            SensorKind::Power => &["voltage", "current", "power"],
            SensorKind::Environmental => &["temperature", "humidity"],
        }
    }

    /// Measurement name used for time-series points of this kind.
    pub fn measurement(self) -> &'static str {
        match self {
            SensorKind::Power => "relay_power",
            SensorKind::Environmental => "environmental",
        }
    }
}

/// A configured sensor. `id` doubles as the source id in samples and rules
/// (power sensors are named after the relay they monitor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    pub kind: SensorKind,
    pub address: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The set of configured sensors, used to resolve rule references.
#[derive(Debug, Clone, Default)]
pub struct SensorCatalog {
    pub sensors: Vec<SensorConfig>,
}

impl SensorCatalog {
    pub fn new(sensors: Vec<SensorConfig>) -> Self {
        Self { sensors }
    }

    /// Whether some sensor declares the `(source, field)` pair.
    pub fn resolves(&self, source: &str, field: &str) -> bool {
        self.sensors
            .iter()
            .any(|s| s.id == source && s.kind.fields().contains(&field))
    }
}

/// One reading from one source. `seq` increases monotonically per source
/// within a process run and is derived from the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
    pub fields: HashMap<String, f64>,
}

impl Sample {
    pub fn new(source_id: impl Into<String>, seq: u64, fields: HashMap<String, f64>) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp: Utc::now(),
            seq,
            fields,
        }
    }
}

/// Health bookkeeping for one sensor, exposed by the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorHealth {
    pub consecutive_failures: u32,
    pub unhealthy: bool,
    pub last_success: Option<DateTime<Utc>>,
}
