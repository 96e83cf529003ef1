//! Process settings from the environment.
//!
//! Everything the process needs before the configuration documents are
//! readable: store URLs, credential hashes, the JWT secret, file paths and
//! the hardware identity of the board. Secrets carry no defaults; a
//! missing `POWERD_SECRET_KEY` is a fatal startup error by design.

use crate::error::{AppResult, ControlError};
use crate::sensor::{SensorConfig, SensorKind};
use figment::providers::Env;
use figment::Figment;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::app_name")]
    pub app_name: String,
    #[serde(default = "defaults::listen_addr")]
    pub listen_addr: String,

    // Token issuance. No defaults for secrets.
    pub secret_key: String,
    #[serde(default = "defaults::algorithm")]
    pub algorithm: String,
    #[serde(default = "defaults::token_expire_minutes")]
    pub access_token_expire_minutes: u64,

    // Credential store: usernames plus argon2 PHC hashes.
    #[serde(default = "defaults::user_username")]
    pub user_username: String,
    pub hashed_user_password: String,
    #[serde(default = "defaults::admin_username")]
    pub admin_username: String,
    pub hashed_admin_password: String,
    /// Shared secret for internal callers; equivalent to admin.
    #[serde(default)]
    pub internal_token: Option<String>,

    // Time-series store.
    #[serde(default = "defaults::influxdb_url")]
    pub influxdb_url: String,
    #[serde(default = "defaults::influxdb_org")]
    pub influxdb_org: String,
    #[serde(default = "defaults::influxdb_bucket")]
    pub influxdb_bucket: String,
    pub influxdb_token: String,

    // KV cache; absent means in-process fallback only.
    #[serde(default)]
    pub redis_url: Option<String>,

    // Documents and devices.
    #[serde(default = "defaults::default_config_path")]
    pub default_config_path: PathBuf,
    #[serde(default = "defaults::custom_config_path")]
    pub custom_config_path: PathBuf,
    #[serde(default = "defaults::watchdog_path")]
    pub watchdog_path: PathBuf,
    #[serde(default)]
    pub ssl_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub ssl_key_file: Option<PathBuf>,

    /// Board sensor map. The default matches the shipped hardware: one
    /// INA260 per relay plus the main rail, and the SHT30.
    #[serde(default = "defaults::sensors")]
    pub sensors: Vec<SensorConfig>,
}

impl Settings {
    /// Read settings from `POWERD_*` environment variables.
    pub fn from_env() -> AppResult<Self> {
        Figment::new()
            .merge(Env::prefixed("POWERD_"))
            .extract()
            .map_err(|e| ControlError::Validation(format!("environment: {e}")))
    }
}

mod defaults {
    use super::*;

    pub fn app_name() -> String {
        "powerd".to_string()
    }

    pub fn listen_addr() -> String {
        "0.0.0.0:8000".to_string()
    }

    pub fn algorithm() -> String {
        "HS256".to_string()
    }

    pub fn token_expire_minutes() -> u64 {
        60
    }

    pub fn user_username() -> String {
        "user".to_string()
    }

    pub fn admin_username() -> String {
        "admin".to_string()
    }

    pub fn influxdb_url() -> String {
        "http://influxdb:8086".to_string()
    }

    pub fn influxdb_org() -> String {
        "RPi".to_string()
    }

    pub fn influxdb_bucket() -> String {
        "Raw_Data".to_string()
    }

    pub fn default_config_path() -> PathBuf {
        PathBuf::from("config/config.json")
    }

    pub fn custom_config_path() -> PathBuf {
        PathBuf::from("config/custom_config.json")
    }

    pub fn watchdog_path() -> PathBuf {
        PathBuf::from("/dev/watchdog")
    }

    pub fn sensors() -> Vec<SensorConfig> {
        let power = [
            ("relay_1", 0x44),
            ("relay_2", 0x45),
            ("relay_3", 0x46),
            ("relay_4", 0x47),
            ("relay_5", 0x48),
            ("relay_6", 0x49),
            ("main", 0x4B),
        ];
        let mut sensors: Vec<SensorConfig> = power
            .into_iter()
            .map(|(id, address)| SensorConfig {
                id: id.to_string(),
                kind: SensorKind::Power,
                address,
                enabled: true,
            })
            .collect();
        sensors.push(SensorConfig {
            id: "environmental".to_string(),
            kind: SensorKind::Environmental,
            address: 0x45,
            enabled: true,
        });
        sensors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sensor_map() {
        let sensors = defaults::sensors();
        assert_eq!(sensors.len(), 8);
        assert!(sensors.iter().any(|s| s.id == "main" && s.address == 0x4B));
        assert!(sensors
            .iter()
            .any(|s| s.kind == SensorKind::Environmental));
    }
}
