//! Periodic parallel sensor sampling.
//!
//! On every sensor tick the poller fans one read out per enabled sensor,
//! each with a hard deadline of `min(0.4 * tick, 2 s)`. A successful read
//! updates the latest-sample cache, enqueues a point for the time-series
//! sink and hands the fields to the rule engine. Failures are isolated per
//! sensor: three consecutive failures mark it unhealthy until the next
//! success.

use crate::hardware::Hardware;
use crate::rules::RuleEngine;
use crate::sensor::{Ina260, Sample, SensorConfig, SensorHealth, SensorKind, Sht30};
use crate::store::{Point, SinkHandle};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const UNHEALTHY_AFTER: u32 = 3;
const MAX_READ_DEADLINE: Duration = Duration::from_secs(2);

pub struct SensorPoller {
    hardware: Arc<dyn Hardware>,
    sensors: Vec<SensorConfig>,
    latest: Arc<DashMap<String, Sample>>,
    sink: SinkHandle,
    engine: Arc<RuleEngine>,
    health: Arc<DashMap<String, SensorHealth>>,
    seq: DashMap<String, u64>,
}

impl SensorPoller {
    pub fn new(
        hardware: Arc<dyn Hardware>,
        sensors: Vec<SensorConfig>,
        sink: SinkHandle,
        engine: Arc<RuleEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hardware,
            sensors,
            latest: Arc::new(DashMap::new()),
            sink,
            engine,
            health: Arc::new(DashMap::new()),
            seq: DashMap::new(),
        })
    }

    /// Shared handle to the latest-sample cache (`M`), read by the hub.
    pub fn latest_samples(&self) -> Arc<DashMap<String, Sample>> {
        self.latest.clone()
    }

    /// Per-sensor health, for the status endpoint.
    pub fn health_snapshot(&self) -> HashMap<String, SensorHealth> {
        self.health
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Run one tick: sample every enabled sensor in parallel and wait for
    /// all of them (each bounded by the per-read deadline).
    pub async fn poll_all(&self, tick: Duration) {
        let deadline = (tick.mul_f64(0.4)).min(MAX_READ_DEADLINE);
        let reads = self
            .sensors
            .iter()
            .filter(|s| s.enabled)
            .map(|sensor| self.read_one(sensor, deadline));
        join_all(reads).await;
    }

    async fn read_one(&self, sensor: &SensorConfig, deadline: Duration) {
        let result = tokio::time::timeout(deadline, self.fields_for(sensor)).await;
        match result {
            Ok(Ok(fields)) => self.accept(sensor, fields).await,
            Ok(Err(e)) => self.reject(sensor, &e.to_string()),
            Err(_) => self.reject(sensor, "read deadline exceeded"),
        }
    }

    async fn fields_for(
        &self,
        sensor: &SensorConfig,
    ) -> crate::hardware::HwResult<HashMap<String, f64>> {
        match sensor.kind {
            SensorKind::Power => Ok(Ina260::new(sensor.address)
                .read(self.hardware.as_ref())
                .await?
                .into_fields()),
            SensorKind::Environmental => Ok(Sht30::new(sensor.address)
                .read(self.hardware.as_ref())
                .await?
                .into_fields()),
        }
    }

    async fn accept(&self, sensor: &SensorConfig, fields: HashMap<String, f64>) {
        let sample = self.stamp(sensor, fields);
        self.latest.insert(sensor.id.clone(), sample.clone());

        let mut point = Point::new(sensor.kind.measurement()).fields(sample.fields.clone());
        point.time = sample.timestamp;
        if sensor.kind == SensorKind::Power {
            point = point.tag("relay_id", sensor.id.clone());
        }
        self.sink.push(point);

        self.engine.evaluate(&sample).await;

        self.health
            .entry(sensor.id.clone())
            .and_modify(|h| {
                h.consecutive_failures = 0;
                h.unhealthy = false;
                h.last_success = Some(sample.timestamp);
            })
            .or_insert(SensorHealth {
                consecutive_failures: 0,
                unhealthy: false,
                last_success: Some(sample.timestamp),
            });
        debug!(sensor = %sensor.id, seq = sample.seq, "sample accepted");
    }

    fn reject(&self, sensor: &SensorConfig, reason: &str) {
        let mut entry = self.health.entry(sensor.id.clone()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= UNHEALTHY_AFTER && !entry.unhealthy {
            entry.unhealthy = true;
            warn!(sensor = %sensor.id, failures = entry.consecutive_failures,
                "sensor marked unhealthy");
        } else {
            warn!(sensor = %sensor.id, %reason, "sensor read failed");
        }
    }

    /// Build the sample with a per-source sequence number derived from the
    /// timestamp, forced monotonic within this process run.
    fn stamp(&self, sensor: &SensorConfig, fields: HashMap<String, f64>) -> Sample {
        let now = Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
        let mut entry = self.seq.entry(sensor.id.clone()).or_insert(0);
        let seq = nanos.max(*entry + 1);
        *entry = seq;
        Sample {
            source_id: sensor.id.clone(),
            timestamp: now,
            seq,
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ControlHandle;
    use crate::config::ConfigManager;
    use crate::hardware::{MockHardware, Watchdog};
    use crate::rules::LatchStore;
    use crate::sensor::SensorCatalog;
    use crate::store::{KvCache, MemoryCache};

    async fn idle_engine(dir: &tempfile::TempDir) -> Arc<RuleEngine> {
        let default_path = dir.path().join("config.json");
        std::fs::write(&default_path, "{}").unwrap();
        let config = Arc::new(
            ConfigManager::load(
                default_path,
                dir.path().join("custom.json"),
                SensorCatalog::default(),
            )
            .await
            .unwrap(),
        );
        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        RuleEngine::new(
            config,
            Arc::new(LatchStore::new(cache.clone())),
            ControlHandle::new(tx),
            cache,
            Watchdog::new(dir.path().join("watchdog")),
        )
    }

    fn power_sensor(id: &str, address: u16) -> SensorConfig {
        SensorConfig {
            id: id.into(),
            kind: SensorKind::Power,
            address,
            enabled: true,
        }
    }

    fn load_registers(hw: &MockHardware, address: u16) {
        hw.set_register(address, 0x02, vec![0x25, 0x80]); // 12 V
        hw.set_register(address, 0x01, vec![0x03, 0x20]); // 1 A
        hw.set_register(address, 0x03, vec![0x04, 0xB0]); // 12 W
    }

    #[tokio::test]
    async fn test_successful_poll_updates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let hw = Arc::new(MockHardware::new());
        load_registers(&hw, 0x44);
        let poller = SensorPoller::new(
            hw,
            vec![power_sensor("relay_1", 0x44)],
            SinkHandle::disconnected(),
            idle_engine(&dir).await,
        );

        poller.poll_all(Duration::from_secs(5)).await;

        let sample = poller.latest_samples().get("relay_1").map(|s| s.clone());
        let sample = sample.unwrap();
        assert!((sample.fields["voltage"] - 12.0).abs() < 1e-9);
        let health = poller.health_snapshot();
        assert!(!health["relay_1"].unhealthy);
    }

    #[tokio::test]
    async fn test_failure_isolated_and_unhealthy_after_three() {
        let dir = tempfile::tempdir().unwrap();
        let hw = Arc::new(MockHardware::new());
        load_registers(&hw, 0x44);
        // 0x45 never answers.
        let poller = SensorPoller::new(
            hw,
            vec![power_sensor("relay_1", 0x44), power_sensor("relay_2", 0x45)],
            SinkHandle::disconnected(),
            idle_engine(&dir).await,
        );

        for _ in 0..3 {
            poller.poll_all(Duration::from_secs(5)).await;
        }

        let health = poller.health_snapshot();
        assert!(!health["relay_1"].unhealthy);
        assert!(health["relay_2"].unhealthy);
        assert_eq!(health["relay_2"].consecutive_failures, 3);
        assert!(poller.latest_samples().get("relay_2").is_none());
    }

    #[tokio::test]
    async fn test_recovery_clears_unhealthy_flag() {
        let dir = tempfile::tempdir().unwrap();
        let hw = Arc::new(MockHardware::new());
        let poller = SensorPoller::new(
            hw.clone(),
            vec![power_sensor("relay_1", 0x44)],
            SinkHandle::disconnected(),
            idle_engine(&dir).await,
        );

        for _ in 0..3 {
            poller.poll_all(Duration::from_secs(5)).await;
        }
        assert!(poller.health_snapshot()["relay_1"].unhealthy);

        load_registers(&hw, 0x44);
        poller.poll_all(Duration::from_secs(5)).await;
        assert!(!poller.health_snapshot()["relay_1"].unhealthy);
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let dir = tempfile::tempdir().unwrap();
        let hw = Arc::new(MockHardware::new());
        load_registers(&hw, 0x44);
        let poller = SensorPoller::new(
            hw,
            vec![power_sensor("relay_1", 0x44)],
            SinkHandle::disconnected(),
            idle_engine(&dir).await,
        );

        poller.poll_all(Duration::from_secs(5)).await;
        let first = poller.latest_samples().get("relay_1").map(|s| s.seq).unwrap();
        poller.poll_all(Duration::from_secs(5)).await;
        let second = poller.latest_samples().get("relay_1").map(|s| s.seq).unwrap();
        assert!(second > first);
    }
}
