//! End-to-end: an environmental sample trips a rule, the rule's io action
//! crosses the command bus, the dispatcher drives the relay authority, and
//! the relay switches exactly once.

use powerd::bus::{ControlHandle, Dispatcher};
use powerd::config::ConfigManager;
use powerd::hardware::{MockHardware, Watchdog};
use powerd::relay::{RelayAuthority, RelayState};
use powerd::rules::{LatchStore, RuleEngine};
use powerd::sensor::{Sample, SensorCatalog, SensorConfig, SensorKind};
use powerd::store::{KvCache, MemoryCache};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn harness(dir: &tempfile::TempDir) -> (Arc<RuleEngine>, Arc<RelayAuthority>, Arc<MockHardware>) {
    let default_path = dir.path().join("config.json");
    std::fs::write(
        &default_path,
        json!({
            "relays": [
                {"id": "relay_6", "gpio_line": 23, "polarity": "normally_open",
                 "enabled": true, "pulse_time": 5}
            ],
            "tasks": [{
                "id": "t1", "name": "over-temp", "source": "environmental",
                "field": "temperature", "operator": ">", "value": 80.0,
                "actions": [{"type": "io", "target": "relay_6", "state": "on"}]
            }]
        })
        .to_string(),
    )
    .unwrap();
    let catalog = SensorCatalog::new(vec![SensorConfig {
        id: "environmental".into(),
        kind: SensorKind::Environmental,
        address: 0x45,
        enabled: true,
    }]);
    let config = Arc::new(
        ConfigManager::load(default_path, dir.path().join("custom.json"), catalog)
            .await
            .unwrap(),
    );

    let hardware = Arc::new(MockHardware::new());
    let authority = Arc::new(RelayAuthority::new(hardware.clone()));
    authority.apply_config(&config.effective().relays).await;

    let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
    let latches = Arc::new(LatchStore::new(cache.clone()));
    let watchdog = Watchdog::new(dir.path().join("watchdog"));

    let (tx, rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(
        Dispatcher::new(
            authority.clone(),
            config.clone(),
            latches.clone(),
            cache.clone(),
            watchdog.clone(),
        )
        .run(rx),
    );

    let engine = RuleEngine::new(config, latches, ControlHandle::new(tx), cache, watchdog);
    (engine, authority, hardware)
}

fn env_sample(temperature: f64, seq: u64) -> Sample {
    Sample::new(
        "environmental",
        seq,
        HashMap::from([("temperature".to_string(), temperature)]),
    )
}

#[tokio::test]
async fn hot_sample_switches_the_relay_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, authority, hardware) = harness(&dir).await;
    assert_eq!(authority.get("relay_6").await.unwrap(), RelayState::Off);

    engine.evaluate(&env_sample(85.0, 1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(authority.get("relay_6").await.unwrap(), RelayState::On);
    let writes_after_first = hardware
        .line_writes()
        .iter()
        .filter(|w| w.line == 23)
        .count();
    assert_eq!(writes_after_first, 1);

    // A second identical sample observes the latched state: no new action.
    engine.evaluate(&env_sample(85.0, 2)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let writes_after_second = hardware
        .line_writes()
        .iter()
        .filter(|w| w.line == 23)
        .count();
    assert_eq!(writes_after_second, writes_after_first);
}

#[tokio::test]
async fn relay_fires_again_after_the_rule_clears() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, authority, _hardware) = harness(&dir).await;

    engine.evaluate(&env_sample(85.0, 1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.latches().is_triggered("t1"));

    // Cool down: latch clears, no action fires on the clearing edge.
    engine.evaluate(&env_sample(20.0, 2)).await;
    assert!(!engine.latches().is_triggered("t1"));

    // Turn the relay off manually, then re-trigger.
    authority.turn_off("relay_6").await.unwrap();
    engine.evaluate(&env_sample(90.0, 3)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(authority.get("relay_6").await.unwrap(), RelayState::On);
}
