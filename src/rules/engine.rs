//! Edge-triggered rule evaluation and action dispatch.
//!
//! Every sample is checked against the rules listening to its source, in
//! configured order. Actions fire exactly once per not-triggered → triggered
//! transition; the clearing transition only stamps the latch. An action
//! failure never rolls the latch back (the transition already happened);
//! it is retried with backoff and finally recorded to the cache.

use crate::bus::{ControlHandle, RelayOp};
use crate::config::ConfigManager;
use crate::error::AppResult;
use crate::hardware::Watchdog;
use crate::rules::{Action, IoState, LatchStore, Rule, RuleStatus};
use crate::sensor::Sample;
use crate::store::KvCache;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Action retry schedule: 3 attempts, exponential backoff from 100 ms.
const ACTION_ATTEMPTS: u32 = 3;
const ACTION_BACKOFF_BASE: Duration = Duration::from_millis(100);

const REBOOT_DEBOUNCE_KEY: &str = "system_reboot_scheduled";
const REBOOT_DEBOUNCE: Duration = Duration::from_secs(60);
const ACTION_LOG_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

pub struct RuleEngine {
    config: Arc<ConfigManager>,
    latches: Arc<LatchStore>,
    bus: ControlHandle,
    cache: Arc<dyn KvCache>,
    watchdog: Watchdog,
}

impl RuleEngine {
    pub fn new(
        config: Arc<ConfigManager>,
        latches: Arc<LatchStore>,
        bus: ControlHandle,
        cache: Arc<dyn KvCache>,
        watchdog: Watchdog,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            latches,
            bus,
            cache,
            watchdog,
        })
    }

    pub fn latches(&self) -> Arc<LatchStore> {
        self.latches.clone()
    }

    fn action_runner(&self) -> ActionRunner {
        ActionRunner {
            bus: self.bus.clone(),
            cache: self.cache.clone(),
            watchdog: self.watchdog.clone(),
            latches: self.latches.clone(),
        }
    }

    /// Evaluate one sample against every rule listening to its source.
    pub async fn evaluate(&self, sample: &Sample) {
        let doc = self.config.effective();
        for rule in doc.tasks.iter().filter(|r| r.source == sample.source_id) {
            let Some(&value) = sample.fields.get(&rule.field) else {
                warn!(rule = %rule.id, field = %rule.field,
                    "field missing from sample, skipping");
                continue;
            };
            let condition = rule.operator.evaluate(value, rule.value);
            let previously = self.latches.is_triggered(&rule.id);
            match (previously, condition) {
                (false, true) => {
                    info!(rule = %rule.name, %value, threshold = rule.value, "rule triggered");
                    self.latches.mark_triggered(&rule.id).await;
                    for action in rule.actions.clone() {
                        let runner = self.action_runner();
                        let rule = rule.clone();
                        let fields = sample.fields.clone();
                        tokio::spawn(async move {
                            runner.run_with_retry(&rule, action, &fields).await;
                        });
                    }
                }
                (true, false) => {
                    info!(rule = %rule.name, %value, threshold = rule.value, "rule cleared");
                    self.latches.mark_cleared(&rule.id).await;
                }
                _ => {}
            }
        }
    }
}

/// Everything an action needs once it has been detached from the
/// evaluation path.
#[derive(Clone)]
struct ActionRunner {
    bus: ControlHandle,
    cache: Arc<dyn KvCache>,
    watchdog: Watchdog,
    latches: Arc<LatchStore>,
}

impl ActionRunner {
    async fn run_with_retry(
        &self,
        rule: &Rule,
        action: Action,
        fields: &std::collections::HashMap<String, f64>,
    ) {
        use rand::Rng;
        let mut backoff = ACTION_BACKOFF_BASE;
        for attempt in 1..=ACTION_ATTEMPTS {
            match self.run_action(rule, &action, fields).await {
                Ok(()) => return,
                Err(e) if attempt < ACTION_ATTEMPTS => {
                    warn!(rule = %rule.id, %attempt, error = %e, "action failed, retrying");
                    let jitter_ms =
                        rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(rule = %rule.id, error = %e, "action failed after final attempt");
                    self.latches
                        .record_action_error(&rule.id, &e.to_string())
                        .await;
                }
            }
        }
    }

    async fn run_action(
        &self,
        rule: &Rule,
        action: &Action,
        fields: &std::collections::HashMap<String, f64>,
    ) -> AppResult<()> {
        match action {
            Action::Io { target, state } => {
                let op = match state {
                    IoState::On => RelayOp::On,
                    IoState::Off => RelayOp::Off,
                    // Duration resolves to the target relay's configured
                    // pulse_time inside the authority.
                    IoState::Pulse => RelayOp::Pulse,
                };
                self.bus.relay_command(op, target, None).await?;
                Ok(())
            }
            Action::Log { message } => {
                let message = message
                    .clone()
                    .unwrap_or_else(|| format!("Alert from rule '{}'", rule.name));
                info!(rule = %rule.name, %message, data = ?fields, "rule alert");
                let record = serde_json::json!({
                    "message": message,
                    "data": fields,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                let key = format!("task_log:{}:{}", rule.name, Utc::now().timestamp());
                // Best-effort: a dead cache must not fail the action.
                if let Err(e) = self
                    .cache
                    .set(&key, &record.to_string(), Some(ACTION_LOG_RETENTION))
                    .await
                {
                    warn!(error = %e, "could not persist rule alert");
                }
                Ok(())
            }
            Action::Reboot => {
                if self.cache.exists(REBOOT_DEBOUNCE_KEY).await.unwrap_or(false) {
                    info!("reboot already scheduled, skipping");
                    return Ok(());
                }
                let _ = self
                    .cache
                    .set(REBOOT_DEBOUNCE_KEY, "1", Some(REBOOT_DEBOUNCE))
                    .await;
                self.watchdog.arm()
            }
        }
    }
}

/// Build the rule status table from the configured rules and their latches.
pub fn rule_status(rules: &[Rule], latches: &LatchStore) -> Vec<RuleStatus> {
    rules
        .iter()
        .map(|rule| {
            let latch = latches.snapshot(&rule.id);
            RuleStatus {
                id: rule.id.clone(),
                name: rule.name.clone(),
                source: rule.source.clone(),
                field: rule.field.clone(),
                operator: rule.operator,
                value: rule.value,
                actions_count: rule.actions.len(),
                triggered: latch.triggered,
                last_triggered: latch.last_triggered_at,
                last_cleared: latch.last_cleared_at,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Command;
    use crate::rules::CompareOp;
    use crate::sensor::{SensorCatalog, SensorConfig, SensorKind};
    use crate::store::MemoryCache;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    async fn engine_with_rule(
        operator: CompareOp,
        threshold: f64,
        actions: Vec<Action>,
    ) -> (Arc<RuleEngine>, Arc<Mutex<Vec<(RelayOp, String)>>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let default_path = dir.path().join("config.json");
        let doc = serde_json::json!({
            "relays": [
                {"id": "relay_6", "gpio_line": 23, "polarity": "normally_open",
                 "enabled": true, "pulse_time": 5}
            ],
            "tasks": [{
                "id": "t1", "name": "test rule", "source": "environmental",
                "field": "temperature",
                "operator": serde_json::to_value(operator).unwrap(),
                "value": threshold,
                "actions": serde_json::to_value(&actions).unwrap(),
            }]
        });
        std::fs::write(&default_path, doc.to_string()).unwrap();
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

        // Record relay commands instead of running a dispatcher.
        let (tx, mut rx) = mpsc::channel::<Command>(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_task = seen.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let Command::Relay {
                    op, id, respond, ..
                } = command
                {
                    seen_in_task.lock().unwrap().push((op, id.clone()));
                    let _ = respond.send(Ok(crate::bus::RelayReply::Switched(
                        crate::relay::SwitchOutcome {
                            id,
                            state: crate::relay::RelayState::On,
                            confirmed: true,
                        },
                    )));
                }
            }
        });

        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let latches = Arc::new(LatchStore::new(cache.clone()));
        let watchdog = Watchdog::new(dir.path().join("watchdog"));
        let engine = RuleEngine::new(config, latches, ControlHandle::new(tx), cache, watchdog);
        (engine, seen, dir)
    }

    fn sample(value: f64, seq: u64) -> Sample {
        Sample::new(
            "environmental",
            seq,
            HashMap::from([("temperature".to_string(), value)]),
        )
    }

    #[tokio::test]
    async fn test_edge_triggering_fires_exactly_on_edges() {
        let (engine, seen, _dir) = engine_with_rule(
            CompareOp::Gt,
            10.0,
            vec![Action::Io {
                target: "relay_6".into(),
                state: IoState::On,
            }],
        )
        .await;

        for (seq, value) in [9.0, 10.0, 11.0, 12.0, 11.0, 9.0, 8.0, 11.0]
            .into_iter()
            .enumerate()
        {
            engine.evaluate(&sample(value, seq as u64)).await;
        }
        // Give spawned action tasks a moment to land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2, "actions must fire on the two rising edges only");
        assert!(seen.iter().all(|(op, id)| *op == RelayOp::On && id == "relay_6"));
    }

    #[tokio::test]
    async fn test_missing_field_is_skipped() {
        let (engine, seen, _dir) =
            engine_with_rule(CompareOp::Gt, 10.0, vec![Action::Reboot]).await;
        let sample = Sample::new(
            "environmental",
            0,
            HashMap::from([("humidity".to_string(), 99.0)]),
        );
        engine.evaluate(&sample).await;
        assert!(!engine.latches().is_triggered("t1"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reboot_is_debounced() {
        let (engine, _seen, dir) =
            engine_with_rule(CompareOp::Gt, 10.0, vec![Action::Reboot]).await;
        std::fs::write(dir.path().join("watchdog"), b"").unwrap();

        engine.evaluate(&sample(11.0, 0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(std::fs::read(dir.path().join("watchdog")).unwrap(), b"1");

        // Clear and re-trigger inside the debounce window: no second arm.
        std::fs::write(dir.path().join("watchdog"), b"").unwrap();
        engine.evaluate(&sample(9.0, 1)).await;
        engine.evaluate(&sample(11.0, 2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(std::fs::read(dir.path().join("watchdog")).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_rule_status_table() {
        let (engine, _seen, _dir) = engine_with_rule(
            CompareOp::Gt,
            10.0,
            vec![Action::Log { message: None }],
        )
        .await;
        engine.evaluate(&sample(11.0, 0)).await;

        let doc = engine.config.effective();
        let table = rule_status(&doc.tasks, &engine.latches());
        assert_eq!(table.len(), 1);
        assert!(table[0].triggered);
        assert_eq!(table[0].actions_count, 1);
        assert!(table[0].last_triggered.is_some());
    }
}
