//! Per-rule trigger latches.
//!
//! The latch is the authoritative edge detector: actions fire only when a
//! rule goes not-triggered → triggered. The in-memory map is the source of
//! truth; every transition is mirrored to the KV cache best-effort so state
//! survives a restart. With no cache a cold start reconstructs every latch
//! as `false`.

use crate::store::KvCache;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn state_key(id: &str) -> String {
    format!("rule_state:{id}")
}

fn triggered_key(id: &str) -> String {
    format!("rule_triggered_at:{id}")
}

fn cleared_key(id: &str) -> String {
    format!("rule_cleared_at:{id}")
}

#[derive(Debug, Clone, Default)]
pub struct LatchSnapshot {
    pub triggered: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_cleared_at: Option<DateTime<Utc>>,
}

pub struct LatchStore {
    latches: DashMap<String, LatchSnapshot>,
    cache: Arc<dyn KvCache>,
}

impl LatchStore {
    pub fn new(cache: Arc<dyn KvCache>) -> Self {
        Self {
            latches: DashMap::new(),
            cache,
        }
    }

    /// Rebuild latches from the cache for the given rule ids. Errors are
    /// swallowed: an unreachable cache means everything starts `false`.
    pub async fn hydrate(&self, rule_ids: impl IntoIterator<Item = String>) {
        for id in rule_ids {
            let triggered = matches!(
                self.cache.get(&state_key(&id)).await,
                Ok(Some(v)) if v == "1"
            );
            let last_triggered_at = self.read_timestamp(&triggered_key(&id)).await;
            let last_cleared_at = self.read_timestamp(&cleared_key(&id)).await;
            debug!(rule = %id, triggered, "hydrated latch");
            self.latches.insert(
                id,
                LatchSnapshot {
                    triggered,
                    last_triggered_at,
                    last_cleared_at,
                },
            );
        }
    }

    async fn read_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.cache.get(key).await {
            Ok(Some(text)) => text.parse().ok(),
            _ => None,
        }
    }

    pub fn is_triggered(&self, id: &str) -> bool {
        self.latches.get(id).map(|l| l.triggered).unwrap_or(false)
    }

    pub fn snapshot(&self, id: &str) -> LatchSnapshot {
        self.latches.get(id).map(|l| l.clone()).unwrap_or_default()
    }

    /// Flip the latch to triggered and stamp the transition.
    pub async fn mark_triggered(&self, id: &str) {
        let now = Utc::now();
        self.latches
            .entry(id.to_string())
            .and_modify(|l| {
                l.triggered = true;
                l.last_triggered_at = Some(now);
            })
            .or_insert(LatchSnapshot {
                triggered: true,
                last_triggered_at: Some(now),
                last_cleared_at: None,
            });
        let _ = self.cache.set(&state_key(id), "1", None).await;
        let _ = self
            .cache
            .set(&triggered_key(id), &now.to_rfc3339(), None)
            .await;
    }

    /// Flip the latch to cleared and stamp the transition.
    pub async fn mark_cleared(&self, id: &str) {
        let now = Utc::now();
        self.latches
            .entry(id.to_string())
            .and_modify(|l| {
                l.triggered = false;
                l.last_cleared_at = Some(now);
            })
            .or_insert(LatchSnapshot {
                triggered: false,
                last_triggered_at: None,
                last_cleared_at: Some(now),
            });
        let _ = self.cache.set(&state_key(id), "0", None).await;
        let _ = self
            .cache
            .set(&cleared_key(id), &now.to_rfc3339(), None)
            .await;
    }

    /// Record a final action failure for operators, 24 h retention.
    pub async fn record_action_error(&self, rule_id: &str, error: &str) {
        let _ = self
            .cache
            .set(
                &format!("rule_error:{rule_id}"),
                error,
                Some(Duration::from_secs(24 * 3600)),
            )
            .await;
    }
}
