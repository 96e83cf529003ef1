//! Configuration manager: load, merge, validate, persist, notify.
//!
//! The effective document is copy-on-write: readers get an `Arc` snapshot
//! that is never mutated after publication. Writes rebuild the merge from
//! the raw default/custom trees, validate, persist the custom overlay
//! atomically (write-to-temp + rename) and only then swap the snapshot and
//! notify listeners. A failed validation leaves both disk and memory
//! untouched.

use crate::config::{merge::deep_merge, validate, ConfigDocument, SECTIONS};
use crate::error::{AppResult, ControlError};
use crate::sensor::SensorCatalog;
use futures::future::BoxFuture;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Per-listener notification deadline.
const LISTENER_DEADLINE: Duration = Duration::from_secs(5);

/// Async callback invoked with every new effective document. Listeners must
/// not write back into the manager synchronously.
pub type ChangeListener =
    Box<dyn Fn(Arc<ConfigDocument>) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ConfigManager {
    default_path: PathBuf,
    custom_path: PathBuf,
    catalog: SensorCatalog,
    default_raw: Value,
    custom_raw: RwLock<Value>,
    effective_raw: RwLock<Value>,
    effective: RwLock<Arc<ConfigDocument>>,
    listeners: tokio::sync::Mutex<Vec<ChangeListener>>,
}

impl ConfigManager {
    /// Load both documents and produce the first effective snapshot. An
    /// unreadable or invalid *default* document is fatal; a broken custom
    /// overlay is discarded with a warning.
    pub async fn load(
        default_path: impl Into<PathBuf>,
        custom_path: impl Into<PathBuf>,
        catalog: SensorCatalog,
    ) -> AppResult<Self> {
        let default_path = default_path.into();
        let custom_path = custom_path.into();

        let default_text = tokio::fs::read_to_string(&default_path).await.map_err(|e| {
            ControlError::Validation(format!(
                "cannot read default config {}: {e}",
                default_path.display()
            ))
        })?;
        let default_raw: Value = serde_json::from_str(&default_text).map_err(|e| {
            ControlError::Validation(format!("default config is not valid JSON: {e}"))
        })?;

        let custom_raw = match tokio::fs::read_to_string(&custom_path).await {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = %custom_path.display(), error = %e,
                        "custom config is not valid JSON, ignoring it");
                    Value::Object(Default::default())
                }
            },
            Err(_) => {
                info!("no custom configuration found");
                Value::Object(Default::default())
            }
        };

        let (effective_raw, effective) =
            Self::build_effective(&default_raw, &custom_raw, &catalog)?;
        info!(path = %default_path.display(), "configuration loaded");

        Ok(Self {
            default_path,
            custom_path,
            catalog,
            default_raw,
            custom_raw: RwLock::new(custom_raw),
            effective_raw: RwLock::new(effective_raw),
            effective: RwLock::new(Arc::new(effective)),
            listeners: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    fn build_effective(
        default_raw: &Value,
        custom_raw: &Value,
        catalog: &SensorCatalog,
    ) -> AppResult<(Value, ConfigDocument)> {
        let mut merged = default_raw.clone();
        deep_merge(&mut merged, custom_raw);
        let doc: ConfigDocument = serde_json::from_value(merged.clone())
            .map_err(|e| ControlError::Validation(format!("config schema: {e}")))?;
        validate(&doc, catalog)?;
        Ok((merged, doc))
    }

    /// Immutable snapshot of the effective document.
    pub fn effective(&self) -> Arc<ConfigDocument> {
        self.effective
            .read()
            .map(|doc| doc.clone())
            .unwrap_or_default()
    }

    /// Deep copy of the effective document as raw JSON, for the API.
    pub fn effective_value(&self) -> Value {
        self.effective_raw
            .read()
            .map(|raw| raw.clone())
            .unwrap_or(Value::Null)
    }

    /// One section of the effective document, or `None` for an unknown name.
    pub fn section(&self, name: &str) -> Option<Value> {
        if !SECTIONS.contains(&name) {
            return None;
        }
        self.effective_value().get(name).cloned()
    }

    /// Deep copy of the default document.
    pub fn default_value(&self) -> Value {
        self.default_raw.clone()
    }

    /// Replace the entire custom overlay.
    pub async fn update_full(&self, custom: Value) -> AppResult<Arc<ConfigDocument>> {
        self.commit(custom).await
    }

    /// Replace one section of the custom overlay. An empty overlay is first
    /// seeded from the default document so the write captures a complete
    /// picture of what the user sees.
    pub async fn update_section(&self, name: &str, section: Value) -> AppResult<Value> {
        if !SECTIONS.contains(&name) {
            return Err(ControlError::NotFound(format!("config section '{name}'")));
        }
        let mut custom = self
            .custom_raw
            .read()
            .map(|raw| raw.clone())
            .unwrap_or(Value::Null);
        if !custom.as_object().is_some_and(|obj| !obj.is_empty()) {
            custom = self.default_raw.clone();
        }
        if let Value::Object(map) = &mut custom {
            map.insert(name.to_string(), section);
        }
        self.commit(custom).await?;
        self.section(name)
            .ok_or_else(|| ControlError::Internal("section vanished after update".into()))
    }

    /// Drop the custom overlay entirely and return to the defaults.
    pub async fn revert_to_defaults(&self) -> AppResult<Arc<ConfigDocument>> {
        let empty = Value::Object(Default::default());
        let (effective_raw, effective) =
            Self::build_effective(&self.default_raw, &empty, &self.catalog)?;
        if self.custom_path.exists() {
            if let Err(e) = tokio::fs::remove_file(&self.custom_path).await {
                error!(path = %self.custom_path.display(), error = %e,
                    "failed to delete custom config");
            }
        }
        let snapshot = self.publish(empty, effective_raw, effective);
        self.notify(snapshot.clone()).await;
        Ok(snapshot)
    }

    async fn commit(&self, custom: Value) -> AppResult<Arc<ConfigDocument>> {
        let (effective_raw, effective) =
            Self::build_effective(&self.default_raw, &custom, &self.catalog)?;
        self.persist_custom(&custom).await?;
        let snapshot = self.publish(custom, effective_raw, effective);
        self.notify(snapshot.clone()).await;
        Ok(snapshot)
    }

    fn publish(
        &self,
        custom: Value,
        effective_raw: Value,
        effective: ConfigDocument,
    ) -> Arc<ConfigDocument> {
        let snapshot = Arc::new(effective);
        if let Ok(mut slot) = self.custom_raw.write() {
            *slot = custom;
        }
        if let Ok(mut slot) = self.effective_raw.write() {
            *slot = effective_raw;
        }
        if let Ok(mut slot) = self.effective.write() {
            *slot = snapshot.clone();
        }
        snapshot
    }

    async fn persist_custom(&self, custom: &Value) -> AppResult<()> {
        let text = serde_json::to_string_pretty(custom)?;
        let tmp = self.custom_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.custom_path).await?;
        info!(path = %self.custom_path.display(), "custom configuration saved");
        Ok(())
    }

    /// Register a change listener. Fired with the new snapshot after every
    /// successful commit; a listener that exceeds its deadline is skipped
    /// for that cycle but stays registered.
    pub async fn register_listener(&self, listener: ChangeListener) {
        self.listeners.lock().await.push(listener);
    }

    async fn notify(&self, snapshot: Arc<ConfigDocument>) {
        let listeners = self.listeners.lock().await;
        for (index, listener) in listeners.iter().enumerate() {
            let fut = listener(snapshot.clone());
            if tokio::time::timeout(LISTENER_DEADLINE, fut).await.is_err() {
                warn!(listener = index, "config listener exceeded deadline, skipping");
            }
        }
    }

    pub fn default_path(&self) -> &Path {
        &self.default_path
    }
}
