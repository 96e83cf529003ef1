//! Write-behind sink and query pass-through for the time-series store.
//!
//! The sink owns a worker task: producers hand points off through a bounded
//! channel and forget them. The worker batches (size or interval, whichever
//! comes first) and posts line protocol to the store's v2 write endpoint
//! behind a circuit breaker. Queries are synchronous pass-throughs that open
//! a dedicated connection each time so a slow query can never wedge the
//! write path.

use crate::error::{AppResult, ControlError};
use crate::store::CircuitBreaker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection coordinates for the store.
#[derive(Debug, Clone)]
pub struct InfluxSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

/// One measurement point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: HashMap<String, f64>,
    pub time: DateTime<Utc>,
}

fn escape_ident(text: &str) -> String {
    text.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: HashMap::new(),
            time: Utc::now(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn fields(mut self, fields: HashMap<String, f64>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Render to InfluxDB line protocol with nanosecond timestamps.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_ident(&self.measurement);
        for (key, value) in &self.tags {
            let _ = write!(line, ",{}={}", escape_ident(key), escape_ident(value));
        }
        line.push(' ');
        let mut fields: Vec<_> = self.fields.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (i, (key, value)) in fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            let _ = write!(line, "{}={}", escape_ident(key), value);
        }
        let _ = write!(
            line,
            " {}",
            self.time.timestamp_nanos_opt().unwrap_or_default()
        );
        line
    }
}

/// Cloneable producer side of the sink. `push` never blocks; when the
/// buffer is full the point is dropped with a warning.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<Point>,
}

impl SinkHandle {
    pub fn push(&self, point: Point) {
        if let Err(e) = self.tx.try_send(point) {
            warn!("time-series buffer full, dropping point: {e}");
        }
    }

    /// A handle wired to nothing, for tests and degraded startup.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

pub struct InfluxSink {
    settings: InfluxSettings,
    batch_size: usize,
    flush_interval: Duration,
    breaker: Arc<CircuitBreaker>,
    client: reqwest::Client,
}

impl InfluxSink {
    pub fn new(settings: InfluxSettings) -> Self {
        Self {
            settings,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            breaker: Arc::new(CircuitBreaker::new(
                "influx-write",
                DEFAULT_FAILURE_THRESHOLD,
                DEFAULT_RESET_TIMEOUT,
            )),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_batching(mut self, batch_size: usize, flush_interval: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, reset_timeout: Duration) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new("influx-write", threshold, reset_timeout));
        self
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    /// Spawn the worker. Dropping every `SinkHandle` triggers a final flush
    /// and ends the task.
    pub fn spawn(self) -> (SinkHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Point>(1024);
        let handle = SinkHandle { tx };
        let task = tokio::spawn(async move {
            let mut batch: Vec<Point> = Vec::with_capacity(self.batch_size);
            let mut interval = tokio::time::interval(self.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(point) => {
                            batch.push(point);
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await;
                            break;
                        }
                    },
                    _ = interval.tick() => {
                        if !batch.is_empty() {
                            self.flush(&mut batch).await;
                        }
                    }
                }
            }
            debug!("time-series sink worker stopped");
        });
        (handle, task)
    }

    async fn flush(&self, batch: &mut Vec<Point>) {
        if batch.is_empty() {
            return;
        }
        let points = std::mem::take(batch);
        if !self.breaker.allow() {
            warn!(dropped = points.len(), "store breaker open, dropping batch");
            return;
        }
        match self.write_batch(&points).await {
            Ok(()) => {
                debug!(points = points.len(), "flushed batch");
                self.breaker.record_success();
            }
            Err(e) => {
                warn!(error = %e, points = points.len(), "batch write failed");
                self.breaker.record_failure();
            }
        }
    }

    async fn write_batch(&self, points: &[Point]) -> AppResult<()> {
        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");
        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            self.settings.url.trim_end_matches('/'),
            self.settings.org,
            self.settings.bucket
        );
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.settings.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ControlError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ControlError::Backend(format!(
                "store write returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// One row of a Flux query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRow {
    pub time: String,
    pub value: f64,
}

/// Synchronous query pass-through. Each call builds a dedicated client so
/// query failures and slow responses stay isolated from the write worker.
#[derive(Clone)]
pub struct InfluxQuery {
    settings: InfluxSettings,
}

impl InfluxQuery {
    pub fn new(settings: InfluxSettings) -> Self {
        Self { settings }
    }

    pub async fn query(&self, flux: &str) -> AppResult<Vec<QueryRow>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ControlError::Backend(e.to_string()))?;
        let url = format!(
            "{}/api/v2/query?org={}",
            self.settings.url.trim_end_matches('/'),
            self.settings.org
        );
        let response = client
            .post(url)
            .header("Authorization", format!("Token {}", self.settings.token))
            .header("Accept", "application/csv")
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({"query": flux, "type": "flux"}))
            .send()
            .await
            .map_err(|e| ControlError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ControlError::Backend(format!(
                "store query returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ControlError::Backend(e.to_string()))?;
        Ok(parse_flux_csv(&body))
    }
}

/// Extract `(_time, _value)` pairs from annotated CSV. Annotation lines
/// start with `#`; each table repeats its header row.
pub fn parse_flux_csv(body: &str) -> Vec<QueryRow> {
    let mut rows = Vec::new();
    let mut time_idx = None;
    let mut value_idx = None;
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        if cells.iter().any(|c| *c == "_time") {
            time_idx = cells.iter().position(|c| *c == "_time");
            value_idx = cells.iter().position(|c| *c == "_value");
            continue;
        }
        let (Some(ti), Some(vi)) = (time_idx, value_idx) else {
            continue;
        };
        if let (Some(time), Some(value)) = (cells.get(ti), cells.get(vi)) {
            if let Ok(value) = value.parse::<f64>() {
                rows.push(QueryRow {
                    time: (*time).to_string(),
                    value,
                });
            }
        }
    }
    rows
}
