//! Historical time-series queries.
//!
//! The Flux text is assembled server-side from validated parameters —
//! clients never submit raw Flux. Heavy ranges with fine intervals get an
//! automatic point limit so a careless chart cannot flatten the store.

use crate::api::auth::Principal;
use crate::api::error::ApiError;
use crate::api::AppState;
use crate::error::ControlError;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const VALID_AGGREGATIONS: &[&str] = &["mean", "max", "min", "sum", "count", "first", "last"];

fn default_aggregation() -> String {
    "mean".to_string()
}

fn default_interval() -> String {
    "1m".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TimeSeriesQuery {
    pub measurement: String,
    pub field: String,
    pub source: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default = "default_aggregation")]
    pub aggregation: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    pub limit: Option<u64>,
}

fn build_flux(bucket: &str, params: &TimeSeriesQuery, limit: Option<u64>) -> String {
    let mut flux = format!(
        "from(bucket: \"{bucket}\")\n  \
         |> range(start: {start}, stop: {stop})\n  \
         |> filter(fn: (r) => r._measurement == \"{measurement}\")\n  \
         |> filter(fn: (r) => r._field == \"{field}\")",
        start = params.start_time.format("%Y-%m-%dT%H:%M:%SZ"),
        stop = params.end_time.format("%Y-%m-%dT%H:%M:%SZ"),
        measurement = params.measurement,
        field = params.field,
    );
    if let Some(source) = &params.source {
        flux.push_str(&format!(
            "\n  |> filter(fn: (r) => r.relay_id == \"{source}\")"
        ));
    }
    flux.push_str(&format!(
        "\n  |> aggregateWindow(every: {interval}, fn: {aggregation}, createEmpty: false)",
        interval = params.interval,
        aggregation = params.aggregation,
    ));
    if let Some(limit) = limit {
        flux.push_str(&format!(
            "\n  |> sort(columns: [\"_time\"], desc: false)\n  |> limit(n: {limit})"
        ));
    }
    flux.push_str(&format!("\n  |> yield(name: \"{}\")", params.aggregation));
    flux
}

/// Cap runaway queries: wide ranges with fine intervals get a limit even if
/// the client did not ask for one.
fn effective_limit(params: &TimeSeriesQuery) -> Option<u64> {
    if params.limit.is_some() {
        return params.limit;
    }
    let span = params.end_time - params.start_time;
    let fine = matches!(params.interval.as_str(), "10s" | "30s" | "1m" | "2m" | "5m");
    if span > chrono::Duration::days(30) && fine {
        let days = span.num_days().max(1) as u64;
        let limit = (10_000 * (1 + days / 10)).min(100_000);
        warn!(days, limit, "heavy query, applying automatic point limit");
        Some(limit)
    } else {
        None
    }
}

/// `GET /timeseries/query`
pub async fn query(
    _principal: Principal,
    State(state): State<AppState>,
    Query(params): Query<TimeSeriesQuery>,
) -> Result<Json<Value>, ApiError> {
    if !VALID_AGGREGATIONS.contains(&params.aggregation.as_str()) {
        return Err(ControlError::Validation(format!(
            "invalid aggregation '{}', valid options: {}",
            params.aggregation,
            VALID_AGGREGATIONS.join(", ")
        ))
        .into());
    }
    if params.end_time <= params.start_time {
        return Err(
            ControlError::Validation("end_time must be after start_time".into()).into(),
        );
    }

    let limit = effective_limit(&params);
    let flux = build_flux(&state.bucket, &params, limit);
    debug!(%flux, "executing time-series query");

    let rows = state.query.query(&flux).await?;
    Ok(Json(json!({
        "measurement": params.measurement,
        "field": params.field,
        "source": params.source,
        "start_time": params.start_time,
        "end_time": params.end_time,
        "interval": params.interval,
        "aggregation": params.aggregation,
        "point_count": rows.len(),
        "data": rows,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(interval: &str, days: i64, limit: Option<u64>) -> TimeSeriesQuery {
        let end = Utc::now();
        TimeSeriesQuery {
            measurement: "relay_power".into(),
            field: "voltage".into(),
            source: Some("relay_3".into()),
            start_time: end - chrono::Duration::days(days),
            end_time: end,
            aggregation: "mean".into(),
            interval: interval.into(),
            limit,
        }
    }

    #[test]
    fn test_flux_shape() {
        let flux = build_flux("Raw_Data", &params("1m", 1, None), None);
        assert!(flux.starts_with("from(bucket: \"Raw_Data\")"));
        assert!(flux.contains("r._measurement == \"relay_power\""));
        assert!(flux.contains("r.relay_id == \"relay_3\""));
        assert!(flux.contains("aggregateWindow(every: 1m, fn: mean"));
        assert!(flux.ends_with("|> yield(name: \"mean\")"));
        assert!(!flux.contains("limit(n:"));
    }

    #[test]
    fn test_explicit_limit_wins() {
        assert_eq!(effective_limit(&params("10s", 60, Some(500))), Some(500));
        let flux = build_flux("b", &params("10s", 60, Some(500)), Some(500));
        assert!(flux.contains("limit(n: 500)"));
    }

    #[test]
    fn test_automatic_limit_for_heavy_queries() {
        assert!(effective_limit(&params("10s", 60, None)).is_some());
        assert_eq!(effective_limit(&params("1h", 60, None)), None);
        assert_eq!(effective_limit(&params("10s", 7, None)), None);
    }
}
