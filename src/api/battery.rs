use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Local;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{error::ApiError, response::clean_json, TimeWindow};
use crate::collector::AppState;
use crate::storage::Storage;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    hours: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

/// GET /api/battery-history - battery time series over a window
/// (`hours=<n|all|custom>`, default last 24 hours)
pub async fn battery_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let window = TimeWindow::parse(
        query.hours.as_deref(),
        query.start_date.as_deref(),
        query.end_date.as_deref(),
        Some(24),
    );

    // Pre-filter at the storage layer for the trailing-hours case, then
    // apply the precise window.
    let days = match window {
        TimeWindow::LastHours(h) => Some(h as f64 / 24.0),
        _ => None,
    };
    let now = Local::now().naive_local();
    let mut rows = state.storage.battery_history(days).await?;
    rows.retain(|r| window.contains(r.timestamp, now));

    let body = serde_json::json!({
        "data": clean_json(&rows),
        "count": rows.len(),
    });
    Ok(Json(body))
}
