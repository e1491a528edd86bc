use axum::{extract::State, Json};
use chrono::Local;
use serde_json::Value;

use crate::api::{error::ApiError, response::clean_json};
use crate::collector::AppState;

/// POST /api/refresh - manual poll through the full pipeline
///
/// Bypasses cache validity, consumes quota, stores the result. Errors map
/// to the taxonomy's status codes (429 quota, 401 auth, 504 timeout, 503
/// vendor down, 500 otherwise).
pub async fn refresh(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.collect("manual", true).await?;

    // Tell the user how old the vehicle-side data actually is; the
    // backend often serves records that lag the wall clock.
    let freshness_note = snapshot
        .vendor_updated_at
        .map(|updated| {
            let age_minutes = (Local::now().naive_local() - updated).num_minutes();
            format!(" (vehicle data from {age_minutes} minutes ago)")
        })
        .unwrap_or_default();

    let body = serde_json::json!({
        "status": "success",
        "message": format!("Data refreshed successfully{freshness_note}"),
        "snapshot": clean_json(&snapshot),
    });
    Ok(Json(body))
}
