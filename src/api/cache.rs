use axum::{extract::State, Json};
use serde_json::Value;

use crate::api::error::ApiError;
use crate::collector::AppState;

/// GET /api/clear-cache - drop current cache entries to force a fresh poll
///
/// History and error files are never touched; they are the audit trail.
pub async fn clear_cache(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let cleared = state.cache.clear_current()?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": format!("Cleared {} cache files", cleared.len()),
        "files": cleared,
    })))
}
