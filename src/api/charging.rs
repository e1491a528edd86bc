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

/// When a tight filter matches nothing, fall back to the most recent
/// sessions so the dashboard is never empty for a car that does charge.
const FALLBACK_SESSION_COUNT: usize = 10;

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    hours: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

/// GET /api/charging-sessions - session history, newest first
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let window = TimeWindow::parse(
        query.hours.as_deref(),
        query.start_date.as_deref(),
        query.end_date.as_deref(),
        None,
    );

    let all = state.storage.charging_sessions().await?;
    let now = Local::now().naive_local();

    let mut sessions: Vec<_> = all
        .iter()
        .filter(|s| window.contains(s.start_time, now))
        .cloned()
        .collect();

    if sessions.is_empty() && !all.is_empty() {
        tracing::info!(
            count = FALLBACK_SESSION_COUNT.min(all.len()),
            "no sessions matched filter, returning most recent instead"
        );
        sessions = all.clone();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions.truncate(FALLBACK_SESSION_COUNT);
    } else {
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    }

    Ok(Json(clean_json(&sessions)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_count_is_bounded() {
        assert_eq!(FALLBACK_SESSION_COUNT, 10);
    }

    #[test]
    fn window_filtering_uses_session_start() {
        let window = TimeWindow::LastHours(1);
        let now = Local::now().naive_local();
        assert!(window.contains(now - chrono::Duration::minutes(30), now));
        assert!(!window.contains(now - chrono::Duration::hours(2), now));
    }
}
