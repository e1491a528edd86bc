pub mod battery;
pub mod cache;
pub mod charging;
pub mod error;
pub mod health;
pub mod locations;
pub mod refresh;
pub mod response;
pub mod status;
pub mod trips;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::collector::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/current-status", get(status::current_status))
        .route("/api/collection-status", get(status::collection_status))
        .route("/api/battery-history", get(battery::battery_history))
        .route("/api/trips", get(trips::list_trips))
        .route("/api/charging-sessions", get(charging::list_sessions))
        .route("/api/locations", get(locations::list_locations))
        .route("/api/clear-cache", get(cache::clear_cache))
        .route("/api/refresh", post(refresh::refresh))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Time-window filter shared by the history endpoints: either everything,
/// a trailing number of hours, or a custom inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TimeWindow {
    All,
    LastHours(i64),
    Range(NaiveDateTime, NaiveDateTime),
}

impl TimeWindow {
    /// Parse the `hours` / `start_date` / `end_date` query parameters.
    /// `default_hours` applies when nothing usable was passed (`None`
    /// means default to the full history).
    pub(crate) fn parse(
        hours: Option<&str>,
        start_date: Option<&str>,
        end_date: Option<&str>,
        default_hours: Option<i64>,
    ) -> Self {
        let parse_date = |raw: &str| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok();

        if let (Some(start), Some(end)) = (
            start_date.and_then(parse_date),
            end_date.and_then(parse_date),
        ) {
            let custom_requested = hours.map(|h| h == "custom").unwrap_or(true);
            if custom_requested {
                // End date is inclusive.
                let start = start.and_hms_opt(0, 0, 0).expect("midnight is valid");
                let end = (end + Duration::days(1))
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is valid");
                return TimeWindow::Range(start, end);
            }
        }

        match hours {
            Some("all") => TimeWindow::All,
            Some(raw) => match raw.parse::<i64>() {
                Ok(h) if h > 0 => TimeWindow::LastHours(h),
                _ => default_hours.map(TimeWindow::LastHours).unwrap_or(TimeWindow::All),
            },
            None => default_hours.map(TimeWindow::LastHours).unwrap_or(TimeWindow::All),
        }
    }

    pub(crate) fn contains(&self, ts: NaiveDateTime, now: NaiveDateTime) -> bool {
        match self {
            TimeWindow::All => true,
            TimeWindow::LastHours(h) => ts >= now - Duration::hours(*h),
            TimeWindow::Range(start, end) => ts >= *start && ts < *end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn parses_all_and_hours() {
        assert_eq!(TimeWindow::parse(Some("all"), None, None, Some(24)), TimeWindow::All);
        assert_eq!(
            TimeWindow::parse(Some("48"), None, None, Some(24)),
            TimeWindow::LastHours(48)
        );
        assert_eq!(
            TimeWindow::parse(Some("garbage"), None, None, Some(24)),
            TimeWindow::LastHours(24)
        );
        assert_eq!(TimeWindow::parse(None, None, None, None), TimeWindow::All);
    }

    #[test]
    fn custom_range_is_end_inclusive() {
        let window =
            TimeWindow::parse(Some("custom"), Some("2024-01-10"), Some("2024-01-12"), Some(24));
        let now = at(20, 0);
        assert!(window.contains(at(10, 0), now));
        assert!(window.contains(at(12, 23), now));
        assert!(!window.contains(at(13, 0), now));
        assert!(!window.contains(at(9, 23), now));
    }

    #[test]
    fn last_hours_window_is_relative_to_now() {
        let window = TimeWindow::LastHours(24);
        let now = at(15, 12);
        assert!(window.contains(at(15, 0), now));
        assert!(window.contains(at(14, 12), now));
        assert!(!window.contains(at(14, 11), now));
    }
}
