use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{error::ApiError, response::clean_json, TimeWindow};
use crate::collector::AppState;
use crate::storage::Storage;
use crate::domain::TripRecord;

#[derive(Debug, Deserialize)]
pub struct TripsQuery {
    page: Option<usize>,
    per_page: Option<usize>,
    hours: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    min_distance: Option<f64>,
    max_distance: Option<f64>,
}

/// Trip row as served to the dashboard: energy in kWh, efficiency derived.
#[derive(Debug, Serialize)]
struct TripView {
    date: String,
    distance: Option<f64>,
    duration: Option<f64>,
    average_speed: Option<f64>,
    max_speed: Option<f64>,
    idle_time: Option<f64>,
    total_consumed: Option<f64>,
    regenerated_energy: Option<f64>,
    accessories_consumed: Option<f64>,
    climate_consumed: Option<f64>,
    drivetrain_consumed: Option<f64>,
    battery_care_consumed: Option<f64>,
    odometer_start: Option<f64>,
    end_latitude: Option<f64>,
    end_longitude: Option<f64>,
    end_temperature: Option<f64>,
    efficiency_wh_per_km: Option<f64>,
}

fn wh_to_kwh(value: Option<f64>) -> Option<f64> {
    value.map(|wh| wh / 1000.0)
}

impl From<&TripRecord> for TripView {
    fn from(trip: &TripRecord) -> Self {
        let efficiency_wh_per_km = match (trip.total_consumed, trip.distance) {
            (Some(consumed), Some(distance)) if distance > 0.0 && consumed > 0.0 => {
                Some(((consumed / distance) * 10.0).round() / 10.0)
            }
            _ => None,
        };
        Self {
            date: trip.date.clone(),
            distance: trip.distance,
            duration: trip.duration,
            average_speed: trip.average_speed,
            max_speed: trip.max_speed,
            idle_time: trip.idle_time,
            total_consumed: wh_to_kwh(trip.total_consumed),
            regenerated_energy: wh_to_kwh(trip.regenerated_energy),
            accessories_consumed: wh_to_kwh(trip.accessories_consumed),
            climate_consumed: wh_to_kwh(trip.climate_consumed),
            drivetrain_consumed: wh_to_kwh(trip.drivetrain_consumed),
            battery_care_consumed: wh_to_kwh(trip.battery_care_consumed),
            odometer_start: trip.odometer_start,
            end_latitude: trip.end_latitude,
            end_longitude: trip.end_longitude,
            end_temperature: trip.end_temperature,
            efficiency_wh_per_km,
        }
    }
}

/// GET /api/trips - paginated trip list with window and distance filters
pub async fn list_trips(
    State(state): State<AppState>,
    Query(query): Query<TripsQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(10).clamp(1, 100);

    let window = TimeWindow::parse(
        query.hours.as_deref(),
        query.start_date.as_deref(),
        query.end_date.as_deref(),
        None,
    );

    let now = Local::now().naive_local();
    let mut trips = state.storage.trips().await?;
    trips.retain(|trip| {
        let in_window = trip
            .start_time()
            .map(|ts| window.contains(ts, now))
            .unwrap_or(window == TimeWindow::All);
        let above_min = query.min_distance.map_or(true, |min| {
            trip.distance.map_or(false, |d| d >= min)
        });
        let below_max = query.max_distance.map_or(true, |max| {
            trip.distance.map_or(false, |d| d <= max)
        });
        in_window && above_min && below_max
    });

    // Newest first.
    trips.sort_by(|a, b| b.date.cmp(&a.date));

    let total = trips.len();
    let total_pages = total.div_ceil(per_page);
    let page_rows: Vec<TripView> = trips
        .iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(TripView::from)
        .collect();

    let body = serde_json::json!({
        "trips": clean_json(&page_rows),
        "total": total,
        "page": page,
        "per_page": per_page,
        "total_pages": total_pages,
    });
    Ok(Json(body))
}
