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

#[derive(Debug, Deserialize)]
pub struct LocationsQuery {
    hours: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

/// One point for the map view: trip end points plus the current position.
#[derive(Debug, Serialize)]
struct MapPoint {
    lat: f64,
    lng: f64,
    date: String,
    distance: f64,
    duration: f64,
    efficiency: Option<f64>,
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_current: bool,
}

/// GET /api/locations - trip end locations for mapping
pub async fn list_locations(
    State(state): State<AppState>,
    Query(query): Query<LocationsQuery>,
) -> Result<Json<Value>, ApiError> {
    let window = TimeWindow::parse(
        query.hours.as_deref(),
        query.start_date.as_deref(),
        query.end_date.as_deref(),
        None,
    );

    let now = Local::now().naive_local();
    let trips = state.storage.trips().await?;

    let mut points: Vec<MapPoint> = trips
        .iter()
        .filter(|trip| {
            trip.start_time()
                .map(|ts| window.contains(ts, now))
                .unwrap_or(false)
        })
        .filter_map(|trip| {
            let (lat, lng) = (trip.end_latitude?, trip.end_longitude?);
            let efficiency = match (trip.total_consumed, trip.distance) {
                (Some(consumed), Some(distance)) if distance > 0.0 => {
                    Some(((consumed / distance) * 10.0).round() / 10.0)
                }
                _ => None,
            };
            Some(MapPoint {
                lat,
                lng,
                date: trip.date.clone(),
                distance: trip.distance.unwrap_or(0.0),
                duration: trip.duration.unwrap_or(0.0),
                efficiency,
                temperature: trip.end_temperature,
                is_current: false,
            })
        })
        .collect();

    // The vehicle's last known position rides along as a synthetic point.
    let known_locations = state.storage.locations().await?;
    if let Some(current) = known_locations.last() {
        points.push(MapPoint {
            lat: current.latitude,
            lng: current.longitude,
            date: "Current Location".to_string(),
            distance: 0.0,
            duration: 0.0,
            efficiency: None,
            temperature: None,
            is_current: true,
        });
    }

    Ok(Json(clean_json(&points)))
}
