use axum::{extract::State, Json};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;

use crate::api::{error::ApiError, response::clean_json};
use crate::collector::AppState;
use crate::storage::Storage;
use crate::config::WeatherSource;
use crate::domain::timefmt;
use crate::weather::CurrentWeather;

/// Latest snapshot fields for the dashboard header.
#[derive(Debug, Serialize)]
struct CurrentStatus {
    battery_level: Option<f64>,
    is_charging: Option<bool>,
    charging_power: Option<f64>,
    range: Option<f64>,
    temperature: Option<f64>,
    meteo_temp: Option<f64>,
    vehicle_temp: Option<f64>,
    odometer: Option<f64>,
    #[serde(with = "timefmt::csv_datetime_opt")]
    last_updated: Option<NaiveDateTime>,
    is_cached: bool,
    weather_source: &'static str,
    location: Option<LocationInfo>,
    #[serde(with = "timefmt::csv_datetime_opt")]
    api_last_updated: Option<NaiveDateTime>,
    #[serde(with = "timefmt::csv_datetime_opt")]
    next_collection: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weather: Option<WeatherInfo>,
}

#[derive(Debug, Serialize)]
struct LocationInfo {
    latitude: f64,
    longitude: f64,
    last_updated: Option<String>,
}

#[derive(Debug, Serialize)]
struct WeatherInfo {
    temperature: Option<f64>,
    temperature_unit: String,
    feels_like: Option<f64>,
    humidity: Option<f64>,
    description: String,
    wind_speed: Option<f64>,
}

impl From<CurrentWeather> for WeatherInfo {
    fn from(weather: CurrentWeather) -> Self {
        Self {
            temperature: weather.temperature,
            temperature_unit: weather.temperature_unit,
            feels_like: weather.feels_like,
            humidity: weather.humidity,
            description: weather.description,
            wind_speed: weather.wind_speed,
        }
    }
}

/// GET /api/current-status - latest battery, location and next-poll info
pub async fn current_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let history = state.storage.battery_history(None).await?;
    let latest = history.last();

    let locations = state.storage.locations().await?;
    let latest_location = locations.last();

    let weather = match (state.cfg.weather.source, latest_location) {
        (WeatherSource::Meteo, Some(loc)) => state
            .weather
            .current(loc.latitude, loc.longitude)
            .await
            .map(WeatherInfo::from),
        _ => None,
    };

    let governor_status = state.governor.status();

    // The current cache entry carries the vendor-reported record time.
    let api_last_updated = state
        .client
        .peek_current()
        .and_then(|snapshot| snapshot.vendor_updated_at);

    let status = CurrentStatus {
        battery_level: latest.map(|r| r.battery_level),
        is_charging: latest.map(|r| r.is_charging),
        charging_power: latest.and_then(|r| r.charging_power),
        range: latest.and_then(|r| r.range),
        temperature: latest.and_then(|r| r.temperature),
        meteo_temp: latest.and_then(|r| r.meteo_temp),
        vehicle_temp: latest.and_then(|r| r.vehicle_temp),
        odometer: latest.and_then(|r| r.odometer),
        last_updated: latest.map(|r| r.timestamp),
        is_cached: latest.map(|r| r.is_cached).unwrap_or(false),
        weather_source: match state.cfg.weather.source {
            WeatherSource::Meteo => "meteo",
            WeatherSource::Vehicle => "vehicle",
        },
        location: latest_location.map(|loc| LocationInfo {
            latitude: loc.latitude,
            longitude: loc.longitude,
            last_updated: loc.last_updated.clone(),
        }),
        api_last_updated,
        next_collection: governor_status.next_collection,
        weather,
    };

    Ok(Json(clean_json(&status)))
}

/// GET /api/collection-status - governor snapshot
pub async fn collection_status(State(state): State<AppState>) -> Json<Value> {
    Json(clean_json(&state.governor.status()))
}
