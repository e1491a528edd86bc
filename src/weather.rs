//! Current-conditions lookup via the Open-Meteo API.
//!
//! Used to enrich battery readings with an ambient temperature when the
//! configured source is `meteo`. Responses are cached on disk for 30
//! minutes per rounded coordinate pair; any failure degrades to `None`
//! and never blocks a storage write.

use chrono::{Local, NaiveDateTime};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::domain::timefmt;

const CACHE_TTL_MINUTES: i64 = 30;

/// Current weather at the vehicle's location, temperatures in Fahrenheit
/// as the API is asked to report them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentWeather {
    pub temperature: Option<f64>,
    pub temperature_unit: String,
    pub feels_like: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub weather_code: Option<i64>,
    pub description: String,
    #[serde(with = "timefmt::csv_datetime")]
    pub fetched_at: NaiveDateTime,
}

pub struct WeatherService {
    client: Client,
    api_url: String,
    cache_dir: PathBuf,
}

impl WeatherService {
    pub fn new(api_url: impl Into<String>, cache_dir: &Path) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_url: api_url.into(),
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    /// Current conditions for a location, served from the 30-minute cache
    /// when possible.
    pub async fn current(&self, latitude: f64, longitude: f64) -> Option<CurrentWeather> {
        let cache_key = format!("weather_{latitude:.3}_{longitude:.3}");
        if let Some(cached) = self.read_cache(&cache_key) {
            return Some(cached);
        }

        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                (
                    "current",
                    "temperature_2m,relative_humidity_2m,apparent_temperature,weather_code,wind_speed_10m"
                        .to_string(),
                ),
                ("temperature_unit", "fahrenheit".to_string()),
                ("wind_speed_unit", "mph".to_string()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                error!(status = %r.status(), "weather API returned error status");
                return None;
            }
            Err(err) => {
                error!(error = %err, "weather API request failed");
                return None;
            }
        };

        let parsed: OpenMeteoResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "weather API returned unparseable body");
                return None;
            }
        };

        let current = parsed.current.unwrap_or_default();
        let weather = CurrentWeather {
            temperature: current.temperature_2m,
            temperature_unit: "F".to_string(),
            feels_like: current.apparent_temperature,
            humidity: current.relative_humidity_2m,
            wind_speed: current.wind_speed_10m,
            weather_code: current.weather_code,
            description: describe_weather_code(current.weather_code),
            fetched_at: Local::now().naive_local(),
        };

        self.write_cache(&cache_key, &weather);
        info!(
            temperature_f = weather.temperature,
            description = %weather.description,
            "fetched weather data"
        );
        Some(weather)
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }

    fn read_cache(&self, key: &str) -> Option<CurrentWeather> {
        let contents = fs::read_to_string(self.cache_path(key)).ok()?;
        let cached: CurrentWeather = serde_json::from_str(&contents).ok()?;
        let age = Local::now().naive_local() - cached.fetched_at;
        if age > chrono::Duration::minutes(CACHE_TTL_MINUTES) {
            return None;
        }
        debug!(key, "serving weather from cache");
        Some(cached)
    }

    fn write_cache(&self, key: &str, weather: &CurrentWeather) {
        if fs::create_dir_all(&self.cache_dir).is_err() {
            return;
        }
        if let Ok(json) = serde_json::to_string_pretty(weather) {
            let _ = fs::write(self.cache_path(key), json);
        }
    }
}

/// WMO weather interpretation codes.
fn describe_weather_code(code: Option<i64>) -> String {
    let Some(code) = code else {
        return "Unknown".to_string();
    };
    let description = match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Foggy",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        71 => "Slight snow",
        73 => "Moderate snow",
        75 => "Heavy snow",
        77 => "Snow grains",
        80 => "Slight rain showers",
        81 => "Moderate rain showers",
        82 => "Violent rain showers",
        85 => "Slight snow showers",
        86 => "Heavy snow showers",
        95 => "Thunderstorm",
        96 => "Thunderstorm with slight hail",
        99 => "Thunderstorm with heavy hail",
        other => return format!("Weather code {other}"),
    };
    description.to_string()
}

// Open-Meteo response shape (only what is consumed).
#[derive(Debug, Default, Deserialize)]
struct OpenMeteoResponse {
    current: Option<OpenMeteoCurrent>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenMeteoCurrent {
    temperature_2m: Option<f64>,
    relative_humidity_2m: Option<f64>,
    apparent_temperature: Option<f64>,
    weather_code: Option<i64>,
    wind_speed_10m: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn weather_codes_have_descriptions() {
        assert_eq!(describe_weather_code(Some(0)), "Clear sky");
        assert_eq!(describe_weather_code(Some(95)), "Thunderstorm");
        assert_eq!(describe_weather_code(Some(42)), "Weather code 42");
        assert_eq!(describe_weather_code(None), "Unknown");
    }

    #[test]
    fn cache_round_trip_honors_ttl() {
        let dir = TempDir::new().unwrap();
        let service = WeatherService::new("https://example.invalid", dir.path());

        let fresh = CurrentWeather {
            temperature: Some(50.0),
            temperature_unit: "F".into(),
            feels_like: Some(45.0),
            humidity: Some(60.0),
            wind_speed: Some(5.0),
            weather_code: Some(0),
            description: "Clear sky".into(),
            fetched_at: Local::now().naive_local(),
        };
        service.write_cache("weather_44.978_-93.265", &fresh);
        let cached = service.read_cache("weather_44.978_-93.265").unwrap();
        assert_eq!(cached.temperature, Some(50.0));

        let stale = CurrentWeather {
            fetched_at: Local::now().naive_local() - chrono::Duration::hours(2),
            ..fresh
        };
        service.write_cache("weather_44.978_-93.265", &stale);
        assert!(service.read_cache("weather_44.978_-93.265").is_none());
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn fetches_live_weather() {
        let dir = TempDir::new().unwrap();
        let service = WeatherService::new("https://api.open-meteo.com/v1/forecast", dir.path());
        let weather = service.current(44.9778, -93.2650).await;
        assert!(weather.is_some());
    }
}
