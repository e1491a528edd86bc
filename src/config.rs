use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub api: ApiConfig,

    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,

    #[serde(default)]
    #[validate(nested)]
    pub storage: StorageConfig,

    #[serde(default)]
    #[validate(nested)]
    pub charging: ChargingConfig,

    #[serde(default)]
    #[validate(nested)]
    pub weather: WeatherConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// HTTP dashboard server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    #[serde(default = "default_host")]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Vendor API configuration
///
/// The Bluelink backend enforces a hard daily quota per account; every poll
/// budget in the crate is derived from `daily_limit`.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ApiConfig {
    #[validate(range(min = 1, max = 1440))]
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,

    #[validate(range(min = 0, max = 10))]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Hard timeout per vendor call; a timeout is treated as a
    /// non-retryable network error.
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Vendor region code. Region 3 (USA) reports the odometer and speeds
    /// in miles, which are converted to km at ingest.
    #[serde(default = "default_region")]
    pub region: u8,

    /// Vendor brand code (1 = Kia, 2 = Hyundai, 3 = Genesis).
    #[serde(default = "default_brand")]
    pub brand: u8,

    #[serde(default)]
    pub vehicle_id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
}

impl ApiConfig {
    /// Minutes between polls when the full daily budget is spread evenly
    /// over the day.
    pub fn base_interval_minutes(&self) -> f64 {
        (24.0 * 60.0) / self.daily_limit as f64
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// How long history files are kept for audit. Distinct from validity,
    /// which is derived from the daily limit.
    #[validate(range(min = 1.0, max = 8760.0))]
    #[serde(default = "default_retention_hours")]
    pub retention_hours: f64,
}

/// Storage backend selection
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Which side serves reads in dual mode.
    #[serde(default)]
    pub dual_read_from: DualReadSide,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Csv,
    Sql,
    Dual,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DualReadSide {
    #[default]
    Csv,
    Sql,
}

/// Charging session derivation parameters
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChargingConfig {
    #[validate(range(min = 1.0, max = 300.0))]
    #[serde(default = "default_battery_capacity_kwh")]
    pub battery_capacity_kwh: f64,

    /// Multiplier on the base poll interval above which two charging
    /// readings are split into separate sessions.
    #[validate(range(min = 1.0, max = 10.0))]
    #[serde(default = "default_gap_multiplier")]
    pub session_gap_multiplier: f64,
}

impl ChargingConfig {
    /// Gap threshold in minutes, floored at 5 so dense polling schedules
    /// never split continuous sessions.
    pub fn gap_threshold_minutes(&self, base_interval_minutes: f64) -> f64 {
        (base_interval_minutes * self.session_gap_multiplier).max(5.0)
    }
}

/// Weather enrichment configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WeatherConfig {
    /// Which temperature becomes the canonical `temperature` column.
    #[serde(default)]
    pub source: WeatherSource,

    #[validate(url)]
    #[serde(default = "default_weather_api_url")]
    pub api_url: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WeatherSource {
    #[default]
    Meteo,
    Vehicle,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

// Default value functions
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8080 }
fn default_daily_limit() -> u32 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_region() -> u8 { 3 }
fn default_brand() -> u8 { 2 }
fn default_true() -> bool { true }
fn default_cache_dir() -> PathBuf { PathBuf::from("cache") }
fn default_retention_hours() -> f64 { 48.0 }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_database_url() -> String { "sqlite://data/telemetry.db".to_string() }
fn default_battery_capacity_kwh() -> f64 { 77.4 }
fn default_gap_multiplier() -> f64 { 1.5 }
fn default_weather_api_url() -> String { "https://api.open-meteo.com/v1/forecast".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            region: default_region(),
            brand: default_brand(),
            vehicle_id: None,
            username: None,
            password: None,
            pin: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            data_dir: default_data_dir(),
            database_url: default_database_url(),
            dual_read_from: DualReadSide::default(),
        }
    }
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            battery_capacity_kwh: default_battery_capacity_kwh(),
            session_gap_multiplier: default_gap_multiplier(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            source: WeatherSource::default(),
            api_url: default_weather_api_url(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_json: false }
    }
}

impl AppConfig {
    /// Load configuration from `config/default.toml` (if present) with
    /// `BLT__` environment overrides (`BLT__API__DAILY_LIMIT` -> api.daily_limit).
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("BLT__").split("__"));

        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.api.daily_limit, 30);
        assert_eq!(cfg.charging.battery_capacity_kwh, 77.4);
        assert_eq!(cfg.cache.retention_hours, 48.0);
    }

    #[test]
    fn base_interval_follows_daily_limit() {
        let api = ApiConfig { daily_limit: 30, ..ApiConfig::default() };
        assert_eq!(api.base_interval_minutes(), 48.0);

        let api = ApiConfig { daily_limit: 96, ..ApiConfig::default() };
        assert_eq!(api.base_interval_minutes(), 15.0);
    }

    #[test]
    fn gap_threshold_has_a_floor() {
        let charging = ChargingConfig::default();
        // 30/day -> 48 min base, x1.5 = 72 min.
        assert_eq!(charging.gap_threshold_minutes(48.0), 72.0);
        // Dense polling never drops the threshold below 5 minutes.
        assert_eq!(charging.gap_threshold_minutes(1.0), 5.0);
    }

    #[test]
    fn server_config_socket_addr() {
        let config = ServerConfig { host: "127.0.0.1".to_string(), port: 8080 };
        let addr = config.socket_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn storage_backend_deserializes_lowercase() {
        let parsed: StorageBackendKind = serde_json::from_str(r#""dual""#).unwrap();
        assert_eq!(parsed, StorageBackendKind::Dual);
    }
}
