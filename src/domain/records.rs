use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::timefmt;

/// One trip reported by the vehicle, immutable once ingested.
///
/// Identity is `(date, distance, odometer_start)`; re-ingesting a record
/// with an identical key is a no-op at the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRecord {
    /// Collection timestamp (when this row was ingested).
    #[serde(with = "timefmt::csv_datetime")]
    pub timestamp: NaiveDateTime,

    /// Trip start as reported by the vendor, normalized (no trailing `.0`).
    pub date: String,

    /// km; the vendor reports km for the US region despite everything else
    /// being imperial.
    #[serde(default)]
    pub distance: Option<f64>,

    /// Minutes (vendor reports seconds).
    #[serde(default)]
    pub duration: Option<f64>,

    /// km/h (vendor reports mph).
    #[serde(default)]
    pub average_speed: Option<f64>,
    #[serde(default)]
    pub max_speed: Option<f64>,

    /// Minutes spent idle: total duration minus driving time.
    #[serde(default)]
    pub idle_time: Option<f64>,

    #[serde(default = "default_trips_count")]
    pub trips_count: u32,

    // Energy breakdown, all Wh as reported.
    #[serde(default)]
    pub total_consumed: Option<f64>,
    #[serde(default)]
    pub regenerated_energy: Option<f64>,
    #[serde(default)]
    pub accessories_consumed: Option<f64>,
    #[serde(default)]
    pub climate_consumed: Option<f64>,
    #[serde(default)]
    pub drivetrain_consumed: Option<f64>,
    #[serde(default)]
    pub battery_care_consumed: Option<f64>,

    #[serde(default)]
    pub odometer_start: Option<f64>,

    // End-of-trip context stamped onto the most recent trip only.
    #[serde(default)]
    pub end_latitude: Option<f64>,
    #[serde(default)]
    pub end_longitude: Option<f64>,
    #[serde(default)]
    pub end_temperature: Option<f64>,
}

fn default_trips_count() -> u32 {
    1
}

impl TripRecord {
    /// Dedup key: normalized date + distance, plus the starting odometer
    /// when present. Matches the identity used by every tool that has ever
    /// written the trips table.
    pub fn dedup_key(&self) -> String {
        let date = timefmt::normalize_date_string(&self.date);
        let mut key = match self.distance {
            Some(d) => format!("{date}_{d}"),
            None => format!("{date}_"),
        };
        if let Some(odo) = self.odometer_start {
            key.push('_');
            key.push_str(&odo.to_string());
        }
        key
    }

    /// Trip start parsed from the normalized date string.
    pub fn start_time(&self) -> Option<NaiveDateTime> {
        timefmt::parse_flexible(&timefmt::normalize_date_string(&self.date))
    }
}

/// Append-only battery sample, one per poll that yielded battery data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryReading {
    #[serde(with = "timefmt::csv_datetime")]
    pub timestamp: NaiveDateTime,

    pub battery_level: f64,

    #[serde(with = "timefmt::csv_bool")]
    pub is_charging: bool,

    #[serde(default, with = "timefmt::csv_bool_opt")]
    pub is_plugged_in: Option<bool>,

    /// kW.
    #[serde(default)]
    pub charging_power: Option<f64>,

    /// km.
    #[serde(default)]
    pub range: Option<f64>,

    /// Canonical temperature in Celsius; source selected by configuration
    /// (`meteo_temp` or `vehicle_temp`).
    #[serde(default)]
    pub temperature: Option<f64>,

    /// km.
    #[serde(default)]
    pub odometer: Option<f64>,

    /// Open-Meteo temperature, Celsius.
    #[serde(default)]
    pub meteo_temp: Option<f64>,

    /// Cabin sensor temperature converted to Celsius.
    #[serde(default)]
    pub vehicle_temp: Option<f64>,

    /// True when the freshness classifier decided this poll was a
    /// server-side replay.
    #[serde(default, with = "timefmt::csv_bool")]
    pub is_cached: bool,
}

/// Vehicle position sample; appended whenever the vendor reports one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationReading {
    #[serde(with = "timefmt::csv_datetime")]
    pub timestamp: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    /// Vendor-reported position timestamp, kept as received.
    #[serde(default)]
    pub last_updated: Option<String>,
}
