use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::records::TripRecord;
use crate::domain::timefmt;

/// One normalized vehicle observation, produced per successful poll and
/// memoized in the response cache.
///
/// Units are normalized at ingest: distances in km, speeds in km/h, trip
/// durations in minutes. The raw vendor payload is preserved verbatim in
/// `raw` for audit and freshness comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    #[serde(with = "timefmt::csv_datetime")]
    pub collected_at: NaiveDateTime,

    /// Timestamp reported by the vendor backend; may lag hours behind
    /// `collected_at` when the backend serves a cached record.
    #[serde(default, with = "timefmt::csv_datetime_opt")]
    pub vendor_updated_at: Option<NaiveDateTime>,

    #[serde(default)]
    pub vehicle_id: Option<String>,

    /// Stable hash of `raw`, used to detect server-side replays when the
    /// vendor timestamp does not move.
    pub payload_digest: String,

    #[serde(default)]
    pub odometer_km: Option<f64>,

    pub battery: BatterySnapshot,

    #[serde(default)]
    pub location: Option<LocationSnapshot>,

    #[serde(default)]
    pub trips: Vec<TripRecord>,

    /// Opaque vendor payload, kept byte-faithful modulo JSON re-encoding.
    #[serde(default)]
    pub raw: serde_json::Value,

    /// Set by the freshness classifier: true when this poll returned a
    /// server-cached replay rather than new vehicle data.
    #[serde(default)]
    pub is_cached: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatterySnapshot {
    #[serde(default)]
    pub level: Option<f64>,
    #[serde(default)]
    pub is_charging: bool,
    #[serde(default)]
    pub is_plugged_in: Option<bool>,
    /// Charging power in kW, when the vendor reports it.
    #[serde(default)]
    pub charging_power: Option<f64>,
    #[serde(default)]
    pub range_km: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl VehicleSnapshot {
    /// Vehicle air temperature in Fahrenheit, as reported by the cabin
    /// sensor inside the raw payload (`airTemp.value`). The value "LO" is
    /// returned by the sensor below its measurable range and maps to `None`.
    pub fn vehicle_temp_f(&self) -> Option<f64> {
        let value = self.raw.get("airTemp")?.get("value")?;
        match value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => {
                if s.eq_ignore_ascii_case("lo") {
                    None
                } else {
                    s.parse().ok()
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot_with_air_temp(value: serde_json::Value) -> VehicleSnapshot {
        VehicleSnapshot {
            collected_at: chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            vendor_updated_at: None,
            vehicle_id: Some("VIN123".into()),
            payload_digest: "abc".into(),
            odometer_km: Some(5000.0),
            battery: BatterySnapshot::default(),
            location: None,
            trips: vec![],
            raw: json!({ "airTemp": { "value": value } }),
            is_cached: false,
        }
    }

    #[test]
    fn vehicle_temp_reads_numeric_and_string_values() {
        assert_eq!(snapshot_with_air_temp(json!(72.0)).vehicle_temp_f(), Some(72.0));
        assert_eq!(snapshot_with_air_temp(json!("68")).vehicle_temp_f(), Some(68.0));
    }

    #[test]
    fn vehicle_temp_lo_sentinel_is_none() {
        assert_eq!(snapshot_with_air_temp(json!("LO")).vehicle_temp_f(), None);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = snapshot_with_air_temp(json!(72.0));
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: VehicleSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.collected_at, snapshot.collected_at);
        assert_eq!(decoded.payload_digest, snapshot.payload_digest);
        assert_eq!(decoded.odometer_km, snapshot.odometer_km);
        assert_eq!(decoded.raw, snapshot.raw);
    }
}
