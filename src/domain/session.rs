use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::timefmt;

/// A charging session derived from battery readings.
///
/// Mutable while `is_complete` is false; at most one incomplete session may
/// exist at any time. Derived fields obey:
/// `duration_minutes = end - start` in minutes,
/// `energy_added = max(0, end_battery - start_battery)/100 * capacity_kwh`,
/// `avg_power = energy_added / (duration/60)` when the duration is positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingSession {
    /// Derived from the start timestamp: `charge_YYYYMMDD_HHMMSS`.
    pub session_id: String,

    #[serde(with = "timefmt::csv_datetime")]
    pub start_time: NaiveDateTime,

    #[serde(default, with = "timefmt::csv_datetime_opt")]
    pub end_time: Option<NaiveDateTime>,

    pub duration_minutes: f64,

    pub start_battery: f64,
    pub end_battery: f64,

    /// kWh.
    pub energy_added: f64,

    /// kW.
    pub avg_power: f64,
    pub max_power: f64,

    #[serde(default)]
    pub location_lat: Option<f64>,
    #[serde(default)]
    pub location_lon: Option<f64>,

    #[serde(with = "timefmt::csv_bool")]
    pub is_complete: bool,
}

impl ChargingSession {
    /// Session id for a session starting at `start`.
    pub fn id_for(start: NaiveDateTime) -> String {
        format!("charge_{}", start.format("%Y%m%d_%H%M%S"))
    }

    /// Open a new session at `start` with the observed battery level.
    pub fn open(
        start: NaiveDateTime,
        battery_level: f64,
        charging_power: Option<f64>,
        location: Option<(f64, f64)>,
    ) -> Self {
        let power = charging_power.unwrap_or(0.0);
        Self {
            session_id: Self::id_for(start),
            start_time: start,
            end_time: None,
            duration_minutes: 0.0,
            start_battery: battery_level,
            end_battery: battery_level,
            energy_added: 0.0,
            avg_power: power,
            max_power: power,
            location_lat: location.map(|(lat, _)| lat),
            location_lon: location.map(|(_, lon)| lon),
            is_complete: false,
        }
    }

    /// Recompute the derived fields from the stored endpoints.
    pub fn recompute_derived(&mut self, capacity_kwh: f64) {
        if let Some(end) = self.end_time {
            let minutes = (end - self.start_time).num_seconds() as f64 / 60.0;
            self.duration_minutes = (minutes * 10.0).round() / 10.0;
        }
        let delta = (self.end_battery - self.start_battery).max(0.0);
        self.energy_added = ((delta / 100.0) * capacity_kwh * 100.0).round() / 100.0;
        self.avg_power = if self.duration_minutes > 0.0 {
            (self.energy_added / (self.duration_minutes / 60.0) * 100.0).round() / 100.0
        } else {
            0.0
        };
    }

    /// True when the stored derived fields disagree with the recomputed
    /// ones by more than the repair tolerances (1 minute / 0.5 kW), or when
    /// any of them is missing.
    pub fn needs_normalization(&self, capacity_kwh: f64) -> bool {
        if self.end_time.is_none() {
            return false;
        }
        let mut recomputed = self.clone();
        recomputed.recompute_derived(capacity_kwh);

        !self.duration_minutes.is_finite()
            || !self.energy_added.is_finite()
            || !self.avg_power.is_finite()
            || (self.duration_minutes - recomputed.duration_minutes).abs() > 1.0
            || (self.energy_added - recomputed.energy_added).abs() > 0.5
            || (self.avg_power - recomputed.avg_power).abs() > 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn session_id_derives_from_start() {
        assert_eq!(ChargingSession::id_for(at(10, 0)), "charge_20240115_100000");
    }

    #[test]
    fn derived_fields_follow_battery_delta() {
        let mut session = ChargingSession::open(at(10, 0), 60.0, Some(7.2), None);
        session.end_time = Some(at(10, 48));
        session.end_battery = 68.0;
        session.recompute_derived(77.4);

        assert_eq!(session.duration_minutes, 48.0);
        assert_eq!(session.energy_added, 6.19);
        assert_eq!(session.avg_power, 7.74);
    }

    #[test]
    fn negative_delta_is_clamped_to_zero_energy() {
        let mut session = ChargingSession::open(at(10, 0), 60.0, None, None);
        session.end_time = Some(at(11, 0));
        session.end_battery = 55.0;
        session.recompute_derived(77.4);

        assert_eq!(session.energy_added, 0.0);
        assert_eq!(session.avg_power, 0.0);
        // The observed end level stays as recorded.
        assert_eq!(session.end_battery, 55.0);
    }

    #[test]
    fn normalization_detects_inconsistent_rows() {
        let mut session = ChargingSession::open(at(10, 0), 60.0, None, None);
        session.end_time = Some(at(10, 48));
        session.end_battery = 68.0;
        session.recompute_derived(77.4);
        assert!(!session.needs_normalization(77.4));

        session.duration_minutes = 5.0;
        assert!(session.needs_normalization(77.4));
    }

    #[test]
    fn open_sessions_are_not_flagged() {
        let session = ChargingSession::open(at(10, 0), 60.0, None, None);
        assert!(!session.needs_normalization(77.4));
    }
}
