//! Derives charging sessions from sparsely sampled battery readings.
//!
//! Three signals indicate charging, in priority order: the vendor's
//! `is_charging` flag, a plugged-in vehicle whose level rose since the
//! previous reading, and (with no flags at all) a level jump of at least
//! two points, which means a timer-scheduled charge completed entirely
//! between polls. The engine is a pure state machine: callers load the
//! active session and the previous reading, and persist whatever sessions
//! come back.

use tracing::debug;

use crate::domain::{BatteryReading, ChargingSession};

/// Minimum battery-level rise (percentage points) that counts as a charge
/// having happened between two polls with no charging flags set.
const INFERRED_RISE_POINTS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChargeSignal {
    /// The vehicle is charging right now.
    Active,
    /// A charge completed between the previous poll and this one.
    InferredComplete,
    Idle,
}

pub struct ChargingEngine {
    capacity_kwh: f64,
    gap_threshold_minutes: f64,
}

impl ChargingEngine {
    pub fn new(capacity_kwh: f64, gap_threshold_minutes: f64) -> Self {
        Self { capacity_kwh, gap_threshold_minutes }
    }

    fn signal(previous: Option<&BatteryReading>, reading: &BatteryReading) -> ChargeSignal {
        if reading.is_charging {
            return ChargeSignal::Active;
        }
        let Some(prev) = previous else {
            return ChargeSignal::Idle;
        };
        if reading.is_plugged_in == Some(true) && reading.battery_level > prev.battery_level {
            return ChargeSignal::Active;
        }
        if reading.battery_level - prev.battery_level >= INFERRED_RISE_POINTS {
            return ChargeSignal::InferredComplete;
        }
        ChargeSignal::Idle
    }

    /// Feed one battery reading through the state machine.
    ///
    /// `active` is the at-most-one incomplete session currently stored;
    /// `previous` is the reading immediately before this one. Returns the
    /// sessions to upsert, keyed by `session_id`. The returned set never
    /// contains more than one incomplete session.
    pub fn observe(
        &self,
        active: Option<ChargingSession>,
        previous: Option<&BatteryReading>,
        reading: &BatteryReading,
        location: Option<(f64, f64)>,
    ) -> Vec<ChargingSession> {
        match (Self::signal(previous, reading), active) {
            (ChargeSignal::Active, None) => {
                let session = ChargingSession::open(
                    reading.timestamp,
                    reading.battery_level,
                    reading.charging_power,
                    location,
                );
                debug!(session_id = %session.session_id, "charging session started");
                vec![session]
            }
            (ChargeSignal::Active, Some(mut session)) => {
                let last_seen = session.end_time.unwrap_or(session.start_time);
                let gap_minutes = (reading.timestamp - last_seen).num_seconds() as f64 / 60.0;
                if gap_minutes > self.gap_threshold_minutes {
                    // Too long since the session was last observed: that
                    // charge ended, this reading opens a new one.
                    session.end_time = Some(last_seen);
                    session.is_complete = true;
                    session.recompute_derived(self.capacity_kwh);
                    let next = ChargingSession::open(
                        reading.timestamp,
                        reading.battery_level,
                        reading.charging_power,
                        location,
                    );
                    debug!(
                        closed = %session.session_id,
                        opened = %next.session_id,
                        gap_minutes = format!("{gap_minutes:.1}"),
                        "charging session split by gap"
                    );
                    vec![session, next]
                } else {
                    session.end_time = Some(reading.timestamp);
                    session.end_battery = reading.battery_level;
                    if let Some(power) = reading.charging_power {
                        if power > session.max_power {
                            session.max_power = power;
                        }
                    }
                    session.recompute_derived(self.capacity_kwh);
                    vec![session]
                }
            }
            (ChargeSignal::InferredComplete, None) => {
                // A whole session happened between two polls; synthesize it
                // from the two endpoints. The signal only fires with a
                // previous reading present.
                let Some(prev) = previous else {
                    return vec![];
                };
                let mut session = ChargingSession::open(
                    prev.timestamp,
                    prev.battery_level,
                    reading.charging_power,
                    location,
                );
                session.end_time = Some(reading.timestamp);
                session.end_battery = reading.battery_level;
                session.is_complete = true;
                session.recompute_derived(self.capacity_kwh);
                debug!(
                    session_id = %session.session_id,
                    energy_kwh = session.energy_added,
                    "inferred completed charging session from level jump"
                );
                vec![session]
            }
            (ChargeSignal::InferredComplete | ChargeSignal::Idle, Some(mut session)) => {
                session.end_time = Some(reading.timestamp);
                session.end_battery = reading.battery_level;
                session.is_complete = true;
                session.recompute_derived(self.capacity_kwh);
                debug!(session_id = %session.session_id, "charging session closed");
                vec![session]
            }
            (ChargeSignal::Idle, None) => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn reading(ts: NaiveDateTime, level: f64, charging: bool) -> BatteryReading {
        BatteryReading {
            timestamp: ts,
            battery_level: level,
            is_charging: charging,
            is_plugged_in: None,
            charging_power: None,
            range: None,
            temperature: None,
            odometer: None,
            meteo_temp: None,
            vehicle_temp: None,
            is_cached: false,
        }
    }

    fn engine() -> ChargingEngine {
        // 30 calls/day -> 48 min base interval, x1.5 gap multiplier.
        ChargingEngine::new(77.4, 72.0)
    }

    #[test]
    fn charging_flag_opens_a_session() {
        let r = reading(at(10, 0), 60.0, true);
        let out = engine().observe(None, None, &r, Some((45.0, -93.0)));
        assert_eq!(out.len(), 1);
        let s = &out[0];
        assert_eq!(s.session_id, "charge_20240115_100000");
        assert_eq!(s.start_battery, 60.0);
        assert!(!s.is_complete);
        assert_eq!(s.location_lat, Some(45.0));
    }

    #[test]
    fn update_tracks_level_and_max_power() {
        let eng = engine();
        let r1 = reading(at(10, 0), 60.0, true);
        let mut out = eng.observe(None, None, &r1, None);
        let active = out.remove(0);

        let mut r2 = reading(at(10, 48), 68.0, true);
        r2.charging_power = Some(11.0);
        let out = eng.observe(Some(active), Some(&r1), &r2, None);
        assert_eq!(out.len(), 1);
        let s = &out[0];
        assert!(!s.is_complete);
        assert_eq!(s.end_battery, 68.0);
        assert_eq!(s.max_power, 11.0);
        assert_eq!(s.duration_minutes, 48.0);
        assert_eq!(s.energy_added, 6.19);
    }

    #[test]
    fn not_charging_closes_the_active_session() {
        let eng = engine();
        let r1 = reading(at(10, 0), 60.0, true);
        let active = eng.observe(None, None, &r1, None).remove(0);

        let r2 = reading(at(10, 48), 68.0, false);
        let out = eng.observe(Some(active), Some(&r1), &r2, None);
        assert_eq!(out.len(), 1);
        let s = &out[0];
        assert!(s.is_complete);
        assert_eq!(s.end_battery, 68.0);
        assert_eq!(s.energy_added, 6.19);
    }

    #[test]
    fn inferred_session_from_level_jump_without_flags() {
        // Two snapshots 48 minutes apart, level 60 -> 68, no charging or
        // plug flags: a timer charge completed between polls.
        let eng = engine();
        let r1 = reading(at(10, 0), 60.0, false);
        let r2 = reading(at(10, 48), 68.0, false);

        let out = eng.observe(None, Some(&r1), &r2, None);
        assert_eq!(out.len(), 1);
        let s = &out[0];
        assert!(s.is_complete);
        assert_eq!(s.start_time, at(10, 0));
        assert_eq!(s.end_time, Some(at(10, 48)));
        assert_eq!(s.start_battery, 60.0);
        assert_eq!(s.end_battery, 68.0);
        assert_eq!(s.energy_added, 6.19);
    }

    #[test]
    fn small_rise_is_not_inferred_as_charging() {
        let eng = engine();
        let r1 = reading(at(10, 0), 60.0, false);
        let r2 = reading(at(10, 48), 61.5, false);
        assert!(eng.observe(None, Some(&r1), &r2, None).is_empty());
    }

    #[test]
    fn plugged_in_with_rise_counts_as_charging() {
        let eng = engine();
        let r1 = reading(at(10, 0), 60.0, false);
        let mut r2 = reading(at(10, 48), 61.0, false);
        r2.is_plugged_in = Some(true);

        let out = eng.observe(None, Some(&r1), &r2, None);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_complete);
        assert_eq!(out[0].start_battery, 61.0);
    }

    #[test]
    fn plugged_in_without_rise_is_idle() {
        let eng = engine();
        let r1 = reading(at(10, 0), 60.0, false);
        let mut r2 = reading(at(10, 48), 60.0, false);
        r2.is_plugged_in = Some(true);
        assert!(eng.observe(None, Some(&r1), &r2, None).is_empty());
    }

    #[test]
    fn gap_above_threshold_splits_sessions() {
        // Active session last updated 12:00; next charging reading 13:30.
        // 90 minutes > 72 minute threshold: close the old, open a new one.
        let eng = engine();
        let r1 = reading(at(12, 0), 50.0, true);
        let active = eng.observe(None, None, &r1, None).remove(0);

        let r2 = reading(at(13, 30), 70.0, true);
        let out = eng.observe(Some(active), Some(&r1), &r2, None);
        assert_eq!(out.len(), 2);

        let closed = &out[0];
        assert!(closed.is_complete);
        assert_eq!(closed.end_time, Some(at(12, 0)));

        let opened = &out[1];
        assert!(!opened.is_complete);
        assert_eq!(opened.start_time, at(13, 30));
        assert_eq!(opened.start_battery, 70.0);
    }

    #[test]
    fn gap_at_threshold_does_not_split() {
        let eng = engine();
        let r1 = reading(at(12, 0), 50.0, true);
        let active = eng.observe(None, None, &r1, None).remove(0);

        let r2 = reading(at(13, 12), 60.0, true); // exactly 72 min
        let out = eng.observe(Some(active), Some(&r1), &r2, None);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_complete);
    }

    #[test]
    fn at_most_one_open_session_in_output() {
        let eng = engine();
        let r1 = reading(at(12, 0), 50.0, true);
        let active = eng.observe(None, None, &r1, None).remove(0);
        let r2 = reading(at(14, 0), 70.0, true);
        let out = eng.observe(Some(active), Some(&r1), &r2, None);
        assert_eq!(out.iter().filter(|s| !s.is_complete).count(), 1);
    }
}
