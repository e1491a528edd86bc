//! Normalizes a vendor record into the domain model.
//!
//! Unit rules are fixed by the vendor's US-region behavior: odometer and
//! speeds arrive in miles, trip durations in seconds, and trip distances
//! already in km. The range unit is tagged inside the payload (unit 3 is
//! miles). Cabin temperature stays in Fahrenheit; Celsius conversion
//! happens only for the canonical temperature column at storage time.

use chrono::NaiveDateTime;
use serde_json::Value;

use crate::domain::{timefmt, BatterySnapshot, LocationSnapshot, TripRecord, VehicleSnapshot};
use crate::freshness;
use crate::vendor::VehicleRecord;

pub const MILES_TO_KM: f64 = 1.60934;
const US_REGION: u8 = 3;
const RANGE_UNIT_MILES: i64 = 3;

/// Build a normalized snapshot from a vendor record.
pub fn normalize(record: &VehicleRecord, region: u8, collected_at: NaiveDateTime) -> VehicleSnapshot {
    let raw = merged_raw(record);

    let odometer_km = record.odometer.map(|value| {
        if region == US_REGION {
            (value * MILES_TO_KM).round()
        } else {
            value
        }
    });

    let battery = BatterySnapshot {
        level: record.ev_battery_percentage,
        is_charging: record.ev_battery_is_charging.unwrap_or(false),
        is_plugged_in: record.ev_battery_is_plugged_in,
        charging_power: charging_power(&raw),
        range_km: ev_range_km(&raw),
    };

    let location = match (record.location_latitude, record.location_longitude) {
        (Some(latitude), Some(longitude)) => Some(LocationSnapshot {
            latitude,
            longitude,
            last_updated: record.location_last_updated_at.clone(),
        }),
        _ => None,
    };

    let mut trips = extract_trips(&raw, collected_at);
    stamp_latest_trip(&mut trips, &location, vehicle_temp_f(&raw));

    VehicleSnapshot {
        collected_at,
        vendor_updated_at: record
            .last_updated_at
            .as_deref()
            .and_then(timefmt::parse_flexible),
        vehicle_id: record.vehicle_id.clone(),
        payload_digest: freshness::payload_digest(&raw),
        odometer_km,
        battery,
        location,
        trips,
        raw,
        is_cached: false,
    }
}

/// The preserved raw payload: the cabin temperature folded in under
/// `airTemp`, then everything from the record's `data`. Entries in `data`
/// win on key collisions.
fn merged_raw(record: &VehicleRecord) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "airTemp".to_string(),
        serde_json::json!({ "value": record.air_temperature.clone() }),
    );
    if let Value::Object(data) = &record.data {
        for (key, value) in data {
            map.insert(key.clone(), value.clone());
        }
    }
    Value::Object(map)
}

fn ev_status(raw: &Value) -> Option<&Value> {
    raw.get("vehicleStatus")?.get("evStatus")
}

/// Range from the nested drive-distance block, converted from miles when
/// the unit tag says so.
fn ev_range_km(raw: &Value) -> Option<f64> {
    let range = ev_status(raw)?
        .get("drvDistance")?
        .get(0)?
        .get("rangeByFuel")?
        .get("totalAvailableRange")?;
    let value = range.get("value")?.as_f64()?;
    let unit = range.get("unit").and_then(Value::as_i64);
    if unit == Some(RANGE_UNIT_MILES) {
        Some((value * MILES_TO_KM).round())
    } else {
        Some(value)
    }
}

fn charging_power(raw: &Value) -> Option<f64> {
    ev_status(raw)?.get("batteryStndChrgPower")?.as_f64()
}

fn vehicle_temp_f(raw: &Value) -> Option<f64> {
    match raw.get("airTemp")?.get("value")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.eq_ignore_ascii_case("lo") => s.parse().ok(),
        _ => None,
    }
}

fn extract_trips(raw: &Value, collected_at: NaiveDateTime) -> Vec<TripRecord> {
    if let Some(details) = raw
        .get("evTripDetails")
        .and_then(|d| d.get("tripdetails"))
        .and_then(Value::as_array)
    {
        return details
            .iter()
            .filter_map(|t| trip_from_details(t, collected_at))
            .collect();
    }

    // Older accounts only expose per-day aggregates.
    if let Some(stats) = raw.get("daily_stats").and_then(Value::as_array) {
        return stats
            .iter()
            .filter_map(|s| trip_from_daily_stat(s, collected_at))
            .collect();
    }

    Vec::new()
}

fn nested_value(trip: &Value, key: &str) -> Option<f64> {
    trip.get(key)?.get("value")?.as_f64()
}

fn trip_from_details(trip: &Value, collected_at: NaiveDateTime) -> Option<TripRecord> {
    let date = trip.get("startdate")?.as_str()?.to_string();

    let avg_speed_mph = nested_value(trip, "avgspeed");
    let max_speed_mph = nested_value(trip, "maxspeed");
    let duration_sec = nested_value(trip, "duration");
    let driving_sec = nested_value(trip, "mileagetime");

    let idle_time = match (duration_sec, driving_sec) {
        (Some(total), Some(driving)) => Some(((total - driving) / 60.0).round()),
        _ => None,
    };

    Some(TripRecord {
        timestamp: collected_at,
        date: timefmt::normalize_date_string(&date),
        distance: trip.get("distance").and_then(Value::as_f64),
        duration: duration_sec.map(|s| (s / 60.0).round()),
        average_speed: avg_speed_mph.map(|mph| (mph * MILES_TO_KM).round()),
        max_speed: max_speed_mph.map(|mph| (mph * MILES_TO_KM).round()),
        idle_time,
        trips_count: 1,
        total_consumed: trip.get("totalused").and_then(Value::as_f64),
        regenerated_energy: trip.get("regen").and_then(Value::as_f64),
        accessories_consumed: trip.get("accessories").and_then(Value::as_f64),
        climate_consumed: trip.get("climate").and_then(Value::as_f64),
        drivetrain_consumed: trip.get("drivetrain").and_then(Value::as_f64),
        battery_care_consumed: trip.get("batterycare").and_then(Value::as_f64),
        odometer_start: nested_value(trip, "odometer"),
        end_latitude: None,
        end_longitude: None,
        end_temperature: None,
    })
}

fn trip_from_daily_stat(stat: &Value, collected_at: NaiveDateTime) -> Option<TripRecord> {
    let date = stat.get("date")?.as_str()?.to_string();
    Some(TripRecord {
        timestamp: collected_at,
        date: timefmt::normalize_date_string(&date),
        distance: stat.get("distance").and_then(Value::as_f64),
        duration: None,
        average_speed: None,
        max_speed: None,
        idle_time: None,
        trips_count: 1,
        total_consumed: stat.get("total_consumed").and_then(Value::as_f64),
        regenerated_energy: stat.get("regenerated_energy").and_then(Value::as_f64),
        accessories_consumed: None,
        climate_consumed: None,
        drivetrain_consumed: None,
        battery_care_consumed: None,
        odometer_start: None,
        end_latitude: None,
        end_longitude: None,
        end_temperature: None,
    })
}

/// The most recent trip gets stamped with the vehicle's current position
/// and cabin temperature; the vendor does not report trip end locations.
fn stamp_latest_trip(
    trips: &mut [TripRecord],
    location: &Option<LocationSnapshot>,
    temp_f: Option<f64>,
) {
    let Some(loc) = location else {
        return;
    };
    let Some(latest) = trips
        .iter_mut()
        .max_by(|a, b| a.date.cmp(&b.date))
    else {
        return;
    };
    latest.end_latitude = Some(loc.latitude);
    latest.end_longitude = Some(loc.longitude);
    latest.end_temperature = temp_f;
}
