//! Distinguishes fresh vendor data from a server-side replay.
//!
//! The Bluelink backend frequently answers a forced refresh with the same
//! record it served last time. The vendor-reported update timestamp is the
//! primary signal; when it does not move, a digest of the raw payload is
//! the tie-breaker.

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

use crate::domain::{timefmt, VehicleSnapshot};

/// Stable digest of a raw payload. Keys are serialized in sorted order
/// (serde_json maps preserve insertion order, so the value is re-built
/// through a BTreeMap first) to make the digest independent of field order.
pub fn payload_digest(raw: &serde_json::Value) -> String {
    let canonical = canonicalize(raw);
    let serialized = serde_json::to_string(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// The vendor-reported update time for a snapshot, checked in order:
/// the normalized `vendor_updated_at`, then `raw.vehicleStatus.dateTime`,
/// then `raw.vehicleStatus.evStatus.lastUpdatedAt`.
pub fn vendor_timestamp(snapshot: &VehicleSnapshot) -> Option<NaiveDateTime> {
    if let Some(ts) = snapshot.vendor_updated_at {
        return Some(ts);
    }

    let vehicle_status = snapshot.raw.get("vehicleStatus");
    let candidates = [
        vehicle_status.and_then(|vs| vs.get("dateTime")),
        vehicle_status
            .and_then(|vs| vs.get("evStatus"))
            .and_then(|ev| ev.get("lastUpdatedAt")),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(raw) = candidate.as_str() {
            if let Some(ts) = timefmt::parse_flexible(raw) {
                return Some(ts);
            }
        }
    }
    None
}

/// Whether `new` carries new vehicle data relative to `previous`.
///
/// Decision table:
/// - both timestamps present, unequal: fresh either way (a timestamp that
///   moved backwards is clock skew, not a replay);
/// - both present and equal: fresh iff the payload digests differ;
/// - only the new snapshot has a timestamp: fresh;
/// - only the previous one has a timestamp: not fresh;
/// - neither: fresh (first observation).
pub fn is_fresh(new: &VehicleSnapshot, previous: Option<&VehicleSnapshot>) -> bool {
    let new_ts = vendor_timestamp(new);
    let prev_ts = previous.and_then(vendor_timestamp);

    match (new_ts, prev_ts) {
        (Some(n), Some(p)) => {
            if n != p {
                return true;
            }
            match previous {
                Some(prev) => new.payload_digest != prev.payload_digest,
                None => true,
            }
        }
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BatterySnapshot;
    use chrono::NaiveDate;
    use serde_json::json;

    fn snapshot(vendor_ts: Option<&str>, raw: serde_json::Value) -> VehicleSnapshot {
        VehicleSnapshot {
            collected_at: NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            vendor_updated_at: vendor_ts.and_then(timefmt::parse_flexible),
            vehicle_id: Some("VIN123".into()),
            payload_digest: payload_digest(&raw),
            odometer_km: None,
            battery: BatterySnapshot::default(),
            location: None,
            trips: vec![],
            raw,
            is_cached: false,
        }
    }

    #[test]
    fn newer_timestamp_is_fresh() {
        let prev = snapshot(Some("2024-01-15 09:00:00"), json!({"a": 1}));
        let new = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 1}));
        assert!(is_fresh(&new, Some(&prev)));
    }

    #[test]
    fn older_timestamp_is_treated_as_clock_skew_not_replay() {
        let prev = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 1}));
        let new = snapshot(Some("2024-01-15 09:00:00"), json!({"a": 1}));
        assert!(is_fresh(&new, Some(&prev)));
    }

    #[test]
    fn equal_timestamp_same_payload_is_a_replay() {
        let prev = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 1}));
        let new = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 1}));
        assert!(!is_fresh(&new, Some(&prev)));
    }

    #[test]
    fn equal_timestamp_different_payload_is_fresh() {
        let prev = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 1}));
        let new = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 2}));
        assert!(is_fresh(&new, Some(&prev)));
    }

    #[test]
    fn identical_snapshot_is_not_fresh() {
        let snap = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 1}));
        assert!(!is_fresh(&snap, Some(&snap)));
    }

    #[test]
    fn first_observation_is_fresh() {
        let snap = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 1}));
        assert!(is_fresh(&snap, None));

        let untimed = snapshot(None, json!({"a": 1}));
        assert!(is_fresh(&untimed, None));
    }

    #[test]
    fn timestamp_disappearing_is_not_fresh() {
        let prev = snapshot(Some("2024-01-15 10:00:00"), json!({"a": 1}));
        let new = snapshot(None, json!({"a": 2}));
        assert!(!is_fresh(&new, Some(&prev)));
    }

    #[test]
    fn vendor_timestamp_falls_back_to_raw_paths() {
        let raw = json!({
            "vehicleStatus": {
                "dateTime": "2024-01-15T10:30:00Z",
                "evStatus": { "lastUpdatedAt": "20240115093000" }
            }
        });
        let snap = snapshot(None, raw);
        let ts = vendor_timestamp(&snap).unwrap();
        assert_eq!(ts.format("%H:%M:%S").to_string(), "10:30:00");

        let raw = json!({
            "vehicleStatus": { "evStatus": { "lastUpdatedAt": "20240115093000" } }
        });
        let snap = snapshot(None, raw);
        let ts = vendor_timestamp(&snap).unwrap();
        assert_eq!(ts.format("%H:%M:%S").to_string(), "09:30:00");
    }

    #[test]
    fn digest_is_field_order_independent() {
        let a = json!({"x": 1, "y": {"b": 2, "a": 3}});
        let b = json!({"y": {"a": 3, "b": 2}, "x": 1});
        assert_eq!(payload_digest(&a), payload_digest(&b));
        assert_ne!(payload_digest(&a), payload_digest(&json!({"x": 2})));
    }
}
