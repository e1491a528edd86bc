//! Timestamp parsing and serde helpers.
//!
//! The vendor API and historical CSV files carry timestamps in several
//! shapes: RFC 3339 with or without an offset, `YYYY-MM-DD HH:MM:SS` with an
//! optional fractional part (old rows end in `.0`), and the compact
//! `YYYYMMDDHHMMSS` form used inside raw payloads. Writes always use one
//! canonical format; reads accept all of them.

use chrono::{NaiveDate, NaiveDateTime};

pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
pub const COMPACT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Parse a timestamp in any of the accepted shapes. Offsets are dropped;
/// all comparisons in this crate are over naive wall-clock time.
pub fn parse_flexible(value: &str) -> Option<NaiveDateTime> {
    let mut candidate = value.trim();
    if candidate.is_empty() {
        return None;
    }
    if let Some(stripped) = candidate.strip_suffix('Z') {
        candidate = stripped;
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value.trim()) {
        return Some(dt.naive_local());
    }

    let formats = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        COMPACT_FORMAT,
    ];
    for fmt in formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(candidate, fmt) {
            return Some(dt);
        }
    }

    // Bare dates show up in trip records aggregated per day.
    if let Ok(date) = NaiveDate::parse_from_str(candidate, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    if candidate.len() == 8 && candidate.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(date) = NaiveDate::parse_from_str(candidate, "%Y%m%d") {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Strip the trailing `.0` that some historical trip dates carry.
pub fn normalize_date_string(value: &str) -> String {
    let trimmed = value.trim();
    trimmed.strip_suffix(".0").unwrap_or(trimmed).to_string()
}

/// Tolerant boolean parse for CSV cells written by several generations of
/// the collector (`true`, `True`, `1`, `yes`).
pub fn parse_loose_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Serde adapter for required timestamps in CSV rows.
pub mod csv_datetime {
    use super::*;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &NaiveDateTime, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&dt.format(CANONICAL_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(de)?;
        parse_flexible(&raw)
            .ok_or_else(|| de::Error::custom(format!("unparseable timestamp: {raw:?}")))
    }
}

/// Serde adapter for optional timestamps; empty cells round-trip to `None`.
pub mod csv_datetime_opt {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &Option<NaiveDateTime>, ser: S) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => ser.serialize_str(&dt.format(CANONICAL_FORMAT).to_string()),
            None => ser.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        Ok(raw.as_deref().and_then(parse_flexible))
    }
}

/// Serde adapter for boolean cells. Historical rows carry `True`/`False`
/// capitalization; serialization stays a plain bool, only reads are
/// loosened.
pub mod csv_bool {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bool(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(de)?;
        Ok(parse_loose_bool(&raw))
    }
}

/// Same as [`csv_bool`] but for optional flags (`is_plugged_in` is absent on
/// older firmware).
pub mod csv_bool_opt {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<bool>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => ser.serialize_some(v),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<bool>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        Ok(raw.and_then(|s| {
            let trimmed = s.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(parse_loose_bool(&trimmed))
            }
        }))
    }
}
