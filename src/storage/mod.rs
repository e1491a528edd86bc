//! Storage backends for the collected time series.
//!
//! One trait, three variants: CSV files, SQLite, and a dual-write mode
//! that feeds both and reads from a configured side. Backends receive a
//! prepared [`SnapshotBatch`] so weather lookups and temperature-source
//! selection happen exactly once per poll, upstream of the write.

pub mod csv_store;
pub mod dual_store;
pub mod sql_store;

pub use csv_store::CsvStorage;
pub use dual_store::DualStorage;
pub use sql_store::SqlStorage;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{AppConfig, DualReadSide, StorageBackendKind, WeatherSource};
use crate::domain::{
    BatteryReading, ChargingSession, LocationReading, TripRecord, VehicleSnapshot,
};

/// Everything one poll contributes to storage.
#[derive(Debug, Clone)]
pub struct SnapshotBatch {
    pub snapshot: VehicleSnapshot,
    pub reading: Option<BatteryReading>,
    pub location: Option<LocationReading>,
    pub trips: Vec<TripRecord>,
}

/// Outcome counters for one store call.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub new_trips: usize,
    pub duplicate_trips: usize,
    pub sessions_written: usize,
}

/// Capability set every backend implements.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent append of one poll's data. Trips deduplicate on their
    /// identity key; battery and location rows always append; charging
    /// sessions are derived and upserted.
    async fn store(&self, batch: &SnapshotBatch) -> Result<StoreStats>;

    /// All trips, unordered.
    async fn trips(&self) -> Result<Vec<TripRecord>>;

    /// The `n` most recent trips by ingest time, newest first.
    async fn latest_trips(&self, n: usize) -> Result<Vec<TripRecord>>;

    /// Battery readings, oldest first, within the trailing window in days
    /// (`None` = all).
    async fn battery_history(&self, days: Option<f64>) -> Result<Vec<BatteryReading>>;

    /// All location readings, oldest first.
    async fn locations(&self) -> Result<Vec<LocationReading>>;

    /// All charging sessions, normalized: rows whose derived fields are
    /// missing or inconsistent beyond 1 minute / 0.5 kW are recomputed
    /// from their endpoints and persisted back.
    async fn charging_sessions(&self) -> Result<Vec<ChargingSession>>;
}

fn fahrenheit_to_celsius(f: f64) -> f64 {
    ((f - 32.0) * 5.0 / 9.0 * 10.0).round() / 10.0
}

/// Assemble the rows a snapshot contributes, selecting the canonical
/// temperature per the configured source. `meteo_temp_f` is the already
/// fetched Open-Meteo reading in Fahrenheit, when available.
pub fn prepare_batch(
    snapshot: VehicleSnapshot,
    meteo_temp_f: Option<f64>,
    source: WeatherSource,
) -> SnapshotBatch {
    let vehicle_temp = snapshot.vehicle_temp_f().map(fahrenheit_to_celsius);
    let meteo_temp = meteo_temp_f.map(fahrenheit_to_celsius);
    let temperature = match source {
        WeatherSource::Meteo => meteo_temp,
        WeatherSource::Vehicle => vehicle_temp,
    };

    let reading = snapshot.battery.level.map(|level| BatteryReading {
        timestamp: snapshot.collected_at,
        battery_level: level,
        is_charging: snapshot.battery.is_charging,
        is_plugged_in: snapshot.battery.is_plugged_in,
        charging_power: snapshot.battery.charging_power,
        range: snapshot.battery.range_km,
        temperature,
        odometer: snapshot.odometer_km,
        meteo_temp,
        vehicle_temp,
        is_cached: snapshot.is_cached,
    });

    let location = snapshot.location.as_ref().map(|loc| LocationReading {
        timestamp: snapshot.collected_at,
        latitude: loc.latitude,
        longitude: loc.longitude,
        last_updated: loc.last_updated.clone(),
    });

    let trips = snapshot.trips.clone();
    SnapshotBatch { snapshot, reading, location, trips }
}

/// Build the configured storage backend.
pub async fn create_storage(cfg: &AppConfig) -> Result<Arc<dyn Storage>> {
    let capacity = cfg.charging.battery_capacity_kwh;
    let gap = cfg
        .charging
        .gap_threshold_minutes(cfg.api.base_interval_minutes());

    match cfg.storage.backend {
        StorageBackendKind::Csv => Ok(Arc::new(CsvStorage::new(
            &cfg.storage.data_dir,
            capacity,
            gap,
        )?)),
        StorageBackendKind::Sql => Ok(Arc::new(
            SqlStorage::connect(&cfg.storage.database_url, capacity, gap).await?,
        )),
        StorageBackendKind::Dual => {
            let csv = Arc::new(CsvStorage::new(&cfg.storage.data_dir, capacity, gap)?);
            let sql =
                Arc::new(SqlStorage::connect(&cfg.storage.database_url, capacity, gap).await?);
            let read_from_sql = cfg.storage.dual_read_from == DualReadSide::Sql;
            Ok(Arc::new(DualStorage::new(csv, sql, read_from_sql)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatterySnapshot, LocationSnapshot};
    use chrono::NaiveDate;
    use serde_json::json;

    fn snapshot() -> VehicleSnapshot {
        VehicleSnapshot {
            collected_at: NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            vendor_updated_at: None,
            vehicle_id: Some("VIN123".into()),
            payload_digest: "d".into(),
            odometer_km: Some(5000.0),
            battery: BatterySnapshot {
                level: Some(60.0),
                is_charging: false,
                is_plugged_in: None,
                charging_power: None,
                range_km: Some(240.0),
            },
            location: Some(LocationSnapshot {
                latitude: 44.97,
                longitude: -93.26,
                last_updated: None,
            }),
            trips: vec![],
            raw: json!({ "airTemp": { "value": 32.0 } }),
            is_cached: false,
        }
    }

    #[test]
    fn meteo_source_selects_meteo_temperature() {
        let batch = prepare_batch(snapshot(), Some(50.0), WeatherSource::Meteo);
        let reading = batch.reading.unwrap();
        assert_eq!(reading.meteo_temp, Some(10.0));
        assert_eq!(reading.vehicle_temp, Some(0.0));
        assert_eq!(reading.temperature, Some(10.0));
    }

    #[test]
    fn vehicle_source_selects_cabin_temperature() {
        let batch = prepare_batch(snapshot(), Some(50.0), WeatherSource::Vehicle);
        let reading = batch.reading.unwrap();
        assert_eq!(reading.temperature, Some(0.0));
        // Both raw fields are preserved either way.
        assert_eq!(reading.meteo_temp, Some(10.0));
    }

    #[test]
    fn snapshot_without_battery_level_yields_no_reading() {
        let mut s = snapshot();
        s.battery.level = None;
        let batch = prepare_batch(s, None, WeatherSource::Meteo);
        assert!(batch.reading.is_none());
    }

    #[test]
    fn snapshot_without_location_still_produces_reading() {
        let mut s = snapshot();
        s.location = None;
        let batch = prepare_batch(s, None, WeatherSource::Meteo);
        assert!(batch.location.is_none());
        assert!(batch.reading.is_some());
    }
}
