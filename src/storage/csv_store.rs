//! CSV-file storage backend.
//!
//! One file per entity under the data directory. Trips, battery readings
//! and locations are append-only; the charging sessions table is
//! read-modify-written under an exclusive file lock because sessions
//! mutate until they close. Readers skip unparseable rows so a partially
//! written final line never poisons a read.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::charging::ChargingEngine;
use crate::domain::{BatteryReading, ChargingSession, LocationReading, TripRecord};
use crate::storage::{SnapshotBatch, Storage, StoreStats};

/// Column orders are fixed; downstream consumers read these files
/// positionally, and a mismatch between header and rows is a known
/// corruption class.
pub const TRIP_FIELDS: [&str; 18] = [
    "timestamp", "date", "distance", "duration", "average_speed", "max_speed",
    "idle_time", "trips_count", "total_consumed", "regenerated_energy",
    "accessories_consumed", "climate_consumed", "drivetrain_consumed",
    "battery_care_consumed", "odometer_start", "end_latitude", "end_longitude",
    "end_temperature",
];

pub const BATTERY_FIELDS: [&str; 11] = [
    "timestamp", "battery_level", "is_charging", "is_plugged_in",
    "charging_power", "range", "temperature", "odometer", "meteo_temp",
    "vehicle_temp", "is_cached",
];

pub const LOCATION_FIELDS: [&str; 4] = ["timestamp", "latitude", "longitude", "last_updated"];

pub const CHARGING_SESSION_FIELDS: [&str; 12] = [
    "session_id", "start_time", "end_time", "duration_minutes",
    "start_battery", "end_battery", "energy_added", "avg_power", "max_power",
    "location_lat", "location_lon", "is_complete",
];

pub struct CsvStorage {
    trips_file: PathBuf,
    battery_file: PathBuf,
    location_file: PathBuf,
    sessions_file: PathBuf,
    engine: ChargingEngine,
    capacity_kwh: f64,
}

impl CsvStorage {
    pub fn new(data_dir: &Path, capacity_kwh: f64, gap_threshold_minutes: f64) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let storage = Self {
            trips_file: data_dir.join("trips.csv"),
            battery_file: data_dir.join("battery_status.csv"),
            location_file: data_dir.join("locations.csv"),
            sessions_file: data_dir.join("charging_sessions.csv"),
            engine: ChargingEngine::new(capacity_kwh, gap_threshold_minutes),
            capacity_kwh,
        };
        storage.init_files()?;
        Ok(storage)
    }

    fn init_files(&self) -> Result<()> {
        init_file(&self.trips_file, &TRIP_FIELDS)?;
        init_file(&self.battery_file, &BATTERY_FIELDS)?;
        init_file(&self.location_file, &LOCATION_FIELDS)?;
        init_file(&self.sessions_file, &CHARGING_SESSION_FIELDS)?;
        Ok(())
    }

    fn read_trips(&self) -> Result<Vec<TripRecord>> {
        read_rows(&self.trips_file)
    }

    fn read_battery(&self) -> Result<Vec<BatteryReading>> {
        read_rows(&self.battery_file)
    }

    fn read_sessions(&self) -> Result<Vec<ChargingSession>> {
        read_rows(&self.sessions_file)
    }

    fn store_trips(&self, trips: &[TripRecord]) -> Result<(usize, usize)> {
        if trips.is_empty() {
            return Ok((0, 0));
        }
        let mut existing: HashSet<String> =
            self.read_trips()?.iter().map(TripRecord::dedup_key).collect();

        let mut fresh = Vec::new();
        let mut skipped = 0usize;
        for trip in trips {
            if existing.insert(trip.dedup_key()) {
                fresh.push(trip.clone());
            } else {
                skipped += 1;
            }
        }

        if skipped > 0 {
            info!(skipped, "skipped duplicate trips");
        }
        if !fresh.is_empty() {
            info!(count = fresh.len(), "storing new trips");
            append_rows(&self.trips_file, &fresh)?;
        }
        Ok((fresh.len(), skipped))
    }

    /// Apply the charging engine for one new reading and upsert whatever
    /// sessions come back. The whole read-modify-write runs under an
    /// exclusive lock on the sessions file.
    fn track_session(
        &self,
        previous: Option<&BatteryReading>,
        reading: &BatteryReading,
        location: Option<(f64, f64)>,
    ) -> Result<usize> {
        let mut written = 0usize;
        self.rewrite_sessions(|sessions| {
            let active_idx = sessions.iter().rposition(|s| !s.is_complete);
            let active = active_idx.map(|i| sessions[i].clone());
            let updates = self.engine.observe(active, previous, reading, location);
            written = updates.len();
            for update in updates {
                match sessions.iter().rposition(|s| s.session_id == update.session_id) {
                    Some(idx) => sessions[idx] = update,
                    None => sessions.push(update),
                }
            }
            written > 0
        })?;
        Ok(written)
    }

    /// Read-modify-write the sessions table in place while holding an
    /// exclusive advisory lock on the file. The closure returns whether
    /// anything changed; an untouched table is left alone.
    fn rewrite_sessions(
        &self,
        mutate: impl FnOnce(&mut Vec<ChargingSession>) -> bool,
    ) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.sessions_file)
            .with_context(|| format!("opening {}", self.sessions_file.display()))?;
        file.lock_exclusive().context("locking charging sessions file")?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let mut sessions = parse_rows(&contents);

        if mutate(&mut sessions) {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new());
            writer.write_record(CHARGING_SESSION_FIELDS)?;
            for session in &sessions {
                writer.serialize(session)?;
            }
            let encoded = writer.into_inner().context("flushing session rows")?;

            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs2::FileExt::unlock(&file).context("unlocking charging sessions file")?;
        Ok(())
    }
}

#[async_trait]
impl Storage for CsvStorage {
    async fn store(&self, batch: &SnapshotBatch) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        (stats.new_trips, stats.duplicate_trips) = self.store_trips(&batch.trips)?;

        if let Some(reading) = &batch.reading {
            // Previous reading must be captured before this append.
            let previous = self.read_battery()?.into_iter().last();
            append_rows(&self.battery_file, std::slice::from_ref(reading))?;

            let location = batch.location.as_ref().map(|l| (l.latitude, l.longitude));
            match self.track_session(previous.as_ref(), reading, location) {
                Ok(written) => stats.sessions_written = written,
                Err(err) => warn!(error = %err, "charging session tracking failed"),
            }
        }

        if let Some(location) = &batch.location {
            append_rows(&self.location_file, std::slice::from_ref(location))?;
        }

        debug!(
            new_trips = stats.new_trips,
            sessions = stats.sessions_written,
            "stored snapshot batch"
        );
        Ok(stats)
    }

    async fn trips(&self) -> Result<Vec<TripRecord>> {
        self.read_trips()
    }

    async fn latest_trips(&self, n: usize) -> Result<Vec<TripRecord>> {
        let mut trips = self.read_trips()?;
        trips.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        trips.truncate(n);
        Ok(trips)
    }

    async fn battery_history(&self, days: Option<f64>) -> Result<Vec<BatteryReading>> {
        let mut rows = self.read_battery()?;
        if let Some(days) = days {
            let cutoff =
                Local::now().naive_local() - chrono::Duration::seconds((days * 86_400.0) as i64);
            rows.retain(|r| r.timestamp >= cutoff);
        }
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    async fn locations(&self) -> Result<Vec<LocationReading>> {
        let mut rows: Vec<LocationReading> = read_rows(&self.location_file)?;
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    async fn charging_sessions(&self) -> Result<Vec<ChargingSession>> {
        let sessions = self.read_sessions()?;
        let needs_repair = sessions
            .iter()
            .any(|s| s.needs_normalization(self.capacity_kwh));
        if !needs_repair {
            return Ok(sessions);
        }

        // Inconsistent derived fields are a known corruption class from a
        // historical column-order bug; repair in place.
        let mut repaired = 0usize;
        let mut result = Vec::new();
        self.rewrite_sessions(|sessions| {
            for session in sessions.iter_mut() {
                if session.needs_normalization(self.capacity_kwh) {
                    session.recompute_derived(self.capacity_kwh);
                    repaired += 1;
                }
            }
            result = sessions.clone();
            repaired > 0
        })?;
        if repaired > 0 {
            info!(repaired, "normalized charging session rows");
        }
        Ok(result)
    }
}

fn init_file(path: &Path, fields: &[&str]) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writeln!(file, "{}", fields.join(","))?;
    Ok(())
}

fn append_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {} for append", path.display()))?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_rows(&contents))
}

fn parse_rows<T: DeserializeOwned>(contents: &str) -> Vec<T> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(contents.as_bytes());
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        match result {
            Ok(row) => rows.push(row),
            // A truncated final line from an in-flight append parses as an
            // error; skip it rather than failing the whole read.
            Err(err) => debug!(error = %err, "skipping unparseable CSV row"),
        }
    }
    rows
}
