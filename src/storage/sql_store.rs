//! SQLite storage backend.
//!
//! Same contract as the CSV backend over an embedded database. Timestamps
//! are stored as canonical text so rows stay greppable and the tolerant
//! parser applies on the way out. Trip dedup rides on a unique index over
//! the identity key; session upserts use `ON CONFLICT`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::charging::ChargingEngine;
use crate::domain::{
    timefmt, BatteryReading, ChargingSession, LocationReading, TripRecord,
};
use crate::storage::{SnapshotBatch, Storage, StoreStats};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trips (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    date TEXT NOT NULL,
    distance REAL,
    duration REAL,
    average_speed REAL,
    max_speed REAL,
    idle_time REAL,
    trips_count INTEGER NOT NULL DEFAULT 1,
    total_consumed REAL,
    regenerated_energy REAL,
    accessories_consumed REAL,
    climate_consumed REAL,
    drivetrain_consumed REAL,
    battery_care_consumed REAL,
    odometer_start REAL,
    end_latitude REAL,
    end_longitude REAL,
    end_temperature REAL,
    dedup_key TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trips_dedup ON trips(dedup_key);

CREATE TABLE IF NOT EXISTS battery_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    battery_level REAL NOT NULL,
    is_charging INTEGER NOT NULL,
    is_plugged_in INTEGER,
    charging_power REAL,
    range REAL,
    temperature REAL,
    odometer REAL,
    meteo_temp REAL,
    vehicle_temp REAL,
    is_cached INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_battery_timestamp ON battery_status(timestamp);

CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    last_updated TEXT
);

CREATE TABLE IF NOT EXISTS charging_sessions (
    session_id TEXT PRIMARY KEY,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration_minutes REAL NOT NULL DEFAULT 0,
    start_battery REAL NOT NULL,
    end_battery REAL NOT NULL,
    energy_added REAL NOT NULL DEFAULT 0,
    avg_power REAL NOT NULL DEFAULT 0,
    max_power REAL NOT NULL DEFAULT 0,
    location_lat REAL,
    location_lon REAL,
    is_complete INTEGER NOT NULL DEFAULT 0
);
"#;

pub struct SqlStorage {
    pool: SqlitePool,
    engine: ChargingEngine,
    capacity_kwh: f64,
}

impl SqlStorage {
    pub async fn connect(url: &str, capacity_kwh: f64, gap_threshold_minutes: f64) -> Result<Self> {
        // `sqlite://data/telemetry.db` needs its parent directory to exist.
        if let Some(path) = url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parsing database url {url}"))?
            .create_if_missing(true);
        // Single connection: SQLite serializes writers anyway, and a
        // `:memory:` database exists per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to sqlite database")?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            engine: ChargingEngine::new(capacity_kwh, gap_threshold_minutes),
            capacity_kwh,
        })
    }

    fn format_ts(ts: chrono::NaiveDateTime) -> String {
        ts.format(timefmt::CANONICAL_FORMAT).to_string()
    }

    async fn insert_trip(&self, trip: &TripRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO trips (
                timestamp, date, distance, duration, average_speed, max_speed,
                idle_time, trips_count, total_consumed, regenerated_energy,
                accessories_consumed, climate_consumed, drivetrain_consumed,
                battery_care_consumed, odometer_start, end_latitude,
                end_longitude, end_temperature, dedup_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Self::format_ts(trip.timestamp))
        .bind(timefmt::normalize_date_string(&trip.date))
        .bind(trip.distance)
        .bind(trip.duration)
        .bind(trip.average_speed)
        .bind(trip.max_speed)
        .bind(trip.idle_time)
        .bind(trip.trips_count as i64)
        .bind(trip.total_consumed)
        .bind(trip.regenerated_energy)
        .bind(trip.accessories_consumed)
        .bind(trip.climate_consumed)
        .bind(trip.drivetrain_consumed)
        .bind(trip.battery_care_consumed)
        .bind(trip.odometer_start)
        .bind(trip.end_latitude)
        .bind(trip.end_longitude)
        .bind(trip.end_temperature)
        .bind(trip.dedup_key())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_reading(&self, reading: &BatteryReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO battery_status (
                timestamp, battery_level, is_charging, is_plugged_in,
                charging_power, range, temperature, odometer, meteo_temp,
                vehicle_temp, is_cached
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Self::format_ts(reading.timestamp))
        .bind(reading.battery_level)
        .bind(reading.is_charging)
        .bind(reading.is_plugged_in)
        .bind(reading.charging_power)
        .bind(reading.range)
        .bind(reading.temperature)
        .bind(reading.odometer)
        .bind(reading.meteo_temp)
        .bind(reading.vehicle_temp)
        .bind(reading.is_cached)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_session(&self, session: &ChargingSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO charging_sessions (
                session_id, start_time, end_time, duration_minutes,
                start_battery, end_battery, energy_added, avg_power,
                max_power, location_lat, location_lon, is_complete
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                end_time = excluded.end_time,
                duration_minutes = excluded.duration_minutes,
                start_battery = excluded.start_battery,
                end_battery = excluded.end_battery,
                energy_added = excluded.energy_added,
                avg_power = excluded.avg_power,
                max_power = excluded.max_power,
                location_lat = excluded.location_lat,
                location_lon = excluded.location_lon,
                is_complete = excluded.is_complete
            "#,
        )
        .bind(&session.session_id)
        .bind(Self::format_ts(session.start_time))
        .bind(session.end_time.map(Self::format_ts))
        .bind(session.duration_minutes)
        .bind(session.start_battery)
        .bind(session.end_battery)
        .bind(session.energy_added)
        .bind(session.avg_power)
        .bind(session.max_power)
        .bind(session.location_lat)
        .bind(session.location_lon)
        .bind(session.is_complete)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_reading(&self) -> Result<Option<BatteryReading>> {
        let row = sqlx::query(
            "SELECT * FROM battery_status ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().and_then(reading_from_row))
    }

    async fn active_session(&self) -> Result<Option<ChargingSession>> {
        let row = sqlx::query(
            "SELECT * FROM charging_sessions WHERE is_complete = 0 ORDER BY start_time DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().and_then(session_from_row))
    }
}

#[async_trait]
impl Storage for SqlStorage {
    async fn store(&self, batch: &SnapshotBatch) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        for trip in &batch.trips {
            if self.insert_trip(trip).await? {
                stats.new_trips += 1;
            } else {
                stats.duplicate_trips += 1;
            }
        }
        if stats.duplicate_trips > 0 {
            info!(skipped = stats.duplicate_trips, "skipped duplicate trips");
        }

        if let Some(reading) = &batch.reading {
            let previous = self.last_reading().await?;
            self.insert_reading(reading).await?;

            let active = self.active_session().await?;
            let location = batch.location.as_ref().map(|l| (l.latitude, l.longitude));
            let updates = self.engine.observe(active, previous.as_ref(), reading, location);
            stats.sessions_written = updates.len();
            for session in updates {
                if let Err(err) = self.upsert_session(&session).await {
                    warn!(error = %err, session_id = %session.session_id, "session upsert failed");
                }
            }
        }

        if let Some(location) = &batch.location {
            sqlx::query(
                "INSERT INTO locations (timestamp, latitude, longitude, last_updated) VALUES (?, ?, ?, ?)",
            )
            .bind(Self::format_ts(location.timestamp))
            .bind(location.latitude)
            .bind(location.longitude)
            .bind(&location.last_updated)
            .execute(&self.pool)
            .await?;
        }

        debug!(new_trips = stats.new_trips, "stored snapshot batch (sql)");
        Ok(stats)
    }

    async fn trips(&self) -> Result<Vec<TripRecord>> {
        let rows = sqlx::query("SELECT * FROM trips").fetch_all(&self.pool).await?;
        Ok(rows.iter().filter_map(trip_from_row).collect())
    }

    async fn latest_trips(&self, n: usize) -> Result<Vec<TripRecord>> {
        let rows = sqlx::query("SELECT * FROM trips ORDER BY timestamp DESC LIMIT ?")
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(trip_from_row).collect())
    }

    async fn battery_history(&self, days: Option<f64>) -> Result<Vec<BatteryReading>> {
        let rows = match days {
            Some(days) => {
                let cutoff = Local::now().naive_local()
                    - chrono::Duration::seconds((days * 86_400.0) as i64);
                sqlx::query(
                    "SELECT * FROM battery_status WHERE timestamp >= ? ORDER BY timestamp ASC",
                )
                .bind(Self::format_ts(cutoff))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM battery_status ORDER BY timestamp ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().filter_map(reading_from_row).collect())
    }

    async fn locations(&self) -> Result<Vec<LocationReading>> {
        let rows = sqlx::query("SELECT * FROM locations ORDER BY timestamp ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(location_from_row).collect())
    }

    async fn charging_sessions(&self) -> Result<Vec<ChargingSession>> {
        let rows = sqlx::query("SELECT * FROM charging_sessions ORDER BY start_time ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut sessions: Vec<ChargingSession> =
            rows.iter().filter_map(session_from_row).collect();

        let mut repaired = 0usize;
        for session in sessions.iter_mut() {
            if session.needs_normalization(self.capacity_kwh) {
                session.recompute_derived(self.capacity_kwh);
                self.upsert_session(session).await?;
                repaired += 1;
            }
        }
        if repaired > 0 {
            info!(repaired, "normalized charging session rows");
        }
        Ok(sessions)
    }
}

// Row mapping. Timestamps come back as text and run through the tolerant
// parser; rows that fail to map are dropped rather than failing the read.

fn parse_ts(row: &sqlx::sqlite::SqliteRow, column: &str) -> Option<chrono::NaiveDateTime> {
    let raw: String = row.try_get(column).ok()?;
    timefmt::parse_flexible(&raw)
}

fn trip_from_row(row: &sqlx::sqlite::SqliteRow) -> Option<TripRecord> {
    Some(TripRecord {
        timestamp: parse_ts(row, "timestamp")?,
        date: row.try_get("date").ok()?,
        distance: row.try_get("distance").ok()?,
        duration: row.try_get("duration").ok()?,
        average_speed: row.try_get("average_speed").ok()?,
        max_speed: row.try_get("max_speed").ok()?,
        idle_time: row.try_get("idle_time").ok()?,
        trips_count: row.try_get::<i64, _>("trips_count").ok()? as u32,
        total_consumed: row.try_get("total_consumed").ok()?,
        regenerated_energy: row.try_get("regenerated_energy").ok()?,
        accessories_consumed: row.try_get("accessories_consumed").ok()?,
        climate_consumed: row.try_get("climate_consumed").ok()?,
        drivetrain_consumed: row.try_get("drivetrain_consumed").ok()?,
        battery_care_consumed: row.try_get("battery_care_consumed").ok()?,
        odometer_start: row.try_get("odometer_start").ok()?,
        end_latitude: row.try_get("end_latitude").ok()?,
        end_longitude: row.try_get("end_longitude").ok()?,
        end_temperature: row.try_get("end_temperature").ok()?,
    })
}

fn reading_from_row(row: &sqlx::sqlite::SqliteRow) -> Option<BatteryReading> {
    Some(BatteryReading {
        timestamp: parse_ts(row, "timestamp")?,
        battery_level: row.try_get("battery_level").ok()?,
        is_charging: row.try_get("is_charging").ok()?,
        is_plugged_in: row.try_get("is_plugged_in").ok()?,
        charging_power: row.try_get("charging_power").ok()?,
        range: row.try_get("range").ok()?,
        temperature: row.try_get("temperature").ok()?,
        odometer: row.try_get("odometer").ok()?,
        meteo_temp: row.try_get("meteo_temp").ok()?,
        vehicle_temp: row.try_get("vehicle_temp").ok()?,
        is_cached: row.try_get("is_cached").ok()?,
    })
}

fn location_from_row(row: &sqlx::sqlite::SqliteRow) -> Option<LocationReading> {
    Some(LocationReading {
        timestamp: parse_ts(row, "timestamp")?,
        latitude: row.try_get("latitude").ok()?,
        longitude: row.try_get("longitude").ok()?,
        last_updated: row.try_get("last_updated").ok()?,
    })
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Option<ChargingSession> {
    let end_time: Option<String> = row.try_get("end_time").ok()?;
    Some(ChargingSession {
        session_id: row.try_get("session_id").ok()?,
        start_time: parse_ts(row, "start_time")?,
        end_time: end_time.as_deref().and_then(timefmt::parse_flexible),
        duration_minutes: row.try_get("duration_minutes").ok()?,
        start_battery: row.try_get("start_battery").ok()?,
        end_battery: row.try_get("end_battery").ok()?,
        energy_added: row.try_get("energy_added").ok()?,
        avg_power: row.try_get("avg_power").ok()?,
        max_power: row.try_get("max_power").ok()?,
        location_lat: row.try_get("location_lat").ok()?,
        location_lon: row.try_get("location_lon").ok()?,
        is_complete: row.try_get("is_complete").ok()?,
    })
}
