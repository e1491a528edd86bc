//! Response cache for normalized vehicle snapshots.
//!
//! Two orthogonal time thresholds govern the cache. *Validity* is how long a
//! snapshot short-circuits a new API call; it is derived from the daily
//! quota (95% of the even poll interval). *Retention* is how long the
//! timestamped history copies are kept for audit, configured in hours.

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::domain::VehicleSnapshot;

/// Cache key for one (vehicle, method) pair.
pub fn fingerprint(vehicle_id: &str, method: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vehicle_id.as_bytes());
    hasher.update(b"_");
    hasher.update(method.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// Classified upstream failure, persisted for later analysis.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub error_type: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<String>,
    pub region: u8,
    pub brand: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
}

pub struct ResponseCache {
    dir: PathBuf,
    enabled: bool,
    validity: Duration,
    retention: Duration,
}

impl ResponseCache {
    pub fn new(dir: &Path, enabled: bool, daily_limit: u32, retention_hours: f64) -> Result<Self> {
        // 95% of the even poll interval leaves a safety margin so a
        // scheduler firing exactly on the interval never reads its own
        // previous response back.
        let validity_minutes = (24.0 * 60.0 / daily_limit as f64) * 0.95;
        let cache = Self {
            dir: dir.to_path_buf(),
            enabled,
            validity: Duration::from_secs_f64(validity_minutes * 60.0),
            retention: Duration::from_secs_f64(retention_hours * 3600.0),
        };
        fs::create_dir_all(&cache.dir)
            .with_context(|| format!("creating cache dir {}", cache.dir.display()))?;
        debug!(
            validity_minutes = format!("{validity_minutes:.1}"),
            retention_hours, "response cache configured"
        );
        Ok(cache)
    }

    #[cfg(test)]
    pub fn with_durations(dir: &Path, validity: Duration, retention: Duration) -> Self {
        fs::create_dir_all(dir).unwrap();
        Self { dir: dir.to_path_buf(), enabled: true, validity, retention }
    }

    fn current_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Age of the current entry, from the file's modification time.
    pub fn age(&self, fingerprint: &str) -> Option<Duration> {
        let metadata = fs::metadata(self.current_path(fingerprint)).ok()?;
        let modified = metadata.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    /// Current entry if caching is enabled and the entry is still within
    /// validity. An entry aged exactly at the validity horizon is stale.
    pub fn load_valid(&self, fingerprint: &str) -> Option<VehicleSnapshot> {
        if !self.enabled {
            return None;
        }
        let age = self.age(fingerprint)?;
        if age >= self.validity {
            return None;
        }
        self.peek(fingerprint)
    }

    /// Current entry regardless of validity (used for freshness comparison
    /// against the previous poll).
    pub fn peek(&self, fingerprint: &str) -> Option<VehicleSnapshot> {
        let contents = fs::read_to_string(self.current_path(fingerprint)).ok()?;
        match serde_json::from_str(&contents) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(error = %err, fingerprint, "unreadable cache entry");
                None
            }
        }
    }

    /// Most recent snapshot on disk within retention, used as a stale
    /// fallback when the quota is exhausted or the vendor is down.
    pub fn load_stale(&self) -> Option<VehicleSnapshot> {
        let entries = fs::read_dir(&self.dir).ok()?;
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json")
                || name.starts_with("error_")
                || name.starts_with("weather_")
            {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().map(|(ts, _)| modified > *ts).unwrap_or(true) {
                newest = Some((modified, entry.path()));
            }
        }

        let (modified, path) = newest?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age > self.retention {
            warn!(path = %path.display(), "latest cache file exceeds retention, not using as fallback");
            return None;
        }
        info!(age_secs = age.as_secs(), "using fallback cache");
        let contents = fs::read_to_string(&path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Write the current entry, a timestamped history copy, and garbage
    /// collect history files older than retention.
    pub fn store(&self, fingerprint: &str, snapshot: &VehicleSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(self.current_path(fingerprint), &json)
            .with_context(|| format!("writing cache entry {fingerprint}"))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let history = self.dir.join(format!("history_{stamp}_{fingerprint}.json"));
        fs::write(&history, &json)
            .with_context(|| format!("writing cache history {}", history.display()))?;

        self.cleanup_history(SystemTime::now() - self.retention);
        Ok(())
    }

    /// Remove history files whose modification time is before `cutoff`.
    pub fn cleanup_history(&self, cutoff: SystemTime) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("history_") || !name.ends_with(".json") {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if modified < cutoff && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "removed cache history files past retention");
        }
    }

    /// Delete current (non-history, non-error) cache files; returns the
    /// removed file names.
    pub fn clear_current(&self) -> Result<Vec<String>> {
        let mut cleared = Vec::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json")
                || name.starts_with("history_")
                || name.starts_with("error_")
            {
                continue;
            }
            if fs::remove_file(entry.path()).is_ok() {
                cleared.push(name);
            }
        }
        Ok(cleared)
    }

    /// Persist a classified failure for later analysis. Best effort: a
    /// failed error write is logged, never propagated.
    pub fn write_error_record(&self, record: &ErrorRecord) {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let name = match &record.error_stage {
            Some(stage) => format!("error_{stage}_{stamp}.json"),
            None => format!("error_{stamp}.json"),
        };
        let path = self.dir.join(name);
        match serde_json::to_string_pretty(record) {
            Ok(json) => {
                if let Err(err) = fs::write(&path, json) {
                    warn!(error = %err, path = %path.display(), "failed to write error record");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize error record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BatterySnapshot;
    use tempfile::TempDir;

    fn snapshot() -> VehicleSnapshot {
        VehicleSnapshot {
            collected_at: chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            vendor_updated_at: None,
            vehicle_id: Some("VIN123".into()),
            payload_digest: "d".into(),
            odometer_km: Some(5000.0),
            battery: BatterySnapshot { level: Some(60.0), ..Default::default() },
            location: None,
            trips: vec![],
            raw: serde_json::json!({}),
            is_cached: false,
        }
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = fingerprint("VIN123", "full_data");
        let b = fingerprint("VIN123", "full_data");
        let c = fingerprint("VIN456", "full_data");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn store_then_load_within_validity() {
        let dir = TempDir::new().unwrap();
        let cache =
            ResponseCache::with_durations(dir.path(), Duration::from_secs(3600), Duration::from_secs(7200));
        let fp = fingerprint("VIN123", "full_data");

        assert!(cache.load_valid(&fp).is_none());
        cache.store(&fp, &snapshot()).unwrap();

        let loaded = cache.load_valid(&fp).expect("entry should be valid");
        assert_eq!(loaded.battery.level, Some(60.0));
        assert!(cache.age(&fp).unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn zero_validity_means_always_stale() {
        let dir = TempDir::new().unwrap();
        let cache =
            ResponseCache::with_durations(dir.path(), Duration::ZERO, Duration::from_secs(7200));
        let fp = fingerprint("VIN123", "full_data");
        cache.store(&fp, &snapshot()).unwrap();

        // Validity check is strict: age >= validity is stale.
        assert!(cache.load_valid(&fp).is_none());
        // The stale fallback still sees it.
        assert!(cache.load_stale().is_some());
    }

    #[test]
    fn store_writes_history_copy() {
        let dir = TempDir::new().unwrap();
        let cache =
            ResponseCache::with_durations(dir.path(), Duration::from_secs(60), Duration::from_secs(7200));
        let fp = fingerprint("VIN123", "full_data");
        cache.store(&fp, &snapshot()).unwrap();

        let history: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("history_"))
            .collect();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn cleanup_removes_history_but_keeps_current() {
        let dir = TempDir::new().unwrap();
        let cache =
            ResponseCache::with_durations(dir.path(), Duration::from_secs(60), Duration::from_secs(7200));
        let fp = fingerprint("VIN123", "full_data");
        cache.store(&fp, &snapshot()).unwrap();

        cache.cleanup_history(SystemTime::now() + Duration::from_secs(3600));

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n == &format!("{fp}.json")));
        assert!(!names.iter().any(|n| n.starts_with("history_")));
    }

    #[test]
    fn clear_current_spares_history_and_errors() {
        let dir = TempDir::new().unwrap();
        let cache =
            ResponseCache::with_durations(dir.path(), Duration::from_secs(60), Duration::from_secs(7200));
        let fp = fingerprint("VIN123", "full_data");
        cache.store(&fp, &snapshot()).unwrap();
        cache.write_error_record(&ErrorRecord {
            timestamp: "2024-01-15 10:00:00".into(),
            error_type: "network".into(),
            error_message: "timeout".into(),
            error_stage: None,
            region: 3,
            brand: 2,
            vehicle_id: Some("VIN123".into()),
        });

        let cleared = cache.clear_current().unwrap();
        assert_eq!(cleared, vec![format!("{fp}.json")]);

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("history_")));
        assert!(names.iter().any(|n| n.starts_with("error_")));
    }

    #[test]
    fn stale_fallback_ignores_error_records() {
        let dir = TempDir::new().unwrap();
        let cache =
            ResponseCache::with_durations(dir.path(), Duration::from_secs(60), Duration::from_secs(7200));
        cache.write_error_record(&ErrorRecord {
            timestamp: "2024-01-15 10:00:00".into(),
            error_type: "unknown".into(),
            error_message: "boom".into(),
            error_stage: None,
            region: 3,
            brand: 2,
            vehicle_id: None,
        });
        assert!(cache.load_stale().is_none());
    }
}
