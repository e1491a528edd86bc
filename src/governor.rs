//! Daily API quota accounting shared between the collector and the
//! dashboard, which may run as separate OS processes over the same data
//! directory. Every read-modify-write of the persisted state happens under
//! an advisory file lock; writers replace the file atomically via a temp
//! file and rename.

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::domain::timefmt;

const CALL_SOURCE_RING: usize = 50;
const EVENT_RING: usize = 200;
const MAX_BACKOFF: f64 = 4.0;
const BACKOFF_STEP: f64 = 1.5;

/// One recorded upstream call, kept for debugging the quota budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(with = "timefmt::csv_datetime")]
    pub time: NaiveDateTime,
    pub source: String,
    pub call_number: u32,
}

/// One vendor rate-limit rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEvent {
    #[serde(with = "timefmt::csv_datetime")]
    pub timestamp: NaiveDateTime,
    pub source: String,
    pub error_message: String,
    pub calls_at_time: u32,
    pub daily_limit: u32,
    pub backoff_multiplier: f64,
}

/// Persisted governor state, one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GovernorState {
    last_reset: NaiveDate,
    calls_today: u32,
    #[serde(default, with = "timefmt::csv_datetime_opt")]
    last_call: Option<NaiveDateTime>,
    backoff_multiplier: f64,
    #[serde(default)]
    call_sources: Vec<CallRecord>,
}

impl GovernorState {
    fn empty(today: NaiveDate) -> Self {
        Self {
            last_reset: today,
            calls_today: 0,
            last_call: None,
            backoff_multiplier: 1.0,
            call_sources: Vec::new(),
        }
    }

    /// Zero the counters when the stored date is earlier than today.
    /// Idempotent, so two processes observing midnight concurrently still
    /// reset exactly once.
    fn maybe_reset(&mut self, today: NaiveDate) {
        if self.last_reset < today {
            info!(
                previous_calls = self.calls_today,
                previous_date = %self.last_reset,
                "new day detected, resetting API call counter"
            );
            *self = Self::empty(today);
        }
    }
}

/// Snapshot of the governor for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub calls_today: u32,
    pub daily_limit: u32,
    pub remaining_calls: u32,
    #[serde(with = "timefmt::csv_datetime_opt")]
    pub last_call: Option<NaiveDateTime>,
    #[serde(with = "timefmt::csv_datetime_opt")]
    pub next_collection: Option<NaiveDateTime>,
    pub collection_interval_minutes: f64,
    pub backoff_multiplier: f64,
    pub adjusted_interval_minutes: f64,
    pub minutes_until_reset: f64,
    pub is_rate_limited: bool,
    pub recent_calls: Vec<CallRecord>,
    pub recent_rate_limit_events: Vec<RateLimitEvent>,
}

/// Enforces the configured daily call budget across processes.
pub struct RateLimitGovernor {
    daily_limit: u32,
    state_path: PathBuf,
    events_path: PathBuf,
}

impl RateLimitGovernor {
    pub fn new(data_dir: &Path, daily_limit: u32) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        Ok(Self {
            daily_limit,
            state_path: data_dir.join("api_call_history.json"),
            events_path: data_dir.join("rate_limit_events.json"),
        })
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Minutes between collections when the budget is spread evenly.
    pub fn collection_interval_minutes(&self) -> f64 {
        (24.0 * 60.0) / self.daily_limit as f64
    }

    /// Base interval inflated by the current backoff multiplier.
    pub fn adjusted_interval_minutes(&self) -> f64 {
        self.collection_interval_minutes() * self.read_state().backoff_multiplier
    }

    /// Whether an upstream call is allowed right now. Rolls the counter
    /// over at local midnight as a side effect.
    pub fn can_call(&self) -> bool {
        let limit = self.daily_limit;
        match self.update_state(|state| state.calls_today < limit) {
            Ok(allowed) => allowed,
            Err(err) => {
                // An unreadable state file must never stall the collector.
                warn!(error = %err, "governor state unavailable, allowing call");
                true
            }
        }
    }

    pub fn remaining_calls(&self) -> u32 {
        self.daily_limit.saturating_sub(self.read_state().calls_today)
    }

    pub fn last_call(&self) -> Option<NaiveDateTime> {
        self.read_state().last_call
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.read_state().backoff_multiplier
    }

    /// Record that an upstream call was made. `source` identifies the
    /// trigger (`scheduler`, `manual`, ...).
    pub fn record_call(&self, source: &str) -> Result<()> {
        let limit = self.daily_limit;
        let (calls, now) = self.update_state(|state| {
            let now = Local::now().naive_local();
            state.calls_today += 1;
            state.last_call = Some(now);
            state.call_sources.push(CallRecord {
                time: now,
                source: source.to_string(),
                call_number: state.calls_today,
            });
            let overflow = state.call_sources.len().saturating_sub(CALL_SOURCE_RING);
            if overflow > 0 {
                state.call_sources.drain(..overflow);
            }
            (state.calls_today, now)
        })?;
        info!(source, calls, limit, at = %now, "API call recorded");
        Ok(())
    }

    /// Record a vendor rate-limit rejection: inflate the backoff multiplier
    /// and append an event to the ring log.
    pub fn record_rate_limit_hit(&self, source: &str, error_message: &str) -> Result<()> {
        let limit = self.daily_limit;
        let (calls, backoff) = self.update_state(|state| {
            state.backoff_multiplier = (state.backoff_multiplier * BACKOFF_STEP).min(MAX_BACKOFF);
            (state.calls_today, state.backoff_multiplier)
        })?;

        let message: String = error_message.chars().take(500).collect();
        let event = RateLimitEvent {
            timestamp: Local::now().naive_local(),
            source: source.to_string(),
            error_message: message,
            calls_at_time: calls,
            daily_limit: limit,
            backoff_multiplier: backoff,
        };
        self.append_event(event)?;

        warn!(
            source,
            calls,
            limit,
            backoff = format!("{backoff:.2}x"),
            "vendor rate limit hit"
        );
        Ok(())
    }

    /// Reset the backoff multiplier after a confirmed successful call.
    pub fn reset_backoff(&self) -> Result<()> {
        let previous = self.update_state(|state| {
            let previous = state.backoff_multiplier;
            state.backoff_multiplier = 1.0;
            previous
        })?;
        if previous > 1.0 {
            info!(previous = format!("{previous:.2}x"), "backoff reset after successful call");
        }
        Ok(())
    }

    /// Current status for the dashboard.
    pub fn status(&self) -> GovernorStatus {
        let state = self.read_state();
        let now = Local::now().naive_local();
        let interval = self.collection_interval_minutes();
        let adjusted = interval * state.backoff_multiplier;

        let next_collection = state.last_call.map(|last| {
            let candidate = last + Duration::seconds((adjusted * 60.0) as i64);
            if candidate <= now {
                now + Duration::seconds(30)
            } else {
                candidate
            }
        });

        let tomorrow = (now.date() + Duration::days(1)).and_hms_opt(0, 0, 0).unwrap_or(now);
        let minutes_until_reset = (tomorrow - now).num_seconds() as f64 / 60.0;

        let events = self.read_events();
        GovernorStatus {
            calls_today: state.calls_today,
            daily_limit: self.daily_limit,
            remaining_calls: self.daily_limit.saturating_sub(state.calls_today),
            last_call: state.last_call,
            next_collection,
            collection_interval_minutes: (interval * 10.0).round() / 10.0,
            backoff_multiplier: state.backoff_multiplier,
            adjusted_interval_minutes: (adjusted * 10.0).round() / 10.0,
            minutes_until_reset: (minutes_until_reset * 10.0).round() / 10.0,
            is_rate_limited: state.backoff_multiplier > 1.0,
            recent_calls: state.call_sources.iter().rev().take(10).rev().cloned().collect(),
            recent_rate_limit_events: events.iter().rev().take(5).rev().cloned().collect(),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Load, mutate and persist the state under an exclusive lock.
    fn update_state<R>(&self, mutate: impl FnOnce(&mut GovernorState) -> R) -> Result<R> {
        let today = Local::now().date_naive();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.state_path)
            .with_context(|| format!("opening {}", self.state_path.display()))?;
        file.lock_exclusive().context("locking governor state")?;

        let mut state = read_json_or(&mut file, || GovernorState::empty(today));
        state.maybe_reset(today);
        let result = mutate(&mut state);

        let outcome = replace_with_json(&self.state_path, &state);
        let unlock = fs2::FileExt::unlock(&file);
        outcome?;
        unlock.context("unlocking governor state")?;
        Ok(result)
    }

    /// Read the state under a shared lock. Day rollover is applied
    /// in-memory only; the next mutation persists it.
    fn read_state(&self) -> GovernorState {
        let today = Local::now().date_naive();
        let mut file = match OpenOptions::new().read(true).open(&self.state_path) {
            Ok(f) => f,
            Err(_) => return GovernorState::empty(today),
        };
        if file.lock_shared().is_err() {
            return GovernorState::empty(today);
        }
        let mut state = read_json_or(&mut file, || GovernorState::empty(today));
        let _ = fs2::FileExt::unlock(&file);
        state.maybe_reset(today);
        state
    }

    fn append_event(&self, event: RateLimitEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.events_path)
            .with_context(|| format!("opening {}", self.events_path.display()))?;
        file.lock_exclusive().context("locking rate limit event log")?;

        let mut events: Vec<RateLimitEvent> = read_json_or(&mut file, Vec::new);
        events.push(event);
        let overflow = events.len().saturating_sub(EVENT_RING);
        if overflow > 0 {
            events.drain(..overflow);
        }

        let outcome = replace_with_json(&self.events_path, &events);
        let unlock = fs2::FileExt::unlock(&file);
        outcome?;
        unlock.context("unlocking rate limit event log")?;
        Ok(())
    }

    fn read_events(&self) -> Vec<RateLimitEvent> {
        let mut file = match OpenOptions::new().read(true).open(&self.events_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        if file.lock_shared().is_err() {
            return Vec::new();
        }
        let events = read_json_or(&mut file, Vec::new);
        let _ = fs2::FileExt::unlock(&file);
        events
    }
}

/// Parse the file's JSON contents, falling back to `fallback` when the file
/// is empty or corrupt. Corruption is logged and never propagated; the
/// collector must not crash over a damaged governor file.
fn read_json_or<T: DeserializeOwned>(file: &mut fs::File, fallback: impl FnOnce() -> T) -> T {
    let mut contents = String::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_string(&mut contents).is_err() {
        return fallback();
    }
    if contents.trim().is_empty() {
        return fallback();
    }
    match serde_json::from_str(&contents) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "corrupt governor file, starting from empty state");
            fallback()
        }
    }
}

/// Atomically replace `path` with the pretty-printed JSON of `value`.
fn replace_with_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("opening {}", tmp_path.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn governor(dir: &TempDir, limit: u32) -> RateLimitGovernor {
        RateLimitGovernor::new(dir.path(), limit).unwrap()
    }

    #[test]
    fn counts_calls_up_to_the_daily_limit() {
        let dir = TempDir::new().unwrap();
        let gov = governor(&dir, 3);

        assert!(gov.can_call());
        for _ in 0..2 {
            gov.record_call("scheduler").unwrap();
        }
        assert!(gov.can_call());
        assert_eq!(gov.remaining_calls(), 1);

        gov.record_call("scheduler").unwrap();
        assert!(!gov.can_call());
        assert_eq!(gov.remaining_calls(), 0);
    }

    #[test]
    fn state_survives_reconstruction_over_same_dir() {
        let dir = TempDir::new().unwrap();
        {
            let gov = governor(&dir, 30);
            gov.record_call("scheduler").unwrap();
            gov.record_call("manual").unwrap();
        }
        let gov = governor(&dir, 30);
        assert_eq!(gov.remaining_calls(), 28);
        assert!(gov.last_call().is_some());
    }

    #[test]
    fn backoff_climbs_and_clamps() {
        let dir = TempDir::new().unwrap();
        let gov = governor(&dir, 30);

        let expected = [1.5, 2.25, 3.375, 4.0, 4.0];
        for want in expected {
            gov.record_rate_limit_hit("scheduler", "429 too many requests").unwrap();
            assert!((gov.backoff_multiplier() - want).abs() < 1e-9);
        }
    }

    #[test]
    fn backoff_resets_after_success() {
        let dir = TempDir::new().unwrap();
        let gov = governor(&dir, 30);
        gov.record_rate_limit_hit("scheduler", "throttled").unwrap();
        assert!(gov.backoff_multiplier() > 1.0);
        gov.reset_backoff().unwrap();
        assert_eq!(gov.backoff_multiplier(), 1.0);
    }

    #[test]
    fn adjusted_interval_follows_backoff() {
        let dir = TempDir::new().unwrap();
        let gov = governor(&dir, 30);
        assert_eq!(gov.collection_interval_minutes(), 48.0);
        gov.record_rate_limit_hit("scheduler", "throttled").unwrap();
        assert!((gov.adjusted_interval_minutes() - 72.0).abs() < 1e-9);
    }

    #[test]
    fn corrupt_state_file_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("api_call_history.json"), b"{not json").unwrap();
        let gov = governor(&dir, 30);
        assert!(gov.can_call());
        assert_eq!(gov.remaining_calls(), 30);
        gov.record_call("scheduler").unwrap();
        assert_eq!(gov.remaining_calls(), 29);
    }

    #[test]
    fn day_rollover_resets_counters_once() {
        let today = Local::now().date_naive();
        let mut state = GovernorState {
            last_reset: today - Duration::days(1),
            calls_today: 30,
            last_call: Some(Local::now().naive_local()),
            backoff_multiplier: 2.5,
            call_sources: vec![],
        };
        state.maybe_reset(today);
        assert_eq!(state.calls_today, 0);
        assert_eq!(state.backoff_multiplier, 1.0);
        assert!(state.last_call.is_none());

        // Applying the rollover again is a no-op.
        state.calls_today = 5;
        state.maybe_reset(today);
        assert_eq!(state.calls_today, 5);
    }

    #[test]
    fn status_reports_rings_and_reset_window() {
        let dir = TempDir::new().unwrap();
        let gov = governor(&dir, 30);
        for i in 0..12 {
            gov.record_call(&format!("source_{i}")).unwrap();
        }
        gov.record_rate_limit_hit("manual", "quota exceeded").unwrap();

        let status = gov.status();
        assert_eq!(status.calls_today, 12);
        assert_eq!(status.recent_calls.len(), 10);
        assert_eq!(status.recent_calls.last().unwrap().source, "source_11");
        assert_eq!(status.recent_rate_limit_events.len(), 1);
        assert!(status.is_rate_limited);
        assert!(status.minutes_until_reset > 0.0);
        assert!(status.minutes_until_reset <= 24.0 * 60.0);
        assert!(status.next_collection.is_some());
    }

    #[test]
    fn call_source_ring_is_bounded() {
        let dir = TempDir::new().unwrap();
        let gov = governor(&dir, 200);
        for i in 0..60 {
            gov.record_call(&format!("s{i}")).unwrap();
        }
        let raw = fs::read_to_string(dir.path().join("api_call_history.json")).unwrap();
        let state: GovernorState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.call_sources.len(), CALL_SOURCE_RING);
        assert_eq!(state.call_sources.last().unwrap().call_number, 60);
    }
}
