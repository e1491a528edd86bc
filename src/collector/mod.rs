//! Collection pipeline and the long-running scheduler loop.
//!
//! The scheduler computes the next poll time from the governor's last-call
//! stamp and the backoff-adjusted interval, falling back to an evenly
//! distributed slot grid anchored at local midnight. One poll at a time;
//! a cancellation token unwinds the sleep for clean shutdown.

use anyhow::Result;
use chrono::{Duration, Local, NaiveDateTime};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::ResponseCache;
use crate::client::{FetchError, VehicleClient};
use crate::config::{AppConfig, WeatherSource};
use crate::domain::VehicleSnapshot;
use crate::governor::RateLimitGovernor;
use crate::storage::{self, Storage};
use crate::vendor::VendorApi;
use crate::weather::WeatherService;

/// Everything the collector loop and the HTTP handlers share.
#[derive(Clone)]
pub struct AppState {
    pub cfg: AppConfig,
    pub client: Arc<VehicleClient>,
    pub storage: Arc<dyn Storage>,
    pub governor: Arc<RateLimitGovernor>,
    pub cache: Arc<ResponseCache>,
    pub weather: Arc<WeatherService>,
}

/// Failure of one collection cycle.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("storage error: {0}")]
    Storage(anyhow::Error),
}

impl AppState {
    pub async fn new(cfg: AppConfig, vendor: Arc<dyn VendorApi>) -> Result<Self> {
        let governor = Arc::new(RateLimitGovernor::new(
            &cfg.storage.data_dir,
            cfg.api.daily_limit,
        )?);
        let cache = Arc::new(ResponseCache::new(
            &cfg.cache.dir,
            cfg.cache.enabled,
            cfg.api.daily_limit,
            cfg.cache.retention_hours,
        )?);
        let client = Arc::new(VehicleClient::new(
            vendor,
            Arc::clone(&cache),
            Arc::clone(&governor),
            cfg.api.clone(),
        ));
        let storage = storage::create_storage(&cfg).await?;
        let weather = Arc::new(WeatherService::new(cfg.weather.api_url.clone(), &cfg.cache.dir));

        Ok(Self { cfg, client, storage, governor, cache, weather })
    }

    /// One full collection: fetch, enrich with weather, store. Returns the
    /// snapshot even when it came from cache so callers can report it.
    pub async fn collect(&self, source: &str, force: bool) -> Result<VehicleSnapshot, CollectError> {
        let snapshot = self.client.fetch(source, force).await?;

        let meteo_temp = match (&self.cfg.weather.source, &snapshot.location) {
            (WeatherSource::Meteo, Some(loc)) => self
                .weather
                .current(loc.latitude, loc.longitude)
                .await
                .and_then(|w| w.temperature),
            (WeatherSource::Meteo, None) => {
                warn!("no vehicle location available for weather data");
                None
            }
            (WeatherSource::Vehicle, _) => None,
        };

        let batch = storage::prepare_batch(snapshot.clone(), meteo_temp, self.cfg.weather.source);
        self.storage
            .store(&batch)
            .await
            .map_err(CollectError::Storage)?;

        info!(
            battery = ?snapshot.battery.level,
            range_km = ?snapshot.battery.range_km,
            is_cached = snapshot.is_cached,
            "data collected"
        );
        Ok(snapshot)
    }
}

/// Next poll time.
///
/// With a last-call stamp, the candidate is `last + base * backoff`; if it
/// is already past, fall back to the grid. The grid distributes
/// `daily_limit` slots evenly from local midnight and picks the first slot
/// strictly in the future, or tomorrow midnight when none remain.
pub fn next_collection_time(
    now: NaiveDateTime,
    last_call: Option<NaiveDateTime>,
    daily_limit: u32,
    backoff_multiplier: f64,
) -> NaiveDateTime {
    let base_minutes = (24.0 * 60.0) / daily_limit.max(1) as f64;

    if let Some(last) = last_call {
        let adjusted = base_minutes * backoff_multiplier;
        let candidate = last + Duration::seconds((adjusted * 60.0) as i64);
        if candidate > now {
            return candidate;
        }
    }

    let midnight = now.date().and_hms_opt(0, 0, 0).expect("midnight is valid");
    let slot_seconds = (base_minutes * 60.0) as i64;
    for i in 0..daily_limit {
        let slot = midnight + Duration::seconds(slot_seconds * i as i64);
        if slot > now {
            return slot;
        }
    }
    midnight + Duration::days(1)
}

/// The long-running collector.
pub struct Collector {
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self { state, cancel }
    }

    /// Poll forever: sleep until the next slot (at least a minute), then
    /// collect, then recompute. Quota exhaustion is expected and only
    /// logged; unexpected errors wait five minutes before the next pass.
    pub async fn run_forever(&self) {
        let limit = self.state.governor.daily_limit();
        info!(daily_limit = limit, "starting data collector");
        if let Some(last) = self.state.governor.last_call() {
            info!(last_collection = %last, "resuming schedule from persisted state");
        }

        loop {
            let now = Local::now().naive_local();
            let next = next_collection_time(
                now,
                self.state.governor.last_call(),
                limit,
                self.state.governor.backoff_multiplier(),
            );
            let wait_seconds = (next - now).num_seconds().max(60) as u64;
            info!(
                next_collection = %next,
                wait_minutes = format!("{:.1}", wait_seconds as f64 / 60.0),
                "waiting for next scheduled collection"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(wait_seconds)) => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }

            match self.state.collect("scheduler", false).await {
                Ok(_) => {}
                Err(CollectError::Fetch(FetchError::QuotaExhausted { message, .. })) => {
                    warn!(message = %message, "collection skipped");
                }
                Err(err) => {
                    error!(error = %err, "collection failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(300)) => {}
                    }
                }
            }
        }
        info!("data collector stopped");
    }

    /// Single-shot mode for tests and cron-style deployments.
    pub async fn run_once(&self) -> bool {
        match self.state.collect("scheduler", false).await {
            Ok(_) => true,
            Err(err) => {
                error!(error = %err, "single-shot collection failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn grid_picks_first_future_slot() {
        // 30/day -> slots every 48 minutes from midnight.
        let next = next_collection_time(day(0, 30), None, 30, 1.0);
        assert_eq!(next, day(0, 48));

        let next = next_collection_time(day(10, 0), None, 30, 1.0);
        assert_eq!(next, day(10, 24)); // slot 13 = 624 min
    }

    #[test]
    fn grid_exhausted_rolls_to_tomorrow_midnight() {
        let next = next_collection_time(day(23, 30), None, 30, 1.0);
        assert_eq!(
            next,
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
    }

    #[test]
    fn future_candidate_from_last_call_wins() {
        let next = next_collection_time(day(10, 0), Some(day(9, 30)), 30, 1.0);
        assert_eq!(next, day(10, 18)); // 9:30 + 48 min
    }

    #[test]
    fn backoff_stretches_the_candidate() {
        let next = next_collection_time(day(10, 0), Some(day(9, 30)), 30, 1.5);
        assert_eq!(next, day(10, 42)); // 9:30 + 72 min
    }

    #[test]
    fn stale_candidate_falls_back_to_grid() {
        // Last call long past: candidate 8:48 <= now, use the grid.
        let next = next_collection_time(day(10, 0), Some(day(8, 0)), 30, 1.0);
        assert_eq!(next, day(10, 24));
    }
}
