//! Cached vehicle client: the one place that talks to the vendor backend.
//!
//! `fetch` ties the pipeline together: cache short-circuit, quota gate,
//! token refresh, the retry loop (rate-limit errors only), normalization,
//! freshness classification and cache write-back. Every upstream failure
//! is classified into the error taxonomy and persisted for analysis.

pub mod error;
pub mod normalize;

pub use error::{classify_message, ErrorKind, FetchError};
pub use normalize::normalize;

use chrono::Local;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{fingerprint, ErrorRecord, ResponseCache};
use crate::config::ApiConfig;
use crate::domain::VehicleSnapshot;
use crate::freshness;
use crate::governor::RateLimitGovernor;
use crate::vendor::{VehicleRecord, VendorApi};

const CACHE_METHOD: &str = "full_data";

pub struct VehicleClient {
    vendor: Arc<dyn VendorApi>,
    cache: Arc<ResponseCache>,
    governor: Arc<RateLimitGovernor>,
    cfg: ApiConfig,
}

impl VehicleClient {
    pub fn new(
        vendor: Arc<dyn VendorApi>,
        cache: Arc<ResponseCache>,
        governor: Arc<RateLimitGovernor>,
        cfg: ApiConfig,
    ) -> Self {
        Self { vendor, cache, governor, cfg }
    }

    fn cache_key(&self) -> String {
        match &self.cfg.vehicle_id {
            Some(id) => fingerprint(id, CACHE_METHOD),
            None => "sample_data".to_string(),
        }
    }

    /// The current cached snapshot regardless of validity, if any.
    pub fn peek_current(&self) -> Option<VehicleSnapshot> {
        self.cache.peek(&self.cache_key())
    }

    /// Fetch a snapshot. `source` names the trigger for quota accounting;
    /// `force` bypasses the validity short-circuit (manual refresh).
    pub async fn fetch(&self, source: &str, force: bool) -> Result<VehicleSnapshot, FetchError> {
        let key = self.cache_key();

        if !force {
            if let Some(snapshot) = self.cache.load_valid(&key) {
                info!(
                    age_secs = self.cache.age(&key).map(|a| a.as_secs()).unwrap_or(0),
                    "serving vehicle data from cache"
                );
                return Ok(snapshot);
            }
        }

        if !self.governor.can_call() {
            let stale = self.cache.load_stale().map(|mut snapshot| {
                snapshot.is_cached = true;
                Box::new(snapshot)
            });
            return Err(FetchError::QuotaExhausted {
                message: format!(
                    "daily API quota exhausted ({}/{} calls used)",
                    self.governor.daily_limit() - self.governor.remaining_calls(),
                    self.governor.daily_limit()
                ),
                stale,
            });
        }

        if let Err(err) = self.vendor.refresh_token().await {
            self.persist_error("auth", &err.message, Some("token"));
            return Err(FetchError::Auth(err.message));
        }

        let record = match self.refresh_with_retry(source).await {
            Ok(record) => record,
            Err(FetchError::PartialPayload(message)) => {
                // Common enough that it is not persisted as an error
                // record; the last good snapshot keeps the dashboard alive.
                match self.cache.load_stale() {
                    Some(mut snapshot) => {
                        warn!("cached-state fallback failed, returning last good snapshot");
                        snapshot.is_cached = true;
                        return Ok(snapshot);
                    }
                    None => return Err(FetchError::PartialPayload(message)),
                }
            }
            Err(err) => return Err(err),
        };

        self.governor.record_call(source).ok();
        self.governor.reset_backoff().ok();

        let mut snapshot = normalize(&record, self.cfg.region, Local::now().naive_local());
        let previous = self.cache.peek(&key);
        snapshot.is_cached = !freshness::is_fresh(&snapshot, previous.as_ref());
        if snapshot.is_cached {
            info!("vendor served a cached replay, flagging snapshot");
        }

        if let Err(err) = self.cache.store(&key, &snapshot) {
            warn!(error = %err, "failed to store snapshot in cache");
        }
        Ok(snapshot)
    }

    /// Refresh the vehicle state with bounded retries. Only rate-limit
    /// rejections are retried, with exponential backoff and jitter; a
    /// timeout counts as a non-retryable network error.
    async fn refresh_with_retry(&self, source: &str) -> Result<VehicleRecord, FetchError> {
        let timeout = Duration::from_secs(self.cfg.request_timeout_secs);
        let max_retries = self.cfg.max_retries.max(1);
        let mut last_message = String::new();

        for attempt in 0..max_retries {
            if attempt > 0 {
                let base = 2f64.powi(attempt as i32);
                let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
                let delay = Duration::from_secs_f64(base * jitter);
                info!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_secs = format!("{:.1}", delay.as_secs_f64()),
                    "retrying vehicle refresh after rate limit"
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = tokio::time::timeout(timeout, self.vendor.force_refresh()).await;
            let err = match outcome {
                Ok(Ok(record)) => return Ok(record),
                Ok(Err(err)) => err,
                Err(_) => {
                    let message =
                        format!("vendor call timed out after {}s", timeout.as_secs());
                    self.persist_error("network", &message, None);
                    return Err(FetchError::Network(message));
                }
            };

            match classify_message(&err.message) {
                ErrorKind::PartialPayload => {
                    // The forced refresh came back without vehicleStatus;
                    // the backend's own cached record usually still works.
                    info!("vehicleStatus missing from response, trying backend cached state");
                    match tokio::time::timeout(timeout, self.vendor.cached_state()).await {
                        Ok(Ok(record)) => return Ok(record),
                        _ => return Err(FetchError::PartialPayload(err.message)),
                    }
                }
                ErrorKind::RateLimit => {
                    self.governor.record_rate_limit_hit(source, &err.message).ok();
                    last_message = err.message;
                    continue;
                }
                kind => {
                    let fetch_err = FetchError::from_kind(kind, err.message.clone());
                    self.persist_error(fetch_err.error_type(), &err.message, None);
                    return Err(fetch_err);
                }
            }
        }

        let fetch_err = FetchError::QuotaExhausted { message: last_message.clone(), stale: None };
        self.persist_error(fetch_err.error_type(), &last_message, None);
        Err(fetch_err)
    }

    fn persist_error(&self, error_type: &str, message: &str, stage: Option<&str>) {
        self.cache.write_error_record(&ErrorRecord {
            timestamp: Local::now().naive_local().to_string(),
            error_type: error_type.to_string(),
            error_message: message.to_string(),
            error_stage: stage.map(str::to_string),
            region: self.cfg.region,
            brand: self.cfg.brand,
            vehicle_id: self.cfg.vehicle_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::VendorError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Vendor stub that fails a set number of times before succeeding.
    struct FlakyVendor {
        failures: Vec<&'static str>,
        calls: AtomicU32,
        token_ok: bool,
        cached_ok: bool,
    }

    impl FlakyVendor {
        fn succeeding() -> Self {
            Self { failures: vec![], calls: AtomicU32::new(0), token_ok: true, cached_ok: true }
        }

        fn failing_with(failures: Vec<&'static str>) -> Self {
            Self { failures, calls: AtomicU32::new(0), token_ok: true, cached_ok: true }
        }

        fn record() -> VehicleRecord {
            VehicleRecord {
                vehicle_id: Some("VIN123".into()),
                ev_battery_percentage: Some(64.0),
                ev_battery_is_charging: Some(false),
                odometer: Some(100.0),
                last_updated_at: Some("20240115100000".into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl VendorApi for FlakyVendor {
        async fn refresh_token(&self) -> Result<(), VendorError> {
            if self.token_ok {
                Ok(())
            } else {
                Err(VendorError::new("401 Unauthorized"))
            }
        }

        async fn force_refresh(&self) -> Result<VehicleRecord, VendorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.failures.get(call) {
                Some(message) => Err(VendorError::new(*message)),
                None => Ok(Self::record()),
            }
        }

        async fn cached_state(&self) -> Result<VehicleRecord, VendorError> {
            if self.cached_ok {
                Ok(Self::record())
            } else {
                Err(VendorError::new("cached state unavailable"))
            }
        }
    }

    fn client_over(
        dir: &TempDir,
        vendor: FlakyVendor,
        daily_limit: u32,
    ) -> (VehicleClient, Arc<RateLimitGovernor>) {
        let governor = Arc::new(RateLimitGovernor::new(dir.path(), daily_limit).unwrap());
        let cache = Arc::new(
            ResponseCache::new(&dir.path().join("cache"), true, daily_limit, 48.0).unwrap(),
        );
        let cfg = ApiConfig {
            daily_limit,
            vehicle_id: Some("VIN123".into()),
            ..ApiConfig::default()
        };
        let client = VehicleClient::new(Arc::new(vendor), cache, Arc::clone(&governor), cfg);
        (client, governor)
    }

    #[tokio::test]
    async fn successful_fetch_records_call_and_caches() {
        let dir = TempDir::new().unwrap();
        let (client, governor) = client_over(&dir, FlakyVendor::succeeding(), 30);

        let snapshot = client.fetch("scheduler", false).await.unwrap();
        assert_eq!(snapshot.battery.level, Some(64.0));
        assert_eq!(governor.remaining_calls(), 29);

        // Second fetch is served from the still-valid cache: no quota.
        let again = client.fetch("scheduler", false).await.unwrap();
        assert_eq!(again.payload_digest, snapshot.payload_digest);
        assert_eq!(governor.remaining_calls(), 29);
    }

    #[tokio::test]
    async fn quota_exhausted_fails_without_touching_vendor() {
        let dir = TempDir::new().unwrap();
        let (client, governor) = client_over(&dir, FlakyVendor::succeeding(), 1);
        client.fetch("scheduler", false).await.unwrap();
        assert_eq!(governor.remaining_calls(), 0);

        let err = client.fetch("scheduler", true).await.unwrap_err();
        match err {
            FetchError::QuotaExhausted { stale, .. } => {
                // Previous snapshot comes back as the stale fallback.
                let stale = stale.expect("stale snapshot expected");
                assert!(stale.is_cached);
            }
            other => panic!("expected QuotaExhausted, got {other:?}"),
        }
        assert_eq!(governor.remaining_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_errors_are_retried_then_succeed() {
        let dir = TempDir::new().unwrap();
        let (client, governor) =
            client_over(&dir, FlakyVendor::failing_with(vec!["429 too many requests"]), 30);

        let snapshot = client.fetch("manual", true).await.unwrap();
        assert_eq!(snapshot.battery.level, Some(64.0));
        // The hit bumped the backoff, the eventual success reset it.
        assert_eq!(governor.backoff_multiplier(), 1.0);
        assert_eq!(governor.remaining_calls(), 29);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_exhausts_retries_and_surfaces() {
        let dir = TempDir::new().unwrap();
        let (client, governor) = client_over(
            &dir,
            FlakyVendor::failing_with(vec!["throttled", "throttled", "throttled"]),
            30,
        );

        let err = client.fetch("manual", true).await.unwrap_err();
        assert!(matches!(err, FetchError::QuotaExhausted { .. }));
        // No successful call was recorded; backoff climbed per hit.
        assert_eq!(governor.remaining_calls(), 30);
        assert!(governor.backoff_multiplier() > 1.0);
    }

    #[tokio::test]
    async fn auth_failure_persists_token_error_record() {
        let dir = TempDir::new().unwrap();
        let mut vendor = FlakyVendor::succeeding();
        vendor.token_ok = false;
        let (client, _) = client_over(&dir, vendor, 30);

        let err = client.fetch("manual", true).await.unwrap_err();
        assert!(matches!(err, FetchError::Auth(_)));

        let errors: Vec<_> = std::fs::read_dir(dir.path().join("cache"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("error_token_"))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let dir = TempDir::new().unwrap();
        let (client, governor) =
            client_over(&dir, FlakyVendor::failing_with(vec!["vehicle offline"]), 30);

        let err = client.fetch("manual", true).await.unwrap_err();
        assert!(matches!(err, FetchError::VehicleOffline(_)));
        assert_eq!(governor.remaining_calls(), 30);
    }

    #[tokio::test]
    async fn partial_payload_falls_back_to_cached_state() {
        let dir = TempDir::new().unwrap();
        let (client, governor) = client_over(
            &dir,
            FlakyVendor::failing_with(vec!["KeyError: 'vehicleStatus'"]),
            30,
        );

        let snapshot = client.fetch("manual", true).await.unwrap();
        assert_eq!(snapshot.battery.level, Some(64.0));
        assert_eq!(governor.remaining_calls(), 29);
    }

    #[tokio::test]
    async fn partial_payload_with_failed_fallback_returns_last_good_cache() {
        let dir = TempDir::new().unwrap();
        {
            let (client, _) = client_over(&dir, FlakyVendor::succeeding(), 30);
            client.fetch("scheduler", false).await.unwrap();
        }

        let mut vendor = FlakyVendor::failing_with(vec!["KeyError: 'vehicleStatus'"]);
        vendor.cached_ok = false;
        let (client, _) = client_over(&dir, vendor, 30);

        let snapshot = client.fetch("manual", true).await.unwrap();
        assert!(snapshot.is_cached);
        assert_eq!(snapshot.battery.level, Some(64.0));
    }

    #[tokio::test]
    async fn replayed_payload_is_flagged_cached() {
        let dir = TempDir::new().unwrap();
        let (client, _) = client_over(&dir, FlakyVendor::succeeding(), 30);

        let first = client.fetch("manual", true).await.unwrap();
        assert!(!first.is_cached);

        // Same vendor timestamp and payload on the second forced fetch.
        let second = client.fetch("manual", true).await.unwrap();
        assert!(second.is_cached);
    }
}
