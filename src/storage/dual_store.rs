//! Dual-write storage: every write goes to the primary (CSV) first, then
//! the secondary (SQL). Secondary failures are logged and never propagate,
//! so local data integrity does not depend on the database being up.
//! Reads come from the configured side.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::domain::{BatteryReading, ChargingSession, LocationReading, TripRecord};
use crate::storage::{SnapshotBatch, Storage, StoreStats};

pub struct DualStorage {
    primary: Arc<dyn Storage>,
    secondary: Arc<dyn Storage>,
    read_from_secondary: bool,
}

impl DualStorage {
    pub fn new(
        primary: Arc<dyn Storage>,
        secondary: Arc<dyn Storage>,
        read_from_secondary: bool,
    ) -> Self {
        info!(
            read_from = if read_from_secondary { "sql" } else { "csv" },
            "dual-write storage initialized"
        );
        Self { primary, secondary, read_from_secondary }
    }

    fn reader(&self) -> &Arc<dyn Storage> {
        if self.read_from_secondary {
            &self.secondary
        } else {
            &self.primary
        }
    }
}

#[async_trait]
impl Storage for DualStorage {
    async fn store(&self, batch: &SnapshotBatch) -> Result<StoreStats> {
        let stats = self.primary.store(batch).await?;
        if let Err(err) = self.secondary.store(batch).await {
            error!(error = %err, "secondary storage write failed (primary write succeeded)");
        }
        Ok(stats)
    }

    async fn trips(&self) -> Result<Vec<TripRecord>> {
        self.reader().trips().await
    }

    async fn latest_trips(&self, n: usize) -> Result<Vec<TripRecord>> {
        self.reader().latest_trips(n).await
    }

    async fn battery_history(&self, days: Option<f64>) -> Result<Vec<BatteryReading>> {
        self.reader().battery_history(days).await
    }

    async fn locations(&self) -> Result<Vec<LocationReading>> {
        self.reader().locations().await
    }

    async fn charging_sessions(&self) -> Result<Vec<ChargingSession>> {
        self.reader().charging_sessions().await
    }
}
