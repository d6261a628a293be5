//! Sync outcome reporting.

use std::time::Duration;
use tracing::{error, info};

/// Receives the outcome of each full sync pass.
pub trait SyncAnalytics: Send + Sync {
    fn start_sync(&self);

    fn record_success(&self, items_synced: usize, duration: Duration);

    fn record_failure(&self, reason: &str, items_synced: usize, duration: Duration);
}

/// Writes sync outcomes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl SyncAnalytics for TracingAnalytics {
    fn start_sync(&self) {
        info!("Sync started");
    }

    fn record_success(&self, items_synced: usize, duration: Duration) {
        info!(items_synced, duration_ms = duration.as_millis() as u64, "Sync succeeded");
    }

    fn record_failure(&self, reason: &str, items_synced: usize, duration: Duration) {
        error!(reason, items_synced, duration_ms = duration.as_millis() as u64, "Sync failed");
    }
}
