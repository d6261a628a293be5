//! # Initial Sync Orchestrator
//!
//! Runs one full reconciliation pass over every category in order (ROMs,
//! save states, BIOS, non-database files). Each category runs under its own
//! timeout; a failure or timeout is recorded and the next category still
//! runs. The retry queue is drained once at the end.
//!
//! Only one pass runs at a time. A second caller gets an empty report
//! immediately.

use bridge_traits::{RecordQuery, RemoteRecordStore};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::analytics::SyncAnalytics;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::progress::{ProgressCategory, ProgressTracker};
use crate::retry::{RetryDispatch, RetryQueue, RetryReport};
use crate::schema::record_type;
use crate::syncer::{EntitySyncer, SyncCounts};

/// Reason reported to analytics when any category fails
pub const PARTIAL_FAILURE: &str = "Partial sync failure";

/// One category of the pass
#[derive(Clone)]
pub struct SyncCategory {
    pub name: &'static str,
    pub timeout: Duration,
    pub syncer: Arc<dyn EntitySyncer>,
    /// Buckets closed when the category ends
    pub progress: Vec<ProgressCategory>,
}

/// Outcome of one category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryReport {
    pub name: &'static str,
    pub counts: Option<SyncCounts>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl CategoryReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of [`InitialSyncer::perform_initial_sync`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialSyncReport {
    /// Items synced across every category that completed
    pub total_synced: usize,
    pub overall_success: bool,
    pub categories: Vec<CategoryReport>,
    pub retries: RetryReport,
    /// Pass did not run (already in flight or not needed)
    pub skipped: bool,
}

impl InitialSyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn category(&self, name: &str) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.name == name)
    }
}

/// Resets the in-flight flag however the pass ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Full-pass orchestrator
pub struct InitialSyncer {
    categories: Vec<SyncCategory>,
    store: Arc<dyn RemoteRecordStore>,
    config: Arc<SyncConfig>,
    progress: Arc<ProgressTracker>,
    retry_queue: Arc<RetryQueue>,
    retry_dispatch: Arc<dyn RetryDispatch>,
    analytics: Arc<dyn SyncAnalytics>,
    event_bus: Arc<EventBus>,
    in_flight: AtomicBool,
}

impl InitialSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        categories: Vec<SyncCategory>,
        store: Arc<dyn RemoteRecordStore>,
        config: Arc<SyncConfig>,
        progress: Arc<ProgressTracker>,
        retry_queue: Arc<RetryQueue>,
        retry_dispatch: Arc<dyn RetryDispatch>,
        analytics: Arc<dyn SyncAnalytics>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            categories,
            store,
            config,
            progress,
            retry_queue,
            retry_dispatch,
            analytics,
            event_bus,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether the remote store looks empty.
    ///
    /// Any record of any type means a sync already happened. Lookup errors and
    /// timeouts are skipped; with nothing conclusive the answer is `true`.
    #[instrument(skip(self))]
    pub async fn is_initial_sync_needed(&self) -> bool {
        for kind in [
            record_type::ROM,
            record_type::SAVE_STATE,
            record_type::BIOS,
            record_type::FILE,
        ] {
            let query = RecordQuery::all(kind).with_desired_keys(Vec::new());
            match tokio::time::timeout(self.config.presence_check_timeout, self.store.query(&query, 1)).await {
                Ok(Ok(page)) if !page.records.is_empty() => {
                    debug!(record_type = kind, "Found existing records, initial sync not needed");
                    return false;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(record_type = kind, error = %e, "Lookup failed, checking other types"),
                Err(_) => warn!(record_type = kind, "Lookup timed out, checking other types"),
            }
        }
        debug!("No remote records found, initial sync needed");
        true
    }

    /// Run one full pass.
    #[instrument(skip(self))]
    pub async fn perform_initial_sync(&self, force: bool) -> InitialSyncReport {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Initial sync already in progress");
            self.emit(SyncEvent::Skipped {
                reason: "already in progress".to_string(),
            });
            return InitialSyncReport::skipped();
        }
        let _guard = InFlight(&self.in_flight);

        if !force && !self.is_initial_sync_needed().await {
            info!("Initial sync not needed, skipping");
            self.emit(SyncEvent::Skipped {
                reason: "not needed".to_string(),
            });
            return InitialSyncReport::skipped();
        }

        self.progress.reset();
        self.analytics.start_sync();
        self.emit(SyncEvent::Started { force });
        let started = Instant::now();

        let mut report = InitialSyncReport {
            overall_success: true,
            ..Default::default()
        };
        for category in &self.categories {
            let outcome = self.run_category(category).await;
            if let Some(counts) = outcome.counts {
                report.total_synced += counts.synced;
            }
            report.overall_success &= outcome.succeeded();
            report.categories.push(outcome);
        }

        report.retries = self.retry_queue.drain(self.retry_dispatch.as_ref()).await;
        self.progress.mark_complete();

        let elapsed = started.elapsed();
        if report.overall_success {
            info!(total = report.total_synced, "Initial sync completed");
            self.analytics.record_success(report.total_synced, elapsed);
        } else {
            error!(
                total = report.total_synced,
                "Initial sync completed with failures"
            );
            self.analytics
                .record_failure(PARTIAL_FAILURE, report.total_synced, elapsed);
        }
        self.emit(SyncEvent::Completed {
            total_synced: report.total_synced,
            overall_success: report.overall_success,
        });
        report
    }

    async fn run_category(&self, category: &SyncCategory) -> CategoryReport {
        info!(category = category.name, "Syncing category");
        let result = tokio::time::timeout(
            category.timeout,
            category.syncer.sync_all(&self.progress),
        )
        .await;

        for bucket in &category.progress {
            self.progress.finish_category(*bucket);
        }

        let (counts, error) = match result {
            Ok(Ok(counts)) => (Some(counts), None),
            Ok(Err(e)) => (None, Some(e)),
            Err(_) => (
                None,
                Some(SyncError::Timeout {
                    category: category.name.to_string(),
                    seconds: category.timeout.as_secs(),
                }),
            ),
        };

        match (&counts, &error) {
            (Some(counts), _) => {
                info!(
                    category = category.name,
                    synced = counts.synced,
                    skipped = counts.skipped,
                    failed = counts.failed,
                    "Category completed"
                );
                self.emit(SyncEvent::CategoryCompleted {
                    category: category.name.to_string(),
                    count: counts.synced,
                });
            }
            (None, Some(e)) => {
                error!(category = category.name, error = %e, "Category failed");
                self.emit(SyncEvent::CategoryFailed {
                    category: category.name.to_string(),
                    message: e.to_string(),
                    timed_out: matches!(e, SyncError::Timeout { .. }),
                });
            }
            (None, None) => {}
        }

        CategoryReport {
            name: category.name,
            counts,
            timed_out: matches!(error, Some(SyncError::Timeout { .. })),
            error: error.map(|e| e.to_string()),
        }
    }

    fn emit(&self, event: SyncEvent) {
        self.event_bus.emit(CoreEvent::Sync(event)).ok();
    }
}
