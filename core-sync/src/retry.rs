//! # Retry Handling
//!
//! Two layers:
//!
//! - [`with_transient_retry`] re-runs a single remote call a few times when it
//!   fails with a transient error (network, rate limiting).
//! - [`RetryQueue`] remembers whole uploads that failed during a pass and
//!   replays them once the pass is over, with a per-attempt backoff driven by
//!   a `DelayQueue` timer.

use async_trait::async_trait;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Maximum attempts per queued upload
pub const MAX_UPLOAD_ATTEMPTS: u32 = 3;

/// Queued uploads older than this are dropped instead of retried
pub const RETRY_WINDOW: Duration = Duration::from_secs(300);

// ============================================================================
// Transient retry
// ============================================================================

/// Attempts and backoff for a single remote call
#[derive(Debug, Clone, Copy)]
pub struct TransientRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for TransientRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl TransientRetryPolicy {
    /// Delay before attempt `attempt + 1`: base, 2x base, 4x base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
///
/// Non-transient errors and the last transient error are returned as is.
pub async fn with_transient_retry<T, F, Fut>(
    policy: TransientRetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient remote failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Upload retry queue
// ============================================================================

/// Entity whose upload failed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UploadEntity {
    Rom { md5: String },
    SaveState { id: String },
    Bios { md5: String },
    File { path: PathBuf },
}

impl fmt::Display for UploadEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadEntity::Rom { md5 } => write!(f, "rom:{md5}"),
            UploadEntity::SaveState { id } => write!(f, "save_state:{id}"),
            UploadEntity::Bios { md5 } => write!(f, "bios:{md5}"),
            UploadEntity::File { path } => write!(f, "file:{}", path.display()),
        }
    }
}

/// A failed upload waiting for another attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RetryableUpload {
    pub entity: UploadEntity,
    pub last_error: String,
    /// Attempts made so far, starting at 1 for the failure that queued it
    pub attempt: u32,
    pub first_attempt_at: DateTime<Utc>,
}

impl RetryableUpload {
    pub fn new(entity: UploadEntity, error: impl fmt::Display, now: DateTime<Utc>) -> Self {
        Self {
            entity,
            last_error: error.to_string(),
            attempt: 1,
            first_attempt_at: now,
        }
    }

    /// `attempt < 3` and first failure less than five minutes ago
    pub fn can_retry(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.first_attempt_at);
        let within_window = age
            .to_std()
            .map(|age| age < RETRY_WINDOW)
            // Clock went backwards; treat as fresh
            .unwrap_or(true);
        self.attempt < MAX_UPLOAD_ATTEMPTS && within_window
    }

    /// 5 s, 15 s, then 30 s
    pub fn next_retry_delay(&self) -> Duration {
        match self.attempt {
            0 | 1 => Duration::from_secs(5),
            2 => Duration::from_secs(15),
            _ => Duration::from_secs(30),
        }
    }
}

/// Result of dispatching one retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    /// No retry path exists for this entity kind; the item is dropped
    Unsupported,
}

/// Re-runs an upload for a queued entity.
#[async_trait]
pub trait RetryDispatch: Send + Sync {
    async fn retry_upload(&self, entity: &UploadEntity) -> Result<DispatchOutcome>;
}

/// Counts from one [`RetryQueue::drain`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub succeeded: usize,
    /// Still retryable, left in the queue
    pub requeued: usize,
    /// Exhausted attempts or aged out
    pub dropped: usize,
    /// Kinds with no retry path
    pub unsupported: usize,
}

/// Failed uploads awaiting replay.
///
/// Items survive across drains until they succeed or exhaust their budget.
pub struct RetryQueue {
    items: Mutex<Vec<RetryableUpload>>,
    clock: Arc<dyn Clock>,
}

impl RetryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Queue a failed upload. A later failure for the same entity only
    /// refreshes the recorded error.
    pub async fn record_failure(&self, entity: UploadEntity, error: impl fmt::Display) {
        let mut items = self.items.lock().await;
        if let Some(existing) = items.iter_mut().find(|item| item.entity == entity) {
            existing.last_error = error.to_string();
            return;
        }
        debug!(entity = %entity, error = %error, "Queued upload for retry");
        items.push(RetryableUpload::new(entity, error, self.clock.now()));
    }

    pub async fn enqueue(&self, upload: RetryableUpload) {
        let mut items = self.items.lock().await;
        items.retain(|item| item.entity != upload.entity);
        items.push(upload);
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<RetryableUpload> {
        self.items.lock().await.clone()
    }

    /// Replay every queued upload once.
    ///
    /// All retryable items are scheduled on one timer queue up front, each
    /// with its own backoff, and dispatched one at a time as their timers
    /// expire. The attempt counter is bumped before dispatch, so an item
    /// queued with `attempt = 2` is dropped if this third try fails.
    pub async fn drain(&self, dispatcher: &dyn RetryDispatch) -> RetryReport {
        let pending = std::mem::take(&mut *self.items.lock().await);
        let mut report = RetryReport::default();
        if pending.is_empty() {
            return report;
        }

        info!(count = pending.len(), "Processing upload retry queue");
        let now = self.clock.now();
        let mut timers: DelayQueue<RetryableUpload> = DelayQueue::with_capacity(pending.len());
        for item in pending {
            if item.can_retry(now) {
                let delay = item.next_retry_delay();
                timers.insert(item, delay);
            } else {
                error!(
                    entity = %item.entity,
                    attempts = item.attempt,
                    last_error = %item.last_error,
                    "Upload permanently failed"
                );
                report.dropped += 1;
            }
        }

        let mut kept = Vec::new();
        while let Some(expired) = timers.next().await {
            let mut item = expired.into_inner();
            item.attempt += 1;

            match dispatcher.retry_upload(&item.entity).await {
                Ok(DispatchOutcome::Succeeded) => {
                    info!(entity = %item.entity, attempt = item.attempt, "Retry succeeded");
                    report.succeeded += 1;
                }
                Ok(DispatchOutcome::Unsupported) => {
                    warn!(entity = %item.entity, "No retry path for entity, dropping");
                    report.unsupported += 1;
                }
                Err(e) => {
                    item.last_error = e.to_string();
                    if item.attempt >= MAX_UPLOAD_ATTEMPTS {
                        error!(
                            entity = %item.entity,
                            attempts = item.attempt,
                            error = %e,
                            "Upload permanently failed"
                        );
                        report.dropped += 1;
                    } else {
                        warn!(entity = %item.entity, attempt = item.attempt, error = %e, "Retry failed");
                        report.requeued += 1;
                        kept.push(item);
                    }
                }
            }
        }

        if !kept.is_empty() {
            let mut items = self.items.lock().await;
            // Items recorded while draining stay behind the survivors
            let recorded: Vec<_> = std::mem::take(&mut *items)
                .into_iter()
                .filter(|item| !kept_contains(&kept, &item.entity))
                .collect();
            kept.extend(recorded);
            *items = kept;
        }

        report
    }
}

fn kept_contains(kept: &[RetryableUpload], entity: &UploadEntity) -> bool {
    kept.iter().any(|item| &item.entity == entity)
}
