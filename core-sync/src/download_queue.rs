//! # Download Queue
//!
//! Space-aware scheduling of payload downloads.
//!
//! ## Admission
//!
//! A task is admitted only when
//! `expected_size <= available_space - safety_buffer - reserved`, where
//! `reserved` is the sum of tasks already admitted but not yet finished.
//! Rejections surface as [`SyncError::InsufficientSpace`] so callers can count
//! them as skipped. On storage-constrained devices, automatic downloads above
//! the large-file threshold are deferred until explicitly requested.
//!
//! ## Execution
//!
//! [`DownloadQueue::start`] spawns a worker that runs up to
//! `max_concurrent` downloads through a [`DownloadExecutor`], highest
//! priority first, then smallest first.

use async_trait::async_trait;
use bridge_traits::storage::FileSystemAccess;
use core_runtime::events::{CoreEvent, EntityKind, EventBus, TransferEvent};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::upload_queue::TransferPriority;

/// A payload to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub kind: EntityKind,
    /// Stable key of the owning entity (MD5, save-state id, or file record id)
    pub key: String,
    pub expected_size: u64,
    pub priority: TransferPriority,
    /// Explicit user request; bypasses the automatic-download policy
    pub on_demand: bool,
}

impl DownloadTask {
    pub fn new(kind: EntityKind, key: impl Into<String>, expected_size: u64) -> Self {
        Self {
            kind,
            key: key.into(),
            expected_size,
            priority: TransferPriority::Normal,
            on_demand: false,
        }
    }

    pub fn with_priority(mut self, priority: TransferPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_demand(mut self) -> Self {
        self.on_demand = true;
        self
    }

    fn identity(&self) -> (EntityKind, String) {
        (self.kind, self.key.clone())
    }

    fn label(&self) -> String {
        format!("{}:{}", self.kind, self.key)
    }
}

/// Fetches one payload into the local library.
#[async_trait]
pub trait DownloadExecutor: Send + Sync {
    async fn download(&self, task: &DownloadTask) -> Result<()>;
}

/// Admission rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpacePolicy {
    pub safety_buffer_bytes: u64,
    pub large_file_threshold_bytes: u64,
    pub block_large_automatic: bool,
    /// When off, only on-demand tasks are admitted
    pub background_enabled: bool,
}

impl SpacePolicy {
    pub fn from_config(config: &SyncConfig, background_enabled: bool) -> Self {
        Self {
            safety_buffer_bytes: config.safety_buffer_bytes,
            large_file_threshold_bytes: config.large_file_threshold_bytes,
            block_large_automatic: config.block_large_automatic_downloads,
            background_enabled,
        }
    }

    fn defers(&self, task: &DownloadTask) -> bool {
        if task.on_demand {
            return false;
        }
        !self.background_enabled
            || (self.block_large_automatic && task.expected_size > self.large_file_threshold_bytes)
    }
}

/// Outcome of a single admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Same entity already pending or downloading
    AlreadyQueued,
    /// Held back by the automatic-download policy
    Deferred,
}

/// Outcome of [`DownloadQueue::enqueue_batch`]
#[derive(Debug, Default)]
pub struct BatchAdmission {
    pub queued: usize,
    pub already_queued: usize,
    pub deferred: usize,
    /// Space rejections, keyed by entity key
    pub rejected: Vec<(String, SyncError)>,
    pub total_bytes_needed: u64,
}

impl BatchAdmission {
    /// Entities not scheduled in this pass
    pub fn skipped(&self) -> usize {
        self.deferred + self.rejected.len()
    }
}

#[derive(Default)]
struct QueueState {
    pending: Vec<DownloadTask>,
    known: HashSet<(EntityKind, String)>,
    reserved: u64,
    active: usize,
}

impl QueueState {
    /// Highest priority, then smallest
    fn pop_next(&mut self) -> Option<DownloadTask> {
        let index = self
            .pending
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.expected_size.cmp(&b.expected_size))
            })
            .map(|(index, _)| index)?;
        Some(self.pending.remove(index))
    }
}

/// Space-aware download scheduler
pub struct DownloadQueue {
    state: Mutex<QueueState>,
    wake: Notify,
    fs: Arc<dyn FileSystemAccess>,
    volume_path: PathBuf,
    policy: SpacePolicy,
    max_concurrent: usize,
    event_bus: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl DownloadQueue {
    /// `volume_path` selects the volume whose free space is checked.
    pub fn new(
        fs: Arc<dyn FileSystemAccess>,
        volume_path: impl Into<PathBuf>,
        policy: SpacePolicy,
        max_concurrent: usize,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            fs,
            volume_path: volume_path.into(),
            policy,
            max_concurrent: max_concurrent.max(1),
            event_bus,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> SpacePolicy {
        self.policy
    }

    async fn available_space(&self) -> Result<u64> {
        self.fs
            .available_space(&self.volume_path)
            .await
            .map_err(SyncError::file_system)
    }

    /// Bytes still admissible: free space minus buffer minus reservations.
    pub async fn available_budget(&self) -> Result<u64> {
        let available = self.available_space().await?;
        let reserved = self.state.lock().await.reserved;
        Ok(available
            .saturating_sub(self.policy.safety_buffer_bytes)
            .saturating_sub(reserved))
    }

    /// Admit a single task.
    ///
    /// # Errors
    /// [`SyncError::InsufficientSpace`] when the task does not fit the budget.
    #[instrument(skip(self, task), fields(key = %task.key, size = task.expected_size))]
    pub async fn enqueue(&self, task: DownloadTask) -> Result<Admission> {
        if self.policy.defers(&task) {
            debug!("Automatic download deferred by policy");
            return Ok(Admission::Deferred);
        }

        let available = self.available_space().await?;
        let mut state = self.state.lock().await;

        if state.known.contains(&task.identity()) {
            return Ok(Admission::AlreadyQueued);
        }

        let budget = available
            .saturating_sub(self.policy.safety_buffer_bytes)
            .saturating_sub(state.reserved);
        if task.expected_size > budget {
            drop(state);
            warn!(required = task.expected_size, available = budget, "Download rejected for space");
            self.event_bus
                .emit(CoreEvent::Transfer(TransferEvent::DownloadRejected {
                    key: task.label(),
                    required: task.expected_size,
                    available: budget,
                }))
                .ok();
            return Err(SyncError::InsufficientSpace {
                required: task.expected_size,
                available: budget,
            });
        }

        state.reserved += task.expected_size;
        state.known.insert(task.identity());
        let key = task.label();
        let size = task.expected_size;
        state.pending.push(task);
        drop(state);

        self.event_bus
            .emit(CoreEvent::Transfer(TransferEvent::DownloadQueued { key, size }))
            .ok();
        self.wake.notify_one();
        Ok(Admission::Queued)
    }

    /// Admit a batch smallest-first so as many items as possible fit.
    pub async fn enqueue_batch(&self, mut tasks: Vec<DownloadTask>) -> BatchAdmission {
        let mut report = BatchAdmission {
            total_bytes_needed: tasks.iter().map(|t| t.expected_size).sum(),
            ..Default::default()
        };
        if tasks.is_empty() {
            return report;
        }

        if let Ok(budget) = self.available_budget().await {
            if report.total_bytes_needed > budget {
                warn!(
                    needed = report.total_bytes_needed,
                    budget,
                    count = tasks.len(),
                    "Not every pending download fits on disk"
                );
            }
        }

        tasks.sort_by_key(|t| t.expected_size);
        for task in tasks {
            let key = task.key.clone();
            match self.enqueue(task).await {
                Ok(Admission::Queued) => report.queued += 1,
                Ok(Admission::AlreadyQueued) => report.already_queued += 1,
                Ok(Admission::Deferred) => report.deferred += 1,
                Err(e) => report.rejected.push((key, e)),
            }
        }

        info!(
            queued = report.queued,
            deferred = report.deferred,
            rejected = report.rejected.len(),
            "Download batch admitted"
        );
        report
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn active_len(&self) -> usize {
        self.state.lock().await.active
    }

    pub async fn reserved_bytes(&self) -> u64 {
        self.state.lock().await.reserved
    }

    /// Spawn the worker. Tasks admitted before this call wait until it runs.
    pub fn start(self: &Arc<Self>, executor: Arc<dyn DownloadExecutor>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run(executor).await })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>, executor: Arc<dyn DownloadExecutor>) {
        debug!("Download worker started");
        loop {
            self.dispatch(&executor).await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }
        debug!("Download worker stopped");
    }

    async fn dispatch(self: &Arc<Self>, executor: &Arc<dyn DownloadExecutor>) {
        let mut state = self.state.lock().await;
        while state.active < self.max_concurrent {
            let Some(task) = state.pop_next() else {
                break;
            };
            state.active += 1;

            let queue = Arc::clone(self);
            let executor = Arc::clone(executor);
            tokio::spawn(async move {
                let result = executor.download(&task).await;
                queue.finish(task, result).await;
            });
        }
    }

    async fn finish(&self, task: DownloadTask, result: Result<()>) {
        {
            let mut state = self.state.lock().await;
            state.active = state.active.saturating_sub(1);
            state.reserved = state.reserved.saturating_sub(task.expected_size);
            state.known.remove(&task.identity());
        }

        let event = match result {
            Ok(()) => {
                debug!(key = %task.key, "Download completed");
                TransferEvent::DownloadCompleted { key: task.label() }
            }
            Err(e) => {
                warn!(key = %task.key, error = %e, "Download failed");
                TransferEvent::DownloadFailed {
                    key: task.label(),
                    message: e.to_string(),
                }
            }
        };
        self.event_bus.emit(CoreEvent::Transfer(event)).ok();
        self.wake.notify_one();
    }
}
