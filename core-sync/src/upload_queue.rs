//! # Upload Queue
//!
//! Background upload scheduler implemented as an actor: one task owns the
//! queue and all counters, and every caller talks to it over a channel.
//!
//! ## Features
//!
//! - **Prioritization**: higher priority first, then oldest first
//! - **Bounded Concurrency**: at most `max_concurrent` uploads in flight
//! - **Cancellation**: cancelling an active upload marks it failed at once
//! - **Observation**: queue counters published on a `watch` channel
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::upload_queue::{TransferPriority, UploadQueue};
//!
//! let queue = UploadQueue::spawn(executor, 2, clock, event_bus);
//! let id = queue
//!     .enqueue(entity, "Zelda.sfc", path, TransferPriority::High)
//!     .await?;
//! queue.cancel(id).await?;
//! ```

use async_trait::async_trait;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, TransferEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::retry::UploadEntity;

const COMMAND_BUFFER: usize = 64;

/// Finished tasks whose status stays queryable; older ones are forgotten
const FINISHED_HISTORY: usize = 256;

/// Priority level for transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum TransferPriority {
    /// Low priority - background refreshes
    Low = 0,
    /// Normal priority - bulk sync
    #[default]
    Normal = 1,
    /// High priority - freshly imported content
    High = 2,
}

/// Type-safe upload task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadTaskId(Uuid);

impl UploadTaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    Queued,
    Uploading,
    Completed,
    Failed,
}

/// A scheduled upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    pub id: UploadTaskId,
    pub entity: UploadEntity,
    pub display_name: String,
    pub file_path: PathBuf,
    pub priority: TransferPriority,
    pub created_at: DateTime<Utc>,
    sequence: u64,
}

/// Counters published after every queue change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSnapshot {
    pub queued: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Performs one upload.
#[async_trait]
pub trait UploadExecutor: Send + Sync {
    async fn upload(&self, task: &UploadTask) -> Result<()>;
}

enum Command {
    Enqueue {
        entity: UploadEntity,
        display_name: String,
        file_path: PathBuf,
        priority: TransferPriority,
        reply: oneshot::Sender<UploadTaskId>,
    },
    Cancel {
        id: UploadTaskId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        id: UploadTaskId,
        reply: oneshot::Sender<Option<UploadStatus>>,
    },
}

type Completion = (UploadTaskId, std::result::Result<(), String>);

/// Handle to the upload actor
pub struct UploadQueue {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<UploadSnapshot>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    /// Start the actor on the current runtime.
    pub fn spawn(
        executor: Arc<dyn UploadExecutor>,
        max_concurrent: usize,
        clock: Arc<dyn Clock>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot) = watch::channel(UploadSnapshot::default());
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let actor = UploadActor {
            queue: Vec::new(),
            active: HashMap::new(),
            statuses: HashMap::new(),
            finished: VecDeque::new(),
            completed: 0,
            failed: 0,
            next_sequence: 0,
            max_concurrent: max_concurrent.max(1),
            executor,
            clock,
            event_bus,
            snapshot_tx,
            done_tx,
            shutdown: shutdown.clone(),
        };
        let worker = tokio::spawn(actor.run(command_rx, done_rx));

        Self {
            commands,
            snapshot,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an upload and return its id.
    pub async fn enqueue(
        &self,
        entity: UploadEntity,
        display_name: impl Into<String>,
        file_path: impl Into<PathBuf>,
        priority: TransferPriority,
    ) -> Result<UploadTaskId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue {
            entity,
            display_name: display_name.into(),
            file_path: file_path.into(),
            priority,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::QueueClosed)
    }

    /// Cancel a queued or active upload. Returns `false` if the id is unknown
    /// or already finished.
    pub async fn cancel(&self, id: UploadTaskId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { id, reply }).await?;
        rx.await.map_err(|_| SyncError::QueueClosed)
    }

    /// `None` for unknown ids and for finished tasks that have aged out of
    /// the recent history.
    pub async fn status(&self, id: UploadTaskId) -> Result<Option<UploadStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { id, reply }).await?;
        rx.await.map_err(|_| SyncError::QueueClosed)
    }

    pub fn snapshot(&self) -> UploadSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadSnapshot> {
        self.snapshot.clone()
    }

    /// Stop the actor, cancelling in-flight uploads.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Upload worker ended abnormally");
            }
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::QueueClosed)
    }
}

struct ActiveUpload {
    task: UploadTask,
    token: CancellationToken,
}

struct UploadActor {
    queue: Vec<UploadTask>,
    active: HashMap<UploadTaskId, ActiveUpload>,
    statuses: HashMap<UploadTaskId, UploadStatus>,
    /// Terminal ids in finishing order
    finished: VecDeque<UploadTaskId>,
    completed: usize,
    failed: usize,
    next_sequence: u64,
    max_concurrent: usize,
    executor: Arc<dyn UploadExecutor>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    snapshot_tx: watch::Sender<UploadSnapshot>,
    done_tx: mpsc::UnboundedSender<Completion>,
    shutdown: CancellationToken,
}

impl UploadActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut done: mpsc::UnboundedReceiver<Completion>,
    ) {
        debug!("Upload actor started");
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some((id, result)) = done.recv() => self.finish(id, result),
            }
            self.schedule();
            self.publish();
        }

        for (_, active) in self.active.drain() {
            active.token.cancel();
        }
        debug!("Upload actor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue {
                entity,
                display_name,
                file_path,
                priority,
                reply,
            } => {
                let task = UploadTask {
                    id: UploadTaskId::new(),
                    entity,
                    display_name,
                    file_path,
                    priority,
                    created_at: self.clock.now(),
                    sequence: self.next_sequence,
                };
                self.next_sequence += 1;
                let id = task.id;

                self.event_bus
                    .emit(CoreEvent::Transfer(TransferEvent::UploadQueued {
                        task_id: id.to_string(),
                        key: task.entity.to_string(),
                    }))
                    .ok();
                self.statuses.insert(id, UploadStatus::Queued);
                self.queue.push(task);
                self.queue.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.created_at.cmp(&b.created_at))
                        .then(a.sequence.cmp(&b.sequence))
                });
                reply.send(id).ok();
            }
            Command::Cancel { id, reply } => {
                reply.send(self.cancel(id)).ok();
            }
            Command::Status { id, reply } => {
                reply.send(self.statuses.get(&id).copied()).ok();
            }
        }
    }

    fn cancel(&mut self, id: UploadTaskId) -> bool {
        let task = if let Some(active) = self.active.remove(&id) {
            active.token.cancel();
            active.task
        } else if let Some(index) = self.queue.iter().position(|t| t.id == id) {
            self.queue.remove(index)
        } else {
            return false;
        };

        info!(task_id = %id, name = %task.display_name, "Upload cancelled");
        self.mark_failed(&task, "cancelled".to_string());
        true
    }

    fn schedule(&mut self) {
        while self.active.len() < self.max_concurrent && !self.queue.is_empty() {
            let task = self.queue.remove(0);
            let token = self.shutdown.child_token();
            let executor = Arc::clone(&self.executor);
            let done = self.done_tx.clone();
            let running = task.clone();
            let cancelled = token.clone();

            debug!(task_id = %task.id, name = %task.display_name, "Upload started");
            tokio::spawn(async move {
                let result = tokio::select! {
                    result = executor.upload(&running) => result.map_err(|e| e.to_string()),
                    _ = cancelled.cancelled() => Err("cancelled".to_string()),
                };
                done.send((running.id, result)).ok();
            });

            self.statuses.insert(task.id, UploadStatus::Uploading);
            self.active.insert(task.id, ActiveUpload { task, token });
        }
    }

    fn finish(&mut self, id: UploadTaskId, result: std::result::Result<(), String>) {
        // Cancelled uploads were already accounted for
        let Some(active) = self.active.remove(&id) else {
            return;
        };

        match result {
            Ok(()) => {
                self.completed += 1;
                self.retire(id, UploadStatus::Completed);
                info!(task_id = %id, name = %active.task.display_name, "Upload completed");
                self.event_bus
                    .emit(CoreEvent::Transfer(TransferEvent::UploadCompleted {
                        task_id: id.to_string(),
                        key: active.task.entity.to_string(),
                    }))
                    .ok();
            }
            Err(message) => {
                warn!(task_id = %id, error = %message, "Upload failed");
                self.mark_failed(&active.task, message);
            }
        }
    }

    fn mark_failed(&mut self, task: &UploadTask, message: String) {
        self.failed += 1;
        self.retire(task.id, UploadStatus::Failed);
        self.event_bus
            .emit(CoreEvent::Transfer(TransferEvent::UploadFailed {
                task_id: task.id.to_string(),
                key: task.entity.to_string(),
                message,
            }))
            .ok();
    }

    fn retire(&mut self, id: UploadTaskId, status: UploadStatus) {
        self.statuses.insert(id, status);
        self.finished.push_back(id);
        while self.finished.len() > FINISHED_HISTORY {
            if let Some(oldest) = self.finished.pop_front() {
                self.statuses.remove(&oldest);
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(UploadSnapshot {
            queued: self.queue.len(),
            uploading: self.active.len(),
            completed: self.completed,
            failed: self.failed,
        });
    }
}
