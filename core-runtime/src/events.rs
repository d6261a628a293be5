//! # Event Bus System
//!
//! Typed notifications published by the sync engine over
//! `tokio::sync::broadcast`.
//!
//! ```text
//! ┌──────────────┐  emit   ┌───────────┐  subscribe  ┌────────────┐
//! │ Orchestrator ├────────>│           ├────────────>│ UI / hosts │
//! └──────────────┘         │ EventBus  │             └────────────┘
//! ┌──────────────┐  emit   │           │  subscribe  ┌────────────┐
//! │ Syncers      ├────────>│           ├────────────>│ Telemetry  │
//! └──────────────┘         └───────────┘             └────────────┘
//! ```
//!
//! Publishers ignore the "no subscribers" error: `bus.emit(event).ok()`.
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EntityKind, EventBus, LibraryEvent};
//!
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//! bus.emit(CoreEvent::Library(LibraryEvent::EntityDeleted {
//!     kind: EntityKind::Rom,
//!     key: "0F1E".into(),
//! }))
//! .ok();
//! assert!(rx.try_recv().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, error::RecvError, error::SendError, Receiver};

/// Default per-subscriber buffer.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Sync(SyncEvent),
    Library(LibraryEvent),
    Transfer(TransferEvent),
}

impl CoreEvent {
    /// Human-readable description of the event.
    pub fn description(&self) -> &'static str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Library(e) => e.description(),
            CoreEvent::Transfer(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::CategoryFailed { .. })
            | CoreEvent::Transfer(TransferEvent::UploadFailed { .. })
            | CoreEvent::Transfer(TransferEvent::DownloadFailed { .. }) => EventSeverity::Error,
            CoreEvent::Transfer(TransferEvent::DownloadRejected { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Completed {
                overall_success: false,
                ..
            }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Completed { .. })
            | CoreEvent::Sync(SyncEvent::Started { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Kind of library entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Rom,
    SaveState,
    Bios,
    File,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Rom => "rom",
            EntityKind::SaveState => "save_state",
            EntityKind::Bios => "bios",
            EntityKind::File => "file",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Sync Events
// ============================================================================

/// Lifecycle of an initial / full sync pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    Started {
        force: bool,
    },
    CategoryCompleted {
        category: String,
        count: usize,
    },
    CategoryFailed {
        category: String,
        message: String,
        /// True when the category hit its time budget
        timed_out: bool,
    },
    Completed {
        total_synced: usize,
        overall_success: bool,
    },
    /// The pass did not run (already in flight, or nothing to do)
    Skipped {
        reason: String,
    },
}

impl SyncEvent {
    fn description(&self) -> &'static str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::CategoryCompleted { .. } => "Sync category completed",
            SyncEvent::CategoryFailed { .. } => "Sync category failed",
            SyncEvent::Completed { .. } => "Sync completed",
            SyncEvent::Skipped { .. } => "Sync skipped",
        }
    }
}

// ============================================================================
// Library Events
// ============================================================================

/// Local store changes caused by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LibraryEvent {
    EntityCreated { kind: EntityKind, key: String },
    EntityUpdated { kind: EntityKind, key: String },
    EntityDeleted { kind: EntityKind, key: String },
}

impl LibraryEvent {
    fn description(&self) -> &'static str {
        match self {
            LibraryEvent::EntityCreated { .. } => "Library entity created",
            LibraryEvent::EntityUpdated { .. } => "Library entity updated",
            LibraryEvent::EntityDeleted { .. } => "Library entity deleted",
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            LibraryEvent::EntityCreated { kind, .. }
            | LibraryEvent::EntityUpdated { kind, .. }
            | LibraryEvent::EntityDeleted { kind, .. } => *kind,
        }
    }
}

// ============================================================================
// Transfer Events
// ============================================================================

/// Background upload / download queue activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TransferEvent {
    UploadQueued { task_id: String, key: String },
    UploadCompleted { task_id: String, key: String },
    UploadFailed { task_id: String, key: String, message: String },
    DownloadQueued { key: String, size: u64 },
    DownloadRejected { key: String, required: u64, available: u64 },
    DownloadCompleted { key: String },
    DownloadFailed { key: String, message: String },
}

impl TransferEvent {
    fn description(&self) -> &'static str {
        match self {
            TransferEvent::UploadQueued { .. } => "Upload queued",
            TransferEvent::UploadCompleted { .. } => "Upload completed",
            TransferEvent::UploadFailed { .. } => "Upload failed",
            TransferEvent::DownloadQueued { .. } => "Download queued",
            TransferEvent::DownloadRejected { .. } => "Download rejected for space",
            TransferEvent::DownloadCompleted { .. } => "Download completed",
            TransferEvent::DownloadFailed { .. } => "Download failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    ///
    /// Subscribers that fall further behind receive `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event; fails only when nobody is subscribed.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// New independent receiver; past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Receiver wrapper with an optional predicate.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let bus = EventBus::new(8);
/// let transfers = EventStream::new(bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Transfer(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Next event passing the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when drained.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}
