//! # Sync Engine
//!
//! Reconciles the local library (ROMs, save states, BIOS images and plain
//! file directories) with a remote record store.
//!
//! ## Overview
//!
//! - Two-phase pulls: metadata first, payload downloads scheduled afterwards
//! - Pushes of local entities that have no remote record yet
//! - Soft deletes through a tombstone flag, hard deletes kept separate
//! - Upload retries bounded by attempt count and age
//! - Space-aware download admission
//!
//! ## Components
//!
//! - **Orchestrator** (`orchestrator`): full pass with per-category timeouts
//! - **Syncers** (`roms`, `save_states`, `bios`, `files`): one per entity type, on top of `syncer`
//! - **Retry Queue** (`retry`): replays failed uploads once per pass
//! - **Conflict Resolver** (`conflict_resolver`): fetch-merge-save on write conflicts
//! - **Upload Queue** (`upload_queue`): prioritized actor with bounded concurrency
//! - **Download Queue** (`download_queue`): admission control and smallest-first scheduling
//! - **Change Routing** (`subscriptions`): remote notifications to syncers
//! - **Engine** (`engine`): builds and wires everything

use std::path::Path;

pub mod analytics;
pub mod bios;
pub mod config;
pub mod conflict_resolver;
pub mod download_queue;
pub mod engine;
pub mod error;
pub mod files;
pub mod orchestrator;
pub mod paths;
pub mod progress;
pub mod record_id;
pub mod retry;
pub mod roms;
pub mod save_states;
pub mod schema;
pub mod subscriptions;
pub mod syncer;
pub mod upload_queue;

pub use analytics::{SyncAnalytics, TracingAnalytics};
pub use bios::BiosSyncer;
pub use config::SyncConfig;
pub use conflict_resolver::ConflictResolver;
pub use download_queue::{
    Admission, BatchAdmission, DownloadExecutor, DownloadQueue, DownloadTask, SpacePolicy,
};
pub use engine::{SyncEngine, SyncerDispatch};
pub use error::{Result, SyncError};
pub use files::{FileLocation, NonDatabaseSyncer};
pub use orchestrator::{CategoryReport, InitialSyncReport, InitialSyncer, SyncCategory};
pub use paths::LibraryPaths;
pub use progress::{CategoryProgress, ProgressCategory, ProgressTracker, SyncProgress};
pub use retry::{
    DispatchOutcome, RetryDispatch, RetryQueue, RetryReport, RetryableUpload, TransientRetryPolicy,
    UploadEntity,
};
pub use roms::{RomSyncer, RomUploadOutcome};
pub use save_states::{SaveStateSyncer, SaveStateUploadOutcome};
pub use subscriptions::{ChangeRouter, Route, RoutingHandle};
pub use syncer::{
    ChangeOutcome, EntitySyncer, MetadataOnlySyncable, SoftDeleteOutcome, SyncContext, SyncCounts,
    SyncerBase,
};
pub use upload_queue::{
    TransferPriority, UploadExecutor, UploadQueue, UploadSnapshot, UploadStatus, UploadTask,
    UploadTaskId,
};

/// File name only, for log fields
pub(crate) fn log_name(path: &Path) -> String {
    core_runtime::logging::strip_path(&path.to_string_lossy()).to_string()
}
