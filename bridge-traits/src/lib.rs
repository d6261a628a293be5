//! # Host Bridge Traits
//!
//! Capability contracts the sync engine needs from its host platform.
//!
//! ## Traits
//!
//! - [`FileSystemAccess`](storage::FileSystemAccess) - payload files, archives, free space
//! - [`RemoteRecordStore`](remote::RemoteRecordStore) - the cloud record database
//! - [`Clock`](time::Clock) - time source for deterministic testing
//! - [`LoggerSink`](logging::LoggerSink) - forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate |
//! |----------|---------------------|
//! | Desktop  | `bridge-desktop`    |
//! | Apple TV / iOS | host-provided |
//!
//! The remote store is always host-provided; the engine never talks to a
//! cloud API directly.
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Remote store
//! adapters must report missing records, write conflicts and transient
//! failures through the dedicated variants so the engine can tell them apart.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`.

pub mod error;
pub mod logging;
pub mod remote;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use logging::{LogEntry, LogLevel, LoggerSink};
pub use remote::{
    Asset, ChangeReason, ChangeTypes, FieldValue, QueryCursor, QueryPage, RecordChange,
    RecordPredicate, RecordQuery, RemoteRecord, RemoteRecordStore, SubscriptionHandle,
};
pub use storage::{FileMetadata, FileSystemAccess};
pub use time::{Clock, ManualClock, SystemClock};
