use bridge_traits::BridgeError;
use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote record not found: {record_id}")]
    RemoteNotFound { record_id: String },

    #[error("Remote record changed concurrently: {record_id}")]
    RemoteConflict { record_id: String },

    #[error("Transient remote failure: {0}")]
    RemoteTransient(String),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Insufficient space: {required} bytes required, {available} bytes available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("{category} sync timed out after {seconds} seconds")]
    Timeout { category: String, seconds: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Queue is no longer running")]
    QueueClosed,

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Failures worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteTransient(_))
    }

    /// Admission rejections, counted as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, SyncError::InsufficientSpace { .. })
    }

    /// Map a file system bridge failure.
    ///
    /// The blanket `From<BridgeError>` assumes the remote store; local I/O
    /// goes through here so it is not confused with a cloud failure.
    pub fn file_system(err: BridgeError) -> Self {
        SyncError::FileSystem(err.to_string())
    }

    pub(crate) fn missing_field(record_id: &str, field: &str) -> Self {
        SyncError::InvalidData(format!("record {record_id} has no {field}"))
    }
}

impl From<BridgeError> for SyncError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NotFound(record_id) => SyncError::RemoteNotFound { record_id },
            BridgeError::Conflict(record_id) => SyncError::RemoteConflict { record_id },
            BridgeError::Transient(message) => SyncError::RemoteTransient(message),
            BridgeError::Io(e) => SyncError::FileSystem(e.to_string()),
            other => SyncError::Remote(other.to_string()),
        }
    }
}

impl From<core_runtime::Error> for SyncError {
    fn from(err: core_runtime::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
