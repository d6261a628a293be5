//! # Repository Pattern Implementation
//!
//! One trait per entity with a SQLite implementation:
//!
//! - `RomRepository` - ROMs keyed by uppercased MD5
//! - `SaveStateRepository` - save states keyed by UUID, owned by a ROM
//! - `BiosRepository` - BIOS images keyed by expected MD5
//!
//! Mutating calls open a transaction, re-read the current row, apply the
//! caller's change and commit. Callers never hand back an entity they read
//! earlier; they hand over a closure describing the change.

pub mod bios;
pub mod rom;
pub mod save_state;

pub use bios::{BiosRepository, SqliteBiosRepository};
pub use rom::{RomRepository, SqliteRomRepository};
pub use save_state::{SaveStateRepository, SqliteSaveStateRepository};

/// Reconciles an incoming value into the stored one.
///
/// Receives the current row and the incoming value; returns `true` when the
/// stored row changed and must be written back.
pub type Merge<T> = Box<dyn FnOnce(&mut T, &T) -> bool + Send>;

/// In-place change to a stored row; returns `true` when something changed.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> bool + Send>;

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_mutation(self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn invalid(field: &str, message: String) -> crate::LibraryError {
    crate::LibraryError::InvalidInput {
        field: field.to_string(),
        message,
    }
}
