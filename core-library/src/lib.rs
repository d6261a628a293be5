//! # Library Store
//!
//! Owns the local ROM library database and provides repositories for the
//! entities the sync engine reconciles.
//!
//! This crate manages:
//! - SQLite schema and embedded migrations
//! - Models for ROMs, save states and BIOS files
//! - Repository traits with SQLite implementations; every write runs inside
//!   a single transaction that re-reads the row it mutates

pub mod db;
pub mod error;
pub mod models;
pub mod repositories;

pub use error::{LibraryError, Result};
pub use models::{Bios, Rom, SaveState};
pub use repositories::{
    BiosRepository, Merge, Mutation, RomRepository, SaveStateRepository, SqliteBiosRepository,
    SqliteRomRepository, SqliteSaveStateRepository, UpsertOutcome,
};
