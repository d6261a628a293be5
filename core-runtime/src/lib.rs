//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the ROM sync core:
//! - Logging and tracing infrastructure
//! - Configuration management (`CoreConfig`)
//! - Event bus for sync, library and transfer notifications
//!
//! Other crates depend on this one for their logging conventions and for the
//! event types they publish.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
