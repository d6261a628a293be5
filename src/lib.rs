//! Workspace placeholder crate.
//!
//! This crate exposes the sync engine behind the `desktop-shims` feature so a
//! host application can depend on `romsync-workspace` without wiring the
//! individual workspace crates (`core-sync`, `core-runtime`) itself.

#[cfg(feature = "desktop-shims")]
pub use core_runtime as runtime;
#[cfg(feature = "desktop-shims")]
pub use core_sync as sync;
