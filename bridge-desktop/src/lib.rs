//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! - `FileSystemAccess` using `tokio::fs`, `zip` for companion archives and
//!   `sysinfo` for free-space queries
//!
//! The remote record store has no desktop default; hosts inject their own
//! adapter.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::TokioFileSystem;
//! use bridge_traits::FileSystemAccess;
//!
//! #[tokio::main]
//! async fn main() {
//!     let fs = TokioFileSystem::new();
//!     let docs = fs.get_documents_directory().await.unwrap();
//! }
//! ```

mod filesystem;

pub use filesystem::TokioFileSystem;
