//! Storage and File System Abstractions
//!
//! Provides the platform-agnostic file system trait used by the sync engine
//! for payload files, temporary archives and free-space checks.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File metadata information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    /// Unix seconds
    pub created_at: Option<i64>,
    /// Unix seconds
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// File system access trait
///
/// Abstracts file I/O operations to support different platforms:
/// - Desktop: Direct filesystem access
/// - iOS/tvOS: Sandboxed app container, smaller free-space budget
///
/// Archive creation and extraction are part of this contract because the
/// engine only ever treats archives as opaque packaging for multi-file
/// payloads.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn stage(fs: &dyn FileSystemAccess, data: Bytes) -> Result<PathBuf> {
///     let tmp = fs.get_temp_directory().await?;
///     let file_path = tmp.join("staged.bin");
///     fs.write_file(&file_path, data).await?;
///     Ok(file_path)
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Get the root directory that holds the user's library
    /// (`ROMs/`, `Save States/`, `BIOS/`, `Screenshots/`, ...)
    async fn get_documents_directory(&self) -> Result<PathBuf>;

    /// Get a directory suitable for temporary files that may be purged
    async fn get_temp_directory(&self) -> Result<PathBuf>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for a file or directory
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Read entire file contents into memory
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating it if it doesn't exist
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Copy a file, replacing the destination if present
    async fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Move a file atomically where the platform allows it
    async fn move_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Delete a file
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Delete a directory and all its contents
    async fn delete_dir_all(&self, path: &Path) -> Result<()>;

    /// List all entries in a directory
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Bytes available to the application on the volume holding `path`
    async fn available_space(&self, path: &Path) -> Result<u64>;

    /// Package `files` into a single archive at `destination`.
    ///
    /// Entries are stored flat under their file names.
    async fn create_archive(&self, files: &[PathBuf], destination: &Path) -> Result<()>;

    /// Extract `archive` into `destination`, returning the extracted paths
    async fn extract_archive(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>>;

    /// Recursively list regular files below `path`
    async fn list_files_recursive(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![path.to_path_buf()];

        while let Some(dir) = pending.pop() {
            for entry in self.list_directory(&dir).await? {
                if self.metadata(&entry).await?.is_directory {
                    pending.push(entry);
                } else {
                    files.push(entry);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Calculate total size of a directory recursively
    async fn directory_size(&self, path: &Path) -> Result<u64> {
        let mut total = 0u64;
        for file in self.list_files_recursive(path).await? {
            total += self.metadata(&file).await?.size;
        }
        Ok(total)
    }
}
