//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{FileMetadata, FileSystemAccess},
};
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tokio::fs;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;

const APP_DIR: &str = "romsync";

/// Tokio-based file system implementation
///
/// Library payloads live under the documents directory; staging archives go
/// to the temp directory. Archive work runs on the blocking pool.
pub struct TokioFileSystem {
    documents_dir: PathBuf,
    temp_dir: PathBuf,
}

impl TokioFileSystem {
    /// Create a new file system accessor with default directories
    pub fn new() -> Self {
        let documents_dir = dirs::document_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        let temp_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);

        Self {
            documents_dir,
            temp_dir,
        }
    }

    /// Create a new file system accessor with custom directories
    pub fn with_directories(documents_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            documents_dir,
            temp_dir,
        }
    }

    fn map_io_error(e: io::Error) -> BridgeError {
        BridgeError::Io(e)
    }

    fn map_zip_error(e: zip::result::ZipError) -> BridgeError {
        match e {
            zip::result::ZipError::Io(e) => BridgeError::Io(e),
            other => BridgeError::OperationFailed(format!("archive error: {other}")),
        }
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<PathBuf> {
        if !fs::try_exists(dir).await.map_err(Self::map_io_error)? {
            fs::create_dir_all(dir).await.map_err(Self::map_io_error)?;
            debug!(path = ?dir, "Created directory");
        }
        Ok(dir.to_path_buf())
    }

    fn write_archive(files: &[PathBuf], destination: &Path) -> Result<()> {
        let out = std::fs::File::create(destination).map_err(Self::map_io_error)?;
        let mut writer = zip::ZipWriter::new(out);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for file in files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    BridgeError::OperationFailed(format!("invalid archive entry: {}", file.display()))
                })?;

            writer
                .start_file(name, options)
                .map_err(Self::map_zip_error)?;
            let mut input = std::fs::File::open(file).map_err(Self::map_io_error)?;
            io::copy(&mut input, &mut writer).map_err(Self::map_io_error)?;
        }

        writer.finish().map_err(Self::map_zip_error)?;
        Ok(())
    }

    fn read_archive(archive: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
        let input = std::fs::File::open(archive).map_err(Self::map_io_error)?;
        let mut zip = zip::ZipArchive::new(input).map_err(Self::map_zip_error)?;
        let mut extracted = Vec::with_capacity(zip.len());

        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(Self::map_zip_error)?;
            let Some(relative) = entry.enclosed_name() else {
                warn!(name = entry.name(), "Skipping archive entry with unsafe path");
                continue;
            };
            let target = destination.join(relative);

            if entry.is_dir() {
                std::fs::create_dir_all(&target).map_err(Self::map_io_error)?;
                continue;
            }

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(Self::map_io_error)?;
            }
            let mut out = std::fs::File::create(&target).map_err(Self::map_io_error)?;
            io::copy(&mut entry, &mut out).map_err(Self::map_io_error)?;
            extracted.push(target);
        }

        Ok(extracted)
    }

    fn free_space_for(path: &Path) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn get_documents_directory(&self) -> Result<PathBuf> {
        self.ensure_dir(&self.documents_dir).await
    }

    async fn get_temp_directory(&self) -> Result<PathBuf> {
        self.ensure_dir(&self.temp_dir).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path).await.map_err(Self::map_io_error)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(path).await.map_err(Self::map_io_error)?;

        Ok(FileMetadata {
            size: metadata.len(),
            created_at: metadata
                .created()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            modified_at: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            is_directory: metadata.is_dir(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        let data = fs::read(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, size = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }

        fs::write(path, data.as_ref())
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.create_dir_all(parent).await?;
        }
        let bytes = fs::copy(from, to).await.map_err(Self::map_io_error)?;
        debug!(from = ?from, to = ?to, bytes, "Copied file");
        Ok(())
    }

    async fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.create_dir_all(parent).await?;
        }

        // rename fails across volumes (temp dir on another disk)
        if let Err(e) = fs::rename(from, to).await {
            debug!(error = %e, "Rename failed, falling back to copy");
            fs::copy(from, to).await.map_err(Self::map_io_error)?;
            fs::remove_file(from).await.map_err(Self::map_io_error)?;
        }
        debug!(from = ?from, to = ?to, "Moved file");
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Deleted file");
        Ok(())
    }

    async fn delete_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, "Deleted directory");
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await.map_err(Self::map_io_error)?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(Self::map_io_error)?
        {
            entries.push(entry.path());
        }

        debug!(path = ?path, count = entries.len(), "Listed directory");
        Ok(entries)
    }

    async fn available_space(&self, path: &Path) -> Result<u64> {
        let path = fs::canonicalize(path).await.map_err(Self::map_io_error)?;
        let target = path.clone();
        let space = tokio::task::spawn_blocking(move || Self::free_space_for(&target))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("disk query panicked: {e}")))?;

        space.ok_or_else(|| {
            BridgeError::NotAvailable(format!("no volume found for {}", path.display()))
        })
    }

    async fn create_archive(&self, files: &[PathBuf], destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            self.create_dir_all(parent).await?;
        }

        let files = files.to_vec();
        let dest = destination.to_path_buf();
        let count = files.len();
        tokio::task::spawn_blocking(move || Self::write_archive(&files, &dest))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("archive task panicked: {e}")))??;

        debug!(path = ?destination, entries = count, "Created archive");
        Ok(())
    }

    async fn extract_archive(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
        self.create_dir_all(destination).await?;

        let src = archive.to_path_buf();
        let dest = destination.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || Self::read_archive(&src, &dest))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("extract task panicked: {e}")))??;

        debug!(archive = ?archive, entries = extracted.len(), "Extracted archive");
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn scratch(name: &str) -> PathBuf {
        env::temp_dir().join(format!("romsync-fs-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_custom_directories() {
        let docs = scratch("docs");
        let temp = scratch("temp");
        let fs = TokioFileSystem::with_directories(docs.clone(), temp.clone());

        assert_eq!(fs.get_documents_directory().await.unwrap(), docs);
        assert!(fs.exists(&docs).await.unwrap());
        assert_eq!(fs.get_temp_directory().await.unwrap(), temp);

        let _ = fs.delete_dir_all(&docs).await;
        let _ = fs.delete_dir_all(&temp).await;
    }

    #[tokio::test]
    async fn test_write_move_and_read() {
        let root = scratch("move");
        let fs = TokioFileSystem::with_directories(root.clone(), root.clone());

        let staged = root.join("staged.bin");
        let target = root.join("ROMs").join("nes").join("game.nes");
        let data = Bytes::from("cartridge");

        fs.write_file(&staged, data.clone()).await.unwrap();
        fs.move_file(&staged, &target).await.unwrap();

        assert!(!fs.exists(&staged).await.unwrap());
        assert_eq!(fs.read_file(&target).await.unwrap(), data);
        assert_eq!(fs.directory_size(&root).await.unwrap(), data.len() as u64);

        fs.delete_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_archive_round_trip_keeps_file_names() {
        let root = scratch("archive");
        let fs = TokioFileSystem::with_directories(root.clone(), root.clone());

        let cue = root.join("src").join("disc.cue");
        let bin = root.join("src").join("disc.bin");
        fs.write_file(&cue, Bytes::from("FILE disc.bin")).await.unwrap();
        fs.write_file(&bin, Bytes::from(vec![7u8; 2048])).await.unwrap();

        let archive = root.join("out").join("companions.zip");
        fs.create_archive(&[cue.clone(), bin.clone()], &archive)
            .await
            .unwrap();

        let mut extracted = fs
            .extract_archive(&archive, &root.join("unpacked"))
            .await
            .unwrap();
        extracted.sort();

        let names: Vec<_> = extracted
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["disc.bin", "disc.cue"]);
        assert_eq!(fs.metadata(&extracted[0]).await.unwrap().size, 2048);

        fs.delete_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_available_space_for_temp_dir() {
        let fs = TokioFileSystem::new();
        let space = fs.available_space(&env::temp_dir()).await;
        // Containers without a visible mount table report NotAvailable
        assert!(space.is_ok() || matches!(space, Err(BridgeError::NotAvailable(_))));
    }
}
