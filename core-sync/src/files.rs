//! # Non-Database File Syncer
//!
//! Directories such as `Battery States` and `Screenshots` have no local
//! database rows; the file tree is the source of truth. Each file maps to a
//! `File` record named `file_<directory>_<relative path>` that carries its
//! location in fields.

use async_trait::async_trait;
use bridge_traits::{Asset, RemoteRecord};
use chrono::{TimeZone, Utc};
use core_runtime::events::EntityKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::download_queue::DownloadTask;
use crate::error::{Result, SyncError};
use crate::paths::{checked_name, checked_relative_path, LibraryPaths};
use crate::progress::{ProgressCategory, ProgressTracker};
use crate::record_id::file_record_id;
use crate::retry::UploadEntity;
use crate::schema::{self, file as field, record_type, FILE_DATA};
use crate::syncer::{
    ChangeOutcome, EntitySyncer, ItemResult, MetadataOnlySyncable, SoftDeleteOutcome,
    SyncContext, SyncCounts, SyncerBase,
};

const MAX_LISTED_FAILURES: usize = 5;

/// Remote view of one file, from a metadata pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RemoteFileState {
    /// Unix seconds
    last_modified: Option<i64>,
    deleted: bool,
}

/// Location of a file record inside the library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub directory: String,
    pub relative_path: String,
}

impl FileLocation {
    fn from_record(record: &RemoteRecord) -> Result<Self> {
        let directory = record
            .get_non_empty(field::DIRECTORY)
            .ok_or_else(|| SyncError::missing_field(&record.id, field::DIRECTORY))?;
        let relative_path = record
            .get_non_empty(field::RELATIVE_PATH)
            .or_else(|| record.get_non_empty(field::FILENAME))
            .ok_or_else(|| SyncError::missing_field(&record.id, field::RELATIVE_PATH))?;
        Ok(Self {
            directory: checked_name(&record.id, field::DIRECTORY, directory)?.to_string(),
            relative_path: checked_relative_path(&record.id, field::RELATIVE_PATH, relative_path)?
                .to_string(),
        })
    }

    fn record_id(&self) -> String {
        file_record_id(&self.directory, &self.relative_path)
    }

    fn local_path(&self, paths: &LibraryPaths) -> PathBuf {
        self.relative_path
            .split('/')
            .fold(paths.non_database_dir(&self.directory), |path, part| path.join(part))
    }
}

struct FilePush {
    name: String,
    result: Result<ItemResult>,
}

/// Syncs plain files in the configured top-level directories
pub struct NonDatabaseSyncer {
    base: SyncerBase,
}

impl NonDatabaseSyncer {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            base: SyncerBase::new(ctx),
        }
    }

    fn directories(&self) -> &[String] {
        &self.base.config().non_database_directories
    }

    fn is_synced_directory(&self, directory: &str) -> bool {
        self.directories().iter().any(|d| d == directory)
    }

    /// Metadata pass: learn remote state, queue downloads for missing files.
    async fn pull(
        &self,
        progress: &ProgressTracker,
        queue_downloads: bool,
    ) -> Result<(SyncCounts, HashMap<String, RemoteFileState>)> {
        let records = self
            .base
            .fetch_all_metadata(record_type::FILE, field::METADATA_KEYS)
            .await?;

        let mut counts = SyncCounts::default();
        let mut remote = HashMap::new();
        let mut downloads = Vec::new();

        for record in &records {
            let location = match FileLocation::from_record(record) {
                Ok(location) => location,
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "Ignoring file record");
                    counts.failed += 1;
                    continue;
                }
            };
            if !self.is_synced_directory(&location.directory) {
                continue;
            }

            let category = ProgressCategory::for_directory(&location.directory);
            if let Some(category) = category {
                progress.add_total(category, 1);
                progress.advance(category, 1);
            }

            let deleted = schema::is_tombstoned(record);
            remote.insert(
                record.id.clone(),
                RemoteFileState {
                    last_modified: record.get_date(field::LAST_MODIFIED).map(|d| d.timestamp()),
                    deleted,
                },
            );
            if deleted {
                counts.skipped += 1;
                continue;
            }

            let local = location.local_path(self.base.paths());
            match self.base.local_size(&local).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let size = record.get_i64(field::FILE_SIZE).unwrap_or(0).max(0) as u64;
                    downloads.push(DownloadTask::new(EntityKind::File, record.id.clone(), size));
                }
                Err(e) => {
                    warn!(file = %crate::log_name(&local), error = %e, "Cannot check local file");
                    counts.failed += 1;
                    continue;
                }
            }
            counts.synced += 1;
        }

        if queue_downloads && !downloads.is_empty() {
            let admission = self.base.ctx().downloads.enqueue_batch(downloads).await;
            counts.skipped += admission.skipped();
        }

        debug!(records = remote.len(), "Loaded file records");
        Ok((counts, remote))
    }

    /// Every regular file in the synced directories, with its location
    async fn local_files(&self) -> Result<Vec<(FileLocation, PathBuf)>> {
        let fs = self.base.fs();
        let mut files = Vec::new();
        for directory in self.directories() {
            let root = self.base.paths().non_database_dir(directory);
            if !fs.exists(&root).await.map_err(SyncError::file_system)? {
                continue;
            }
            for path in fs
                .list_files_recursive(&root)
                .await
                .map_err(SyncError::file_system)?
            {
                if let Some(relative_path) = LibraryPaths::relative_to(&root, &path) {
                    files.push((
                        FileLocation {
                            directory: directory.clone(),
                            relative_path,
                        },
                        path,
                    ));
                }
            }
        }
        Ok(files)
    }

    /// Upload one file, creating or updating its record.
    ///
    /// Returns `false` when the remote copy is at least as new, or tombstoned.
    #[instrument(skip(self, location), fields(file = %crate::log_name(path)))]
    pub async fn upload_file(&self, location: &FileLocation, path: &Path) -> Result<bool> {
        let metadata = self
            .base
            .fs()
            .metadata(path)
            .await
            .map_err(SyncError::file_system)?;
        let record_id = location.record_id();

        let existing = self.base.fetch_optional(&record_id).await?;
        if let Some(record) = &existing {
            if schema::is_tombstoned(record) {
                return Ok(false);
            }
            let remote_modified = record.get_date(field::LAST_MODIFIED).map(|d| d.timestamp());
            if !local_is_newer(metadata.modified_at, remote_modified) {
                return Ok(false);
            }
        }

        let file_name = Path::new(&location.relative_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| location.relative_path.clone());

        let mut record = existing.unwrap_or_else(|| RemoteRecord::new(record_type::FILE, &record_id));
        record.set(field::DIRECTORY, location.directory.as_str());
        record.set(field::FILENAME, file_name);
        record.set(field::RELATIVE_PATH, location.relative_path.as_str());
        record.set(field::FILE_SIZE, metadata.size as i64);
        record.set_opt(
            field::LAST_MODIFIED,
            metadata
                .modified_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        );
        record
            .assets
            .insert(FILE_DATA.to_string(), Asset::new(path).with_size(metadata.size));

        self.base.save(record).await?;
        debug!("Uploaded file");
        Ok(true)
    }

    /// Upload a file given only its path inside a synced directory.
    pub async fn upload_path(&self, path: &Path) -> Result<bool> {
        let location = self
            .directories()
            .iter()
            .find_map(|directory| {
                let root = self.base.paths().non_database_dir(directory);
                LibraryPaths::relative_to(&root, path).map(|relative_path| FileLocation {
                    directory: directory.clone(),
                    relative_path,
                })
            })
            .ok_or_else(|| {
                SyncError::InvalidData(format!(
                    "{} is outside the synced directories",
                    crate::log_name(path)
                ))
            })?;
        self.upload_file(&location, path).await
    }

    async fn push_file(
        &self,
        location: FileLocation,
        path: PathBuf,
        remote: &HashMap<String, RemoteFileState>,
    ) -> Result<ItemResult> {
        let record_id = location.record_id();
        if let Some(state) = remote.get(&record_id) {
            if state.deleted {
                return Ok(ItemResult::Skipped);
            }
            let metadata = self
                .base
                .fs()
                .metadata(&path)
                .await
                .map_err(SyncError::file_system)?;
            if !local_is_newer(metadata.modified_at, state.last_modified) {
                return Ok(ItemResult::Synced);
            }
        }

        match self.upload_file(&location, &path).await {
            Ok(_) => Ok(ItemResult::Synced),
            Err(e) => {
                self.base
                    .ctx()
                    .retry_queue
                    .record_failure(UploadEntity::File { path: path.clone() }, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn push(
        &self,
        progress: &ProgressTracker,
        remote: &HashMap<String, RemoteFileState>,
    ) -> Result<SyncCounts> {
        let files = self.local_files().await?;
        for (location, _) in &files {
            if let Some(category) = ProgressCategory::for_directory(&location.directory) {
                progress.add_total(category, 1);
            }
        }

        let results = self
            .base
            .process_in_batches(
                files,
                |(location, _)| location.directory.clone(),
                |(location, path)| async move {
                    let name = location.relative_path.clone();
                    let category = ProgressCategory::for_directory(&location.directory);
                    let result = self.push_file(location, path, remote).await;
                    if let Some(category) = category {
                        progress.advance(category, 1);
                    }
                    Ok(FilePush { name, result })
                },
            )
            .await;

        let mut counts = SyncCounts::default();
        let mut failed_names = Vec::new();
        for push in results.outputs {
            match push.result {
                Ok(ItemResult::Synced) => counts.synced += 1,
                Ok(ItemResult::Skipped) => counts.skipped += 1,
                Err(e) => {
                    counts.failed += 1;
                    debug!(file = %push.name, error = %e, "File upload failed");
                    failed_names.push(push.name);
                }
            }
        }
        counts.failed += results.failures.len();

        if !failed_names.is_empty() {
            let listed: Vec<&str> = failed_names
                .iter()
                .take(MAX_LISTED_FAILURES)
                .map(String::as_str)
                .collect();
            warn!(
                failed = failed_names.len(),
                files = %listed.join(", "),
                "Some files failed to upload"
            );
        }
        Ok(counts)
    }

    /// Fetch a file record's payload into its directory.
    #[instrument(skip(self), fields(record_id = %record_id))]
    pub async fn download_file(&self, record_id: &str) -> Result<u64> {
        let record = self
            .base
            .fetch_optional(record_id)
            .await?
            .ok_or_else(|| SyncError::RemoteNotFound {
                record_id: record_id.to_string(),
            })?;
        let location = FileLocation::from_record(&record)?;
        let asset = record
            .asset(FILE_DATA)
            .ok_or_else(|| SyncError::missing_field(record_id, FILE_DATA))?;

        let fs = self.base.fs();
        let target = location.local_path(self.base.paths());
        if let Some(parent) = target.parent() {
            fs.create_dir_all(parent).await.map_err(SyncError::file_system)?;
        }
        fs.copy_file(&asset.local_path, &target)
            .await
            .map_err(SyncError::file_system)?;

        let size = self.base.local_size(&target).await?.unwrap_or(0);
        self.base.notify(EntityKind::File, record_id, ChangeOutcome::Created);
        debug!(size, "Downloaded file");
        Ok(size)
    }

    async fn find_local(&self, record_id: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .local_files()
            .await?
            .into_iter()
            .find(|(location, _)| location.record_id() == record_id)
            .map(|(_, path)| path))
    }
}

#[async_trait]
impl EntitySyncer for NonDatabaseSyncer {
    fn kind(&self) -> EntityKind {
        EntityKind::File
    }

    #[instrument(skip_all)]
    async fn sync_all(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        let (pulled, remote) = self.pull(progress, true).await?;
        let mut counts = self.push(progress, &remote).await?;
        counts.skipped += pulled.skipped;
        counts.failed += pulled.failed;

        for directory in self.directories() {
            if let Some(category) = ProgressCategory::for_directory(directory) {
                progress.finish_category(category);
            }
        }
        info!(
            synced = counts.synced,
            skipped = counts.skipped,
            failed = counts.failed,
            "Synced non-database files"
        );
        Ok(counts)
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn handle_remote_change(&self, record_id: &str) -> Result<ChangeOutcome> {
        let record = match self.base.fetch_optional(record_id).await? {
            Some(record) if !schema::is_tombstoned(&record) => record,
            found => {
                let location = found
                    .as_ref()
                    .and_then(|record| FileLocation::from_record(record).ok());
                let local = match location {
                    Some(location) => Some(location.local_path(self.base.paths())),
                    None => self.find_local(record_id).await?,
                };
                let Some(local) = local else {
                    return Ok(ChangeOutcome::AlreadyAbsent);
                };
                if self.base.local_size(&local).await?.is_none() {
                    return Ok(ChangeOutcome::AlreadyAbsent);
                }
                self.base.remove_local_files(&[local.as_path()]).await;
                self.base.notify(EntityKind::File, record_id, ChangeOutcome::Deleted);
                info!(file = %crate::log_name(&local), "Removed file deleted remotely");
                return Ok(ChangeOutcome::Deleted);
            }
        };

        let location = FileLocation::from_record(&record)?;
        if !self.is_synced_directory(&location.directory) {
            return Ok(ChangeOutcome::Skipped);
        }
        if self
            .base
            .local_size(&location.local_path(self.base.paths()))
            .await?
            .is_some()
        {
            return Ok(ChangeOutcome::Unchanged);
        }

        let size = record.get_i64(field::FILE_SIZE).unwrap_or(0).max(0) as u64;
        match self
            .base
            .ctx()
            .downloads
            .enqueue(DownloadTask::new(EntityKind::File, record_id, size))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_skip() => info!(error = %e, "File download skipped"),
            Err(e) => return Err(e),
        }
        Ok(ChangeOutcome::Skipped)
    }

    async fn mark_deleted(&self, record_id: &str) -> Result<SoftDeleteOutcome> {
        self.base.mark_deleted(record_id).await
    }

    async fn purge(&self, record_id: &str) -> Result<bool> {
        self.base.delete_record(record_id).await
    }
}

#[async_trait]
impl MetadataOnlySyncable for NonDatabaseSyncer {
    async fn sync_metadata_only(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        Ok(self.pull(progress, false).await?.0)
    }
}

/// Upload only when the local copy is strictly newer than the remote one.
fn local_is_newer(local_secs: Option<i64>, remote_secs: Option<i64>) -> bool {
    match (local_secs, remote_secs) {
        (Some(local), Some(remote)) => local > remote,
        (_, None) => true,
        (None, Some(_)) => false,
    }
}
