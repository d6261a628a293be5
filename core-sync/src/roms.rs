//! # ROM Syncer
//!
//! Reconciles the ROM library with `ROM` records (and legacy `Game` records).
//!
//! ## Workflow
//!
//! ### Pull (two-phase)
//! 1. Fetch every ROM record without its payload
//! 2. Upsert local ROMs; counters only grow, other fields follow the remote
//!    copy when it is newer than our last sync
//! 3. Queue payload downloads for ROMs missing locally, smallest first
//!
//! ### Push
//! ROMs without a remote record are uploaded. A ROM with companion files
//! (cue sheets, multi-disc images) is packed into one archive first.

use async_trait::async_trait;
use bridge_traits::{Asset, RemoteRecord};
use chrono::{DateTime, TimeZone, Utc};
use core_library::{Rom, RomRepository, UpsertOutcome};
use core_runtime::events::EntityKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::download_queue::DownloadTask;
use crate::error::{Result, SyncError};
use crate::paths::checked_name;
use crate::progress::{ProgressCategory, ProgressTracker};
use crate::record_id::{resolve_stable_key, rom_record_id};
use crate::retry::UploadEntity;
use crate::schema::{self, common, record_type, rom as field, FILE_DATA};
use crate::syncer::{
    assign, find_local_match, remote_is_newer, ChangeOutcome, EntitySyncer, ItemResult,
    LocalLookup, MatchKeys, MetadataOnlySyncable, SoftDeleteOutcome, SyncContext, SyncCounts,
    SyncerBase,
};

const MAX_LOGGED_FAILURES: usize = 5;

/// Result of [`RomSyncer::upload_rom`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RomUploadOutcome {
    Uploaded { record_id: String },
    /// The remote copy is tombstoned; re-uploading would resurrect it
    SkippedTombstone,
    /// No payload on disk
    MissingPayload,
}

struct Applied {
    outcome: ChangeOutcome,
    download: Option<DownloadTask>,
}

struct RomLookup<'a>(&'a dyn RomRepository);

#[async_trait]
impl LocalLookup for RomLookup<'_> {
    type Entity = Rom;

    async fn by_record_id(&self, record_id: &str) -> Result<Option<Rom>> {
        Ok(self.0.find_by_record_id(record_id).await?)
    }

    async fn by_content_hash(&self, hash: &str) -> Result<Option<Rom>> {
        Ok(self.0.find_by_md5(hash).await?)
    }

    async fn by_file_name(&self, file_name: &str) -> Result<Option<Rom>> {
        Ok(self.0.find_by_file_name(file_name).await?)
    }
}

/// ROM syncer
pub struct RomSyncer {
    base: SyncerBase,
    repo: Arc<dyn RomRepository>,
}

impl RomSyncer {
    pub fn new(ctx: SyncContext, repo: Arc<dyn RomRepository>) -> Self {
        Self {
            base: SyncerBase::new(ctx),
            repo,
        }
    }

    /// Remote ROM records without payloads, falling back to the legacy type
    async fn fetch_records(&self) -> Result<Vec<RemoteRecord>> {
        let records = self
            .base
            .fetch_all_metadata(record_type::ROM, field::METADATA_KEYS)
            .await?;
        if !records.is_empty() {
            return Ok(records);
        }

        let legacy = self
            .base
            .fetch_all_metadata(record_type::LEGACY_GAME, field::METADATA_KEYS)
            .await?;
        if !legacy.is_empty() {
            info!(count = legacy.len(), "Using legacy game records");
        }
        Ok(legacy)
    }

    /// Pull every remote ROM into the local store, then queue missing payloads.
    #[instrument(skip_all)]
    pub async fn load_all_from_cloud(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        self.pull(progress, true).await
    }

    async fn pull(&self, progress: &ProgressTracker, queue_downloads: bool) -> Result<SyncCounts> {
        let records = self.fetch_records().await?;
        progress.add_total(ProgressCategory::Roms, records.len());

        let results = self
            .base
            .process_in_batches(
                records,
                |record| system_of(record).unwrap_or_default().to_string(),
                |record| async move {
                    let applied = self.apply_record(&record).await;
                    progress.advance(ProgressCategory::Roms, 1);
                    applied
                },
            )
            .await;

        let mut counts = SyncCounts {
            failed: results.failures.len(),
            ..Default::default()
        };
        for error in results.failures.iter().take(MAX_LOGGED_FAILURES) {
            warn!(error = %error, "Failed to apply remote ROM");
        }

        let mut downloads = Vec::new();
        for applied in results.outputs {
            match applied.outcome {
                ChangeOutcome::Skipped => counts.skipped += 1,
                _ => counts.synced += 1,
            }
            downloads.extend(applied.download);
        }

        if queue_downloads && !downloads.is_empty() {
            let admission = self.base.ctx().downloads.enqueue_batch(downloads).await;
            counts.skipped += admission.skipped();
        }

        info!(
            synced = counts.synced,
            skipped = counts.skipped,
            failed = counts.failed,
            "Loaded ROMs from cloud"
        );
        Ok(counts)
    }

    /// Upsert one remote record locally.
    async fn apply_record(&self, record: &RemoteRecord) -> Result<Applied> {
        if schema::is_tombstoned(record) {
            return Ok(Applied {
                outcome: ChangeOutcome::Skipped,
                download: None,
            });
        }

        let hash = record
            .get_non_empty(field::MD5)
            .or_else(|| record.get_non_empty(common::MD5))
            .map(str::to_ascii_uppercase)
            .or_else(|| resolve_stable_key(EntityKind::Rom, &record.id).map(|r| r.key));
        let file_name = original_file_name(record);

        let matched = find_local_match(
            &RomLookup(self.repo.as_ref()),
            MatchKeys {
                record_id: &record.id,
                content_hash: hash.as_deref(),
                file_name,
            },
        )
        .await?;

        let md5 = match (hash, matched) {
            (_, Some((local, _))) => local.md5,
            (Some(hash), None) => hash,
            (None, None) => return Err(SyncError::missing_field(&record.id, field::MD5)),
        };

        let mut incoming = rom_from_record(record, &md5)?;
        let payload = self
            .base
            .paths()
            .rom_file(&incoming.system_identifier, &incoming.file_name);
        let present = self.base.local_size(&payload).await?.is_some();
        incoming.is_downloaded = present;

        let outcome = self
            .repo
            .upsert(incoming.clone(), Box::new(merge_remote_rom))
            .await?;
        let outcome = ChangeOutcome::from(outcome);
        self.base.notify(EntityKind::Rom, &md5, outcome);

        let download = (!present).then(|| {
            DownloadTask::new(
                EntityKind::Rom,
                md5.clone(),
                incoming.file_size.unwrap_or(0).max(0) as u64,
            )
        });
        debug!(md5 = %md5, ?outcome, "Applied remote ROM");

        Ok(Applied { outcome, download })
    }

    /// Upload one local ROM, creating or updating its record.
    #[instrument(skip(self), fields(md5 = %md5))]
    pub async fn upload_rom(&self, md5: &str) -> Result<RomUploadOutcome> {
        let rom = self
            .repo
            .find_by_md5(md5)
            .await?
            .ok_or_else(|| SyncError::InvalidData(format!("ROM {md5} is not in the library")))?;

        let paths = self.base.paths();
        let primary = paths.rom_file(&rom.system_identifier, &rom.file_name);
        let Some(size) = self.base.local_size(&primary).await? else {
            debug!("ROM payload missing, skipping upload");
            return Ok(RomUploadOutcome::MissingPayload);
        };

        let record_id = rom_record_id(&rom.md5);
        let existing = self.base.fetch_optional(&record_id).await?;
        if existing.as_ref().is_some_and(schema::is_tombstoned) {
            info!("Remote ROM is tombstoned, not uploading");
            return Ok(RomUploadOutcome::SkippedTombstone);
        }

        let mut record = existing.unwrap_or_else(|| RemoteRecord::new(record_type::ROM, &record_id));
        self.write_fields(&rom, size, &mut record);

        let mut companions = Vec::new();
        for name in &rom.related_files {
            let path = paths.rom_file(&rom.system_identifier, name);
            if self.base.fs().exists(&path).await.map_err(SyncError::file_system)? {
                companions.push(path);
            }
        }

        let staged = if companions.is_empty() {
            record.set(field::IS_ARCHIVE, false);
            record.set(field::RELATED_FILENAMES, Vec::<String>::new());
            record
                .assets
                .insert(FILE_DATA.to_string(), Asset::new(&primary).with_size(size));
            None
        } else {
            let archive = paths.rom_upload_archive(&rom.md5);
            let mut files = vec![primary.clone()];
            files.extend(companions.iter().cloned());
            self.stage_archive(&files, &archive).await?;
            let archive_size = self.base.local_size(&archive).await?.unwrap_or(0);

            record.set(field::IS_ARCHIVE, true);
            record.set(field::RELATED_FILENAMES, file_names(&companions));
            record
                .assets
                .insert(FILE_DATA.to_string(), Asset::new(&archive).with_size(archive_size));
            Some(archive)
        };

        let saved = self.base.save(record).await;
        if let Some(archive) = staged {
            self.base.remove_local_files(&[archive.as_path()]).await;
        }
        let saved = saved?;

        self.repo
            .mark_synced(&rom.md5, &saved.id, self.base.now_millis())
            .await?;
        info!(record_id = %saved.id, "Uploaded ROM");
        Ok(RomUploadOutcome::Uploaded { record_id: saved.id })
    }

    /// Upload, routing failures into the retry queue.
    async fn upload_or_queue(&self, md5: &str) -> Result<ItemResult> {
        match self.upload_rom(md5).await {
            Ok(outcome) => Ok(outcome.into()),
            Err(e) => {
                self.base
                    .ctx()
                    .retry_queue
                    .record_failure(UploadEntity::Rom { md5: md5.to_string() }, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn stage_archive(&self, files: &[PathBuf], archive: &Path) -> Result<()> {
        let fs = self.base.fs();
        if let Some(parent) = archive.parent() {
            fs.create_dir_all(parent).await.map_err(SyncError::file_system)?;
        }
        if let Err(e) = fs.create_archive(files, archive).await {
            self.base.remove_local_files(&[archive]).await;
            return Err(SyncError::file_system(e));
        }
        Ok(())
    }

    fn write_fields(&self, rom: &Rom, size: u64, record: &mut RemoteRecord) {
        record.set(field::MD5, rom.md5.as_str());
        record.set(field::TITLE, rom.title.as_str());
        record.set(field::SYSTEM_IDENTIFIER, rom.system_identifier.as_str());
        record.set(field::FILE_SIZE, size as i64);
        record.set(field::ORIGINAL_FILENAME, rom.file_name.as_str());
        record.set_opt(field::DESCRIPTION, rom.description.clone());
        record.set_opt(field::DEVELOPER, rom.developer.clone());
        record.set_opt(field::PUBLISHER, rom.publisher.clone());
        record.set_opt(field::GENRES, rom.genres.clone());
        record.set_opt(field::RATING, rom.rating);
        record.set(field::PLAY_COUNT, rom.play_count);
        record.set(field::TIME_SPENT, rom.time_spent_in_game);
        record.set_opt(field::LAST_PLAYED, rom.last_played.and_then(date_from_millis));
        record.set(field::IS_FAVORITE, rom.is_favorite);
        record.set_opt(field::IMPORT_DATE, date_from_millis(rom.created_at));
        record.set(schema::LAST_MODIFIED_DEVICE, self.base.config().device_name.as_str());
        record.set(common::FILENAME, rom.file_name.as_str());
        record.set(common::SYSTEM, rom.system_identifier.as_str());
        record.set(common::DIRECTORY, format!("ROMs/{}", rom.system_identifier));
    }

    /// Fetch the payload into `ROMs/<system>/` and mark the ROM downloaded.
    #[instrument(skip(self), fields(md5 = %md5))]
    pub async fn download_rom(&self, md5: &str) -> Result<u64> {
        let record_id = self
            .repo
            .find_by_md5(md5)
            .await?
            .and_then(|rom| rom.remote_record_id)
            .unwrap_or_else(|| rom_record_id(md5));

        let Some(record) = self.base.fetch_optional(&record_id).await? else {
            self.repo.set_downloaded(md5, false, None).await?;
            return Err(SyncError::RemoteNotFound { record_id });
        };
        let Some(asset) = record.asset(FILE_DATA) else {
            self.repo.set_downloaded(md5, false, None).await?;
            return Err(SyncError::missing_field(&record_id, FILE_DATA));
        };
        let file_name = record
            .get_non_empty(field::ORIGINAL_FILENAME)
            .ok_or_else(|| SyncError::missing_field(&record_id, field::ORIGINAL_FILENAME))?;
        let file_name = checked_name(&record_id, field::ORIGINAL_FILENAME, file_name)?;
        let system = record
            .get_non_empty(field::SYSTEM_IDENTIFIER)
            .ok_or_else(|| SyncError::missing_field(&record_id, field::SYSTEM_IDENTIFIER))?;
        let system = checked_name(&record_id, field::SYSTEM_IDENTIFIER, system)?;

        let fs = self.base.fs();
        let directory = self.base.paths().roms_dir(system);
        fs.create_dir_all(&directory).await.map_err(SyncError::file_system)?;

        let target = directory.join(file_name);
        if record.get_bool(field::IS_ARCHIVE).unwrap_or(false) {
            let extracted = fs
                .extract_archive(&asset.local_path, &directory)
                .await
                .map_err(SyncError::file_system)?;
            debug!(files = extracted.len(), "Extracted ROM archive");
        } else {
            fs.copy_file(&asset.local_path, &target)
                .await
                .map_err(SyncError::file_system)?;
        }

        let size = match self.base.local_size(&target).await? {
            Some(size) => size,
            None => asset.size.unwrap_or(0),
        };
        if self.repo.set_downloaded(md5, true, Some(size as i64)).await? {
            self.base.notify(EntityKind::Rom, md5, ChangeOutcome::Updated);
        }
        info!(size, "Downloaded ROM");
        Ok(size)
    }

    async fn remove_local(&self, md5: &str) -> Result<ChangeOutcome> {
        let Some(rom) = self.repo.find_by_md5(md5).await? else {
            return Ok(ChangeOutcome::AlreadyAbsent);
        };
        if !self.repo.delete(&rom.md5).await? {
            return Ok(ChangeOutcome::AlreadyAbsent);
        }

        let paths = self.base.paths();
        let files: Vec<PathBuf> = rom
            .all_file_names()
            .into_iter()
            .map(|name| paths.rom_file(&rom.system_identifier, name))
            .collect();
        let refs: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
        self.base.remove_local_files(&refs).await;

        self.base.notify(EntityKind::Rom, &rom.md5, ChangeOutcome::Deleted);
        info!(md5 = %rom.md5, "Removed ROM deleted remotely");
        Ok(ChangeOutcome::Deleted)
    }

    async fn push(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        let roms = self.repo.list_all().await?;
        progress.add_total(ProgressCategory::Roms, roms.len());

        let results = self
            .base
            .process_in_batches(
                roms,
                |rom| rom.system_identifier.clone(),
                |rom| async move {
                    let result = if rom.remote_record_id.is_some() {
                        Ok(ItemResult::Synced)
                    } else {
                        self.upload_or_queue(&rom.md5).await
                    };
                    progress.advance(ProgressCategory::Roms, 1);
                    result
                },
            )
            .await;
        Ok(results.tally("roms", MAX_LOGGED_FAILURES))
    }
}

#[async_trait]
impl EntitySyncer for RomSyncer {
    fn kind(&self) -> EntityKind {
        EntityKind::Rom
    }

    #[instrument(skip_all)]
    async fn sync_all(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        let pulled = self.load_all_from_cloud(progress).await?;
        let mut counts = self.push(progress).await?;
        counts.skipped += pulled.skipped;
        counts.failed += pulled.failed;
        Ok(counts)
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn handle_remote_change(&self, record_id: &str) -> Result<ChangeOutcome> {
        let md5 = match resolve_stable_key(EntityKind::Rom, record_id) {
            Some(resolved) => resolved.key,
            None => match self.repo.find_by_record_id(record_id).await? {
                Some(rom) => rom.md5,
                None => {
                    return Err(SyncError::InvalidData(format!(
                        "unrecognized ROM record id {record_id}"
                    )))
                }
            },
        };

        let record = match self.base.fetch_optional(record_id).await? {
            Some(record) if !schema::is_tombstoned(&record) => record,
            _ => return self.remove_local(&md5).await,
        };

        let applied = self.apply_record(&record).await?;
        if let Some(task) = applied.download {
            if self.base.ctx().platform.is_constrained() {
                debug!("Skipping automatic ROM download on constrained platform");
            } else {
                match self.base.ctx().downloads.enqueue(task).await {
                    Ok(_) => {}
                    Err(e) if e.is_skip() => info!(error = %e, "ROM download skipped"),
                    Err(e) => warn!(error = %e, "Failed to queue ROM download"),
                }
            }
        }
        Ok(applied.outcome)
    }

    async fn mark_deleted(&self, md5: &str) -> Result<SoftDeleteOutcome> {
        self.base.mark_deleted(&rom_record_id(md5)).await
    }

    async fn purge(&self, md5: &str) -> Result<bool> {
        self.base.delete_record(&rom_record_id(md5)).await
    }
}

#[async_trait]
impl MetadataOnlySyncable for RomSyncer {
    async fn sync_metadata_only(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        self.pull(progress, false).await
    }
}

fn date_from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn system_of(record: &RemoteRecord) -> Option<&str> {
    record
        .get_non_empty(field::SYSTEM_IDENTIFIER)
        .or_else(|| record.get_non_empty(common::SYSTEM))
}

fn original_file_name(record: &RemoteRecord) -> Option<&str> {
    record
        .get_non_empty(field::ORIGINAL_FILENAME)
        .or_else(|| record.get_non_empty(common::FILENAME))
}

fn file_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Build the local view of a remote ROM record.
fn rom_from_record(record: &RemoteRecord, md5: &str) -> Result<Rom> {
    let file_name = original_file_name(record)
        .ok_or_else(|| SyncError::missing_field(&record.id, field::ORIGINAL_FILENAME))?;
    let file_name = checked_name(&record.id, field::ORIGINAL_FILENAME, file_name)?;
    let system = system_of(record)
        .ok_or_else(|| SyncError::missing_field(&record.id, field::SYSTEM_IDENTIFIER))?;
    let system = checked_name(&record.id, field::SYSTEM_IDENTIFIER, system)?;
    let title = record
        .get_non_empty(field::TITLE)
        .map(str::to_string)
        .unwrap_or_else(|| {
            Path::new(file_name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.to_string())
        });

    let mut rom = Rom::new(md5, title, file_name, system);
    rom.related_files = record
        .get_string_list(field::RELATED_FILENAMES)
        .unwrap_or_default()
        .iter()
        .map(|name| checked_name(&record.id, field::RELATED_FILENAMES, name).map(str::to_string))
        .collect::<Result<_>>()?;
    rom.file_size = record.get_i64(field::FILE_SIZE);
    rom.description = record.get_str(field::DESCRIPTION).map(str::to_string);
    rom.developer = record.get_str(field::DEVELOPER).map(str::to_string);
    rom.publisher = record.get_str(field::PUBLISHER).map(str::to_string);
    rom.genres = record.get_str(field::GENRES).map(str::to_string);
    rom.rating = record.get_f64(field::RATING);
    rom.play_count = record.get_i64(field::PLAY_COUNT).unwrap_or(0).max(0);
    rom.time_spent_in_game = record.get_i64(field::TIME_SPENT).unwrap_or(0).max(0);
    rom.last_played = record.get_date(field::LAST_PLAYED).map(|d| d.timestamp_millis());
    rom.is_favorite = record.get_bool(field::IS_FAVORITE).unwrap_or(false);
    rom.remote_record_id = Some(record.id.clone());
    rom.last_synced_at = record.modified_at.map(|d| d.timestamp_millis());
    Ok(rom)
}

/// Merge a remote ROM into the stored one.
///
/// Play count and time played never decrease. Everything else follows the
/// remote copy only when it changed after our last sync.
fn merge_remote_rom(current: &mut Rom, incoming: &Rom) -> bool {
    let mut changed = assign(&mut current.remote_record_id, incoming.remote_record_id.clone());

    if incoming.play_count > current.play_count {
        current.play_count = incoming.play_count;
        changed = true;
    }
    if incoming.time_spent_in_game > current.time_spent_in_game {
        current.time_spent_in_game = incoming.time_spent_in_game;
        changed = true;
    }
    if incoming.is_downloaded && !current.is_downloaded {
        current.is_downloaded = true;
        changed = true;
    }

    if remote_is_newer(incoming.last_synced_at, current.last_synced_at) {
        changed |= assign(&mut current.title, incoming.title.clone());
        changed |= assign(&mut current.description, incoming.description.clone());
        changed |= assign(&mut current.developer, incoming.developer.clone());
        changed |= assign(&mut current.publisher, incoming.publisher.clone());
        changed |= assign(&mut current.genres, incoming.genres.clone());
        changed |= assign(&mut current.rating, incoming.rating);
        changed |= assign(&mut current.is_favorite, incoming.is_favorite);
        let last_played = incoming.last_played.or(current.last_played);
        changed |= assign(&mut current.last_played, last_played);
        changed |= assign(&mut current.related_files, incoming.related_files.clone());
        if incoming.file_size.is_some() {
            changed |= assign(&mut current.file_size, incoming.file_size);
        }
        changed |= assign(&mut current.last_synced_at, incoming.last_synced_at);
    }

    changed
}

impl From<RomUploadOutcome> for ItemResult {
    fn from(outcome: RomUploadOutcome) -> Self {
        match outcome {
            RomUploadOutcome::Uploaded { .. } => ItemResult::Synced,
            _ => ItemResult::Skipped,
        }
    }
}
