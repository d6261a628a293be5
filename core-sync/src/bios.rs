//! # BIOS Syncer
//!
//! BIOS images live flat in `BIOS/` under the name the emulator expects.
//! Records match on id, then expected MD5, then expected file name.

use async_trait::async_trait;
use bridge_traits::{Asset, RemoteRecord};
use core_library::{Bios, BiosRepository};
use core_runtime::events::EntityKind;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::download_queue::DownloadTask;
use crate::error::{Result, SyncError};
use crate::paths::checked_name;
use crate::progress::{ProgressCategory, ProgressTracker};
use crate::record_id::{bios_record_id, resolve_stable_key};
use crate::schema::{self, bios as field, record_type, FILE_DATA};
use crate::syncer::{
    assign, find_local_match, remote_is_newer, ChangeOutcome, EntitySyncer, ItemResult,
    LocalLookup, MatchKeys, MetadataOnlySyncable, SoftDeleteOutcome, SyncContext, SyncCounts,
    SyncerBase,
};

const MAX_LOGGED_FAILURES: usize = 5;

struct BiosLookup<'a>(&'a dyn BiosRepository);

#[async_trait]
impl LocalLookup for BiosLookup<'_> {
    type Entity = Bios;

    async fn by_record_id(&self, record_id: &str) -> Result<Option<Bios>> {
        Ok(self.0.find_by_record_id(record_id).await?)
    }

    async fn by_content_hash(&self, hash: &str) -> Result<Option<Bios>> {
        Ok(self.0.find_by_md5(hash).await?)
    }

    async fn by_file_name(&self, file_name: &str) -> Result<Option<Bios>> {
        Ok(self.0.find_by_file_name(file_name).await?)
    }
}

struct Applied {
    outcome: ChangeOutcome,
    download: Option<DownloadTask>,
}

pub struct BiosSyncer {
    base: SyncerBase,
    repo: Arc<dyn BiosRepository>,
}

impl BiosSyncer {
    pub fn new(ctx: SyncContext, repo: Arc<dyn BiosRepository>) -> Self {
        Self {
            base: SyncerBase::new(ctx),
            repo,
        }
    }

    #[instrument(skip_all)]
    pub async fn load_all_from_cloud(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        self.pull(progress, true).await
    }

    async fn pull(&self, progress: &ProgressTracker, queue_downloads: bool) -> Result<SyncCounts> {
        let records = self
            .base
            .fetch_all_metadata(record_type::BIOS, field::METADATA_KEYS)
            .await?;
        progress.add_total(ProgressCategory::Bios, records.len());

        let results = self
            .base
            .process_in_batches(
                records,
                |record| {
                    record
                        .get_str(field::SYSTEM_IDENTIFIER)
                        .unwrap_or_default()
                        .to_string()
                },
                |record| async move {
                    let applied = self.apply_record(&record).await;
                    progress.advance(ProgressCategory::Bios, 1);
                    applied
                },
            )
            .await;

        let mut counts = SyncCounts {
            failed: results.failures.len(),
            ..Default::default()
        };
        for error in results.failures.iter().take(MAX_LOGGED_FAILURES) {
            warn!(error = %error, "Failed to apply remote BIOS");
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

        info!(synced = counts.synced, skipped = counts.skipped, failed = counts.failed, "Loaded BIOS from cloud");
        Ok(counts)
    }

    async fn apply_record(&self, record: &RemoteRecord) -> Result<Applied> {
        if schema::is_tombstoned(record) {
            return Ok(Applied {
                outcome: ChangeOutcome::Skipped,
                download: None,
            });
        }

        let hash = record
            .get_non_empty(field::MD5)
            .map(str::to_ascii_uppercase)
            .or_else(|| resolve_stable_key(EntityKind::Bios, &record.id).map(|r| r.key));
        let matched = find_local_match(
            &BiosLookup(self.repo.as_ref()),
            MatchKeys {
                record_id: &record.id,
                content_hash: hash.as_deref(),
                file_name: record.get_non_empty(field::EXPECTED_FILENAME),
            },
        )
        .await?;

        let md5 = match (hash, matched) {
            (_, Some((local, _))) => local.md5,
            (Some(hash), None) => hash,
            (None, None) => return Err(SyncError::missing_field(&record.id, field::MD5)),
        };

        let mut incoming = bios_from_record(record, &md5)?;
        let payload = self.base.paths().bios_file(&incoming.expected_filename);
        let present = self.base.local_size(&payload).await?.is_some();
        incoming.is_downloaded = present;
        let size = incoming.expected_size.unwrap_or(0).max(0) as u64;

        let outcome = self.repo.upsert(incoming, Box::new(merge_remote_bios)).await?;
        let outcome = ChangeOutcome::from(outcome);
        self.base.notify(EntityKind::Bios, &md5, outcome);

        let download = (!present).then(|| DownloadTask::new(EntityKind::Bios, md5, size));
        Ok(Applied { outcome, download })
    }

    /// Upload one BIOS image. `Ok(false)` when the file is missing locally
    /// or the remote copy is tombstoned.
    #[instrument(skip(self), fields(md5 = %md5))]
    pub async fn upload_bios(&self, md5: &str) -> Result<bool> {
        let bios = self
            .repo
            .find_by_md5(md5)
            .await?
            .ok_or_else(|| SyncError::InvalidData(format!("BIOS {md5} is not in the library")))?;

        let payload = self.base.paths().bios_file(&bios.expected_filename);
        let Some(size) = self.base.local_size(&payload).await? else {
            debug!(file = %bios.expected_filename, "BIOS file missing, skipping upload");
            return Ok(false);
        };

        let record_id = bios_record_id(&bios.md5);
        let existing = self.base.fetch_optional(&record_id).await?;
        if existing.as_ref().is_some_and(schema::is_tombstoned) {
            info!("Remote BIOS is tombstoned, not uploading");
            return Ok(false);
        }

        let mut record = existing.unwrap_or_else(|| RemoteRecord::new(record_type::BIOS, &record_id));
        record.set(field::EXPECTED_FILENAME, bios.expected_filename.as_str());
        record.set(field::MD5, bios.md5.as_str());
        record.set(field::EXPECTED_SIZE, bios.expected_size.unwrap_or(size as i64));
        record.set(field::SYSTEM_IDENTIFIER, bios.system_identifier.as_str());
        record.set_opt(field::DESCRIPTION_TEXT, bios.description_text.clone());
        record.set(field::OPTIONAL, bios.optional);
        record
            .assets
            .insert(FILE_DATA.to_string(), Asset::new(&payload).with_size(size));

        let saved = self.base.save(record).await?;
        self.repo
            .mark_synced(&bios.md5, &saved.id, self.base.now_millis())
            .await?;
        info!(record_id = %saved.id, "Uploaded BIOS");
        Ok(true)
    }

    /// Fetch the payload into `BIOS/<expected filename>`.
    #[instrument(skip(self), fields(md5 = %md5))]
    pub async fn download_bios(&self, md5: &str) -> Result<u64> {
        let bios = self
            .repo
            .find_by_md5(md5)
            .await?
            .ok_or_else(|| SyncError::InvalidData(format!("BIOS {md5} is not in the library")))?;
        let record_id = bios
            .remote_record_id
            .clone()
            .unwrap_or_else(|| bios_record_id(&bios.md5));

        let Some(record) = self.base.fetch_optional(&record_id).await? else {
            self.repo.set_downloaded(&bios.md5, false).await?;
            return Err(SyncError::RemoteNotFound { record_id });
        };
        let Some(asset) = record.asset(FILE_DATA) else {
            self.repo.set_downloaded(&bios.md5, false).await?;
            return Err(SyncError::missing_field(&record_id, FILE_DATA));
        };

        let fs = self.base.fs();
        let paths = self.base.paths();
        fs.create_dir_all(&paths.bios_dir())
            .await
            .map_err(SyncError::file_system)?;
        let target = paths.bios_file(&bios.expected_filename);
        fs.copy_file(&asset.local_path, &target)
            .await
            .map_err(SyncError::file_system)?;

        let size = self.base.local_size(&target).await?.unwrap_or(0);
        if self.repo.set_downloaded(&bios.md5, true).await? {
            self.base.notify(EntityKind::Bios, &bios.md5, ChangeOutcome::Updated);
        }
        info!(size, "Downloaded BIOS");
        Ok(size)
    }

    async fn remove_local(&self, bios: Bios) -> Result<ChangeOutcome> {
        if !self.repo.delete(&bios.md5).await? {
            return Ok(ChangeOutcome::AlreadyAbsent);
        }
        let payload = self.base.paths().bios_file(&bios.expected_filename);
        self.base.remove_local_files(&[payload.as_path()]).await;
        self.base.notify(EntityKind::Bios, &bios.md5, ChangeOutcome::Deleted);
        info!(md5 = %bios.md5, "Removed BIOS deleted remotely");
        Ok(ChangeOutcome::Deleted)
    }

    async fn push(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        let entries = self.repo.list_all().await?;
        progress.add_total(ProgressCategory::Bios, entries.len());

        let results = self
            .base
            .process_in_batches(
                entries,
                |bios| bios.system_identifier.clone(),
                |bios| async move {
                    let result = if bios.remote_record_id.is_some() {
                        Ok(ItemResult::Synced)
                    } else {
                        self.upload_bios(&bios.md5).await.map(|uploaded| {
                            if uploaded {
                                ItemResult::Synced
                            } else {
                                ItemResult::Skipped
                            }
                        })
                    };
                    progress.advance(ProgressCategory::Bios, 1);
                    result
                },
            )
            .await;
        Ok(results.tally("bios", MAX_LOGGED_FAILURES))
    }
}

#[async_trait]
impl EntitySyncer for BiosSyncer {
    fn kind(&self) -> EntityKind {
        EntityKind::Bios
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
        let record = match self.base.fetch_optional(record_id).await? {
            Some(record) if !schema::is_tombstoned(&record) => record,
            _ => {
                let local = match self.repo.find_by_record_id(record_id).await? {
                    Some(bios) => Some(bios),
                    None => match resolve_stable_key(EntityKind::Bios, record_id) {
                        Some(resolved) => self.repo.find_by_md5(&resolved.key).await?,
                        None => None,
                    },
                };
                return match local {
                    Some(bios) => self.remove_local(bios).await,
                    None => Ok(ChangeOutcome::AlreadyAbsent),
                };
            }
        };

        let applied = self.apply_record(&record).await?;
        if let Some(task) = applied.download {
            match self.base.ctx().downloads.enqueue(task).await {
                Ok(_) => {}
                Err(e) if e.is_skip() => info!(error = %e, "BIOS download skipped"),
                Err(e) => warn!(error = %e, "Failed to queue BIOS download"),
            }
        }
        Ok(applied.outcome)
    }

    async fn mark_deleted(&self, md5: &str) -> Result<SoftDeleteOutcome> {
        self.base.mark_deleted(&bios_record_id(md5)).await
    }

    async fn purge(&self, md5: &str) -> Result<bool> {
        self.base.delete_record(&bios_record_id(md5)).await
    }
}

#[async_trait]
impl MetadataOnlySyncable for BiosSyncer {
    async fn sync_metadata_only(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        self.pull(progress, false).await
    }
}

fn bios_from_record(record: &RemoteRecord, md5: &str) -> Result<Bios> {
    let file_name = record
        .get_non_empty(field::EXPECTED_FILENAME)
        .ok_or_else(|| SyncError::missing_field(&record.id, field::EXPECTED_FILENAME))?;
    let file_name = checked_name(&record.id, field::EXPECTED_FILENAME, file_name)?;
    let system = record.get_str(field::SYSTEM_IDENTIFIER).unwrap_or_default();

    let mut bios = Bios::new(md5, file_name, system);
    bios.expected_size = record.get_i64(field::EXPECTED_SIZE);
    bios.description_text = record.get_str(field::DESCRIPTION_TEXT).map(str::to_string);
    bios.optional = record.get_bool(field::OPTIONAL).unwrap_or(false);
    bios.remote_record_id = Some(record.id.clone());
    bios.last_synced_at = record.modified_at.map(|d| d.timestamp_millis());
    Ok(bios)
}

fn merge_remote_bios(current: &mut Bios, incoming: &Bios) -> bool {
    let mut changed = assign(&mut current.remote_record_id, incoming.remote_record_id.clone());
    if incoming.is_downloaded && !current.is_downloaded {
        current.is_downloaded = true;
        changed = true;
    }

    if remote_is_newer(incoming.last_synced_at, current.last_synced_at) {
        let expected_size = incoming.expected_size.or(current.expected_size);
        changed |= assign(&mut current.expected_size, expected_size);
        changed |= assign(&mut current.description_text, incoming.description_text.clone());
        changed |= assign(&mut current.optional, incoming.optional);
        if !incoming.system_identifier.is_empty() {
            changed |= assign(&mut current.system_identifier, incoming.system_identifier.clone());
        }
        changed |= assign(&mut current.last_synced_at, incoming.last_synced_at);
    }
    changed
}
