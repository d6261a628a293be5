//! # Save State Syncer
//!
//! Save states belong to a game. A remote state whose game is not in the
//! local library is skipped until the ROM arrives. States are matched by
//! record id first, then by `(gameID, filename)`.

use async_trait::async_trait;
use bridge_traits::{Asset, RemoteRecord};
use chrono::{TimeZone, Utc};
use core_library::{RomRepository, SaveState, SaveStateRepository};
use core_runtime::events::EntityKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::download_queue::DownloadTask;
use crate::error::{Result, SyncError};
use crate::paths::checked_name;
use crate::progress::{ProgressCategory, ProgressTracker};
use crate::record_id::{resolve_stable_key, save_state_record_id};
use crate::retry::UploadEntity;
use crate::schema::{self, record_type, save_state as field, FILE_DATA};
use crate::syncer::{
    assign, remote_is_newer, ChangeOutcome, EntitySyncer, ItemResult, MetadataOnlySyncable,
    SoftDeleteOutcome, SyncContext, SyncCounts, SyncerBase,
};

const MAX_LOGGED_FAILURES: usize = 5;

/// Result of [`SaveStateSyncer::upload_save_state`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStateUploadOutcome {
    Uploaded { record_id: String },
    SkippedTombstone,
    MissingPayload,
}

impl From<SaveStateUploadOutcome> for ItemResult {
    fn from(outcome: SaveStateUploadOutcome) -> Self {
        match outcome {
            SaveStateUploadOutcome::Uploaded { .. } => ItemResult::Synced,
            _ => ItemResult::Skipped,
        }
    }
}

struct Applied {
    outcome: ChangeOutcome,
    download: Option<DownloadTask>,
}

pub struct SaveStateSyncer {
    base: SyncerBase,
    repo: Arc<dyn SaveStateRepository>,
    roms: Arc<dyn RomRepository>,
}

impl SaveStateSyncer {
    pub fn new(
        ctx: SyncContext,
        repo: Arc<dyn SaveStateRepository>,
        roms: Arc<dyn RomRepository>,
    ) -> Self {
        Self {
            base: SyncerBase::new(ctx),
            repo,
            roms,
        }
    }

    /// Pull every remote save state, then queue missing payloads.
    #[instrument(skip_all)]
    pub async fn load_all_from_cloud(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        self.pull(progress, true).await
    }

    async fn pull(&self, progress: &ProgressTracker, queue_downloads: bool) -> Result<SyncCounts> {
        let records = self
            .base
            .fetch_all_metadata(record_type::SAVE_STATE, field::METADATA_KEYS)
            .await?;
        progress.add_total(ProgressCategory::SaveStates, records.len());

        let results = self
            .base
            .process_in_batches(
                records,
                |record| record.get_str(field::GAME_ID).unwrap_or_default().to_string(),
                |record| async move {
                    let applied = self.apply_record(&record).await;
                    progress.advance(ProgressCategory::SaveStates, 1);
                    applied
                },
            )
            .await;

        let mut counts = SyncCounts {
            failed: results.failures.len(),
            ..Default::default()
        };
        for error in results.failures.iter().take(MAX_LOGGED_FAILURES) {
            warn!(error = %error, "Failed to apply remote save state");
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
            "Loaded save states from cloud"
        );
        Ok(counts)
    }

    async fn apply_record(&self, record: &RemoteRecord) -> Result<Applied> {
        let skipped = Applied {
            outcome: ChangeOutcome::Skipped,
            download: None,
        };
        if schema::is_tombstoned(record) {
            return Ok(skipped);
        }

        let game_md5 = record
            .get_non_empty(field::GAME_ID)
            .ok_or_else(|| SyncError::missing_field(&record.id, field::GAME_ID))?;
        let Some(game) = self.roms.find_by_md5(game_md5).await? else {
            debug!(record_id = %record.id, game = %game_md5, "Game not in library, skipping save state");
            return Ok(skipped);
        };
        let file_name = record
            .get_non_empty(field::FILENAME)
            .ok_or_else(|| SyncError::missing_field(&record.id, field::FILENAME))?;

        let existing = match self.repo.find_by_record_id(&record.id).await? {
            Some(state) => Some(state),
            None => {
                self.repo
                    .find_by_game_and_file_name(&game.md5, file_name)
                    .await?
            }
        };

        let mut incoming = save_state_from_record(record, &game.md5, &game.system_identifier)?;
        match existing {
            Some(local) => incoming.id = local.id,
            None => {
                if let Some(resolved) = resolve_stable_key(EntityKind::SaveState, &record.id) {
                    incoming.id = resolved.key;
                }
            }
        }

        let payload = self
            .base
            .paths()
            .save_state_file(&incoming.system_identifier, &incoming.file_name);
        let present = self.base.local_size(&payload).await?.is_some();
        incoming.is_downloaded = present;

        let id = incoming.id.clone();
        let size = incoming.file_size.unwrap_or(0).max(0) as u64;
        let outcome = self
            .repo
            .upsert(incoming, Box::new(merge_remote_save_state))
            .await?;
        let outcome = ChangeOutcome::from(outcome);
        self.base.notify(EntityKind::SaveState, &id, outcome);

        let download = (!present).then(|| DownloadTask::new(EntityKind::SaveState, id, size));
        Ok(Applied { outcome, download })
    }

    /// Upload one local save state with its screenshot, if any.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn upload_save_state(&self, id: &str) -> Result<SaveStateUploadOutcome> {
        let state = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::InvalidData(format!("save state {id} is not in the library")))?;

        let paths = self.base.paths();
        let payload = paths.save_state_file(&state.system_identifier, &state.file_name);
        let Some(size) = self.base.local_size(&payload).await? else {
            debug!("Save state payload missing, skipping upload");
            return Ok(SaveStateUploadOutcome::MissingPayload);
        };

        let record_id = save_state_record_id(&state.id);
        let existing = self.base.fetch_optional(&record_id).await?;
        if existing.as_ref().is_some_and(schema::is_tombstoned) {
            info!("Remote save state is tombstoned, not uploading");
            return Ok(SaveStateUploadOutcome::SkippedTombstone);
        }

        let mut record =
            existing.unwrap_or_else(|| RemoteRecord::new(record_type::SAVE_STATE, &record_id));
        record.set(field::GAME_ID, state.game_md5.as_str());
        record.set(field::SYSTEM_IDENTIFIER, state.system_identifier.as_str());
        record.set(field::FILENAME, state.file_name.as_str());
        record.set_opt(
            field::CREATION_DATE,
            Utc.timestamp_millis_opt(state.created_at).single(),
        );
        record.set(field::FILE_SIZE, size as i64);
        record.set(field::IS_AUTO_SAVE, state.is_auto_save);
        record.set(
            schema::LAST_MODIFIED_DEVICE,
            self.base.config().device_name.as_str(),
        );
        record
            .assets
            .insert(FILE_DATA.to_string(), Asset::new(&payload).with_size(size));

        if let Some(image_name) = &state.image_file_name {
            let image = paths.save_state_file(&state.system_identifier, image_name);
            if let Some(image_size) = self.base.local_size(&image).await? {
                record.set(field::IMAGE_FILENAME, image_name.as_str());
                record.assets.insert(
                    field::IMAGE_ASSET.to_string(),
                    Asset::new(&image).with_size(image_size),
                );
            }
        }

        let saved = self.base.save(record).await?;
        self.repo
            .mark_synced(&state.id, &saved.id, self.base.now_millis())
            .await?;
        info!(record_id = %saved.id, "Uploaded save state");
        Ok(SaveStateUploadOutcome::Uploaded { record_id: saved.id })
    }

    async fn upload_or_queue(&self, id: &str) -> Result<ItemResult> {
        match self.upload_save_state(id).await {
            Ok(outcome) => Ok(outcome.into()),
            Err(e) => {
                self.base
                    .ctx()
                    .retry_queue
                    .record_failure(UploadEntity::SaveState { id: id.to_string() }, &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Fetch the payload and screenshot into `Save States/<system>/`.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn download_save_state(&self, id: &str) -> Result<u64> {
        let state = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::InvalidData(format!("save state {id} is not in the library")))?;
        let record_id = state
            .remote_record_id
            .clone()
            .unwrap_or_else(|| save_state_record_id(&state.id));

        let Some(record) = self.base.fetch_optional(&record_id).await? else {
            self.repo.set_downloaded(&state.id, false).await?;
            return Err(SyncError::RemoteNotFound { record_id });
        };
        let Some(asset) = record.asset(FILE_DATA) else {
            self.repo.set_downloaded(&state.id, false).await?;
            return Err(SyncError::missing_field(&record_id, FILE_DATA));
        };

        let fs = self.base.fs();
        let paths = self.base.paths();
        fs.create_dir_all(&paths.save_states_dir(&state.system_identifier))
            .await
            .map_err(SyncError::file_system)?;

        let target = paths.save_state_file(&state.system_identifier, &state.file_name);
        fs.copy_file(&asset.local_path, &target)
            .await
            .map_err(SyncError::file_system)?;

        if let (Some(image), Some(image_name)) = (
            record.asset(field::IMAGE_ASSET),
            record.get_non_empty(field::IMAGE_FILENAME),
        ) {
            let image_target = paths.save_state_file(&state.system_identifier, image_name);
            if let Err(e) = fs.copy_file(&image.local_path, &image_target).await {
                warn!(error = %e, "Failed to download save state screenshot");
            }
        }

        let size = self.base.local_size(&target).await?.unwrap_or(0);
        if self.repo.set_downloaded(&state.id, true).await? {
            self.base
                .notify(EntityKind::SaveState, &state.id, ChangeOutcome::Updated);
        }
        info!(size, "Downloaded save state");
        Ok(size)
    }

    async fn remove_local(&self, state: SaveState) -> Result<ChangeOutcome> {
        if !self.repo.delete(&state.id).await? {
            return Ok(ChangeOutcome::AlreadyAbsent);
        }

        let paths = self.base.paths();
        let mut files: Vec<PathBuf> =
            vec![paths.save_state_file(&state.system_identifier, &state.file_name)];
        if let Some(image) = &state.image_file_name {
            files.push(paths.save_state_file(&state.system_identifier, image));
        }
        let refs: Vec<&std::path::Path> = files.iter().map(PathBuf::as_path).collect();
        self.base.remove_local_files(&refs).await;

        self.base
            .notify(EntityKind::SaveState, &state.id, ChangeOutcome::Deleted);
        info!(id = %state.id, "Removed save state deleted remotely");
        Ok(ChangeOutcome::Deleted)
    }

    async fn find_for_record(&self, record_id: &str) -> Result<Option<SaveState>> {
        if let Some(state) = self.repo.find_by_record_id(record_id).await? {
            return Ok(Some(state));
        }
        match resolve_stable_key(EntityKind::SaveState, record_id) {
            Some(resolved) => Ok(self.repo.find_by_id(&resolved.key).await?),
            None => Ok(None),
        }
    }

    async fn push(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        let states = self.repo.list_all().await?;
        progress.add_total(ProgressCategory::SaveStates, states.len());

        let results = self
            .base
            .process_in_batches(
                states,
                |state| state.game_md5.clone(),
                |state| async move {
                    let result = if state.remote_record_id.is_some() {
                        Ok(ItemResult::Synced)
                    } else {
                        self.upload_or_queue(&state.id).await
                    };
                    progress.advance(ProgressCategory::SaveStates, 1);
                    result
                },
            )
            .await;
        Ok(results.tally("save_states", MAX_LOGGED_FAILURES))
    }
}

#[async_trait]
impl EntitySyncer for SaveStateSyncer {
    fn kind(&self) -> EntityKind {
        EntityKind::SaveState
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
                return match self.find_for_record(record_id).await? {
                    Some(state) => self.remove_local(state).await,
                    None => Ok(ChangeOutcome::AlreadyAbsent),
                }
            }
        };

        let applied = self.apply_record(&record).await?;
        if let Some(task) = applied.download {
            match self.base.ctx().downloads.enqueue(task).await {
                Ok(_) => {}
                Err(e) if e.is_skip() => info!(error = %e, "Save state download skipped"),
                Err(e) => warn!(error = %e, "Failed to queue save state download"),
            }
        }
        Ok(applied.outcome)
    }

    async fn mark_deleted(&self, id: &str) -> Result<SoftDeleteOutcome> {
        self.base.mark_deleted(&save_state_record_id(id)).await
    }

    async fn purge(&self, id: &str) -> Result<bool> {
        self.base.delete_record(&save_state_record_id(id)).await
    }
}

#[async_trait]
impl MetadataOnlySyncable for SaveStateSyncer {
    async fn sync_metadata_only(&self, progress: &ProgressTracker) -> Result<SyncCounts> {
        self.pull(progress, false).await
    }
}

fn save_state_from_record(record: &RemoteRecord, game_md5: &str, game_system: &str) -> Result<SaveState> {
    let file_name = record
        .get_non_empty(field::FILENAME)
        .ok_or_else(|| SyncError::missing_field(&record.id, field::FILENAME))?;
    let file_name = checked_name(&record.id, field::FILENAME, file_name)?;
    let system = record
        .get_non_empty(field::SYSTEM_IDENTIFIER)
        .unwrap_or(game_system);
    let system = checked_name(&record.id, field::SYSTEM_IDENTIFIER, system)?;

    let mut state = SaveState::new(game_md5, system, file_name);
    if let Some(created) = record.get_date(field::CREATION_DATE) {
        state.created_at = created.timestamp_millis();
    }
    if let Some(modified) = record.modified_at {
        state.modified_at = modified.timestamp_millis();
    }
    state.file_size = record.get_i64(field::FILE_SIZE);
    state.is_auto_save = record.get_bool(field::IS_AUTO_SAVE).unwrap_or(false);
    state.last_modified_device = record
        .get_str(schema::LAST_MODIFIED_DEVICE)
        .map(str::to_string);
    state.image_file_name = record
        .get_non_empty(field::IMAGE_FILENAME)
        .map(|name| checked_name(&record.id, field::IMAGE_FILENAME, name).map(str::to_string))
        .transpose()?;
    state.remote_record_id = Some(record.id.clone());
    state.last_synced_at = record.modified_at.map(|d| d.timestamp_millis());
    Ok(state)
}

/// Newer remote copies overwrite the state; the link and download flag only move forward.
fn merge_remote_save_state(current: &mut SaveState, incoming: &SaveState) -> bool {
    let mut changed = assign(&mut current.remote_record_id, incoming.remote_record_id.clone());
    if incoming.is_downloaded && !current.is_downloaded {
        current.is_downloaded = true;
        changed = true;
    }

    if remote_is_newer(incoming.last_synced_at, current.last_synced_at) {
        changed |= assign(&mut current.modified_at, incoming.modified_at);
        let file_size = incoming.file_size.or(current.file_size);
        changed |= assign(&mut current.file_size, file_size);
        changed |= assign(&mut current.is_auto_save, incoming.is_auto_save);
        changed |= assign(
            &mut current.last_modified_device,
            incoming.last_modified_device.clone(),
        );
        let image_file_name = incoming
            .image_file_name
            .clone()
            .or_else(|| current.image_file_name.clone());
        changed |= assign(&mut current.image_file_name, image_file_name);
        changed |= assign(&mut current.last_synced_at, incoming.last_synced_at);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAME: &str = "0123456789ABCDEF0123456789ABCDEF";
    const STATE_ID: &str = "6f1c3a52-8d5e-4b7a-9c1e-2f3d4a5b6c7d";

    fn record(modified_ms: i64) -> RemoteRecord {
        let mut record = RemoteRecord::new(record_type::SAVE_STATE, save_state_record_id(STATE_ID))
            .with_field(field::GAME_ID, GAME)
            .with_field(field::FILENAME, "slot1.svs")
            .with_field(field::IS_AUTO_SAVE, true)
            .with_field(schema::LAST_MODIFIED_DEVICE, "handheld");
        record.modified_at = Utc.timestamp_millis_opt(modified_ms).single();
        record
    }

    #[test]
    fn test_system_falls_back_to_game() {
        let state = save_state_from_record(&record(1_000), GAME, "com.nintendo.snes").unwrap();
        assert_eq!(state.system_identifier, "com.nintendo.snes");
        assert_eq!(state.game_md5, GAME);
        assert!(state.is_auto_save);
        assert_eq!(state.last_synced_at, Some(1_000));
    }

    #[test]
    fn test_newer_remote_overwrites() {
        let mut current = SaveState::new(GAME, "com.nintendo.snes", "slot1.svs");
        current.last_synced_at = Some(500);
        let incoming = save_state_from_record(&record(1_000), GAME, "com.nintendo.snes").unwrap();

        assert!(merge_remote_save_state(&mut current, &incoming));
        assert!(current.is_auto_save);
        assert_eq!(current.last_modified_device.as_deref(), Some("handheld"));
        assert!(!merge_remote_save_state(&mut current, &incoming));
    }

    #[test]
    fn test_newer_remote_keeps_size_and_image_it_lacks() {
        let mut current = SaveState::new(GAME, "com.nintendo.snes", "slot1.svs");
        current.last_synced_at = Some(500);
        current.file_size = Some(2_048);
        current.image_file_name = Some("slot1.png".to_string());
        let incoming = save_state_from_record(&record(1_000), GAME, "com.nintendo.snes").unwrap();

        assert!(merge_remote_save_state(&mut current, &incoming));
        assert_eq!(current.file_size, Some(2_048));
        assert_eq!(current.image_file_name.as_deref(), Some("slot1.png"));
        assert_eq!(current.last_synced_at, Some(1_000));
    }

    #[test]
    fn test_stale_remote_only_links() {
        let mut current = SaveState::new(GAME, "com.nintendo.snes", "slot1.svs");
        current.last_synced_at = Some(5_000);
        let incoming = save_state_from_record(&record(1_000), GAME, "com.nintendo.snes").unwrap();

        assert!(merge_remote_save_state(&mut current, &incoming));
        assert!(!current.is_auto_save);
        assert_eq!(current.remote_record_id, incoming.remote_record_id);
    }
}
