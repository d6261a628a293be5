//! # Sync Engine
//!
//! Composition root. Builds every service once from a [`CoreConfig`] and a
//! SQLite pool and wires them together:
//!
//! ```text
//!             ┌──────────────┐
//!             │ InitialSyncer│──── drain ───> RetryQueue
//!             └──────┬───────┘
//!                    │ sync_all (timeout per category)
//!    ┌────────────┬──┴─────────┬──────────────┐
//!    ▼            ▼            ▼              ▼
//! RomSyncer  SaveStateSyncer  BiosSyncer  NonDatabaseSyncer
//!    │            │            │              │
//!    └────────────┴─────┬──────┴──────────────┘
//!                       ▼
//!           DownloadQueue ◄── SyncerDispatch ──► UploadQueue
//! ```
//!
//! The download queue is created before the syncers and started after them,
//! since its executor calls back into the syncers.

use async_trait::async_trait;
use bridge_traits::RemoteRecord;
use core_library::{
    RomRepository, SqliteBiosRepository, SqliteRomRepository, SqliteSaveStateRepository,
};
use core_runtime::config::{CoreConfig, FeatureFlags};
use core_runtime::events::{EntityKind, EventBus, EventStream, DEFAULT_EVENT_BUFFER_SIZE};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::analytics::{SyncAnalytics, TracingAnalytics};
use crate::bios::BiosSyncer;
use crate::config::SyncConfig;
use crate::download_queue::{DownloadExecutor, DownloadQueue, DownloadTask, SpacePolicy};
use crate::error::{Result, SyncError};
use crate::files::NonDatabaseSyncer;
use crate::orchestrator::{InitialSyncReport, InitialSyncer, SyncCategory};
use crate::paths::LibraryPaths;
use crate::progress::{ProgressCategory, ProgressTracker, SyncProgress};
use crate::retry::{DispatchOutcome, RetryDispatch, RetryQueue, UploadEntity};
use crate::roms::RomSyncer;
use crate::save_states::SaveStateSyncer;
use crate::schema::{self, record_type};
use crate::subscriptions::{ChangeRouter, Route, RoutingHandle};
use crate::syncer::{
    ChangeOutcome, EntitySyncer, MetadataOnlySyncable, SyncContext, SyncCounts, SyncerBase,
};
use crate::upload_queue::{TransferPriority, UploadExecutor, UploadQueue, UploadTask, UploadTaskId};

/// Routes queued transfers and retries to the owning syncer.
pub struct SyncerDispatch {
    roms: Arc<RomSyncer>,
    save_states: Arc<SaveStateSyncer>,
    bios: Arc<BiosSyncer>,
    files: Arc<NonDatabaseSyncer>,
    retry_queue: Arc<RetryQueue>,
}

#[async_trait]
impl RetryDispatch for SyncerDispatch {
    async fn retry_upload(&self, entity: &UploadEntity) -> Result<DispatchOutcome> {
        match entity {
            UploadEntity::Rom { md5 } => {
                self.roms.upload_rom(md5).await?;
                Ok(DispatchOutcome::Succeeded)
            }
            UploadEntity::SaveState { id } => {
                self.save_states.upload_save_state(id).await?;
                Ok(DispatchOutcome::Succeeded)
            }
            UploadEntity::Bios { .. } | UploadEntity::File { .. } => Ok(DispatchOutcome::Unsupported),
        }
    }
}

#[async_trait]
impl UploadExecutor for SyncerDispatch {
    async fn upload(&self, task: &UploadTask) -> Result<()> {
        let result = match &task.entity {
            UploadEntity::Rom { md5 } => self.roms.upload_rom(md5).await.map(drop),
            UploadEntity::SaveState { id } => self.save_states.upload_save_state(id).await.map(drop),
            UploadEntity::Bios { md5 } => self.bios.upload_bios(md5).await.map(drop),
            UploadEntity::File { path } => self.files.upload_path(path).await.map(drop),
        };
        if let Err(e) = &result {
            if matches!(task.entity, UploadEntity::Rom { .. }) {
                self.retry_queue
                    .record_failure(task.entity.clone(), e)
                    .await;
            }
        }
        result
    }
}

#[async_trait]
impl DownloadExecutor for SyncerDispatch {
    async fn download(&self, task: &DownloadTask) -> Result<()> {
        match task.kind {
            EntityKind::Rom => self.roms.download_rom(&task.key).await.map(drop),
            EntityKind::SaveState => self.save_states.download_save_state(&task.key).await.map(drop),
            EntityKind::Bios => self.bios.download_bios(&task.key).await.map(drop),
            EntityKind::File => self.files.download_file(&task.key).await.map(drop),
        }
    }
}

/// Fully wired sync engine
pub struct SyncEngine {
    features: FeatureFlags,
    event_bus: Arc<EventBus>,
    progress: Arc<ProgressTracker>,
    rom_repo: Arc<dyn RomRepository>,
    roms: Arc<RomSyncer>,
    save_states: Arc<SaveStateSyncer>,
    bios: Arc<BiosSyncer>,
    files: Arc<NonDatabaseSyncer>,
    retry_queue: Arc<RetryQueue>,
    records: SyncerBase,
    non_database_directories: Vec<String>,
    router: ChangeRouter,
    orchestrator: InitialSyncer,
    uploads: UploadQueue,
    downloads: Arc<DownloadQueue>,
    download_worker: Mutex<Option<JoinHandle<()>>>,
    routing: Mutex<Option<RoutingHandle>>,
    paths: LibraryPaths,
}

impl SyncEngine {
    /// Build the engine with log-only analytics.
    pub async fn new(core: CoreConfig, config: SyncConfig, pool: SqlitePool) -> Result<Self> {
        Self::with_analytics(core, config, pool, Arc::new(TracingAnalytics)).await
    }

    /// Build the engine, creating the library directories if needed.
    ///
    /// Must be called inside a Tokio runtime; the upload actor and the
    /// download worker are spawned here.
    pub async fn with_analytics(
        core: CoreConfig,
        config: SyncConfig,
        pool: SqlitePool,
        analytics: Arc<dyn SyncAnalytics>,
    ) -> Result<Self> {
        core.validate()?;
        core.prepare_directories().await?;

        let config = Arc::new(config);
        let event_bus = Arc::new(EventBus::new(DEFAULT_EVENT_BUFFER_SIZE));
        let paths = LibraryPaths::new(&core.documents_dir, &core.temp_dir);
        let retry_queue = Arc::new(RetryQueue::new(Arc::clone(&core.clock)));
        let downloads = Arc::new(DownloadQueue::new(
            Arc::clone(&core.file_system),
            core.documents_dir.clone(),
            SpacePolicy::from_config(&config, core.features.enable_background_downloads),
            config.max_concurrent_downloads,
            Arc::clone(&event_bus),
        ));

        let ctx = SyncContext {
            store: Arc::clone(&core.remote_store),
            fs: Arc::clone(&core.file_system),
            clock: Arc::clone(&core.clock),
            event_bus: Arc::clone(&event_bus),
            config: Arc::clone(&config),
            paths: paths.clone(),
            platform: core.platform,
            retry_queue: Arc::clone(&retry_queue),
            downloads: Arc::clone(&downloads),
        };

        let rom_repo: Arc<dyn RomRepository> = Arc::new(SqliteRomRepository::new(pool.clone()));
        let roms = Arc::new(RomSyncer::new(ctx.clone(), Arc::clone(&rom_repo)));
        let save_states = Arc::new(SaveStateSyncer::new(
            ctx.clone(),
            Arc::new(SqliteSaveStateRepository::new(pool.clone())),
            Arc::clone(&rom_repo),
        ));
        let bios = Arc::new(BiosSyncer::new(
            ctx.clone(),
            Arc::new(SqliteBiosRepository::new(pool)),
        ));
        let records = SyncerBase::new(ctx.clone());
        let files = Arc::new(NonDatabaseSyncer::new(ctx));

        let dispatch = Arc::new(SyncerDispatch {
            roms: Arc::clone(&roms),
            save_states: Arc::clone(&save_states),
            bios: Arc::clone(&bios),
            files: Arc::clone(&files),
            retry_queue: Arc::clone(&retry_queue),
        });
        let uploads = UploadQueue::spawn(
            dispatch.clone(),
            config.max_concurrent_uploads,
            Arc::clone(&core.clock),
            Arc::clone(&event_bus),
        );
        let download_worker = downloads.start(dispatch.clone());

        let progress = Arc::new(ProgressTracker::new());
        let file_buckets: Vec<ProgressCategory> = config
            .non_database_directories
            .iter()
            .filter_map(|directory| ProgressCategory::for_directory(directory))
            .collect();
        let categories = vec![
            SyncCategory {
                name: "roms",
                timeout: config.rom_timeout,
                syncer: roms.clone(),
                progress: vec![ProgressCategory::Roms],
            },
            SyncCategory {
                name: "save_states",
                timeout: config.save_state_timeout,
                syncer: save_states.clone(),
                progress: vec![ProgressCategory::SaveStates],
            },
            SyncCategory {
                name: "bios",
                timeout: config.bios_timeout,
                syncer: bios.clone(),
                progress: vec![ProgressCategory::Bios],
            },
            SyncCategory {
                name: "files",
                timeout: config.non_database_timeout,
                syncer: files.clone(),
                progress: file_buckets,
            },
        ];

        let orchestrator = InitialSyncer::new(
            categories,
            Arc::clone(&core.remote_store),
            Arc::clone(&config),
            Arc::clone(&progress),
            Arc::clone(&retry_queue),
            dispatch,
            analytics,
            Arc::clone(&event_bus),
        );

        let router = ChangeRouter::new(
            Arc::clone(&core.remote_store),
            vec![
                Route {
                    record_type: record_type::ROM,
                    syncer: roms.clone(),
                },
                Route {
                    record_type: record_type::SAVE_STATE,
                    syncer: save_states.clone(),
                },
                Route {
                    record_type: record_type::BIOS,
                    syncer: bios.clone(),
                },
                Route {
                    record_type: record_type::FILE,
                    syncer: files.clone(),
                },
            ],
        );

        info!(platform = ?core.platform, "Sync engine ready");
        Ok(Self {
            features: core.features,
            event_bus,
            progress,
            rom_repo,
            roms,
            save_states,
            bios,
            files,
            retry_queue,
            records,
            non_database_directories: config.non_database_directories.clone(),
            router,
            orchestrator,
            uploads,
            downloads,
            download_worker: Mutex::new(Some(download_worker)),
            routing: Mutex::new(None),
            paths,
        })
    }

    /// Run one full reconciliation pass.
    pub async fn perform_initial_sync(&self, force: bool) -> InitialSyncReport {
        self.orchestrator.perform_initial_sync(force).await
    }

    pub async fn is_initial_sync_needed(&self) -> bool {
        self.orchestrator.is_initial_sync_needed().await
    }

    /// Remote-to-local metadata pass for every category, without payloads.
    #[instrument(skip(self))]
    pub async fn sync_metadata_only(&self) -> Result<SyncCounts> {
        let syncers: [&dyn MetadataOnlySyncable; 4] = [
            self.roms.as_ref(),
            self.save_states.as_ref(),
            self.bios.as_ref(),
            self.files.as_ref(),
        ];
        let mut total = SyncCounts::default();
        for syncer in syncers {
            total.merge(syncer.sync_metadata_only(&self.progress).await?);
        }
        Ok(total)
    }

    /// A ROM was added locally; upload it ahead of background work.
    #[instrument(skip(self), fields(md5 = %md5))]
    pub async fn rom_imported(&self, md5: &str) -> Result<UploadTaskId> {
        let rom = self
            .rom_repo
            .find_by_md5(md5)
            .await?
            .ok_or_else(|| SyncError::InvalidData(format!("ROM {md5} is not in the library")))?;
        let path = self.paths.rom_file(&rom.system_identifier, &rom.file_name);
        self.uploads
            .enqueue(
                UploadEntity::Rom { md5: rom.md5 },
                rom.title,
                path,
                TransferPriority::High,
            )
            .await
    }

    /// Start forwarding remote change notifications to the syncers.
    ///
    /// A no-op when subscriptions are disabled or already running.
    pub async fn start_change_routing(&self) -> Result<bool> {
        if !self.features.enable_subscriptions {
            info!("Subscriptions disabled, not routing remote changes");
            return Ok(false);
        }
        let mut routing = self.routing.lock().await;
        if routing.is_some() {
            return Ok(true);
        }
        *routing = Some(self.router.start(CancellationToken::new()).await?);
        Ok(true)
    }

    /// Apply a record delivered outside the subscriptions, routed by its
    /// type tag or, for untyped records, its `directory` field.
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn apply_remote_record(&self, record: &RemoteRecord) -> Result<ChangeOutcome> {
        let kind = schema::classify_record(record, &self.non_database_directories)
            .ok_or_else(|| {
                SyncError::InvalidData(format!(
                    "Cannot tell the entity kind of record {} ({})",
                    record.id, record.record_type
                ))
            })?;
        self.syncer(kind).handle_remote_change(&record.id).await
    }

    /// Remote records of one kind.
    pub async fn count_remote(&self, kind: EntityKind) -> Result<usize> {
        self.records
            .count_remote_records(schema::record_type_for(kind))
            .await
    }

    pub fn syncer(&self, kind: EntityKind) -> Arc<dyn EntitySyncer> {
        match kind {
            EntityKind::Rom => self.roms.clone(),
            EntityKind::SaveState => self.save_states.clone(),
            EntityKind::Bios => self.bios.clone(),
            EntityKind::File => self.files.clone(),
        }
    }

    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn events(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
    }

    pub fn upload_queue(&self) -> &UploadQueue {
        &self.uploads
    }

    pub fn download_queue(&self) -> &Arc<DownloadQueue> {
        &self.downloads
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    pub fn roms(&self) -> &Arc<RomSyncer> {
        &self.roms
    }

    /// Stop routing, the upload actor and the download worker.
    pub async fn shutdown(&self) {
        if let Some(routing) = self.routing.lock().await.take() {
            routing.stop().await;
        }
        self.uploads.shutdown().await;
        self.downloads.shutdown();
        if let Some(worker) = self.download_worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Download worker ended abnormally");
            }
        }
        info!("Sync engine stopped");
    }
}
