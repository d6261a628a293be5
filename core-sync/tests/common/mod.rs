//! Shared fakes for the sync integration tests
//!
//! - `MemoryStore`: record store with change-tag conflicts, cursors and
//!   subscriptions. Saved assets are copied into a `/cloud` area so they
//!   outlive the caller's staging files.
//! - `MemoryFs`: file system held in a map, with a configurable free-space
//!   figure and a trivial archive format.
//! - `Harness`: a `SyncContext` over both fakes and an in-memory database.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::{
    ChangeReason, ChangeTypes, Clock, FileMetadata, FileSystemAccess, ManualClock, QueryCursor,
    QueryPage, RecordChange, RecordQuery, RemoteRecord, RemoteRecordStore, SubscriptionHandle,
};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use core_library::db::create_test_pool;
use core_library::{
    Bios, Rom, SaveState, SqliteBiosRepository, SqliteRomRepository, SqliteSaveStateRepository,
};
use core_runtime::config::PlatformProfile;
use core_runtime::events::{CoreEvent, EventBus};
use core_sync::schema::FILE_DATA;
use core_sync::{
    BiosSyncer, DownloadQueue, LibraryPaths, NonDatabaseSyncer, RetryQueue, RomSyncer,
    SaveStateSyncer, SpacePolicy, SyncConfig, SyncContext,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::mpsc;

pub const DOCUMENTS: &str = "/library";
pub const TEMP: &str = "/tmp/romsync";
const CLOUD: &str = "/cloud";

pub const GAME_MD5: &str = "0123456789ABCDEF0123456789ABCDEF";
pub const OTHER_MD5: &str = "FEDCBA9876543210FEDCBA9876543210";
pub const SNES: &str = "com.nintendo.snes";

// ============================================================================
// Remote store
// ============================================================================

#[derive(Default)]
struct StoreState {
    records: BTreeMap<String, RemoteRecord>,
    cursors: HashMap<String, Vec<RemoteRecord>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<RecordChange>>>,
    next_tag: u64,
    next_cursor: u64,
    /// Record ids whose next save fails with a conflict after a concurrent edit
    conflict_on_save: HashMap<String, BTreeMap<String, bridge_traits::FieldValue>>,
    transient_failures: usize,
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
    fs: Arc<MemoryFs>,
    clock: Arc<dyn Clock>,
    pub saves: AtomicUsize,
    pub queries: AtomicUsize,
    pub continues: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl MemoryStore {
    pub fn new(fs: Arc<MemoryFs>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            fs,
            clock,
            saves: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            continues: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Place a record as if another device had saved it.
    pub fn seed(&self, mut record: RemoteRecord) {
        let mut state = self.state.lock().unwrap();
        state.next_tag += 1;
        record.change_tag = Some(format!("tag-{}", state.next_tag));
        if record.modified_at.is_none() {
            record.modified_at = Some(self.clock.now());
        }
        state.records.insert(record.id.clone(), record);
    }

    /// Seed a record together with a payload blob.
    pub fn seed_with_payload(&self, record: RemoteRecord, payload: &[u8]) {
        let blob = Path::new(CLOUD).join(&record.id).join(FILE_DATA);
        self.fs.put(&blob, payload);
        let record = record.with_asset(
            FILE_DATA,
            bridge_traits::Asset::new(&blob).with_size(payload.len() as u64),
        );
        self.seed(record);
    }

    pub fn get(&self, id: &str) -> Option<RemoteRecord> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.state.lock().unwrap().records.keys().cloned().collect()
    }

    /// Before the next save of `id`, apply `fields` as a concurrent edit so
    /// the save conflicts.
    pub fn conflict_next_save(&self, id: &str, fields: BTreeMap<String, bridge_traits::FieldValue>) {
        self.state
            .lock()
            .unwrap()
            .conflict_on_save
            .insert(id.to_string(), fields);
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_transiently(&self, count: usize) {
        self.state.lock().unwrap().transient_failures = count;
    }

    /// Deliver a change notification to subscribers of `record_type`.
    pub fn notify(&self, record_type: &str, record_id: &str, reason: ChangeReason) {
        let state = self.state.lock().unwrap();
        if let Some(subscribers) = state.subscribers.get(record_type) {
            for tx in subscribers {
                let _ = tx.send(RecordChange {
                    record_id: record_id.to_string(),
                    record_type: record_type.to_string(),
                    reason,
                });
            }
        }
    }

    fn take_transient(&self) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(BridgeError::Transient("rate limited".to_string()));
        }
        Ok(())
    }

    fn project(record: &RemoteRecord, query: &RecordQuery) -> RemoteRecord {
        let Some(keys) = &query.desired_keys else {
            return record.clone();
        };
        let mut projected = record.clone();
        projected.fields.retain(|key, _| keys.contains(key));
        projected.assets.retain(|key, _| keys.contains(key));
        projected
    }

    fn page(state: &mut StoreState, mut records: Vec<RemoteRecord>, limit: usize) -> QueryPage {
        if records.len() <= limit {
            return QueryPage {
                records,
                cursor: None,
            };
        }
        let rest = records.split_off(limit);
        state.next_cursor += 1;
        let cursor = format!("cursor-{}", state.next_cursor);
        state.cursors.insert(cursor.clone(), rest);
        QueryPage {
            records,
            cursor: Some(QueryCursor(cursor)),
        }
    }
}

#[async_trait]
impl RemoteRecordStore for MemoryStore {
    async fn query(&self, query: &RecordQuery, limit: usize) -> BridgeResult<QueryPage> {
        self.take_transient()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let records: Vec<RemoteRecord> = state
            .records
            .values()
            .filter(|r| r.record_type == query.record_type && query.predicate.matches(r))
            .map(|r| Self::project(r, query))
            .collect();
        Ok(Self::page(&mut state, records, limit))
    }

    async fn continue_query(&self, cursor: &QueryCursor, limit: usize) -> BridgeResult<QueryPage> {
        self.take_transient()?;
        self.continues.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let records = state
            .cursors
            .remove(&cursor.0)
            .ok_or_else(|| BridgeError::OperationFailed(format!("unknown cursor {cursor}")))?;
        Ok(Self::page(&mut state, records, limit))
    }

    async fn fetch(&self, record_id: &str) -> BridgeResult<RemoteRecord> {
        self.take_transient()?;
        self.state
            .lock()
            .unwrap()
            .records
            .get(record_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(record_id.to_string()))
    }

    async fn save(&self, mut record: RemoteRecord) -> BridgeResult<RemoteRecord> {
        self.take_transient()?;

        let mut blobs = Vec::new();
        for (key, asset) in record.assets.iter_mut() {
            if asset.local_path.starts_with(CLOUD) {
                continue;
            }
            let blob = Path::new(CLOUD).join(&record.id).join(key);
            blobs.push((asset.local_path.clone(), blob.clone()));
            asset.local_path = blob;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(edit) = state.conflict_on_save.remove(&record.id) {
            state.next_tag += 1;
            let tag = format!("tag-{}", state.next_tag);
            if let Some(current) = state.records.get_mut(&record.id) {
                current.fields.extend(edit);
                current.change_tag = Some(tag);
            }
        }

        let current_tag = state.records.get(&record.id).and_then(|r| r.change_tag.clone());
        if current_tag.is_some() && current_tag != record.change_tag {
            return Err(BridgeError::Conflict(record.id.clone()));
        }

        state.next_tag += 1;
        record.change_tag = Some(format!("tag-{}", state.next_tag));
        record.modified_at = Some(self.clock.now());
        state.records.insert(record.id.clone(), record.clone());
        drop(state);

        for (from, to) in blobs {
            self.fs.copy_now(&from, &to)?;
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn delete(&self, record_id: &str) -> BridgeResult<()> {
        self.take_transient()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .records
            .remove(record_id)
            .map(drop)
            .ok_or_else(|| BridgeError::NotFound(record_id.to_string()))
    }

    async fn subscribe(
        &self,
        record_type: &str,
        _change_types: ChangeTypes,
    ) -> BridgeResult<SubscriptionHandle> {
        let (tx, changes) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .entry(record_type.to_string())
            .or_default()
            .push(tx);
        Ok(SubscriptionHandle {
            subscription_id: format!("sub-{record_type}"),
            changes,
        })
    }
}

// ============================================================================
// File system
// ============================================================================

#[derive(Default)]
struct FsState {
    files: BTreeMap<PathBuf, (Bytes, i64)>,
    dirs: HashSet<PathBuf>,
    archives: HashMap<PathBuf, Vec<(String, Bytes)>>,
    /// Paths whose existence check fails
    unreadable: HashSet<PathBuf>,
}

pub struct MemoryFs {
    state: Mutex<FsState>,
    available: AtomicU64,
    mtime: AtomicU64,
    pub fail_archives: std::sync::atomic::AtomicBool,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self {
            state: Mutex::new(FsState::default()),
            available: AtomicU64::new(u64::MAX / 2),
            mtime: AtomicU64::new(1_700_000_000),
            fail_archives: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl MemoryFs {
    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }

    /// Write a file stamped with the current fake mtime.
    pub fn put(&self, path: impl AsRef<Path>, data: &[u8]) {
        let mtime = self.mtime.load(Ordering::SeqCst) as i64;
        self.put_with_mtime(path, data, mtime);
    }

    pub fn put_with_mtime(&self, path: impl AsRef<Path>, data: &[u8], mtime_secs: i64) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state.lock().unwrap();
        Self::add_parents(&mut state, &path);
        state
            .files
            .insert(path, (Bytes::copy_from_slice(data), mtime_secs));
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path.as_ref())
            .map(|(data, _)| data.clone())
    }

    /// Make `exists` fail for `path`.
    pub fn fail_exists(&self, path: impl AsRef<Path>) {
        self.state
            .lock()
            .unwrap()
            .unreadable
            .insert(path.as_ref().to_path_buf());
    }

    pub fn has(&self, path: impl AsRef<Path>) -> bool {
        self.state.lock().unwrap().files.contains_key(path.as_ref())
    }

    pub fn files_under(&self, prefix: impl AsRef<Path>) -> Vec<PathBuf> {
        self.state
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|p| p.starts_with(prefix.as_ref()))
            .cloned()
            .collect()
    }

    fn add_parents(state: &mut FsState, path: &Path) {
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir.as_os_str().is_empty() {
                break;
            }
            state.dirs.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }

    fn copy_now(&self, from: &Path, to: &Path) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .files
            .get(from)
            .cloned()
            .ok_or_else(|| not_found(from))?;
        if let Some(entries) = state.archives.get(from).cloned() {
            state.archives.insert(to.to_path_buf(), entries);
        }
        Self::add_parents(&mut state, to);
        state.files.insert(to.to_path_buf(), entry);
        Ok(())
    }
}

fn not_found(path: &Path) -> BridgeError {
    BridgeError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        path.display().to_string(),
    ))
}

#[async_trait]
impl FileSystemAccess for MemoryFs {
    async fn get_documents_directory(&self) -> BridgeResult<PathBuf> {
        Ok(PathBuf::from(DOCUMENTS))
    }

    async fn get_temp_directory(&self) -> BridgeResult<PathBuf> {
        Ok(PathBuf::from(TEMP))
    }

    async fn exists(&self, path: &Path) -> BridgeResult<bool> {
        let state = self.state.lock().unwrap();
        if state.unreadable.contains(path) {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                path.display().to_string(),
            )));
        }
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    async fn metadata(&self, path: &Path) -> BridgeResult<FileMetadata> {
        let state = self.state.lock().unwrap();
        if let Some((data, mtime)) = state.files.get(path) {
            return Ok(FileMetadata {
                size: data.len() as u64,
                created_at: Some(*mtime),
                modified_at: Some(*mtime),
                is_directory: false,
            });
        }
        if state.dirs.contains(path) {
            return Ok(FileMetadata {
                size: 0,
                created_at: None,
                modified_at: None,
                is_directory: true,
            });
        }
        Err(not_found(path))
    }

    async fn create_dir_all(&self, path: &Path) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.dirs.insert(path.to_path_buf());
        Self::add_parents(&mut state, path);
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> BridgeResult<Bytes> {
        self.read(path).ok_or_else(|| not_found(path))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> BridgeResult<()> {
        self.put(path, &data);
        Ok(())
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> BridgeResult<()> {
        self.copy_now(from, to)
    }

    async fn move_file(&self, from: &Path, to: &Path) -> BridgeResult<()> {
        self.copy_now(from, to)?;
        self.state.lock().unwrap().files.remove(from);
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.archives.remove(path);
        state.files.remove(path).map(drop).ok_or_else(|| not_found(path))
    }

    async fn delete_dir_all(&self, path: &Path) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.files.retain(|p, _| !p.starts_with(path));
        state.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> BridgeResult<Vec<PathBuf>> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<PathBuf> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    async fn available_space(&self, _path: &Path) -> BridgeResult<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn create_archive(&self, files: &[PathBuf], destination: &Path) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        let mut entries = Vec::new();
        for file in files {
            let (data, _) = state.files.get(file).cloned().ok_or_else(|| not_found(file))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            entries.push((name, data));
        }
        Self::add_parents(&mut state, destination);
        let size: usize = entries.iter().map(|(_, d)| d.len()).sum();
        state
            .files
            .insert(destination.to_path_buf(), (Bytes::from(vec![0u8; size]), 0));
        if self.fail_archives.load(Ordering::SeqCst) {
            return Err(BridgeError::OperationFailed("archive write failed".to_string()));
        }
        state.archives.insert(destination.to_path_buf(), entries);
        Ok(())
    }

    async fn extract_archive(&self, archive: &Path, destination: &Path) -> BridgeResult<Vec<PathBuf>> {
        let entries = self
            .state
            .lock()
            .unwrap()
            .archives
            .get(archive)
            .cloned()
            .ok_or_else(|| not_found(archive))?;
        let mut extracted = Vec::new();
        for (name, data) in entries {
            let path = destination.join(name);
            self.put(&path, &data);
            extracted.push(path);
        }
        Ok(extracted)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub struct Harness {
    pub fs: Arc<MemoryFs>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub event_bus: Arc<EventBus>,
    pub events: broadcast::Receiver<CoreEvent>,
    pub retry_queue: Arc<RetryQueue>,
    pub downloads: Arc<DownloadQueue>,
    pub paths: LibraryPaths,
    pub ctx: SyncContext,
    pub rom_repo: Arc<SqliteRomRepository>,
    pub save_state_repo: Arc<SqliteSaveStateRepository>,
    pub bios_repo: Arc<SqliteBiosRepository>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(fast_config(), PlatformProfile::Desktop).await
    }

    pub async fn with_config(config: SyncConfig, platform: PlatformProfile) -> Self {
        let fs = Arc::new(MemoryFs::default());
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(MemoryStore::new(fs.clone(), clock.clone()));
        let event_bus = Arc::new(EventBus::new(1024));
        let events = event_bus.subscribe();
        let config = Arc::new(config);
        let paths = LibraryPaths::new(DOCUMENTS, TEMP);
        let retry_queue = Arc::new(RetryQueue::new(clock.clone()));
        let downloads = Arc::new(DownloadQueue::new(
            fs.clone(),
            DOCUMENTS,
            SpacePolicy::from_config(&config, true),
            config.max_concurrent_downloads,
            event_bus.clone(),
        ));

        let ctx = SyncContext {
            store: store.clone(),
            fs: fs.clone(),
            clock: clock.clone(),
            event_bus: event_bus.clone(),
            config,
            paths: paths.clone(),
            platform,
            retry_queue: retry_queue.clone(),
            downloads: downloads.clone(),
        };

        let pool = create_test_pool().await.unwrap();
        Self {
            fs,
            store,
            clock,
            event_bus,
            events,
            retry_queue,
            downloads,
            paths,
            ctx,
            rom_repo: Arc::new(SqliteRomRepository::new(pool.clone())),
            save_state_repo: Arc::new(SqliteSaveStateRepository::new(pool.clone())),
            bios_repo: Arc::new(SqliteBiosRepository::new(pool)),
        }
    }

    pub fn rom_syncer(&self) -> RomSyncer {
        RomSyncer::new(self.ctx.clone(), self.rom_repo.clone())
    }

    pub fn save_state_syncer(&self) -> SaveStateSyncer {
        SaveStateSyncer::new(
            self.ctx.clone(),
            self.save_state_repo.clone(),
            self.rom_repo.clone(),
        )
    }

    pub fn bios_syncer(&self) -> BiosSyncer {
        BiosSyncer::new(self.ctx.clone(), self.bios_repo.clone())
    }

    pub fn file_syncer(&self) -> NonDatabaseSyncer {
        NonDatabaseSyncer::new(self.ctx.clone())
    }

    /// Events published so far
    pub fn drain_events(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Defaults with no inter-batch pause and no retry backoff
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        batch_pause: std::time::Duration::ZERO,
        transient_retry_base_delay: std::time::Duration::from_millis(1),
        ..SyncConfig::default()
    }
}

pub fn rom(md5: &str, title: &str, file_name: &str) -> Rom {
    Rom::new(md5, title, file_name, SNES)
}

pub fn save_state(game_md5: &str, file_name: &str) -> SaveState {
    SaveState::new(game_md5, SNES, file_name)
}

pub fn bios(md5: &str, file_name: &str) -> Bios {
    Bios::new(md5, file_name, "com.sony.psx")
}
