//! Plain-file sync, change routing and the assembled engine.

mod common;

use bridge_traits::{ChangeReason, ManualClock, RemoteRecord};
use common::{start_time, Harness, MemoryFs, MemoryStore, DOCUMENTS, TEMP};
use core_library::db::create_test_pool;
use core_runtime::config::CoreConfig;
use core_runtime::events::EntityKind;
use core_sync::schema::{file as field, record_type, IS_DELETED};
use core_sync::{
    ChangeOutcome, ChangeRouter, EntitySyncer, ProgressTracker, Route, SyncEngine, SyncError,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SAVE_FILE: &str = "/library/Battery States/pokemon.sav";
const SAVE_RECORD: &str = "file_Battery States_pokemon.sav";

fn file_record(directory: &str, relative_path: &str) -> RemoteRecord {
    RemoteRecord::new(
        record_type::FILE,
        format!("file_{directory}_{relative_path}"),
    )
    .with_field(field::DIRECTORY, directory)
    .with_field(field::RELATIVE_PATH, relative_path)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

// ============================================================================
// Non-database files
// ============================================================================

#[tokio::test]
async fn test_local_files_are_pushed_once() {
    let h = Harness::new().await;
    h.fs.put(SAVE_FILE, b"battery");
    h.fs.put("/library/Screenshots/snes/title.png", b"png");
    h.fs.put("/library/Unsynced/ignored.txt", b"nope");
    let syncer = h.file_syncer();
    let progress = ProgressTracker::new();

    let counts = syncer.sync_all(&progress).await.unwrap();
    assert_eq!(counts.synced, 2);
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 2);

    let record = h.store.get(SAVE_RECORD).unwrap();
    assert_eq!(record.get_str(field::DIRECTORY), Some("Battery States"));
    assert_eq!(record.get_str(field::FILENAME), Some("pokemon.sav"));
    assert_eq!(record.get_i64(field::FILE_SIZE), Some(7));
    assert!(h.store.get("file_Screenshots_snes/title.png").is_some());
    assert_eq!(progress.snapshot().battery_states.total, 1);

    // Unchanged files are not uploaded again
    let counts = syncer.sync_all(&progress).await.unwrap();
    assert_eq!(counts.synced, 2);
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 2);

    // A newer local copy is
    h.fs.put_with_mtime(SAVE_FILE, b"battery v2", 1_800_000_000);
    syncer.sync_all(&progress).await.unwrap();
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.store.get(SAVE_RECORD).unwrap().get_i64(field::FILE_SIZE),
        Some(10)
    );
}

#[tokio::test]
async fn test_remote_files_are_downloaded() {
    let h = Harness::new().await;
    h.store.seed_with_payload(
        file_record("Battery States", "zelda.sav")
            .with_field(field::FILE_SIZE, 4i64)
            .with_field(field::LAST_MODIFIED, start_time()),
        b"save",
    );
    let syncer = h.file_syncer();
    let progress = ProgressTracker::new();

    syncer.sync_all(&progress).await.unwrap();
    assert_eq!(h.downloads.pending_len().await, 1);

    let size = syncer
        .download_file("file_Battery States_zelda.sav")
        .await
        .unwrap();
    assert_eq!(size, 4);
    assert_eq!(
        h.fs.read("/library/Battery States/zelda.sav").as_deref(),
        Some(&b"save"[..])
    );

    // The remote copy is newer than the downloaded one; nothing to push
    let saves = h.store.saves.load(Ordering::SeqCst);
    syncer.sync_all(&progress).await.unwrap();
    assert_eq!(h.store.saves.load(Ordering::SeqCst), saves);
}

#[tokio::test]
async fn test_unreadable_local_file_does_not_stop_the_pull() {
    let h = Harness::new().await;
    for name in ["a.sav", "b.sav"] {
        h.store.seed_with_payload(
            file_record("Battery States", name).with_field(field::FILE_SIZE, 4i64),
            b"save",
        );
    }
    h.fs.fail_exists("/library/Battery States/a.sav");

    let counts = h.file_syncer().sync_all(&ProgressTracker::new()).await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.synced, 1);
    assert_eq!(h.downloads.pending_len().await, 1);
}

#[tokio::test]
async fn test_file_records_with_unsafe_locations_are_ignored() {
    let h = Harness::new().await;
    h.store.seed_with_payload(
        file_record("Battery States", "../../../etc/passwd").with_field(field::FILE_SIZE, 4i64),
        b"evil",
    );
    h.store.seed_with_payload(
        file_record("/etc", "passwd").with_field(field::FILE_SIZE, 4i64),
        b"evil",
    );
    let syncer = h.file_syncer();

    let counts = syncer.sync_all(&ProgressTracker::new()).await.unwrap();
    assert_eq!(counts.failed, 2);
    assert_eq!(h.downloads.pending_len().await, 0);

    let escaping = "file_Battery States_../../../etc/passwd";
    assert!(matches!(
        syncer.download_file(escaping).await,
        Err(SyncError::InvalidData(_))
    ));
    assert!(matches!(
        syncer.handle_remote_change(escaping).await,
        Err(SyncError::InvalidData(_))
    ));
    assert!(h.fs.files_under("/etc").is_empty());
    assert!(h.fs.files_under(DOCUMENTS).is_empty());
}

#[tokio::test]
async fn test_tombstoned_file_is_not_pushed() {
    let h = Harness::new().await;
    h.fs.put(SAVE_FILE, b"battery");
    h.store.seed(
        file_record("Battery States", "pokemon.sav").with_field(IS_DELETED, true),
    );

    let counts = h.file_syncer().sync_all(&ProgressTracker::new()).await.unwrap();
    assert_eq!(counts.synced, 0);
    assert!(counts.skipped >= 1);
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
    assert!(h.fs.has(SAVE_FILE));
}

#[tokio::test]
async fn test_upload_path_outside_synced_directories_is_rejected() {
    let h = Harness::new().await;
    h.fs.put("/library/Other/file.bin", b"x");
    let result = h
        .file_syncer()
        .upload_path(std::path::Path::new("/library/Other/file.bin"))
        .await;
    assert!(matches!(result, Err(SyncError::InvalidData(_))));
}

// ============================================================================
// Change routing
// ============================================================================

#[tokio::test]
async fn test_remote_changes_reach_the_owning_syncer() {
    let h = Harness::new().await;
    h.fs.put(SAVE_FILE, b"battery");
    let syncer: Arc<dyn EntitySyncer> = Arc::new(h.file_syncer());

    let router = ChangeRouter::new(
        h.store.clone(),
        vec![Route {
            record_type: record_type::FILE,
            syncer: syncer.clone(),
        }],
    );
    let routing = router.start(CancellationToken::new()).await.unwrap();
    assert_eq!(routing.subscriptions(), 1);

    // Deleted on another device: the local copy goes away
    h.store
        .notify(record_type::FILE, SAVE_RECORD, ChangeReason::Deleted);
    eventually("local file removal", || !h.fs.has(SAVE_FILE)).await;

    // Created on another device: a download is scheduled
    h.store.seed_with_payload(
        file_record("Screenshots", "new.png").with_field(field::FILE_SIZE, 3i64),
        b"png",
    );
    h.store
        .notify(record_type::FILE, "file_Screenshots_new.png", ChangeReason::Created);
    let downloads = h.downloads.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while downloads.pending_len().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("download was not queued");

    // Other record types are not routed here
    h.store.notify(record_type::ROM, "rom_0", ChangeReason::Updated);

    routing.stop().await;

    // Handling the same deletion again is a no-op
    assert_eq!(
        syncer.handle_remote_change(SAVE_RECORD).await.unwrap(),
        ChangeOutcome::AlreadyAbsent
    );
}

// ============================================================================
// Engine
// ============================================================================

async fn engine(fs: Arc<MemoryFs>, store: Arc<MemoryStore>, subscriptions: bool) -> SyncEngine {
    let core = CoreConfig::builder()
        .documents_dir(DOCUMENTS)
        .temp_dir(TEMP)
        .file_system(fs)
        .remote_store(store)
        .clock(Arc::new(ManualClock::new(start_time())))
        .enable_subscriptions(subscriptions)
        .enable_background_downloads(true)
        .build()
        .unwrap();
    SyncEngine::new(core, common::fast_config(), create_test_pool().await.unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_engine_runs_a_full_pass_and_downloads() {
    let fs = Arc::new(MemoryFs::default());
    let store = Arc::new(MemoryStore::new(
        fs.clone(),
        Arc::new(ManualClock::new(start_time())),
    ));
    store.seed_with_payload(
        file_record("Screenshots", "shot.png")
            .with_field(field::FILE_SIZE, 3i64)
            .with_field(field::LAST_MODIFIED, start_time()),
        b"png",
    );

    let engine = engine(fs.clone(), store, true).await;
    assert!(!engine.is_initial_sync_needed().await);

    let skipped = engine.perform_initial_sync(false).await;
    assert!(skipped.skipped);

    let report = engine.perform_initial_sync(true).await;
    assert!(!report.skipped);
    assert!(report.overall_success, "{report:?}");
    assert_eq!(report.categories.len(), 4);
    assert!(report.category("files").is_some_and(|c| c.succeeded()));
    assert!(engine.progress().borrow().is_complete);

    // The download worker fetches the payload in the background
    eventually("background download", || {
        fs.has("/library/Screenshots/shot.png")
    })
    .await;

    assert_eq!(engine.count_remote(EntityKind::File).await.unwrap(), 1);
    assert_eq!(engine.count_remote(EntityKind::Rom).await.unwrap(), 0);

    // Untyped records are routed by directory
    let untyped = RemoteRecord::new("Asset", "file_Screenshots_shot.png")
        .with_field(field::DIRECTORY, "Screenshots");
    assert_eq!(
        engine.apply_remote_record(&untyped).await.unwrap(),
        ChangeOutcome::Unchanged
    );
    let unknown = RemoteRecord::new("Asset", "asset_1").with_field(field::DIRECTORY, "Music");
    assert!(matches!(
        engine.apply_remote_record(&unknown).await,
        Err(SyncError::InvalidData(_))
    ));

    assert!(engine.start_change_routing().await.unwrap());
    // Second start is a no-op
    assert!(engine.start_change_routing().await.unwrap());

    let missing = engine.rom_imported(common::GAME_MD5).await;
    assert!(matches!(missing, Err(SyncError::InvalidData(_))));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_engine_without_subscriptions_does_not_route() {
    let fs = Arc::new(MemoryFs::default());
    let store = Arc::new(MemoryStore::new(
        fs.clone(),
        Arc::new(ManualClock::new(start_time())),
    ));
    let engine = engine(fs, store, false).await;

    assert!(engine.is_initial_sync_needed().await);
    assert!(!engine.start_change_routing().await.unwrap());
    engine.shutdown().await;
}
