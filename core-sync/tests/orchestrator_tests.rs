//! Full-pass orchestration: per-category timeouts, partial failure
//! reporting, single-flight and the "is a sync needed" check.

mod common;

use async_trait::async_trait;
use bridge_traits::time::ManualClock;
use bridge_traits::RemoteRecord;
use common::{start_time, MemoryFs, MemoryStore};
use core_runtime::events::{CoreEvent, EntityKind, EventBus, SyncEvent};
use core_sync::orchestrator::PARTIAL_FAILURE;
use core_sync::schema::record_type;
use core_sync::{
    ChangeOutcome, DispatchOutcome, EntitySyncer, InitialSyncer, ProgressCategory,
    ProgressTracker, RetryDispatch, RetryQueue, SoftDeleteOutcome, SyncAnalytics, SyncCategory,
    SyncConfig, SyncCounts, SyncError, UploadEntity,
};
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

mock! {
    Syncer {}

    #[async_trait]
    impl EntitySyncer for Syncer {
        fn kind(&self) -> EntityKind;
        async fn sync_all(&self, progress: &ProgressTracker) -> core_sync::Result<SyncCounts>;
        async fn handle_remote_change(&self, record_id: &str) -> core_sync::Result<ChangeOutcome>;
        async fn mark_deleted(&self, key: &str) -> core_sync::Result<SoftDeleteOutcome>;
        async fn purge(&self, key: &str) -> core_sync::Result<bool>;
    }
}

mock! {
    Analytics {}

    impl SyncAnalytics for Analytics {
        fn start_sync(&self);
        fn record_success(&self, items_synced: usize, duration: Duration);
        fn record_failure(&self, reason: &str, items_synced: usize, duration: Duration);
    }
}

mock! {
    Dispatch {}

    #[async_trait]
    impl RetryDispatch for Dispatch {
        async fn retry_upload(&self, entity: &UploadEntity) -> core_sync::Result<DispatchOutcome>;
    }
}

/// Reports some progress, then never finishes.
struct HangingSyncer;

#[async_trait]
impl EntitySyncer for HangingSyncer {
    fn kind(&self) -> EntityKind {
        EntityKind::Rom
    }

    async fn sync_all(&self, progress: &ProgressTracker) -> core_sync::Result<SyncCounts> {
        progress.add_total(ProgressCategory::Roms, 5);
        progress.advance(ProgressCategory::Roms, 2);
        std::future::pending().await
    }

    async fn handle_remote_change(&self, _record_id: &str) -> core_sync::Result<ChangeOutcome> {
        Ok(ChangeOutcome::Unchanged)
    }

    async fn mark_deleted(&self, _key: &str) -> core_sync::Result<SoftDeleteOutcome> {
        Ok(SoftDeleteOutcome::NotInCloud)
    }

    async fn purge(&self, _key: &str) -> core_sync::Result<bool> {
        Ok(false)
    }
}

/// Finishes only when the test opens the gate.
struct GatedSyncer {
    gate: Notify,
}

#[async_trait]
impl EntitySyncer for GatedSyncer {
    fn kind(&self) -> EntityKind {
        EntityKind::Rom
    }

    async fn sync_all(&self, _progress: &ProgressTracker) -> core_sync::Result<SyncCounts> {
        self.gate.notified().await;
        Ok(SyncCounts {
            synced: 1,
            ..Default::default()
        })
    }

    async fn handle_remote_change(&self, _record_id: &str) -> core_sync::Result<ChangeOutcome> {
        Ok(ChangeOutcome::Unchanged)
    }

    async fn mark_deleted(&self, _key: &str) -> core_sync::Result<SoftDeleteOutcome> {
        Ok(SoftDeleteOutcome::NotInCloud)
    }

    async fn purge(&self, _key: &str) -> core_sync::Result<bool> {
        Ok(false)
    }
}

fn succeeding(kind: EntityKind, synced: usize) -> Arc<dyn EntitySyncer> {
    let mut syncer = MockSyncer::new();
    syncer.expect_kind().return_const(kind);
    syncer.expect_sync_all().times(1).returning(move |_| {
        Ok(SyncCounts {
            synced,
            ..Default::default()
        })
    });
    Arc::new(syncer)
}

fn failing(kind: EntityKind, message: &'static str) -> Arc<dyn EntitySyncer> {
    let mut syncer = MockSyncer::new();
    syncer.expect_kind().return_const(kind);
    syncer
        .expect_sync_all()
        .times(1)
        .returning(move |_| Err(SyncError::Remote(message.to_string())));
    Arc::new(syncer)
}

fn category(
    name: &'static str,
    timeout_secs: u64,
    syncer: Arc<dyn EntitySyncer>,
    progress: Vec<ProgressCategory>,
) -> SyncCategory {
    SyncCategory {
        name,
        timeout: Duration::from_secs(timeout_secs),
        syncer,
        progress,
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    retry_queue: Arc<RetryQueue>,
    progress: Arc<ProgressTracker>,
    event_bus: Arc<EventBus>,
    events: broadcast::Receiver<CoreEvent>,
}

impl Fixture {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let event_bus = Arc::new(EventBus::new(64));
        Self {
            store: Arc::new(MemoryStore::new(Arc::new(MemoryFs::default()), clock.clone())),
            retry_queue: Arc::new(RetryQueue::new(clock)),
            progress: Arc::new(ProgressTracker::new()),
            events: event_bus.subscribe(),
            event_bus,
        }
    }

    fn syncer(
        &self,
        categories: Vec<SyncCategory>,
        dispatch: MockDispatch,
        analytics: MockAnalytics,
    ) -> InitialSyncer {
        InitialSyncer::new(
            categories,
            self.store.clone(),
            Arc::new(SyncConfig::default()),
            Arc::clone(&self.progress),
            Arc::clone(&self.retry_queue),
            Arc::new(dispatch),
            Arc::new(analytics),
            Arc::clone(&self.event_bus),
        )
    }

    fn sync_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let CoreEvent::Sync(event) = event {
                events.push(event);
            }
        }
        events
    }
}

fn quiet_analytics() -> MockAnalytics {
    let mut analytics = MockAnalytics::new();
    analytics.expect_start_sync().return_const(());
    analytics.expect_record_success().return_const(());
    analytics.expect_record_failure().return_const(());
    analytics
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_category_does_not_stop_the_pass() {
    let mut fixture = Fixture::new();

    let mut analytics = MockAnalytics::new();
    analytics.expect_start_sync().times(1).return_const(());
    analytics.expect_record_success().times(0);
    analytics
        .expect_record_failure()
        .withf(|reason, items, _| reason.to_string() == PARTIAL_FAILURE && *items == 7)
        .times(1)
        .return_const(());

    let orchestrator = fixture.syncer(
        vec![
            category("roms", 300, Arc::new(HangingSyncer), vec![ProgressCategory::Roms]),
            category(
                "save_states",
                300,
                succeeding(EntityKind::SaveState, 3),
                vec![ProgressCategory::SaveStates],
            ),
            category("bios", 180, failing(EntityKind::Bios, "quota exceeded"), vec![]),
            category("files", 300, succeeding(EntityKind::File, 4), vec![]),
        ],
        MockDispatch::new(),
        analytics,
    );

    let report = orchestrator.perform_initial_sync(true).await;

    assert!(!report.skipped);
    assert!(!report.overall_success);
    assert_eq!(report.total_synced, 7);
    assert_eq!(report.categories.len(), 4);

    let roms = report.category("roms").unwrap();
    assert!(roms.timed_out);
    assert_eq!(
        roms.error.as_deref(),
        Some("roms sync timed out after 300 seconds")
    );
    let bios = report.category("bios").unwrap();
    assert!(!bios.timed_out);
    assert_eq!(bios.error.as_deref(), Some("Remote store error: quota exceeded"));
    assert!(report.category("save_states").unwrap().succeeded());
    assert_eq!(
        report.category("files").unwrap().counts.map(|c| c.synced),
        Some(4)
    );

    // Buckets of the timed-out category are closed
    let progress = fixture.progress.snapshot();
    assert_eq!(progress.roms.total, 5);
    assert_eq!(progress.roms.completed, 5);
    assert!(progress.is_complete);

    let events = fixture.sync_events();
    assert_eq!(events.first(), Some(&SyncEvent::Started { force: true }));
    assert!(events.contains(&SyncEvent::CategoryFailed {
        category: "roms".to_string(),
        message: "roms sync timed out after 300 seconds".to_string(),
        timed_out: true,
    }));
    assert!(events.contains(&SyncEvent::CategoryFailed {
        category: "bios".to_string(),
        message: "Remote store error: quota exceeded".to_string(),
        timed_out: false,
    }));
    assert!(events.contains(&SyncEvent::CategoryCompleted {
        category: "save_states".to_string(),
        count: 3,
    }));
    assert_eq!(
        events.last(),
        Some(&SyncEvent::Completed {
            total_synced: 7,
            overall_success: false,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_successful_pass_reports_success() {
    let fixture = Fixture::new();

    let mut analytics = MockAnalytics::new();
    analytics.expect_start_sync().times(1).return_const(());
    analytics
        .expect_record_success()
        .withf(|items, _| *items == 5)
        .times(1)
        .return_const(());
    analytics.expect_record_failure().times(0);

    let orchestrator = fixture.syncer(
        vec![
            category("roms", 300, succeeding(EntityKind::Rom, 2), vec![]),
            category("bios", 180, succeeding(EntityKind::Bios, 3), vec![]),
        ],
        MockDispatch::new(),
        analytics,
    );

    let report = orchestrator.perform_initial_sync(true).await;
    assert!(report.overall_success);
    assert_eq!(report.total_synced, 5);
    assert!(!orchestrator.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_retry_queue_is_drained_after_the_categories() {
    let fixture = Fixture::new();
    let failed = UploadEntity::Rom {
        md5: common::GAME_MD5.to_string(),
    };
    fixture.retry_queue.record_failure(failed.clone(), "offline").await;

    let mut dispatch = MockDispatch::new();
    dispatch
        .expect_retry_upload()
        .withf(move |entity| *entity == failed)
        .times(1)
        .returning(|_| Ok(DispatchOutcome::Succeeded));

    let orchestrator = fixture.syncer(
        vec![category("roms", 300, succeeding(EntityKind::Rom, 1), vec![])],
        dispatch,
        quiet_analytics(),
    );

    let report = orchestrator.perform_initial_sync(true).await;
    assert_eq!(report.retries.succeeded, 1);
    assert!(fixture.retry_queue.is_empty().await);
}

#[tokio::test]
async fn test_concurrent_pass_is_skipped() {
    let mut fixture = Fixture::new();
    let gated = Arc::new(GatedSyncer {
        gate: Notify::new(),
    });
    let orchestrator = Arc::new(fixture.syncer(
        vec![category("roms", 300, gated.clone(), vec![])],
        MockDispatch::new(),
        quiet_analytics(),
    ));

    let first = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.perform_initial_sync(true).await }
    });
    while !orchestrator.is_running() {
        tokio::task::yield_now().await;
    }

    let second = orchestrator.perform_initial_sync(true).await;
    assert!(second.skipped);
    assert!(second.categories.is_empty());

    gated.gate.notify_one();
    let first = first.await.unwrap();
    assert!(!first.skipped);
    assert_eq!(first.total_synced, 1);
    assert!(!orchestrator.is_running());

    assert!(fixture.sync_events().contains(&SyncEvent::Skipped {
        reason: "already in progress".to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_pass_is_skipped_when_remote_has_records() {
    let mut fixture = Fixture::new();
    fixture
        .store
        .seed(RemoteRecord::new(record_type::BIOS, "bios_ABC"));

    let mut syncer = MockSyncer::new();
    syncer.expect_sync_all().times(0);
    let orchestrator = fixture.syncer(
        vec![category("roms", 300, Arc::new(syncer), vec![])],
        MockDispatch::new(),
        MockAnalytics::new(),
    );

    assert!(!orchestrator.is_initial_sync_needed().await);
    let report = orchestrator.perform_initial_sync(false).await;
    assert!(report.skipped);
    assert_eq!(
        fixture.sync_events(),
        vec![SyncEvent::Skipped {
            reason: "not needed".to_string(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_forced_pass_runs_even_with_records() {
    let fixture = Fixture::new();
    fixture
        .store
        .seed(RemoteRecord::new(record_type::ROM, "rom_ABC"));

    let orchestrator = fixture.syncer(
        vec![category("roms", 300, succeeding(EntityKind::Rom, 1), vec![])],
        MockDispatch::new(),
        quiet_analytics(),
    );

    let report = orchestrator.perform_initial_sync(true).await;
    assert!(!report.skipped);
    assert_eq!(report.total_synced, 1);
}

#[tokio::test(start_paused = true)]
async fn test_needed_check_tolerates_store_errors() {
    let fixture = Fixture::new();
    let orchestrator = fixture.syncer(vec![], MockDispatch::new(), MockAnalytics::new());

    // Empty store: needed
    assert!(orchestrator.is_initial_sync_needed().await);

    // ROM lookup fails, the save-state lookup still finds a record
    fixture
        .store
        .seed(RemoteRecord::new(record_type::SAVE_STATE, "savestate_1"));
    fixture.store.fail_transiently(1);
    assert!(!orchestrator.is_initial_sync_needed().await);

    // Every lookup fails: nothing conclusive, so needed
    fixture.store.fail_transiently(4);
    assert!(orchestrator.is_initial_sync_needed().await);
}
