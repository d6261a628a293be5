//! # Syncer Base
//!
//! Shared machinery for the per-entity syncers:
//!
//! - paginated remote queries, optionally restricted to metadata fields
//! - remote calls wrapped in transient retry and conflict merge
//! - adaptive batching with bounded fan-out per batch
//! - local match lookup (record id, then content hash, then file name)
//! - library change notifications
//!
//! The capabilities every syncer exposes are the [`EntitySyncer`] and
//! [`MetadataOnlySyncable`] traits.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{RecordQuery, RemoteRecord, RemoteRecordStore};
use bridge_traits::{storage::FileSystemAccess, time::Clock};
use core_library::UpsertOutcome;
use core_runtime::config::PlatformProfile;
use core_runtime::events::{CoreEvent, EntityKind, EventBus, LibraryEvent};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::conflict_resolver::ConflictResolver;
use crate::download_queue::DownloadQueue;
use crate::error::{Result, SyncError};
use crate::paths::LibraryPaths;
use crate::progress::ProgressTracker;
use crate::retry::{with_transient_retry, RetryQueue, TransientRetryPolicy};

// ============================================================================
// Capabilities
// ============================================================================

/// Counts from a bulk pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    /// Entities in sync with the remote store after the pass
    pub synced: usize,
    /// Entities intentionally left alone (tombstones, missing payloads, space)
    pub skipped: usize,
    pub failed: usize,
}

impl SyncCounts {
    pub fn merge(&mut self, other: SyncCounts) {
        self.synced += other.synced;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Per-item result inside a bulk pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemResult {
    Synced,
    Skipped,
}

impl<R> BatchResults<R> {
    /// Fold item results into counts, logging at most `max_logged` failures.
    pub fn tally(&self, label: &str, max_logged: usize) -> SyncCounts
    where
        R: Copy + Into<ItemResult>,
    {
        let mut counts = SyncCounts {
            failed: self.failures.len(),
            ..Default::default()
        };
        for output in &self.outputs {
            match (*output).into() {
                ItemResult::Synced => counts.synced += 1,
                ItemResult::Skipped => counts.skipped += 1,
            }
        }
        for error in self.failures.iter().take(max_logged) {
            warn!(category = label, error = %error, "Item failed to sync");
        }
        if self.failures.len() > max_logged {
            warn!(
                category = label,
                more = self.failures.len() - max_logged,
                "Additional items failed to sync"
            );
        }
        counts
    }
}

/// What a single remote change did locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Delete for an entity that was never here
    AlreadyAbsent,
    Skipped,
}

impl From<UpsertOutcome> for ChangeOutcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => ChangeOutcome::Created,
            UpsertOutcome::Updated => ChangeOutcome::Updated,
            UpsertOutcome::Unchanged => ChangeOutcome::Unchanged,
        }
    }
}

/// Result of a soft delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftDeleteOutcome {
    Marked,
    AlreadyDeleted,
    /// No remote record to tombstone
    NotInCloud,
}

/// One entity category's participation in sync.
#[async_trait]
pub trait EntitySyncer: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Pull remote changes, then push local entities with no remote counterpart
    async fn sync_all(&self, progress: &ProgressTracker) -> Result<SyncCounts>;

    /// Apply an out-of-band change notification for `record_id`
    async fn handle_remote_change(&self, record_id: &str) -> Result<ChangeOutcome>;

    /// Set the remote tombstone flag so other devices delete their copy
    async fn mark_deleted(&self, key: &str) -> Result<SoftDeleteOutcome>;

    /// Remove the remote record outright. `Ok(false)` if it did not exist.
    async fn purge(&self, key: &str) -> Result<bool>;
}

/// Fast remote-to-local metadata reconciliation without payload transfer.
#[async_trait]
pub trait MetadataOnlySyncable: Send + Sync {
    async fn sync_metadata_only(&self, progress: &ProgressTracker) -> Result<SyncCounts>;
}

// ============================================================================
// Local matching
// ============================================================================

/// Local lookups used to match a remote record to an existing entity.
#[async_trait]
pub trait LocalLookup: Send + Sync {
    type Entity: Send;

    async fn by_record_id(&self, record_id: &str) -> Result<Option<Self::Entity>>;
    async fn by_content_hash(&self, hash: &str) -> Result<Option<Self::Entity>>;
    async fn by_file_name(&self, file_name: &str) -> Result<Option<Self::Entity>>;
}

/// Which key matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    RecordId,
    ContentHash,
    FileName,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchKeys<'a> {
    pub record_id: &'a str,
    pub content_hash: Option<&'a str>,
    pub file_name: Option<&'a str>,
}

/// Record id first, then content hash, then file name.
pub async fn find_local_match<L>(
    lookup: &L,
    keys: MatchKeys<'_>,
) -> Result<Option<(L::Entity, MatchedBy)>>
where
    L: LocalLookup + ?Sized,
{
    if let Some(entity) = lookup.by_record_id(keys.record_id).await? {
        return Ok(Some((entity, MatchedBy::RecordId)));
    }
    if let Some(hash) = keys.content_hash {
        if let Some(entity) = lookup.by_content_hash(hash).await? {
            return Ok(Some((entity, MatchedBy::ContentHash)));
        }
    }
    if let Some(file_name) = keys.file_name {
        if let Some(entity) = lookup.by_file_name(file_name).await? {
            return Ok(Some((entity, MatchedBy::FileName)));
        }
    }
    Ok(None)
}

/// Whether a remote modification time is newer than our last sync.
///
/// A record with no timestamp only wins against a never-synced entity.
pub fn remote_is_newer(remote_modified_ms: Option<i64>, last_synced_ms: Option<i64>) -> bool {
    match (remote_modified_ms, last_synced_ms) {
        (Some(remote), Some(local)) => remote > local,
        (Some(_), None) => true,
        (None, local) => local.is_none(),
    }
}

/// Assign `value` to `slot`, reporting whether it changed.
pub fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

// ============================================================================
// Shared context
// ============================================================================

/// Services shared by every syncer.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn RemoteRecordStore>,
    pub fs: Arc<dyn FileSystemAccess>,
    pub clock: Arc<dyn Clock>,
    pub event_bus: Arc<EventBus>,
    pub config: Arc<SyncConfig>,
    pub paths: LibraryPaths,
    pub platform: PlatformProfile,
    pub retry_queue: Arc<RetryQueue>,
    pub downloads: Arc<DownloadQueue>,
}

/// Collected results of [`SyncerBase::process_in_batches`]
#[derive(Debug)]
pub struct BatchResults<R> {
    pub outputs: Vec<R>,
    pub failures: Vec<SyncError>,
}

impl<R> Default for BatchResults<R> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Common behaviour for entity syncers
pub struct SyncerBase {
    ctx: SyncContext,
    resolver: ConflictResolver,
    retry: TransientRetryPolicy,
}

impl SyncerBase {
    pub fn new(ctx: SyncContext) -> Self {
        let retry = TransientRetryPolicy {
            max_attempts: ctx.config.transient_retry_attempts.max(1),
            base_delay: ctx.config.transient_retry_base_delay,
        };
        let resolver = ConflictResolver::new(Arc::clone(&ctx.store), retry);
        Self {
            ctx,
            resolver,
            retry,
        }
    }

    pub fn ctx(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub fn fs(&self) -> &dyn FileSystemAccess {
        self.ctx.fs.as_ref()
    }

    pub fn paths(&self) -> &LibraryPaths {
        &self.ctx.paths
    }

    pub fn now_millis(&self) -> i64 {
        self.ctx.clock.unix_timestamp_millis()
    }

    /// Run a remote call with transient retry and error mapping.
    pub async fn remote<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        with_transient_retry(self.retry, operation, || {
            let fut = call();
            async move { fut.await.map_err(SyncError::from) }
        })
        .await
    }

    /// Every record matching `query`, following cursors to the end.
    pub async fn fetch_all(&self, query: &RecordQuery) -> Result<Vec<RemoteRecord>> {
        let limit = self.config().page_size;
        let store = &self.ctx.store;

        let mut page = self.remote("query", || store.query(query, limit)).await?;
        let mut records = std::mem::take(&mut page.records);

        while let Some(cursor) = page.cursor.take() {
            page = self
                .remote("continue_query", || store.continue_query(&cursor, limit))
                .await?;
            records.append(&mut page.records);
        }

        debug!(record_type = %query.record_type, count = records.len(), "Fetched remote records");
        Ok(records)
    }

    /// Every record of `record_type`, restricted to `keys` (never the payload).
    pub async fn fetch_all_metadata(
        &self,
        record_type: &str,
        keys: &[&str],
    ) -> Result<Vec<RemoteRecord>> {
        let query = RecordQuery::all(record_type).with_desired_keys(crate::schema::metadata_keys(keys));
        self.fetch_all(&query).await
    }

    /// Number of records of `record_type`, paging a key-less projection.
    pub async fn count_remote_records(&self, record_type: &str) -> Result<usize> {
        let query = RecordQuery::all(record_type).with_desired_keys(Vec::new());
        let limit = self.config().page_size;
        let store = &self.ctx.store;

        let mut page = self.remote("query", || store.query(&query, limit)).await?;
        let mut count = page.records.len();
        while let Some(cursor) = page.cursor.take() {
            page = self
                .remote("continue_query", || store.continue_query(&cursor, limit))
                .await?;
            count += page.records.len();
        }
        Ok(count)
    }

    /// Fetch a record; `None` when it does not exist.
    pub async fn fetch_optional(&self, record_id: &str) -> Result<Option<RemoteRecord>> {
        let store = &self.ctx.store;
        match self.remote("fetch", || store.fetch(record_id)).await {
            Ok(record) => Ok(Some(record)),
            Err(SyncError::RemoteNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Save with conflict merge.
    pub async fn save(&self, record: RemoteRecord) -> Result<RemoteRecord> {
        self.resolver.save_with_conflict_merge(record).await
    }

    /// Hard delete. `Ok(false)` when the record did not exist.
    pub async fn delete_record(&self, record_id: &str) -> Result<bool> {
        let store = &self.ctx.store;
        match self.remote("delete", || store.delete(record_id)).await {
            Ok(()) => Ok(true),
            Err(SyncError::RemoteNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Set the tombstone flag on `record_id`.
    pub async fn mark_deleted(&self, record_id: &str) -> Result<SoftDeleteOutcome> {
        let Some(mut record) = self.fetch_optional(record_id).await? else {
            return Ok(SoftDeleteOutcome::NotInCloud);
        };
        if crate::schema::is_tombstoned(&record) {
            return Ok(SoftDeleteOutcome::AlreadyDeleted);
        }
        record.set(crate::schema::IS_DELETED, true);
        self.save(record).await?;
        Ok(SoftDeleteOutcome::Marked)
    }

    /// Group `items` by `partition`, then run `handler` over adaptive-size
    /// batches concurrently, pausing between batches.
    pub async fn process_in_batches<T, K, R, P, F, Fut>(
        &self,
        items: Vec<T>,
        partition: P,
        handler: F,
    ) -> BatchResults<R>
    where
        K: Ord,
        P: Fn(&T) -> K,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let batch_size = self.config().adaptive_batch_size(items.len());
        let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
        for item in items {
            groups.entry(partition(&item)).or_default().push(item);
        }

        let mut results = BatchResults::default();
        let mut first_batch = true;
        for (_, group) in groups {
            let mut remaining = group.into_iter().peekable();
            while remaining.peek().is_some() {
                if !first_batch {
                    tokio::time::sleep(self.config().batch_pause).await;
                }
                first_batch = false;

                let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
                for outcome in join_all(batch.into_iter().map(&handler)).await {
                    match outcome {
                        Ok(output) => results.outputs.push(output),
                        Err(e) => results.failures.push(e),
                    }
                }
            }
        }
        results
    }

    /// Broadcast a local change caused by reconciliation.
    pub fn notify(&self, kind: EntityKind, key: &str, outcome: ChangeOutcome) {
        let key = key.to_string();
        let event = match outcome {
            ChangeOutcome::Created => LibraryEvent::EntityCreated { kind, key },
            ChangeOutcome::Updated => LibraryEvent::EntityUpdated { kind, key },
            ChangeOutcome::Deleted => LibraryEvent::EntityDeleted { kind, key },
            _ => return,
        };
        self.ctx.event_bus.emit(CoreEvent::Library(event)).ok();
    }

    /// Remove local payload files, logging what cannot be removed.
    pub async fn remove_local_files(&self, paths: &[&Path]) {
        for path in paths {
            match self.fs().exists(path).await {
                Ok(true) => {
                    if let Err(e) = self.fs().delete_file(path).await {
                        warn!(file = %crate::log_name(path), error = %e, "Failed to remove local file");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(file = %crate::log_name(path), error = %e, "Failed to check local file"),
            }
        }
    }

    /// Size of a local file, or `None` when missing
    pub async fn local_size(&self, path: &Path) -> Result<Option<u64>> {
        if !self.fs().exists(path).await.map_err(SyncError::file_system)? {
            return Ok(None);
        }
        let metadata = self.fs().metadata(path).await.map_err(SyncError::file_system)?;
        Ok(Some(metadata.size))
    }
}
