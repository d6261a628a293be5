//! Conflict Resolution for Remote Saves
//!
//! A save fails with a conflict when the record changed on the server after
//! we read it. Resolution is "local wins field by field": the fresh server
//! copy is fetched, every field and asset present on the local record is
//! copied onto it, and the merged record is saved once more. Fields only the
//! server knows about survive.
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::conflict_resolver::ConflictResolver;
//!
//! let resolver = ConflictResolver::new(store, TransientRetryPolicy::default());
//! let saved = resolver.save_with_conflict_merge(record).await?;
//! ```

use bridge_traits::{RemoteRecord, RemoteRecordStore};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{Result, SyncError};
use crate::retry::{with_transient_retry, TransientRetryPolicy};

/// Overlay `local` onto `current`, keeping `current`'s id, type and change tag.
pub fn merge_onto(local: &RemoteRecord, mut current: RemoteRecord) -> RemoteRecord {
    for (key, value) in &local.fields {
        current.fields.insert(key.clone(), value.clone());
    }
    for (key, asset) in &local.assets {
        current.assets.insert(key.clone(), asset.clone());
    }
    current
}

/// Saves records, merging on concurrent modification.
pub struct ConflictResolver {
    store: Arc<dyn RemoteRecordStore>,
    retry: TransientRetryPolicy,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn RemoteRecordStore>, retry: TransientRetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Save `record`; on a conflict fetch the server copy, merge and save once
    /// more. A second conflict is returned to the caller.
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn save_with_conflict_merge(&self, record: RemoteRecord) -> Result<RemoteRecord> {
        let first = self.save(record.clone()).await;
        match first {
            Err(SyncError::RemoteConflict { .. }) => {}
            other => return other,
        }

        warn!("Remote record changed concurrently, merging local fields");
        let current = with_transient_retry(self.retry, "fetch", || async {
            self.store.fetch(&record.id).await.map_err(SyncError::from)
        })
        .await?;

        let merged = merge_onto(&record, current);
        let saved = self.save(merged).await?;
        debug!("Saved merged record");
        Ok(saved)
    }

    async fn save(&self, record: RemoteRecord) -> Result<RemoteRecord> {
        with_transient_retry(self.retry, "save", || {
            let record = record.clone();
            async move { self.store.save(record).await.map_err(SyncError::from) }
        })
        .await
    }
}
