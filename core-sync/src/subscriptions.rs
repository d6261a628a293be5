//! # Change Routing
//!
//! Subscribes to remote change notifications for each record type and
//! forwards every change to the syncer that owns the type. One task per
//! subscription; all of them stop when the routing token is cancelled.

use bridge_traits::{ChangeTypes, RecordChange, RemoteRecordStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::syncer::{ChangeOutcome, EntitySyncer};

/// Record type and the syncer that handles its changes
#[derive(Clone)]
pub struct Route {
    pub record_type: &'static str,
    pub syncer: Arc<dyn EntitySyncer>,
}

/// Running subscriptions
pub struct RoutingHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RoutingHandle {
    pub fn subscriptions(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every subscription task and wait for them to finish.
    pub async fn stop(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Change routing task ended abnormally");
            }
        }
    }
}

/// Forwards remote change notifications to entity syncers
pub struct ChangeRouter {
    store: Arc<dyn RemoteRecordStore>,
    routes: Vec<Route>,
}

impl ChangeRouter {
    pub fn new(store: Arc<dyn RemoteRecordStore>, routes: Vec<Route>) -> Self {
        Self { store, routes }
    }

    /// Subscribe to every routed type and start forwarding.
    ///
    /// Fails if any subscription cannot be created; subscriptions already
    /// started are stopped first.
    pub async fn start(&self, token: CancellationToken) -> Result<RoutingHandle> {
        let mut handle = RoutingHandle {
            token,
            tasks: Vec::with_capacity(self.routes.len()),
        };

        for route in &self.routes {
            let subscription = match self
                .store
                .subscribe(route.record_type, ChangeTypes::all())
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    handle.stop().await;
                    return Err(e.into());
                }
            };
            info!(
                record_type = route.record_type,
                subscription = %subscription.subscription_id,
                "Subscribed to remote changes"
            );

            let task = tokio::spawn(forward(
                route.clone(),
                subscription.changes,
                handle.token.child_token(),
            ));
            handle.tasks.push(task);
        }
        Ok(handle)
    }
}

async fn forward(
    route: Route,
    mut changes: mpsc::UnboundedReceiver<RecordChange>,
    token: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => {
                    debug!(record_type = route.record_type, "Subscription closed");
                    break;
                }
            },
        };

        debug!(record_id = %change.record_id, reason = ?change.reason, "Remote change received");
        match route.syncer.handle_remote_change(&change.record_id).await {
            Ok(ChangeOutcome::Unchanged) | Ok(ChangeOutcome::AlreadyAbsent) => {}
            Ok(outcome) => debug!(record_id = %change.record_id, ?outcome, "Applied remote change"),
            Err(e) => warn!(record_id = %change.record_id, error = %e, "Failed to apply remote change"),
        }
    }
}
