//! Event recording for the RoleBinding controller.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use pkg_constants::state::{EVENTS_PREFIX, MAX_EVENTS_PER_NAMESPACE};
use pkg_state::client::{Mutation, StateStore};
use pkg_types::event::{Event, EventType, ObjectReference};

#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Publish an event about `regarding`.
    ///
    /// * `reason` - machine-readable reason, see [`reasons`]
    /// * `action` - what the controller was doing, see [`actions`]
    /// * `cluster` - member cluster the event concerns, if any
    async fn publish(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        action: &str,
        cluster: Option<&str>,
        note: Option<String>,
    );
}

/// Persists events under `/registry/events/<namespace>/<series-id>`.
///
/// The series id is derived from what the event is about, so a failure
/// repeated on every retry updates one record instead of adding a new one.
/// At most `max_per_namespace` series are kept per namespace; the least
/// recently updated one makes room for a new series.
pub struct StoreEventRecorder {
    store: StateStore,
    controller: String,
    max_per_namespace: usize,
}

impl StoreEventRecorder {
    pub fn new(store: StateStore, controller: &str) -> Self {
        Self {
            store,
            controller: controller.to_string(),
            max_per_namespace: MAX_EVENTS_PER_NAMESPACE,
        }
    }

    pub fn with_max_per_namespace(mut self, max: usize) -> Self {
        self.max_per_namespace = max.max(1);
        self
    }

    /// Drop the least recently updated series until a new one fits.
    async fn make_room(&self, namespace: &str) -> anyhow::Result<()> {
        let prefix = format!("{}{}/", EVENTS_PREFIX, namespace);
        let mut events: Vec<Event> = self.store.list_json(&prefix).await?;
        if events.len() < self.max_per_namespace {
            return Ok(());
        }
        events.sort_by_key(|e| e.timestamp);
        let excess = events.len() + 1 - self.max_per_namespace;
        for old in events.iter().take(excess) {
            self.store
                .delete(&format!("{}{}", prefix, old.id))
                .await?;
        }
        debug!("Dropped {} old event series in {}", excess, namespace);
        Ok(())
    }

    async fn record(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        action: &str,
        cluster: Option<&str>,
        note: Option<String>,
    ) -> anyhow::Result<()> {
        let id = series_id(regarding, event_type, reason, action, cluster);
        let key = format!("{}{}/{}", EVENTS_PREFIX, regarding.namespace, id);
        if self.store.get(&key).await?.is_none() {
            self.make_room(&regarding.namespace).await?;
        }

        let now = Utc::now();
        self.store
            .mutate_json::<Event, (), _>(&key, |existing| {
                let event = match existing {
                    Some(mut series) => {
                        series.count = series.count.saturating_add(1);
                        series.timestamp = now;
                        series.note = note.clone();
                        series
                    }
                    None => Event {
                        id: id.clone(),
                        involved_object: regarding.clone(),
                        event_type,
                        reason: reason.to_string(),
                        action: action.to_string(),
                        note: note.clone(),
                        cluster: cluster.map(str::to_string),
                        reporting_controller: self.controller.clone(),
                        count: 1,
                        first_timestamp: now,
                        timestamp: now,
                    },
                };
                (Mutation::Put(event), ())
            })
            .await
    }
}

/// Stable id of the series an event belongs to.
fn series_id(
    regarding: &ObjectReference,
    event_type: EventType,
    reason: &str,
    action: &str,
    cluster: Option<&str>,
) -> String {
    let name = format!(
        "{}/{}/{}/{:?}/{}/{}/{}",
        regarding.kind,
        regarding.namespace,
        regarding.name,
        event_type,
        reason,
        action,
        cluster.unwrap_or("")
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

#[async_trait]
impl EventRecorder for StoreEventRecorder {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        action: &str,
        cluster: Option<&str>,
        note: Option<String>,
    ) {
        if let Err(e) = self
            .record(regarding, event_type, reason, action, cluster, note)
            .await
        {
            warn!(reason, action, error = %e, "Failed to record event");
        }
    }
}

/// Discards everything.
pub struct NoopEventRecorder;

#[async_trait]
impl EventRecorder for NoopEventRecorder {
    async fn publish(
        &self,
        _regarding: &ObjectReference,
        _event_type: EventType,
        _reason: &str,
        _action: &str,
        _cluster: Option<&str>,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    // Blocking
    pub const ROLE_NOT_FOUND: &str = "RoleNotFound";
    pub const TEAM_NOT_FOUND: &str = "TeamNotFound";
    pub const INVALID_CLUSTER_SELECTOR: &str = "InvalidClusterSelector";

    // Lifecycle
    pub const FINALIZER_ADDED: &str = "FinalizerAdded";
    pub const NO_CLUSTERS_SELECTED: &str = "NoClustersSelected";
    pub const TEARDOWN_COMPLETE: &str = "TeardownComplete";
    pub const TEARDOWN_INCOMPLETE: &str = "TeardownIncomplete";

    // Successful writes
    pub const CREATED_CLUSTER_ROLE: &str = "CreatedClusterRole";
    pub const UPDATED_CLUSTER_ROLE: &str = "UpdatedClusterRole";
    pub const CREATED_BINDING: &str = "CreatedBinding";
    pub const UPDATED_BINDING: &str = "UpdatedBinding";
    pub const PRUNED_BINDING: &str = "PrunedBinding";
    pub const DELETED_BINDING: &str = "DeletedBinding";

    // Per-cluster failures
    pub const FAILED_CLUSTER_CONNECT: &str = "FailedClusterConnect";
    pub const FAILED_RECONCILE_CLUSTER_ROLE: &str = "FailedReconcileClusterRole";
    pub const FAILED_RECONCILE_BINDING: &str = "FailedReconcileBinding";
    pub const FAILED_PRUNE_BINDING: &str = "FailedPruneBinding";
    pub const FAILED_DELETE_BINDING: &str = "FailedDeleteBinding";
}

/// Well-known action strings.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const TEARDOWN: &str = "Teardown";
}
