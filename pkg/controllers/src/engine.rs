//! Per-RoleBinding convergence and teardown across the selected member
//! clusters.
//!
//! One call to [`RoleBindingEngine::reconcile`] is one run for one
//! RoleBinding. Clusters are processed one after another and a failure on
//! one of them never stops the others; each run returns a [`RunReport`]
//! that records what happened per cluster.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use pkg_constants::controller::ROLEBINDING_FINALIZER;
use pkg_constants::state::ROLEBINDINGS_PREFIX;
use pkg_metrics::MetricsRegistry;
use pkg_state::client::{Mutation, StateStore};
use pkg_types::cluster::Cluster;
use pkg_types::event::{EventType, ObjectReference};
use pkg_types::rbac::RoleBinding;
use pkg_types::remote::ClusterRole;

use crate::converge::{
    Outcome, Removal, create_or_patch, delete_if_present, delete_owned, stale_bindings,
};
use crate::events::{EventRecorder, actions, reasons};
use crate::registry::ConnectionRegistry;
use crate::remote::{OWNER_LABEL, ObjectKey, RemoteClient, RemoteError, RemoteObject};
use crate::resolver::{ResolveError, resolve_refs};
use crate::selector::{SelectError, select_clusters};
use crate::synthesize::{self, DesiredBindings, binding_keys, owner_value};

pub const RECONCILE_TOTAL: &str = "rbacfleet_reconcile_total";
pub const CLUSTER_SYNC_TOTAL: &str = "rbacfleet_cluster_sync_total";
pub const TEARDOWN_TOTAL: &str = "rbacfleet_teardown_total";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store: {0}")]
    Store(#[from] anyhow::Error),
}

/// Step of a per-cluster run that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Connect,
    ClusterRole,
    Binding,
    Prune,
    DeleteBinding,
}

impl FailureStage {
    fn reason(self) -> &'static str {
        match self {
            FailureStage::Connect => reasons::FAILED_CLUSTER_CONNECT,
            FailureStage::ClusterRole => reasons::FAILED_RECONCILE_CLUSTER_ROLE,
            FailureStage::Binding => reasons::FAILED_RECONCILE_BINDING,
            FailureStage::Prune => reasons::FAILED_PRUNE_BINDING,
            FailureStage::DeleteBinding => reasons::FAILED_DELETE_BINDING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterFailure {
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterReport {
    pub cluster: String,
    pub failure: Option<ClusterFailure>,
}

impl ClusterReport {
    fn ok(cluster: &Cluster) -> Self {
        Self {
            cluster: cluster.name.clone(),
            failure: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The RoleBinding does not exist (anymore).
    Absent,
    /// A reference or the selector could not be resolved. Nothing was
    /// written; the next trigger retries.
    Blocked(&'static str),
    /// Convergence ran against every selected cluster. Per-cluster failures
    /// are listed in the report.
    Converged,
    /// Every cluster confirmed teardown; the RoleBinding has been deleted.
    Finalized,
    /// Teardown failed somewhere; the finalizer is still in place.
    TeardownPending,
}

impl RunOutcome {
    fn label(self, degraded: bool) -> &'static str {
        match self {
            RunOutcome::Absent => "absent",
            RunOutcome::Blocked(_) => "blocked",
            RunOutcome::Converged if degraded => "degraded",
            RunOutcome::Converged => "converged",
            RunOutcome::Finalized => "finalized",
            RunOutcome::TeardownPending => "teardown_pending",
        }
    }
}

/// Result of one run for one RoleBinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub clusters: Vec<ClusterReport>,
}

impl RunReport {
    fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            clusters: Vec::new(),
        }
    }

    /// Names of the clusters that failed, in processing order.
    pub fn failed_clusters(&self) -> Vec<&str> {
        self.clusters
            .iter()
            .filter(|c| !c.is_ok())
            .map(|c| c.cluster.as_str())
            .collect()
    }

    /// True when a timed retry may make progress. Blocked runs wait for the
    /// next trigger instead.
    pub fn needs_retry(&self) -> bool {
        self.outcome == RunOutcome::TeardownPending || self.clusters.iter().any(|c| !c.is_ok())
    }
}

fn binding_key(namespace: &str, name: &str) -> String {
    format!("{}{}/{}", ROLEBINDINGS_PREFIX, namespace, name)
}

fn regarding(rb: &RoleBinding) -> ObjectReference {
    ObjectReference {
        kind: "RoleBinding".to_string(),
        namespace: rb.namespace.clone(),
        name: rb.name.clone(),
    }
}

/// Drives RoleBindings towards their desired remote state.
pub struct RoleBindingEngine {
    store: StateStore,
    registry: Arc<dyn ConnectionRegistry>,
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<MetricsRegistry>,
    remote_timeout: Duration,
}

impl RoleBindingEngine {
    pub fn new(
        store: StateStore,
        registry: Arc<dyn ConnectionRegistry>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<MetricsRegistry>,
        remote_timeout: Duration,
    ) -> Self {
        metrics.register_counter(RECONCILE_TOTAL, "RoleBinding reconcile runs by result");
        metrics.register_counter(
            CLUSTER_SYNC_TOTAL,
            "Per-cluster convergence attempts by cluster and result",
        );
        metrics.register_counter(TEARDOWN_TOTAL, "RoleBinding teardown runs by result");
        Self {
            store,
            registry,
            recorder,
            metrics,
            remote_timeout,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// One run for the RoleBinding `<namespace>/<name>`: convergence while it
    /// is live, teardown once deletion was requested.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<RunReport, ReconcileError> {
        let Some(rb) = self
            .store
            .get_json::<RoleBinding>(&binding_key(namespace, name))
            .await?
        else {
            debug!("RoleBinding {}/{} is gone", namespace, name);
            return Ok(RunReport::new(RunOutcome::Absent));
        };

        debug!(
            "RoleBinding {}/{} is {}",
            namespace,
            name,
            rb.phase(ROLEBINDING_FINALIZER)
        );
        let report = if rb.is_deleting() {
            self.teardown(&rb).await?
        } else {
            self.converge(&rb).await?
        };

        let degraded = report.clusters.iter().any(|c| !c.is_ok());
        self.metrics.counter_inc(
            RECONCILE_TOTAL,
            &[("result", report.outcome.label(degraded))],
        );
        Ok(report)
    }

    async fn converge(&self, rb: &RoleBinding) -> Result<RunReport, ReconcileError> {
        let (role, team) = match resolve_refs(&self.store, rb).await {
            Ok(refs) => refs,
            Err(ResolveError::Store(e)) => return Err(e.into()),
            Err(e) => {
                let reason = match e {
                    ResolveError::RoleNotFound { .. } => reasons::ROLE_NOT_FOUND,
                    _ => reasons::TEAM_NOT_FOUND,
                };
                warn!("RoleBinding {}/{} blocked: {}", rb.namespace, rb.name, e);
                self.emit(rb, EventType::Warning, reason, actions::RECONCILE, None, Some(e.to_string()))
                    .await;
                return Ok(RunReport::new(RunOutcome::Blocked(reason)));
            }
        };

        let clusters = match self.select(rb, actions::RECONCILE).await? {
            Some(clusters) => clusters,
            None => {
                return Ok(RunReport::new(RunOutcome::Blocked(
                    reasons::INVALID_CLUSTER_SELECTOR,
                )));
            }
        };

        // The finalizer is durable before anything exists remotely.
        if !rb.has_finalizer(ROLEBINDING_FINALIZER) && !self.attach_finalizer(rb).await? {
            return Ok(RunReport::new(RunOutcome::Absent));
        }

        let mut report = RunReport::new(RunOutcome::Converged);
        if clusters.is_empty() {
            info!("RoleBinding {}/{} selects no clusters", rb.namespace, rb.name);
            self.emit(
                rb,
                EventType::Normal,
                reasons::NO_CLUSTERS_SELECTED,
                actions::RECONCILE,
                None,
                None,
            )
            .await;
            return Ok(report);
        }

        let cluster_role = synthesize::cluster_role(&role);
        let desired = synthesize::bindings(&cluster_role, &team, rb);
        for cluster in &clusters {
            let result = self.sync_cluster(rb, cluster, &cluster_role, &desired).await;
            report.clusters.push(self.finish_cluster(rb, cluster, result, actions::RECONCILE).await);
        }

        info!(
            "Reconciled RoleBinding {}/{} on {} cluster(s), {} failed",
            rb.namespace,
            rb.name,
            report.clusters.len(),
            report.failed_clusters().len()
        );
        Ok(report)
    }

    /// Converge one member cluster. The ClusterRole goes first; bindings
    /// are only written once it is in place.
    async fn sync_cluster(
        &self,
        rb: &RoleBinding,
        cluster: &Cluster,
        cluster_role: &ClusterRole,
        desired: &DesiredBindings,
    ) -> Result<(), (FailureStage, RemoteError)> {
        let client = self
            .registry
            .client_for(cluster)
            .await
            .map_err(|e| (FailureStage::Connect, e))?;
        let client = client.as_ref();

        self.apply(
            rb,
            cluster,
            client,
            cluster_role,
            reasons::CREATED_CLUSTER_ROLE,
            reasons::UPDATED_CLUSTER_ROLE,
        )
        .await
        .map_err(|e| (FailureStage::ClusterRole, e))?;

        match desired {
            DesiredBindings::Cluster(binding) => {
                self.apply(
                    rb,
                    cluster,
                    client,
                    binding,
                    reasons::CREATED_BINDING,
                    reasons::UPDATED_BINDING,
                )
                .await
                .map_err(|e| (FailureStage::Binding, e))?;
            }
            DesiredBindings::Namespaced(bindings) => {
                for binding in bindings {
                    self.apply(
                        rb,
                        cluster,
                        client,
                        binding,
                        reasons::CREATED_BINDING,
                        reasons::UPDATED_BINDING,
                    )
                    .await
                    .map_err(|e| (FailureStage::Binding, e))?;
                }
            }
        }

        // Bindings of a previous shape or namespace list.
        let stale = stale_bindings(
            client,
            OWNER_LABEL,
            &owner_value(rb),
            &desired.keys(),
            self.remote_timeout,
        )
        .await
        .map_err(|e| (FailureStage::Prune, e))?;
        for key in stale {
            if delete_if_present(client, &key, self.remote_timeout)
                .await
                .map_err(|e| (FailureStage::Prune, e))?
            {
                info!("Pruned {} on cluster {}", key, cluster.name);
                self.emit(
                    rb,
                    EventType::Normal,
                    reasons::PRUNED_BINDING,
                    actions::RECONCILE,
                    Some(cluster.name.as_str()),
                    Some(key.to_string()),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn apply<T: RemoteObject>(
        &self,
        rb: &RoleBinding,
        cluster: &Cluster,
        client: &dyn RemoteClient,
        desired: &T,
        created_reason: &str,
        updated_reason: &str,
    ) -> Result<(), RemoteError> {
        let key = desired.key();
        let outcome = create_or_patch(client, desired, self.remote_timeout).await?;
        let reason = match outcome {
            Outcome::Unchanged => {
                debug!("{} on cluster {} unchanged", key, cluster.name);
                return Ok(());
            }
            Outcome::Created => created_reason,
            Outcome::Updated => updated_reason,
        };
        info!("{} {} on cluster {}", key, outcome, cluster.name);
        self.emit(
            rb,
            EventType::Normal,
            reason,
            actions::RECONCILE,
            Some(cluster.name.as_str()),
            Some(key.to_string()),
        )
        .await;
        Ok(())
    }

    async fn teardown(&self, rb: &RoleBinding) -> Result<RunReport, ReconcileError> {
        if !rb.has_finalizer(ROLEBINDING_FINALIZER) {
            // Nothing was ever written remotely.
            let deleted = self
                .store
                .mutate_json::<RoleBinding, bool, _>(
                    &binding_key(&rb.namespace, &rb.name),
                    |latest| match latest {
                        Some(l) if l.finalizers.is_empty() && l.deletion_timestamp.is_some() => {
                            (Mutation::Delete, true)
                        }
                        _ => (Mutation::Keep, false),
                    },
                )
                .await?;
            if deleted {
                info!("RoleBinding {}/{} deleted", rb.namespace, rb.name);
            }
            return Ok(RunReport::new(RunOutcome::Finalized));
        }

        let clusters = match self.select(rb, actions::TEARDOWN).await? {
            Some(clusters) => clusters,
            None => {
                self.metrics
                    .counter_inc(TEARDOWN_TOTAL, &[("result", "blocked")]);
                return Ok(RunReport::new(RunOutcome::Blocked(
                    reasons::INVALID_CLUSTER_SELECTOR,
                )));
            }
        };

        let mut report = RunReport::new(RunOutcome::Finalized);
        for cluster in &clusters {
            let result = self.teardown_cluster(rb, cluster).await;
            report.clusters.push(self.finish_cluster(rb, cluster, result, actions::TEARDOWN).await);
        }

        let failed = report.failed_clusters();
        if !failed.is_empty() {
            let note = format!("teardown failed on: {}", failed.join(", "));
            warn!("RoleBinding {}/{} {}", rb.namespace, rb.name, note);
            self.emit(
                rb,
                EventType::Warning,
                reasons::TEARDOWN_INCOMPLETE,
                actions::TEARDOWN,
                None,
                Some(note),
            )
            .await;
            self.metrics
                .counter_inc(TEARDOWN_TOTAL, &[("result", "incomplete")]);
            report.outcome = RunOutcome::TeardownPending;
            return Ok(report);
        }

        self.release(rb).await?;
        self.metrics
            .counter_inc(TEARDOWN_TOTAL, &[("result", "complete")]);
        Ok(report)
    }

    /// Delete every binding `rb` owns on one cluster: the keys `binding_keys`
    /// names first, then labelled leftovers of earlier shapes. Bindings that
    /// are already gone count as deleted and bindings labelled for another
    /// owner are left alone. Every key is attempted; the first failure is
    /// reported.
    async fn teardown_cluster(
        &self,
        rb: &RoleBinding,
        cluster: &Cluster,
    ) -> Result<(), (FailureStage, RemoteError)> {
        let client = self
            .registry
            .client_for(cluster)
            .await
            .map_err(|e| (FailureStage::Connect, e))?;
        let client = client.as_ref();
        let owner = owner_value(rb);

        let mut first_error = None;
        let known = binding_keys(rb);
        for key in &known {
            if let Err(e) = self.remove_binding(rb, cluster, client, key, &owner).await {
                first_error.get_or_insert(e);
            }
        }

        match stale_bindings(client, OWNER_LABEL, &owner, &known, self.remote_timeout).await {
            Ok(leftovers) => {
                for key in &leftovers {
                    if let Err(e) = self.remove_binding(rb, cluster, client, key, &owner).await {
                        first_error.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to list leftover bindings on cluster {}: {}",
                    cluster.name, e
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err((FailureStage::DeleteBinding, e)),
            None => Ok(()),
        }
    }

    async fn remove_binding(
        &self,
        rb: &RoleBinding,
        cluster: &Cluster,
        client: &dyn RemoteClient,
        key: &ObjectKey,
        owner: &str,
    ) -> Result<(), RemoteError> {
        let removal = delete_owned(client, key, OWNER_LABEL, owner, self.remote_timeout)
            .await
            .inspect_err(|e| {
                warn!("Failed to delete {} on cluster {}: {}", key, cluster.name, e)
            })?;
        match removal {
            Removal::Deleted => {
                info!("Deleted {} on cluster {}", key, cluster.name);
                self.emit(
                    rb,
                    EventType::Normal,
                    reasons::DELETED_BINDING,
                    actions::TEARDOWN,
                    Some(cluster.name.as_str()),
                    Some(key.to_string()),
                )
                .await;
            }
            Removal::Absent => debug!("{} already absent on cluster {}", key, cluster.name),
            Removal::OwnedBy(other) => info!(
                "Leaving {} on cluster {}: it belongs to {}",
                key, cluster.name, other
            ),
        }
        Ok(())
    }

    /// Turn a per-cluster result into its report entry, with the matching
    /// event and metric.
    async fn finish_cluster(
        &self,
        rb: &RoleBinding,
        cluster: &Cluster,
        result: Result<(), (FailureStage, RemoteError)>,
        action: &str,
    ) -> ClusterReport {
        match result {
            Ok(()) => {
                self.metrics.counter_inc(
                    CLUSTER_SYNC_TOTAL,
                    &[("cluster", cluster.name.as_str()), ("result", "ok")],
                );
                ClusterReport::ok(cluster)
            }
            Err((stage, e)) => {
                warn!(
                    "RoleBinding {}/{} on cluster {}: {:?} failed: {}",
                    rb.namespace, rb.name, cluster.name, stage, e
                );
                self.metrics.counter_inc(
                    CLUSTER_SYNC_TOTAL,
                    &[("cluster", cluster.name.as_str()), ("result", "error")],
                );
                self.emit(
                    rb,
                    EventType::Warning,
                    stage.reason(),
                    action,
                    Some(cluster.name.as_str()),
                    Some(e.to_string()),
                )
                .await;
                ClusterReport {
                    cluster: cluster.name.clone(),
                    failure: Some(ClusterFailure {
                        stage,
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    /// `None` when the stored selector does not parse; the event has been
    /// emitted already.
    async fn select(
        &self,
        rb: &RoleBinding,
        action: &str,
    ) -> Result<Option<Vec<Cluster>>, ReconcileError> {
        match select_clusters(&self.store, &rb.spec.cluster_selector, &rb.namespace).await {
            Ok(clusters) => Ok(Some(clusters)),
            Err(SelectError::Store(e)) => Err(e.into()),
            Err(SelectError::Invalid(e)) => {
                warn!(
                    "RoleBinding {}/{} has an invalid cluster selector: {}",
                    rb.namespace, rb.name, e
                );
                self.emit(
                    rb,
                    EventType::Warning,
                    reasons::INVALID_CLUSTER_SELECTOR,
                    action,
                    None,
                    Some(e.to_string()),
                )
                .await;
                Ok(None)
            }
        }
    }

    /// Persist the finalizer on the latest stored copy of `rb`. Returns
    /// false if the RoleBinding vanished meanwhile.
    async fn attach_finalizer(&self, rb: &RoleBinding) -> Result<bool, ReconcileError> {
        let key = binding_key(&rb.namespace, &rb.name);
        let added = self
            .store
            .mutate_json::<RoleBinding, Option<bool>, _>(&key, |latest| match latest {
                None => (Mutation::Keep, None),
                Some(mut l) => {
                    if l.add_finalizer(ROLEBINDING_FINALIZER) {
                        (Mutation::Put(l), Some(true))
                    } else {
                        (Mutation::Keep, Some(false))
                    }
                }
            })
            .await?;
        let Some(added) = added else {
            return Ok(false);
        };
        if added {
            info!("Finalizer added to RoleBinding {}/{}", rb.namespace, rb.name);
            self.emit(
                rb,
                EventType::Normal,
                reasons::FINALIZER_ADDED,
                actions::RECONCILE,
                None,
                None,
            )
            .await;
        }
        Ok(true)
    }

    /// Release the finalizer on the latest stored copy. The RoleBinding is
    /// deleted once no other finalizer holds it back.
    async fn release(&self, rb: &RoleBinding) -> Result<(), ReconcileError> {
        let key = binding_key(&rb.namespace, &rb.name);
        let remaining = self
            .store
            .mutate_json::<RoleBinding, Option<Vec<String>>, _>(&key, |latest| match latest {
                None => (Mutation::Keep, None),
                Some(mut l) => {
                    l.remove_finalizer(ROLEBINDING_FINALIZER);
                    if l.finalizers.is_empty() {
                        (Mutation::Delete, Some(Vec::new()))
                    } else {
                        let rest = l.finalizers.clone();
                        (Mutation::Put(l), Some(rest))
                    }
                }
            })
            .await?;
        let Some(remaining) = remaining else {
            return Ok(());
        };
        if !remaining.is_empty() {
            debug!(
                "RoleBinding {}/{} still held by: {}",
                rb.namespace,
                rb.name,
                remaining.join(", ")
            );
        }
        info!(
            "Teardown of RoleBinding {}/{} complete, finalizer released",
            rb.namespace, rb.name
        );
        self.emit(
            rb,
            EventType::Normal,
            reasons::TEARDOWN_COMPLETE,
            actions::TEARDOWN,
            None,
            None,
        )
        .await;
        Ok(())
    }

    async fn emit(
        &self,
        rb: &RoleBinding,
        event_type: EventType,
        reason: &str,
        action: &str,
        cluster: Option<&str>,
        note: Option<String>,
    ) {
        self.recorder
            .publish(&regarding(rb), event_type, reason, action, cluster, note)
            .await;
    }
}
