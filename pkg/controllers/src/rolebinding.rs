use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use pkg_constants::controller::{
    DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_WORKERS,
};
use pkg_constants::state::{
    CLUSTERS_PREFIX, ROLEBINDINGS_PREFIX, ROLES_PREFIX, SECRETS_PREFIX, TEAMS_PREFIX,
};
use pkg_state::client::StateStore;
use pkg_state::watch::{EventType, WatchEvent};
use pkg_types::rbac::RoleBinding;

use crate::engine::RoleBindingEngine;

pub const ROLEBINDINGS_GAUGE: &str = "rbacfleet_rolebindings";
pub const QUEUE_DEPTH_GAUGE: &str = "rbacfleet_workqueue_depth";
use crate::index::{DependencyIndex, NamespacedName};
use crate::queue::WorkQueue;

/// Controller that turns store changes into RoleBinding runs.
///
/// RoleBinding changes enqueue the binding itself; Role and Team changes
/// enqueue their dependents via the `DependencyIndex`; Cluster and Secret
/// changes enqueue every binding of their namespace. A periodic resync
/// re-enqueues everything, and runs with per-cluster failures are retried
/// after `retry_interval`.
pub struct RoleBindingController {
    store: StateStore,
    engine: Arc<RoleBindingEngine>,
    index: Arc<DependencyIndex>,
    queue: Arc<WorkQueue<NamespacedName>>,
    workers: usize,
    resync_interval: Duration,
    retry_interval: Duration,
}

impl RoleBindingController {
    pub fn new(engine: Arc<RoleBindingEngine>, index: Arc<DependencyIndex>) -> Self {
        let metrics = engine.metrics();
        metrics.register_gauge(ROLEBINDINGS_GAUGE, "RoleBindings seen by the last resync");
        metrics.register_gauge(QUEUE_DEPTH_GAUGE, "RoleBindings waiting for a worker");
        Self {
            store: engine.store().clone(),
            engine,
            index,
            queue: Arc::new(WorkQueue::new()),
            workers: DEFAULT_WORKERS,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Start the controller loop and its workers as background tasks.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "RoleBindingController started (workers={}, resync={}s, retry={}s)",
                self.workers,
                self.resync_interval.as_secs(),
                self.retry_interval.as_secs()
            );
            // Subscribe before the initial resync so no change slips between.
            let mut event_rx = self.store.event_log.subscribe();
            let mut last_seq = self.store.event_log.current_seq().await;
            for id in 0..self.workers {
                self.spawn_worker(id);
            }

            let mut interval = tokio::time::interval(self.resync_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.resync().await {
                            warn!("RoleBindingController resync error: {}", e);
                        }
                    }
                    result = event_rx.recv() => {
                        match result {
                            // Already routed by a replay.
                            Ok(event) if event.seq <= last_seq => {}
                            Ok(event) => {
                                last_seq = event.seq;
                                self.route(&event);
                            }
                            Err(RecvError::Lagged(missed)) => {
                                warn!("RoleBindingController lagged by {} events", missed);
                                if !self.replay(&mut last_seq).await {
                                    info!("Event log no longer covers the gap, resyncing");
                                    if let Err(e) = self.resync().await {
                                        warn!("RoleBindingController resync error: {}", e);
                                    }
                                    interval.reset();
                                }
                            }
                            Err(RecvError::Closed) => break,
                        }
                        self.engine
                            .metrics()
                            .gauge_set(QUEUE_DEPTH_GAUGE, &[], self.queue.len() as i64);
                    }
                }
            }
            self.queue.shutdown();
        })
    }

    fn spawn_worker(&self, id: usize) {
        let engine = self.engine.clone();
        let queue = self.queue.clone();
        let retry = self.retry_interval;
        tokio::spawn(async move {
            while let Some(key) = queue.next().await {
                let (namespace, name) = &key;
                match engine.reconcile(namespace, name).await {
                    Ok(report) if report.needs_retry() => {
                        debug!(
                            "worker {}: {}/{} retry in {}s (failed: {})",
                            id,
                            namespace,
                            name,
                            retry.as_secs(),
                            report.failed_clusters().join(", ")
                        );
                        queue.add_after(key.clone(), retry);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("RoleBinding {}/{} reconcile error: {}", namespace, name, e);
                        queue.add_after(key.clone(), retry);
                    }
                }
                queue.done(&key);
            }
        });
    }

    /// Route the buffered events after `last_seq`. False when the buffer
    /// has already dropped some of them.
    async fn replay(&self, last_seq: &mut u64) -> bool {
        let events = self.store.event_log.events_since(*last_seq, "").await;
        if events.first().is_some_and(|e| e.seq > *last_seq + 1) {
            return false;
        }
        debug!("Replaying {} buffered event(s)", events.len());
        for event in &events {
            self.route(event);
            *last_seq = event.seq;
        }
        true
    }

    /// Rebuild the index from the store and enqueue every RoleBinding.
    async fn resync(&self) -> anyhow::Result<()> {
        let bindings: Vec<RoleBinding> = self.store.list_json(ROLEBINDINGS_PREFIX).await?;
        let mut live = HashSet::with_capacity(bindings.len());
        for rb in &bindings {
            self.index.observe(rb);
            live.insert((rb.namespace.clone(), rb.name.clone()));
        }
        for key in self.index.keys() {
            if !live.contains(&key) {
                self.index.forget(&key.0, &key.1);
            }
        }
        debug!("Resync: {} RoleBinding(s)", live.len());
        self.engine
            .metrics()
            .gauge_set(ROLEBINDINGS_GAUGE, &[], live.len() as i64);
        for key in live {
            self.queue.add(key);
        }
        Ok(())
    }

    fn route(&self, event: &WatchEvent) {
        let Some(rk) = event.resource_key() else {
            return;
        };
        let ns = rk.namespace.as_str();

        if event.key.starts_with(ROLEBINDINGS_PREFIX) {
            match event.event_type {
                EventType::Put => {
                    if let Some(value) = &event.value
                        && let Ok(rb) = serde_json::from_slice::<RoleBinding>(value)
                    {
                        self.index.observe(&rb);
                    }
                    self.queue.add((rk.namespace.clone(), rk.name.clone()));
                }
                EventType::Delete => self.index.forget(ns, &rk.name),
            }
        } else if event.key.starts_with(ROLES_PREFIX) {
            self.enqueue_all(ns, self.index.dependents_of_role(ns, &rk.name));
        } else if event.key.starts_with(TEAMS_PREFIX) {
            self.enqueue_all(ns, self.index.dependents_of_team(ns, &rk.name));
        } else if event.key.starts_with(CLUSTERS_PREFIX) || event.key.starts_with(SECRETS_PREFIX) {
            self.enqueue_all(ns, self.index.bindings_in(ns));
        }
    }

    fn enqueue_all(&self, namespace: &str, names: Vec<String>) {
        for name in names {
            self.queue.add((namespace.to_string(), name));
        }
    }
}
