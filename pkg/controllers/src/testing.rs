//! In-process member clusters and fixtures shared by the unit tests.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pkg_constants::state::{CLUSTERS_PREFIX, ROLEBINDINGS_PREFIX, ROLES_PREFIX, TEAMS_PREFIX};
use pkg_state::client::StateStore;
use pkg_types::cluster::Cluster;
use pkg_types::event::{EventType, ObjectReference};
use pkg_types::rbac::{ClusterSelector, PolicyRule, Role, RoleBinding, RoleBindingSpec, Team};

use crate::events::EventRecorder;
use crate::registry::ConnectionRegistry;
use crate::remote::{ObjectKey, RbacKind, RemoteClient, RemoteError, RemoteObject};

/// A member cluster's RBAC API held in memory.
pub struct FakeCluster {
    pub name: String,
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    writes: AtomicUsize,
    delay: Mutex<Duration>,
    failing: AtomicBool,
    failing_lists: AtomicBool,
    /// Kinds whose writes fail while reads keep working.
    failing_writes: Mutex<HashSet<RbacKind>>,
}

impl FakeCluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            failing: AtomicBool::new(false),
            failing_lists: AtomicBool::new(false),
            failing_writes: Mutex::new(HashSet::new()),
        }
    }

    /// Number of successful create/replace/delete calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Every call fails with a transport error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// List calls fail while set; gets and writes keep working.
    pub fn set_failing_lists(&self, failing: bool) {
        self.failing_lists.store(failing, Ordering::SeqCst);
    }

    pub fn fail_writes_of(&self, kind: RbacKind) {
        self.failing_writes.lock().unwrap().insert(kind);
    }

    pub fn insert<T: RemoteObject>(&self, obj: &T) {
        let value = serde_json::to_value(obj).unwrap();
        self.objects.lock().unwrap().insert(obj.key(), value);
    }

    pub fn object<T: RemoteObject>(&self, key: &ObjectKey) -> Option<T> {
        let value = self.objects.lock().unwrap().get(key).cloned()?;
        Some(serde_json::from_value(value).unwrap())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn keys_of(&self, kind: RbacKind) -> Vec<ObjectKey> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.kind == kind)
            .cloned()
            .collect()
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport(format!("{} unreachable", self.name)));
        }
        Ok(())
    }

    fn check_write(&self, key: &ObjectKey) -> Result<(), RemoteError> {
        if self.failing_writes.lock().unwrap().contains(&key.kind) {
            return Err(RemoteError::Status {
                status: 500,
                message: format!("injected failure writing {}", key),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for FakeCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, RemoteError> {
        self.enter().await?;
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<(), RemoteError> {
        self.enter().await?;
        self.check_write(key)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(key) {
            return Err(RemoteError::AlreadyExists(key.clone()));
        }
        objects.insert(key.clone(), object.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace(&self, key: &ObjectKey, object: &Value) -> Result<(), RemoteError> {
        self.enter().await?;
        self.check_write(key)?;
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(key) {
            return Err(RemoteError::NotFound(key.clone()));
        }
        objects.insert(key.clone(), object.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), RemoteError> {
        self.enter().await?;
        self.check_write(key)?;
        if self.objects.lock().unwrap().remove(key).is_none() {
            return Err(RemoteError::NotFound(key.clone()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, kind: RbacKind) -> Result<Vec<Value>, RemoteError> {
        self.enter().await?;
        if self.failing_lists.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                status: 500,
                message: format!("injected failure listing {:?}", kind),
            });
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(_, v)| v.clone())
            .collect())
    }
}

/// Registry handing out `FakeCluster`s by cluster name.
#[derive(Default)]
pub struct FakeRegistry {
    clusters: Mutex<HashMap<String, Arc<FakeCluster>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or fetch) the fake behind cluster `name`.
    pub fn cluster(&self, name: &str) -> Arc<FakeCluster> {
        self.clusters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeCluster::new(name)))
            .clone()
    }

    /// Client acquisition for `name` fails while set.
    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }
}

#[async_trait]
impl ConnectionRegistry for FakeRegistry {
    async fn client_for(&self, cluster: &Cluster) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        if self.unreachable.lock().unwrap().contains(&cluster.name) {
            return Err(RemoteError::Transport(format!(
                "cannot reach {}",
                cluster.name
            )));
        }
        let fake: Arc<dyn RemoteClient> = self.cluster(&cluster.name);
        Ok(fake)
    }
}

/// Keeps events in memory so tests can assert on them.
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<(String, Option<String>, EventType)>>,
}

impl MemoryEventRecorder {
    /// `(reason, cluster, type)` in publish order.
    pub fn recorded(&self) -> Vec<(String, Option<String>, EventType)> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.recorded().into_iter().map(|(r, _, _)| r).collect()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.recorded().iter().filter(|(r, _, _)| r == reason).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn publish(
        &self,
        _regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        _action: &str,
        cluster: Option<&str>,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((reason.to_string(), cluster.map(str::to_string), event_type));
    }
}

// --- Fixtures ---

pub fn read_only_rule() -> PolicyRule {
    PolicyRule {
        api_groups: vec![String::new()],
        resources: vec!["pods".to_string(), "services".to_string()],
        verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
    }
}

pub fn role(namespace: &str, name: &str) -> Role {
    Role {
        name: name.to_string(),
        namespace: namespace.to_string(),
        rules: vec![read_only_rule()],
    }
}

pub fn team(namespace: &str, name: &str, group: &str) -> Team {
    Team {
        name: name.to_string(),
        namespace: namespace.to_string(),
        mapped_group: group.to_string(),
    }
}

pub fn binding(
    namespace: &str,
    name: &str,
    role_ref: &str,
    team_ref: &str,
    namespaces: &[&str],
) -> RoleBinding {
    RoleBinding {
        name: name.to_string(),
        namespace: namespace.to_string(),
        spec: RoleBindingSpec {
            role_ref: role_ref.to_string(),
            team_ref: team_ref.to_string(),
            cluster_selector: ClusterSelector::default(),
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
        },
        finalizers: vec![],
        deletion_timestamp: None,
        created_at: Utc::now(),
    }
}

pub fn cluster(name: &str, labels: &[(&str, &str)]) -> Cluster {
    Cluster {
        name: name.to_string(),
        namespace: "fleet".to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        created_at: Utc::now(),
    }
}

pub async fn seed_role(store: &StateStore, namespace: &str, name: &str) -> Role {
    let r = role(namespace, name);
    store
        .put_json(&format!("{}{}/{}", ROLES_PREFIX, namespace, name), &r)
        .await
        .unwrap();
    r
}

pub async fn seed_team(store: &StateStore, namespace: &str, name: &str, group: &str) -> Team {
    let t = team(namespace, name, group);
    store
        .put_json(&format!("{}{}/{}", TEAMS_PREFIX, namespace, name), &t)
        .await
        .unwrap();
    t
}

pub async fn seed_cluster(
    store: &StateStore,
    namespace: &str,
    name: &str,
    labels: &[(&str, &str)],
) -> Cluster {
    let mut c = cluster(name, labels);
    c.namespace = namespace.to_string();
    store
        .put_json(&format!("{}{}/{}", CLUSTERS_PREFIX, namespace, name), &c)
        .await
        .unwrap();
    c
}

pub async fn seed_binding(store: &StateStore, rb: &RoleBinding) {
    store
        .put_json(
            &format!("{}{}/{}", ROLEBINDINGS_PREFIX, rb.namespace, rb.name),
            rb,
        )
        .await
        .unwrap();
}

pub async fn load_binding(store: &StateStore, namespace: &str, name: &str) -> Option<RoleBinding> {
    store
        .get_json(&format!("{}{}/{}", ROLEBINDINGS_PREFIX, namespace, name))
        .await
        .unwrap()
}
