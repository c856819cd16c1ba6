//! Access to the RBAC API of a member cluster.
//!
//! `RemoteClient` is deliberately untyped (JSON in, JSON out) so it stays
//! object-safe; `RemoteObject` layers the typed view and the ownership rules
//! on top.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use pkg_types::remote::{ClusterRole, ClusterRoleBinding, RoleBinding};

/// Label every object written by the engine carries.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "rbacfleet";
/// Label naming the central RoleBinding (`<namespace>.<name>`) a binding belongs to.
pub const OWNER_LABEL: &str = "rbacfleet.io/owner";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RbacKind {
    ClusterRole,
    ClusterRoleBinding,
    RoleBinding,
}

impl RbacKind {
    pub fn plural(self) -> &'static str {
        match self {
            RbacKind::ClusterRole => "clusterroles",
            RbacKind::ClusterRoleBinding => "clusterrolebindings",
            RbacKind::RoleBinding => "rolebindings",
        }
    }

    pub fn is_namespaced(self) -> bool {
        matches!(self, RbacKind::RoleBinding)
    }
}

/// Identity of one object on a member cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: RbacKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster_role(name: &str) -> Self {
        Self {
            kind: RbacKind::ClusterRole,
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn cluster_role_binding(name: &str) -> Self {
        Self {
            kind: RbacKind::ClusterRoleBinding,
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn role_binding(namespace: &str, name: &str) -> Self {
        Self {
            kind: RbacKind::RoleBinding,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind.plural(), ns, self.name),
            None => write!(f, "{}/{}", self.kind.plural(), self.name),
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid object from remote: {0}")]
    Decode(String),
    #[error("connection descriptor: {0}")]
    Descriptor(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// Minimal CRUD surface of a member cluster's RBAC API.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Read one object; `Ok(None)` when it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, RemoteError>;

    /// Create an object. Fails with `AlreadyExists` if the name is taken.
    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<(), RemoteError>;

    /// Overwrite an existing object. Fails with `NotFound` if it is gone.
    async fn replace(&self, key: &ObjectKey, object: &Value) -> Result<(), RemoteError>;

    /// Delete an object. Fails with `NotFound` if it does not exist.
    async fn delete(&self, key: &ObjectKey) -> Result<(), RemoteError>;

    /// List every object of a kind, across all namespaces for namespaced kinds.
    async fn list(&self, kind: RbacKind) -> Result<Vec<Value>, RemoteError>;
}

/// Typed member-cluster object with an explicit set of engine-owned fields.
pub trait RemoteObject: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn key(&self) -> ObjectKey;

    /// True when every field the engine owns already matches `desired`.
    fn owned_eq(&self, desired: &Self) -> bool;

    /// Copy the engine-owned fields of `desired` onto `self`, leaving the
    /// rest untouched.
    fn adopt_owned(&mut self, desired: &Self);
}

fn labels_contain(
    existing: &std::collections::BTreeMap<String, String>,
    wanted: &std::collections::BTreeMap<String, String>,
) -> bool {
    wanted.iter().all(|(k, v)| existing.get(k) == Some(v))
}

fn merge_labels(
    existing: &mut std::collections::BTreeMap<String, String>,
    wanted: &std::collections::BTreeMap<String, String>,
) {
    for (k, v) in wanted {
        existing.insert(k.clone(), v.clone());
    }
}

impl RemoteObject for ClusterRole {
    fn key(&self) -> ObjectKey {
        ObjectKey::cluster_role(&self.name)
    }

    fn owned_eq(&self, desired: &Self) -> bool {
        self.rules == desired.rules && labels_contain(&self.labels, &desired.labels)
    }

    fn adopt_owned(&mut self, desired: &Self) {
        self.rules = desired.rules.clone();
        merge_labels(&mut self.labels, &desired.labels);
    }
}

impl RemoteObject for ClusterRoleBinding {
    fn key(&self) -> ObjectKey {
        ObjectKey::cluster_role_binding(&self.name)
    }

    fn owned_eq(&self, desired: &Self) -> bool {
        self.role_ref == desired.role_ref
            && self.subjects == desired.subjects
            && labels_contain(&self.labels, &desired.labels)
    }

    fn adopt_owned(&mut self, desired: &Self) {
        self.role_ref = desired.role_ref.clone();
        self.subjects = desired.subjects.clone();
        merge_labels(&mut self.labels, &desired.labels);
    }
}

impl RemoteObject for RoleBinding {
    fn key(&self) -> ObjectKey {
        ObjectKey::role_binding(&self.namespace, &self.name)
    }

    fn owned_eq(&self, desired: &Self) -> bool {
        self.role_ref == desired.role_ref
            && self.subjects == desired.subjects
            && labels_contain(&self.labels, &desired.labels)
    }

    fn adopt_owned(&mut self, desired: &Self) {
        self.role_ref = desired.role_ref.clone();
        self.subjects = desired.subjects.clone();
        merge_labels(&mut self.labels, &desired.labels);
    }
}
