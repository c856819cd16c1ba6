use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Policy rules ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// API groups this rule applies to (e.g., "" for core, "*" for all)
    #[serde(default, alias = "apiGroups")]
    pub api_groups: Vec<String>,
    /// Resource types (e.g., "pods", "services", "*" for all)
    #[serde(default)]
    pub resources: Vec<String>,
    /// Allowed verbs (e.g., "get", "list", "create", "update", "delete", "*" for all)
    #[serde(default)]
    pub verbs: Vec<String>,
}

// --- Role ---

/// Reusable set of permission rules, scoped to the namespace it was created in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub rules: Vec<PolicyRule>,
}

// --- Team ---

/// A group of people identified by the group name their identity provider
/// puts in their credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(alias = "mappedGroup")]
    pub mapped_group: String,
}

// --- Subject ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectKind {
    User,
    Group,
    ServiceAccount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Subject {
    pub fn group(name: &str) -> Self {
        Self {
            kind: SubjectKind::Group,
            name: name.to_string(),
            namespace: None,
        }
    }
}

// --- Cluster selection ---

/// Picks the member clusters a RoleBinding is propagated to.
///
/// `name` pins a single cluster; otherwise `label_selector` is evaluated
/// against the cluster inventory of the RoleBinding's namespace. Names in
/// `exclude` are dropped from the result either way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "labelSelector",
        skip_serializing_if = "Option::is_none"
    )]
    pub label_selector: Option<String>,
    #[serde(default, alias = "excludeList")]
    pub exclude: Vec<String>,
}

// --- RoleBinding ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBindingSpec {
    #[serde(alias = "roleRef")]
    pub role_ref: String,
    #[serde(alias = "teamRef")]
    pub team_ref: String,
    #[serde(default, alias = "clusterSelector")]
    pub cluster_selector: ClusterSelector,
    /// Target namespaces on each member cluster. Empty means cluster-wide.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Declared intent: grant `team_ref` the permissions of `role_ref` on every
/// selected member cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub spec: RoleBindingSpec,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Set by the API layer when deletion was requested while finalizers
    /// were still present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Lifecycle phase of a RoleBinding as seen by the propagation engine.
/// A RoleBinding that no longer exists in the store is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingPhase {
    /// Finalizer not attached yet.
    Pending,
    /// Finalizer attached, remote state is converged (or converging).
    Active,
    /// Deletion requested, remote cleanup in progress.
    Terminating,
}

impl std::fmt::Display for BindingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingPhase::Pending => write!(f, "Pending"),
            BindingPhase::Active => write!(f, "Active"),
            BindingPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

impl RoleBinding {
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was newly added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn phase(&self, finalizer: &str) -> BindingPhase {
        if self.is_deleting() {
            BindingPhase::Terminating
        } else if self.has_finalizer(finalizer) {
            BindingPhase::Active
        } else {
            BindingPhase::Pending
        }
    }

    /// True when the binding is cluster-wide on each member cluster.
    pub fn is_cluster_scoped(&self) -> bool {
        self.spec.namespaces.is_empty()
    }
}
