//! Desired member-cluster objects for a RoleBinding. No I/O.

use std::collections::{BTreeMap, BTreeSet};

use pkg_types::rbac::{Role, RoleBinding, Subject, Team};
use pkg_types::remote::{self, ClusterRole, ClusterRoleBinding, RoleRef};

use crate::remote::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, OWNER_LABEL, ObjectKey};

/// The one binding shape a RoleBinding produces on each member cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredBindings {
    Cluster(ClusterRoleBinding),
    /// One per target namespace, ordered by namespace.
    Namespaced(Vec<remote::RoleBinding>),
}

impl DesiredBindings {
    pub fn keys(&self) -> Vec<ObjectKey> {
        match self {
            DesiredBindings::Cluster(b) => vec![ObjectKey::cluster_role_binding(&b.name)],
            DesiredBindings::Namespaced(bs) => bs
                .iter()
                .map(|b| ObjectKey::role_binding(&b.namespace, &b.name))
                .collect(),
        }
    }
}

/// Value of the owner label for bindings of `rb`.
pub fn owner_value(rb: &RoleBinding) -> String {
    format!("{}.{}", rb.namespace, rb.name)
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

fn binding_labels(rb: &RoleBinding) -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.insert(OWNER_LABEL.to_string(), owner_value(rb));
    labels
}

/// Cluster-scoped permission set named after the Role, rules copied verbatim.
pub fn cluster_role(role: &Role) -> ClusterRole {
    ClusterRole {
        name: role.name.clone(),
        labels: managed_labels(),
        annotations: BTreeMap::new(),
        rules: role.rules.clone(),
    }
}

/// Binding(s) granting the Team's mapped group the given permission set.
/// Duplicate namespaces collapse into one binding.
pub fn bindings(cluster_role: &ClusterRole, team: &Team, rb: &RoleBinding) -> DesiredBindings {
    let role_ref = RoleRef::cluster_role(&cluster_role.name);
    let subjects = vec![Subject::group(&team.mapped_group)];

    if rb.is_cluster_scoped() {
        return DesiredBindings::Cluster(ClusterRoleBinding {
            name: rb.name.clone(),
            labels: binding_labels(rb),
            annotations: BTreeMap::new(),
            role_ref,
            subjects,
        });
    }

    let namespaces: BTreeSet<&String> = rb.spec.namespaces.iter().collect();
    DesiredBindings::Namespaced(
        namespaces
            .into_iter()
            .map(|ns| remote::RoleBinding {
                name: rb.name.clone(),
                namespace: ns.clone(),
                labels: binding_labels(rb),
                annotations: BTreeMap::new(),
                role_ref: role_ref.clone(),
                subjects: subjects.clone(),
            })
            .collect(),
    )
}

/// Keys of the binding(s) `rb` owns on a member cluster, derived from the
/// RoleBinding alone. Teardown uses this so it needs neither Role nor Team.
pub fn binding_keys(rb: &RoleBinding) -> Vec<ObjectKey> {
    if rb.is_cluster_scoped() {
        return vec![ObjectKey::cluster_role_binding(&rb.name)];
    }
    let namespaces: BTreeSet<&String> = rb.spec.namespaces.iter().collect();
    namespaces
        .into_iter()
        .map(|ns| ObjectKey::role_binding(ns, &rb.name))
        .collect()
}
