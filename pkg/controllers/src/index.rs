//! Reverse lookups from Role and Team to the RoleBindings that use them.

use dashmap::DashMap;
use std::collections::BTreeSet;

use pkg_types::rbac::RoleBinding;

/// `(namespace, name)`
pub type NamespacedName = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Refs {
    role: String,
    team: String,
}

/// Maps `(namespace, role)` and `(namespace, team)` to the names of the
/// RoleBindings in that namespace referencing them.
///
/// Safe for concurrent use; every update keeps the forward map and both
/// reverse maps in step for the binding concerned.
#[derive(Default)]
pub struct DependencyIndex {
    by_role: DashMap<NamespacedName, BTreeSet<String>>,
    by_team: DashMap<NamespacedName, BTreeSet<String>>,
    refs: DashMap<NamespacedName, Refs>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) the references of `rb`, dropping stale ones.
    pub fn observe(&self, rb: &RoleBinding) {
        let key = (rb.namespace.clone(), rb.name.clone());
        let refs = Refs {
            role: rb.spec.role_ref.clone(),
            team: rb.spec.team_ref.clone(),
        };
        let previous = self.refs.insert(key.clone(), refs.clone());
        if previous.as_ref() == Some(&refs) {
            return;
        }
        if let Some(old) = previous {
            unlink(&self.by_role, &rb.namespace, &old.role, &rb.name);
            unlink(&self.by_team, &rb.namespace, &old.team, &rb.name);
        }
        link(&self.by_role, &rb.namespace, &refs.role, &rb.name);
        link(&self.by_team, &rb.namespace, &refs.team, &rb.name);
    }

    /// Remove a RoleBinding that no longer exists.
    pub fn forget(&self, namespace: &str, name: &str) {
        if let Some((_, old)) = self.refs.remove(&(namespace.to_string(), name.to_string())) {
            unlink(&self.by_role, namespace, &old.role, name);
            unlink(&self.by_team, namespace, &old.team, name);
        }
    }

    pub fn dependents_of_role(&self, namespace: &str, role: &str) -> Vec<String> {
        lookup(&self.by_role, namespace, role)
    }

    pub fn dependents_of_team(&self, namespace: &str, team: &str) -> Vec<String> {
        lookup(&self.by_team, namespace, team)
    }

    /// Every indexed RoleBinding in `namespace`, sorted by name.
    pub fn bindings_in(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .refs
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        names.sort();
        names
    }

    /// Every indexed RoleBinding.
    pub fn keys(&self) -> Vec<NamespacedName> {
        self.refs.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

fn link(map: &DashMap<NamespacedName, BTreeSet<String>>, ns: &str, target: &str, binding: &str) {
    map.entry((ns.to_string(), target.to_string()))
        .or_default()
        .insert(binding.to_string());
}

fn unlink(map: &DashMap<NamespacedName, BTreeSet<String>>, ns: &str, target: &str, binding: &str) {
    let key = (ns.to_string(), target.to_string());
    if let Some(mut set) = map.get_mut(&key) {
        set.remove(binding);
    }
    map.remove_if(&key, |_, set| set.is_empty());
}

fn lookup(map: &DashMap<NamespacedName, BTreeSet<String>>, ns: &str, target: &str) -> Vec<String> {
    map.get(&(ns.to_string(), target.to_string()))
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default()
}
