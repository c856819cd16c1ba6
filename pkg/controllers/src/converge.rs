//! Create-or-patch and idempotent delete against one member cluster.

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::remote::{ObjectKey, RbacKind, RemoteClient, RemoteError, RemoteObject};

/// What a convergence step did. Used for logging and events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Created,
    Updated,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Unchanged => write!(f, "unchanged"),
            Outcome::Created => write!(f, "created"),
            Outcome::Updated => write!(f, "updated"),
        }
    }
}

/// Bound a remote call by `timeout`.
pub async fn with_deadline<T, F>(timeout: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| RemoteError::Timeout(timeout))?
}

fn encode<T: RemoteObject>(obj: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(obj).map_err(|e| RemoteError::Decode(e.to_string()))
}

fn decode<T: RemoteObject>(value: Value) -> Result<T, RemoteError> {
    serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Make the engine-owned fields of the remote object match `desired`.
///
/// Absent → create. Present and different → write the existing object back
/// with only the owned fields replaced. A create that races another writer
/// falls back to the patch path once.
pub async fn create_or_patch<T: RemoteObject>(
    client: &dyn RemoteClient,
    desired: &T,
    timeout: Duration,
) -> Result<Outcome, RemoteError> {
    let key = desired.key();
    let mut retried = false;
    loop {
        match with_deadline(timeout, client.get(&key)).await? {
            None => {
                let body = encode(desired)?;
                match with_deadline(timeout, client.create(&key, &body)).await {
                    Ok(()) => return Ok(Outcome::Created),
                    Err(RemoteError::AlreadyExists(_)) if !retried => {
                        retried = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(value) => {
                let mut current: T = decode(value)?;
                if current.owned_eq(desired) {
                    debug!("{} already converged", key);
                    return Ok(Outcome::Unchanged);
                }
                current.adopt_owned(desired);
                let body = encode(&current)?;
                match with_deadline(timeout, client.replace(&key, &body)).await {
                    Ok(()) => return Ok(Outcome::Updated),
                    Err(RemoteError::NotFound(_)) if !retried => {
                        retried = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Delete `key`; an object that is already gone counts as deleted.
/// Returns whether something was actually removed.
pub async fn delete_if_present(
    client: &dyn RemoteClient,
    key: &ObjectKey,
    timeout: Duration,
) -> Result<bool, RemoteError> {
    match with_deadline(timeout, client.delete(key)).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// What [`delete_owned`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    Absent,
    /// Left in place: labelled as belonging to this other owner.
    OwnedBy(String),
}

/// Delete `key` unless its `owner_label` names a different owner. Objects
/// without the label are deleted.
pub async fn delete_owned(
    client: &dyn RemoteClient,
    key: &ObjectKey,
    owner_label: &str,
    owner: &str,
    timeout: Duration,
) -> Result<Removal, RemoteError> {
    let Some(value) = with_deadline(timeout, client.get(key)).await? else {
        return Ok(Removal::Absent);
    };
    match label(&value, owner_label) {
        Some(other) if other != owner => return Ok(Removal::OwnedBy(other.to_string())),
        _ => {}
    }
    if delete_if_present(client, key, timeout).await? {
        Ok(Removal::Deleted)
    } else {
        Ok(Removal::Absent)
    }
}

fn label<'a>(value: &'a Value, name: &str) -> Option<&'a str> {
    value.get("labels")?.get(name)?.as_str()
}

/// Keys of bindings carrying `owner` that are not part of `keep`.
/// These are leftovers of an earlier shape or namespace list.
pub async fn stale_bindings(
    client: &dyn RemoteClient,
    owner_label: &str,
    owner: &str,
    keep: &[ObjectKey],
    timeout: Duration,
) -> Result<Vec<ObjectKey>, RemoteError> {
    let mut stale = Vec::new();
    for kind in [RbacKind::ClusterRoleBinding, RbacKind::RoleBinding] {
        for value in with_deadline(timeout, client.list(kind)).await? {
            let Some(key) = owned_key(kind, &value, owner_label, owner) else {
                continue;
            };
            if !keep.contains(&key) {
                stale.push(key);
            }
        }
    }
    Ok(stale)
}

fn owned_key(kind: RbacKind, value: &Value, owner_label: &str, owner: &str) -> Option<ObjectKey> {
    if label(value, owner_label) != Some(owner) {
        return None;
    }
    let name = value.get("name")?.as_str()?.to_string();
    let namespace = if kind.is_namespaced() {
        Some(value.get("namespace")?.as_str()?.to_string())
    } else {
        None
    };
    Some(ObjectKey {
        kind,
        namespace,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::OWNER_LABEL;
    use crate::testing::FakeCluster;
    use pkg_types::rbac::{PolicyRule, Subject};
    use pkg_types::remote::{ClusterRole, ClusterRoleBinding, RoleBinding, RoleRef};
    use std::collections::BTreeMap;

    const T: Duration = Duration::from_secs(1);

    fn viewer(verbs: &[&str]) -> ClusterRole {
        ClusterRole {
            name: "viewer".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            rules: vec![PolicyRule {
                api_groups: vec![String::new()],
                resources: vec!["pods".to_string()],
                verbs: verbs.iter().map(|v| v.to_string()).collect(),
            }],
        }
    }

    #[tokio::test]
    async fn test_create_then_noop_then_update() {
        let fake = FakeCluster::new("a");
        assert_eq!(
            create_or_patch(&fake, &viewer(&["get"]), T).await.unwrap(),
            Outcome::Created
        );
        assert_eq!(
            create_or_patch(&fake, &viewer(&["get"]), T).await.unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(fake.writes(), 1);

        assert_eq!(
            create_or_patch(&fake, &viewer(&["get", "list"]), T)
                .await
                .unwrap(),
            Outcome::Updated
        );
        let stored: ClusterRole = fake.object(&ObjectKey::cluster_role("viewer")).unwrap();
        assert_eq!(stored.rules[0].verbs, vec!["get", "list"]);
    }

    #[tokio::test]
    async fn test_patch_preserves_foreign_fields() {
        let fake = FakeCluster::new("a");
        let mut foreign = viewer(&["*"]);
        foreign
            .annotations
            .insert("owner".to_string(), "someone-else".to_string());
        fake.insert(&foreign);

        create_or_patch(&fake, &viewer(&["get"]), T).await.unwrap();
        let stored: ClusterRole = fake.object(&ObjectKey::cluster_role("viewer")).unwrap();
        assert_eq!(stored.rules[0].verbs, vec!["get"]);
        assert_eq!(stored.annotations["owner"], "someone-else");
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let fake = FakeCluster::new("a");
        let key = ObjectKey::cluster_role_binding("viewers");
        assert!(!delete_if_present(&fake, &key, T).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_owned_spares_other_owners() {
        let fake = FakeCluster::new("a");
        let crb = |owner: Option<&str>| ClusterRoleBinding {
            name: "viewers".to_string(),
            labels: owner
                .map(|o| BTreeMap::from([(OWNER_LABEL.to_string(), o.to_string())]))
                .unwrap_or_default(),
            annotations: BTreeMap::new(),
            role_ref: RoleRef::cluster_role("viewer"),
            subjects: vec![Subject::group("g")],
        };
        let key = ObjectKey::cluster_role_binding("viewers");

        fake.insert(&crb(Some("fleet.viewers")));
        assert_eq!(
            delete_owned(&fake, &key, OWNER_LABEL, "other.viewers", T)
                .await
                .unwrap(),
            Removal::OwnedBy("fleet.viewers".to_string())
        );
        assert!(fake.contains(&key));
        assert_eq!(
            delete_owned(&fake, &key, OWNER_LABEL, "fleet.viewers", T)
                .await
                .unwrap(),
            Removal::Deleted
        );
        assert_eq!(
            delete_owned(&fake, &key, OWNER_LABEL, "fleet.viewers", T)
                .await
                .unwrap(),
            Removal::Absent
        );

        // Unlabelled objects go by name.
        fake.insert(&crb(None));
        assert_eq!(
            delete_owned(&fake, &key, OWNER_LABEL, "fleet.viewers", T)
                .await
                .unwrap(),
            Removal::Deleted
        );
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let fake = FakeCluster::new("slow");
        fake.set_delay(Duration::from_secs(5));
        let err = create_or_patch(&fake, &viewer(&["get"]), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_stale_bindings_are_owner_scoped() {
        let fake = FakeCluster::new("a");
        let binding = |ns: &str, owner: &str| RoleBinding {
            name: "viewers".to_string(),
            namespace: ns.to_string(),
            labels: BTreeMap::from([(OWNER_LABEL.to_string(), owner.to_string())]),
            annotations: BTreeMap::new(),
            role_ref: RoleRef::cluster_role("viewer"),
            subjects: vec![Subject::group("g")],
        };
        fake.insert(&binding("app-a", "fleet.viewers"));
        fake.insert(&binding("app-old", "fleet.viewers"));
        fake.insert(&binding("app-x", "other.viewers"));

        let keep = vec![ObjectKey::role_binding("app-a", "viewers")];
        let stale = stale_bindings(&fake, OWNER_LABEL, "fleet.viewers", &keep, T)
            .await
            .unwrap();
        assert_eq!(stale, vec![ObjectKey::role_binding("app-old", "viewers")]);
    }
}
