//! Lookup of the Role and Team a RoleBinding references.

use thiserror::Error;

use pkg_constants::state::{ROLES_PREFIX, TEAMS_PREFIX};
use pkg_state::client::StateStore;
use pkg_types::rbac::{Role, RoleBinding, Team};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("role {namespace}/{name} not found")]
    RoleNotFound { namespace: String, name: String },
    #[error("team {namespace}/{name} not found")]
    TeamNotFound { namespace: String, name: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub async fn resolve_role(
    store: &StateStore,
    name: &str,
    namespace: &str,
) -> Result<Role, ResolveError> {
    let key = format!("{}{}/{}", ROLES_PREFIX, namespace, name);
    store
        .get_json(&key)
        .await?
        .ok_or_else(|| ResolveError::RoleNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
}

pub async fn resolve_team(
    store: &StateStore,
    name: &str,
    namespace: &str,
) -> Result<Team, ResolveError> {
    let key = format!("{}{}/{}", TEAMS_PREFIX, namespace, name);
    store
        .get_json(&key)
        .await?
        .ok_or_else(|| ResolveError::TeamNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
}

/// Resolve both references of `rb` inside its own namespace. The Role is
/// checked first.
pub async fn resolve_refs(store: &StateStore, rb: &RoleBinding) -> Result<(Role, Team), ResolveError> {
    let role = resolve_role(store, &rb.spec.role_ref, &rb.namespace).await?;
    let team = resolve_team(store, &rb.spec.team_ref, &rb.namespace).await?;
    Ok((role, team))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{binding, seed_role, seed_team};

    #[tokio::test]
    async fn test_lookups_are_namespace_scoped() {
        let store = StateStore::in_memory().await.unwrap();
        seed_role(&store, "other", "viewer").await;
        seed_team(&store, "fleet", "platform", "g-platform").await;

        let rb = binding("fleet", "viewers", "viewer", "platform", &[]);
        let err = resolve_refs(&store, &rb).await.unwrap_err();
        assert!(matches!(err, ResolveError::RoleNotFound { ref namespace, .. } if namespace == "fleet"));

        seed_role(&store, "fleet", "viewer").await;
        let (role, team) = resolve_refs(&store, &rb).await.unwrap();
        assert_eq!(role.name, "viewer");
        assert_eq!(team.mapped_group, "g-platform");
    }

    #[tokio::test]
    async fn test_missing_team() {
        let store = StateStore::in_memory().await.unwrap();
        seed_role(&store, "fleet", "viewer").await;
        let rb = binding("fleet", "viewers", "viewer", "platform", &[]);
        assert!(matches!(
            resolve_refs(&store, &rb).await,
            Err(ResolveError::TeamNotFound { .. })
        ));
    }
}
