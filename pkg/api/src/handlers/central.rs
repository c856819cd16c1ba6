//! CRUD for the fleet's own objects: Roles, Teams, Clusters, cluster
//! Secrets and RoleBindings, all under `/api/v1/namespaces/{ns}/...`.

use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use pkg_constants::state::{
    CLUSTERS_PREFIX, ROLEBINDINGS_PREFIX, ROLES_PREFIX, SECRETS_PREFIX, TEAMS_PREFIX,
};
use pkg_state::client::Mutation;
use pkg_types::cluster::Cluster;
use pkg_types::rbac::{Role, RoleBinding, Team};
use pkg_types::secret::Secret;
use pkg_types::validate::{validate_name, validate_role_binding};

use super::{
    create_object, delete_object, get_object, internal_error, list_objects, name_mismatch,
    replace_object,
};
use crate::AppState;

/// A namespaced object stored under `<PREFIX><ns>/<name>`.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const PREFIX: &'static str;
    const KIND: &'static str;

    fn name(&self) -> &str;

    fn set_namespace(&mut self, namespace: &str);

    fn validate(&self) -> anyhow::Result<()> {
        validate_name(self.name())
    }

    /// Reset fields only the server may set.
    fn on_create(&mut self) {}

    /// Keep fields only the server may set from the stored copy.
    fn carry_over(&mut self, _stored: &Self) {}
}

fn key<T: Resource>(namespace: &str, name: &str) -> String {
    format!("{}{}/{}", T::PREFIX, namespace, name)
}

impl Resource for Role {
    const PREFIX: &'static str = ROLES_PREFIX;
    const KIND: &'static str = "Role";

    fn name(&self) -> &str {
        &self.name
    }

    fn set_namespace(&mut self, namespace: &str) {
        self.namespace = namespace.to_string();
    }
}

impl Resource for Team {
    const PREFIX: &'static str = TEAMS_PREFIX;
    const KIND: &'static str = "Team";

    fn name(&self) -> &str {
        &self.name
    }

    fn set_namespace(&mut self, namespace: &str) {
        self.namespace = namespace.to_string();
    }

    fn validate(&self) -> anyhow::Result<()> {
        validate_name(&self.name)?;
        if self.mapped_group.trim().is_empty() {
            anyhow::bail!("mappedGroup must not be empty");
        }
        Ok(())
    }
}

impl Resource for Cluster {
    const PREFIX: &'static str = CLUSTERS_PREFIX;
    const KIND: &'static str = "Cluster";

    fn name(&self) -> &str {
        &self.name
    }

    fn set_namespace(&mut self, namespace: &str) {
        self.namespace = namespace.to_string();
    }

    fn on_create(&mut self) {
        self.created_at = Utc::now();
    }

    fn carry_over(&mut self, stored: &Self) {
        self.created_at = stored.created_at;
    }
}

impl Resource for Secret {
    const PREFIX: &'static str = SECRETS_PREFIX;
    const KIND: &'static str = "Secret";

    fn name(&self) -> &str {
        &self.name
    }

    fn set_namespace(&mut self, namespace: &str) {
        self.namespace = namespace.to_string();
    }

    fn on_create(&mut self) {
        self.created_at = Utc::now();
    }

    fn carry_over(&mut self, stored: &Self) {
        self.created_at = stored.created_at;
    }
}

impl Resource for RoleBinding {
    const PREFIX: &'static str = ROLEBINDINGS_PREFIX;
    const KIND: &'static str = "RoleBinding";

    fn name(&self) -> &str {
        &self.name
    }

    fn set_namespace(&mut self, namespace: &str) {
        self.namespace = namespace.to_string();
    }

    fn validate(&self) -> anyhow::Result<()> {
        validate_role_binding(self)
    }

    fn on_create(&mut self) {
        self.finalizers.clear();
        self.deletion_timestamp = None;
        self.created_at = Utc::now();
    }

    fn carry_over(&mut self, stored: &Self) {
        self.finalizers = stored.finalizers.clone();
        self.deletion_timestamp = stored.deletion_timestamp;
        self.created_at = stored.created_at;
    }
}

pub async fn create<T: Resource>(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Json(mut obj): Json<T>,
) -> Response {
    obj.set_namespace(&ns);
    obj.on_create();
    if let Err(e) = validate_name(&ns).and_then(|_| obj.validate()) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    let what = format!("{} {}/{}", T::KIND, ns, obj.name());
    create_object(&state.store, &key::<T>(&ns, obj.name()), &obj, &what).await
}

pub async fn list<T: Resource>(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> Response {
    list_objects(&state.store, &format!("{}{}/", T::PREFIX, ns)).await
}

pub async fn get<T: Resource>(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> Response {
    get_object(&state.store, &key::<T>(&ns, &name)).await
}

pub async fn replace<T: Resource>(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
    Json(mut obj): Json<T>,
) -> Response {
    if obj.name() != name {
        return name_mismatch(&name, obj.name());
    }
    obj.set_namespace(&ns);
    if let Err(e) = obj.validate() {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    let what = format!("{} {}/{}", T::KIND, ns, name);
    replace_object(&state.store, &key::<T>(&ns, &name), &what, |stored: T| {
        let mut next = obj.clone();
        next.carry_over(&stored);
        next
    })
    .await
}

/// Plain delete for objects nothing depends on (Clusters, Secrets).
pub async fn delete<T: Resource>(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> Response {
    let what = format!("{} {}/{}", T::KIND, ns, name);
    delete_object(&state.store, &key::<T>(&ns, &name), &what).await
}

/// Names of the RoleBindings in `ns` for which `refers` holds.
async fn referencing(
    state: &AppState,
    ns: &str,
    refers: impl Fn(&RoleBinding) -> bool,
) -> anyhow::Result<Vec<String>> {
    let bindings: Vec<RoleBinding> = state
        .store
        .list_json(&format!("{}{}/", ROLEBINDINGS_PREFIX, ns))
        .await?;
    Ok(bindings
        .into_iter()
        .filter(|rb| refers(rb))
        .map(|rb| rb.name)
        .collect())
}

fn still_referenced(what: &str, by: &[String]) -> Response {
    (
        StatusCode::CONFLICT,
        format!("{} is referenced by RoleBinding(s): {}", what, by.join(", ")),
    )
        .into_response()
}

/// DELETE of a Role is refused while any RoleBinding in its namespace
/// references it.
pub async fn delete_role(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> Response {
    let what = format!("Role {}/{}", ns, name);
    match referencing(&state, &ns, |rb| rb.spec.role_ref == name).await {
        Ok(by) if !by.is_empty() => still_referenced(&what, &by),
        Ok(_) => delete_object(&state.store, &key::<Role>(&ns, &name), &what).await,
        Err(e) => internal_error("Failed to list RoleBindings", e),
    }
}

/// DELETE of a Team, with the same rule as for Roles.
pub async fn delete_team(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> Response {
    let what = format!("Team {}/{}", ns, name);
    match referencing(&state, &ns, |rb| rb.spec.team_ref == name).await {
        Ok(by) if !by.is_empty() => still_referenced(&what, &by),
        Ok(_) => delete_object(&state.store, &key::<Team>(&ns, &name), &what).await,
        Err(e) => internal_error("Failed to list RoleBindings", e),
    }
}

/// DELETE of a RoleBinding. Without finalizers the object is removed
/// right away (204). With finalizers only `deletion_timestamp` is set and
/// the controller deletes it after teardown (202).
pub async fn delete_rolebinding(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> Response {
    let key = key::<RoleBinding>(&ns, &name);
    let what = format!("RoleBinding {}/{}", ns, name);
    let deletion = state
        .store
        .mutate_json::<RoleBinding, Deletion, _>(&key, |stored| match stored {
            None => (Mutation::Keep, Deletion::Missing),
            Some(rb) if rb.finalizers.is_empty() => (Mutation::Delete, Deletion::Deleted),
            Some(rb) if rb.is_deleting() => (Mutation::Keep, Deletion::Pending(rb, false)),
            Some(mut rb) => {
                rb.deletion_timestamp = Some(Utc::now());
                (Mutation::Put(rb.clone()), Deletion::Pending(rb, true))
            }
        })
        .await;
    match deletion {
        Ok(Deletion::Missing) => {
            (StatusCode::NOT_FOUND, format!("{} not found", what)).into_response()
        }
        Ok(Deletion::Deleted) => {
            info!("Deleted {}", what);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(Deletion::Pending(rb, marked)) => {
            if marked {
                info!(
                    "{} marked for deletion, waiting for finalizers: {}",
                    what,
                    rb.finalizers.join(", ")
                );
            }
            (StatusCode::ACCEPTED, Json(rb)).into_response()
        }
        Err(e) => internal_error("Failed to delete RoleBinding", e),
    }
}

enum Deletion {
    Missing,
    Deleted,
    /// Held by finalizers; true if this request set the deletion timestamp.
    Pending(RoleBinding, bool),
}
