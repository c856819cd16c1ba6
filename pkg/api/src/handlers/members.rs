//! Member-cluster RBAC API under `/apis/rbac/v1`.
//!
//! Lets this server act as a propagation target: the HTTP remote client of
//! another (or the same) fleet server writes ClusterRoles,
//! ClusterRoleBindings and RoleBindings here.

use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use pkg_constants::state::{
    CLUSTERROLEBINDINGS_PREFIX, CLUSTERROLES_PREFIX, RBAC_ROLEBINDINGS_PREFIX,
};
use pkg_types::remote::{ClusterRole, ClusterRoleBinding, RoleBinding};
use pkg_types::validate::validate_name;

use super::{create_object, delete_object, get_object, list_objects, name_mismatch, replace_object};
use crate::AppState;

/// A cluster-scoped member object stored under `<PREFIX><name>`.
pub trait MemberObject: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const PREFIX: &'static str;
    const KIND: &'static str;

    fn name(&self) -> &str;
}

impl MemberObject for ClusterRole {
    const PREFIX: &'static str = CLUSTERROLES_PREFIX;
    const KIND: &'static str = "ClusterRole";

    fn name(&self) -> &str {
        &self.name
    }
}

impl MemberObject for ClusterRoleBinding {
    const PREFIX: &'static str = CLUSTERROLEBINDINGS_PREFIX;
    const KIND: &'static str = "ClusterRoleBinding";

    fn name(&self) -> &str {
        &self.name
    }
}

fn bad_request(e: anyhow::Error) -> Response {
    (StatusCode::BAD_REQUEST, e.to_string()).into_response()
}

// --- Cluster-scoped: ClusterRoles, ClusterRoleBindings ---

pub async fn list_cluster_scoped<T: MemberObject>(State(state): State<AppState>) -> Response {
    list_objects(&state.store, T::PREFIX).await
}

pub async fn create_cluster_scoped<T: MemberObject>(
    State(state): State<AppState>,
    Json(obj): Json<T>,
) -> Response {
    if let Err(e) = validate_name(obj.name()) {
        return bad_request(e);
    }
    let key = format!("{}{}", T::PREFIX, obj.name());
    let what = format!("{} {}", T::KIND, obj.name());
    create_object(&state.store, &key, &obj, &what).await
}

pub async fn get_cluster_scoped<T: MemberObject>(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    get_object(&state.store, &format!("{}{}", T::PREFIX, name)).await
}

pub async fn replace_cluster_scoped<T: MemberObject>(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    Json(obj): Json<T>,
) -> Response {
    if obj.name() != name {
        return name_mismatch(&name, obj.name());
    }
    let what = format!("{} {}", T::KIND, name);
    replace_object(&state.store, &format!("{}{}", T::PREFIX, name), &what, |_: T| obj.clone()).await
}

pub async fn delete_cluster_scoped<T: MemberObject>(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let what = format!("{} {}", T::KIND, name);
    delete_object(&state.store, &format!("{}{}", T::PREFIX, name), &what).await
}

// --- Namespaced: RoleBindings ---

/// Every RoleBinding across all namespaces.
pub async fn list_all_rolebindings(State(state): State<AppState>) -> Response {
    list_objects(&state.store, RBAC_ROLEBINDINGS_PREFIX).await
}

pub async fn list_rolebindings(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> Response {
    list_objects(&state.store, &format!("{}{}/", RBAC_ROLEBINDINGS_PREFIX, ns)).await
}

pub async fn create_rolebinding(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Json(mut obj): Json<RoleBinding>,
) -> Response {
    obj.namespace = ns.clone();
    if let Err(e) = validate_name(&ns).and_then(|_| validate_name(&obj.name)) {
        return bad_request(e);
    }
    let key = format!("{}{}/{}", RBAC_ROLEBINDINGS_PREFIX, ns, obj.name);
    let what = format!("RoleBinding {}/{}", ns, obj.name);
    create_object(&state.store, &key, &obj, &what).await
}

pub async fn get_rolebinding(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> Response {
    get_object(
        &state.store,
        &format!("{}{}/{}", RBAC_ROLEBINDINGS_PREFIX, ns, name),
    )
    .await
}

pub async fn replace_rolebinding(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
    Json(mut obj): Json<RoleBinding>,
) -> Response {
    if obj.name != name {
        return name_mismatch(&name, &obj.name);
    }
    obj.namespace = ns.clone();
    let key = format!("{}{}/{}", RBAC_ROLEBINDINGS_PREFIX, ns, name);
    let what = format!("RoleBinding {}/{}", ns, name);
    replace_object(&state.store, &key, &what, |_: RoleBinding| obj.clone()).await
}

pub async fn delete_rolebinding(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> Response {
    let key = format!("{}{}/{}", RBAC_ROLEBINDINGS_PREFIX, ns, name);
    let what = format!("RoleBinding {}/{}", ns, name);
    delete_object(&state.store, &key, &what).await
}
