pub mod central;
pub mod members;
pub mod system;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use pkg_state::client::{Mutation, StateStore};

pub(crate) fn internal_error(context: &str, e: anyhow::Error) -> Response {
    warn!("{}: {}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, context.to_string()).into_response()
}

pub(crate) async fn get_object(store: &StateStore, key: &str) -> Response {
    match store.get_json::<Value>(key).await {
        Ok(Some(obj)) => (StatusCode::OK, Json(obj)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error("Failed to read object", e),
    }
}

pub(crate) async fn list_objects(store: &StateStore, prefix: &str) -> Response {
    match store.list_json::<Value>(prefix).await {
        Ok(objs) => (StatusCode::OK, Json(objs)).into_response(),
        Err(e) => internal_error("Failed to list objects", e),
    }
}

/// 201 with the stored object, or 409 if `key` is taken.
pub(crate) async fn create_object<T: Serialize>(
    store: &StateStore,
    key: &str,
    obj: &T,
    what: &str,
) -> Response {
    let data = match serde_json::to_vec(obj) {
        Ok(data) => data,
        Err(e) => return internal_error("Failed to encode object", e.into()),
    };
    match store.compare_and_swap(key, None, Some(&data)).await {
        Ok(true) => {
            info!("Created {}", what);
            (StatusCode::CREATED, Json(obj)).into_response()
        }
        Ok(false) => (StatusCode::CONFLICT, format!("{} already exists", what)).into_response(),
        Err(e) => internal_error("Failed to store object", e),
    }
}

/// 200 with the stored object, or 404 if there is nothing to replace.
/// `next` builds the replacement from the stored copy and runs again if
/// that copy changes before the write lands.
pub(crate) async fn replace_object<T, F>(
    store: &StateStore,
    key: &str,
    what: &str,
    mut next: F,
) -> Response
where
    T: Serialize + DeserializeOwned + Clone,
    F: FnMut(T) -> T,
{
    let replaced = store
        .mutate_json::<T, Option<T>, _>(key, |stored| match stored {
            Some(stored) => {
                let obj = next(stored);
                (Mutation::Put(obj.clone()), Some(obj))
            }
            None => (Mutation::Keep, None),
        })
        .await;
    match replaced {
        Ok(Some(obj)) => {
            info!("Updated {}", what);
            (StatusCode::OK, Json(obj)).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, format!("{} not found", what)).into_response(),
        Err(e) => internal_error("Failed to store object", e),
    }
}

/// 204, or 404 if the object does not exist.
pub(crate) async fn delete_object(store: &StateStore, key: &str, what: &str) -> Response {
    let deleted = store
        .mutate_json::<Value, bool, _>(key, |stored| match stored {
            Some(_) => (Mutation::Delete, true),
            None => (Mutation::Keep, false),
        })
        .await;
    match deleted {
        Ok(true) => {
            info!("Deleted {}", what);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => (StatusCode::NOT_FOUND, format!("{} not found", what)).into_response(),
        Err(e) => internal_error("Failed to delete object", e),
    }
}

pub(crate) fn name_mismatch(path_name: &str, body_name: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!(
            "name in body '{}' does not match name in path '{}'",
            body_name, path_name
        ),
    )
        .into_response()
}
