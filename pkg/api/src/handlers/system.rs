use axum::{
    Json,
    extract::{Path as AxumPath, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use pkg_constants::state::EVENTS_PREFIX;
use pkg_types::event::Event;

use super::internal_error;
use crate::AppState;

pub async fn healthz() -> &'static str {
    "ok"
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    /// Only events about the object with this name.
    #[serde(default)]
    pub name: Option<String>,
}

/// GET /api/v1/namespaces/{ns}/events, oldest first.
pub async fn list_events(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Query(query): Query<EventQuery>,
) -> Response {
    let prefix = format!("{}{}/", EVENTS_PREFIX, ns);
    match state.store.list_json::<Event>(&prefix).await {
        Ok(mut events) => {
            if let Some(name) = &query.name {
                events.retain(|e| &e.involved_object.name == name);
            }
            events.sort_by_key(|e| e.timestamp);
            (StatusCode::OK, Json(events)).into_response()
        }
        Err(e) => internal_error("Failed to list events", e),
    }
}
