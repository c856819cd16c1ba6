pub mod auth;
pub mod handlers;
pub mod request_id;
pub mod server;

use std::sync::Arc;

use pkg_metrics::MetricsRegistry;
use pkg_state::client::StateStore;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub token: String,
    pub metrics: Arc<MetricsRegistry>,
}
