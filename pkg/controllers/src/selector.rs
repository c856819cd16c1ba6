//! Cluster selection for a RoleBinding.

use thiserror::Error;
use tracing::debug;

use pkg_constants::state::CLUSTERS_PREFIX;
use pkg_state::client::StateStore;
use pkg_types::cluster::Cluster;
use pkg_types::rbac::ClusterSelector;
use pkg_types::selector::{LabelSelector, SelectorError};

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("invalid label selector: {0}")]
    Invalid(#[from] SelectorError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Resolve `selector` against the cluster inventory of `namespace`.
///
/// A pinned name that does not exist yields an empty set. Results come in
/// inventory (name) order.
pub async fn select_clusters(
    store: &StateStore,
    selector: &ClusterSelector,
    namespace: &str,
) -> Result<Vec<Cluster>, SelectError> {
    if let Some(name) = &selector.name {
        let key = format!("{}{}/{}", CLUSTERS_PREFIX, namespace, name);
        let found: Option<Cluster> = store.get_json(&key).await?;
        if found.is_none() {
            debug!("Pinned cluster {}/{} not found", namespace, name);
        }
        return Ok(found
            .into_iter()
            .filter(|c| !selector.exclude.contains(&c.name))
            .collect());
    }

    let query: LabelSelector = selector
        .label_selector
        .as_deref()
        .unwrap_or_default()
        .parse()?;
    let inventory: Vec<Cluster> = store
        .list_json(&format!("{}{}/", CLUSTERS_PREFIX, namespace))
        .await?;
    Ok(filter_clusters(inventory, &query, &selector.exclude))
}

/// Keep clusters matching `query` whose name is not excluded.
pub fn filter_clusters(
    inventory: Vec<Cluster>,
    query: &LabelSelector,
    exclude: &[String],
) -> Vec<Cluster> {
    inventory
        .into_iter()
        .filter(|c| query.matches(&c.labels) && !exclude.contains(&c.name))
        .collect()
}
