use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::AppState;
use crate::auth::auth_middleware;
use crate::handlers::{central, members, system};
use crate::request_id::request_id_middleware;
use pkg_constants::controller::CONTROLLER_NAME;
use pkg_controllers::engine::RoleBindingEngine;
use pkg_controllers::events::StoreEventRecorder;
use pkg_controllers::index::DependencyIndex;
use pkg_controllers::registry::SecretConnectionRegistry;
use pkg_controllers::rolebinding::RoleBindingController;
use pkg_metrics::MetricsRegistry;
use pkg_state::client::StateStore;
use pkg_types::cluster::Cluster;
use pkg_types::rbac::{Role, RoleBinding, Team};
use pkg_types::remote::{ClusterRole, ClusterRoleBinding};
use pkg_types::secret::Secret;

/// Server configuration passed from the binary's CLI.
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub data_dir: String,
    pub token: String,
    pub workers: usize,
    pub resync_interval: Duration,
    pub retry_interval: Duration,
    pub remote_timeout: Duration,
}

pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let store = StateStore::new(&config.data_dir).await?;
    let metrics = Arc::new(MetricsRegistry::new());

    // Propagation engine + controller
    let registry = Arc::new(SecretConnectionRegistry::new(
        store.clone(),
        config.remote_timeout,
    ));
    let recorder = Arc::new(StoreEventRecorder::new(store.clone(), CONTROLLER_NAME));
    let engine = Arc::new(RoleBindingEngine::new(
        store.clone(),
        registry,
        recorder,
        metrics.clone(),
        config.remote_timeout,
    ));
    let controller = RoleBindingController::new(engine, Arc::new(DependencyIndex::new()))
        .with_workers(config.workers)
        .with_resync_interval(config.resync_interval)
        .with_retry_interval(config.retry_interval)
        .start();

    let state = AppState {
        store: store.clone(),
        token: config.token,
        metrics,
    };
    let app = router(state);

    info!("Starting API server on {}", config.addr);
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    controller.abort();
    store.close().await?;
    Ok(())
}

/// All routes: `/healthz` and `/metrics` are public, everything else needs
/// the bearer token.
pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Central objects
        .route(
            "/api/v1/namespaces/{ns}/roles",
            post(central::create::<Role>).get(central::list::<Role>),
        )
        .route(
            "/api/v1/namespaces/{ns}/roles/{name}",
            get(central::get::<Role>)
                .put(central::replace::<Role>)
                .delete(central::delete_role),
        )
        .route(
            "/api/v1/namespaces/{ns}/teams",
            post(central::create::<Team>).get(central::list::<Team>),
        )
        .route(
            "/api/v1/namespaces/{ns}/teams/{name}",
            get(central::get::<Team>)
                .put(central::replace::<Team>)
                .delete(central::delete_team),
        )
        .route(
            "/api/v1/namespaces/{ns}/clusters",
            post(central::create::<Cluster>).get(central::list::<Cluster>),
        )
        .route(
            "/api/v1/namespaces/{ns}/clusters/{name}",
            get(central::get::<Cluster>)
                .put(central::replace::<Cluster>)
                .delete(central::delete::<Cluster>),
        )
        .route(
            "/api/v1/namespaces/{ns}/secrets",
            post(central::create::<Secret>).get(central::list::<Secret>),
        )
        .route(
            "/api/v1/namespaces/{ns}/secrets/{name}",
            get(central::get::<Secret>)
                .put(central::replace::<Secret>)
                .delete(central::delete::<Secret>),
        )
        .route(
            "/api/v1/namespaces/{ns}/rolebindings",
            post(central::create::<RoleBinding>).get(central::list::<RoleBinding>),
        )
        .route(
            "/api/v1/namespaces/{ns}/rolebindings/{name}",
            get(central::get::<RoleBinding>)
                .put(central::replace::<RoleBinding>)
                .delete(central::delete_rolebinding),
        )
        .route("/api/v1/namespaces/{ns}/events", get(system::list_events))
        // Member-cluster RBAC
        .route(
            "/apis/rbac/v1/clusterroles",
            post(members::create_cluster_scoped::<ClusterRole>)
                .get(members::list_cluster_scoped::<ClusterRole>),
        )
        .route(
            "/apis/rbac/v1/clusterroles/{name}",
            get(members::get_cluster_scoped::<ClusterRole>)
                .put(members::replace_cluster_scoped::<ClusterRole>)
                .delete(members::delete_cluster_scoped::<ClusterRole>),
        )
        .route(
            "/apis/rbac/v1/clusterrolebindings",
            post(members::create_cluster_scoped::<ClusterRoleBinding>)
                .get(members::list_cluster_scoped::<ClusterRoleBinding>),
        )
        .route(
            "/apis/rbac/v1/clusterrolebindings/{name}",
            get(members::get_cluster_scoped::<ClusterRoleBinding>)
                .put(members::replace_cluster_scoped::<ClusterRoleBinding>)
                .delete(members::delete_cluster_scoped::<ClusterRoleBinding>),
        )
        .route(
            "/apis/rbac/v1/rolebindings",
            get(members::list_all_rolebindings),
        )
        .route(
            "/apis/rbac/v1/namespaces/{ns}/rolebindings",
            post(members::create_rolebinding).get(members::list_rolebindings),
        )
        .route(
            "/apis/rbac/v1/namespaces/{ns}/rolebindings/{name}",
            get(members::get_rolebinding)
                .put(members::replace_rolebinding)
                .delete(members::delete_rolebinding),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(system::healthz))
        .route("/metrics", get(system::metrics))
        .merge(api_routes)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_constants::controller::{KUBECONFIG_SECRET_KEY, ROLEBINDING_FINALIZER};
    use pkg_constants::state::{
        CLUSTERROLES_PREFIX, CLUSTERS_PREFIX, RBAC_ROLEBINDINGS_PREFIX, ROLEBINDINGS_PREFIX,
        ROLES_PREFIX, SECRETS_PREFIX, TEAMS_PREFIX,
    };
    use pkg_controllers::converge::create_or_patch;
    use pkg_controllers::engine::RunOutcome;
    use pkg_controllers::events::NoopEventRecorder;
    use pkg_controllers::http::HttpRemoteClient;
    use pkg_controllers::remote::{ObjectKey, RemoteClient, RemoteError};
    use pkg_state::client::Mutation;
    use pkg_types::kubeconfig::{ConnectionDescriptor, Kubeconfig, encode_kubeconfig};
    use pkg_types::rbac::{ClusterSelector, PolicyRule, RoleBindingSpec};
    use pkg_types::remote;
    use reqwest::StatusCode;
    use serde_json::json;
    use std::collections::BTreeMap;

    const TOKEN: &str = "test-token";

    /// Serve the API on an ephemeral port; returns its base URL.
    async fn serve(store: StateStore) -> String {
        let state = AppState {
            store,
            token: TOKEN.to_string(),
            metrics: Arc::new(MetricsRegistry::new()),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(base: &str) -> HttpRemoteClient {
        let descriptor = ConnectionDescriptor {
            server: base.to_string(),
            token: Some(TOKEN.to_string()),
            ca_pem: None,
            insecure_skip_tls_verify: false,
        };
        HttpRemoteClient::new(&descriptor, Duration::from_secs(5)).unwrap()
    }

    fn viewer_role() -> Role {
        Role {
            name: "viewer".to_string(),
            namespace: "fleet".to_string(),
            rules: vec![PolicyRule {
                api_groups: vec![String::new()],
                resources: vec!["pods".to_string()],
                verbs: vec!["get".to_string(), "list".to_string()],
            }],
        }
    }

    #[tokio::test]
    async fn test_requests_need_the_token() {
        let base = serve(StateStore::in_memory().await.unwrap()).await;
        let http = reqwest::Client::new();

        let resp = http
            .get(format!("{}/api/v1/namespaces/fleet/roles", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = http.get(format!("{}/healthz", base)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_role_delete_refused_while_referenced() {
        let store = StateStore::in_memory().await.unwrap();
        let base = serve(store.clone()).await;
        let http = reqwest::Client::new();

        let resp = http
            .post(format!("{}/api/v1/namespaces/fleet/roles", base))
            .bearer_auth(TOKEN)
            .json(&viewer_role())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = http
            .post(format!("{}/api/v1/namespaces/fleet/roles", base))
            .bearer_auth(TOKEN)
            .json(&viewer_role())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = http
            .post(format!("{}/api/v1/namespaces/fleet/rolebindings", base))
            .bearer_auth(TOKEN)
            .json(&json!({
                "name": "viewers",
                "spec": { "roleRef": "viewer", "teamRef": "platform" }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = http
            .delete(format!("{}/api/v1/namespaces/fleet/roles/viewer", base))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(store
            .get(&format!("{}fleet/viewer", ROLES_PREFIX))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_rolebinding_delete_respects_finalizer() {
        let store = StateStore::in_memory().await.unwrap();
        let base = serve(store.clone()).await;
        let http = reqwest::Client::new();
        let key = format!("{}fleet/viewers", ROLEBINDINGS_PREFIX);

        let rb = RoleBinding {
            name: "viewers".to_string(),
            namespace: "fleet".to_string(),
            spec: RoleBindingSpec {
                role_ref: "viewer".to_string(),
                team_ref: "platform".to_string(),
                cluster_selector: ClusterSelector::default(),
                namespaces: vec![],
            },
            finalizers: vec![ROLEBINDING_FINALIZER.to_string()],
            deletion_timestamp: None,
            created_at: chrono::Utc::now(),
        };
        store.put_json(&key, &rb).await.unwrap();

        let url = format!("{}/api/v1/namespaces/fleet/rolebindings/viewers", base);
        let resp = http.delete(&url).bearer_auth(TOKEN).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let stored: RoleBinding = store.get_json(&key).await.unwrap().unwrap();
        assert!(stored.is_deleting());
        assert!(stored.has_finalizer(ROLEBINDING_FINALIZER));

        // A client cannot strip the finalizer through PUT.
        let mut edited = stored.clone();
        edited.finalizers.clear();
        edited.deletion_timestamp = None;
        let resp = http
            .put(&url)
            .bearer_auth(TOKEN)
            .json(&edited)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let stored: RoleBinding = store.get_json(&key).await.unwrap().unwrap();
        assert!(stored.has_finalizer(ROLEBINDING_FINALIZER));
        assert!(stored.is_deleting());

        let mut released = stored;
        released.finalizers.clear();
        store.put_json(&key, &released).await.unwrap();
        let resp = http.delete(&url).bearer_auth(TOKEN).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(store.get(&key).await.unwrap().is_none());
    }

    fn bare_binding() -> RoleBinding {
        RoleBinding {
            name: "viewers".to_string(),
            namespace: "fleet".to_string(),
            spec: RoleBindingSpec {
                role_ref: "viewer".to_string(),
                team_ref: "platform".to_string(),
                cluster_selector: ClusterSelector::default(),
                namespaces: vec![],
            },
            finalizers: vec![],
            deletion_timestamp: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Add `finalizer` the way the controller does; false if the binding is gone.
    async fn attach(store: &StateStore, key: &str, finalizer: &str) -> bool {
        store
            .mutate_json::<RoleBinding, bool, _>(key, |stored| match stored {
                Some(mut rb) => {
                    rb.add_finalizer(finalizer);
                    (Mutation::Put(rb), true)
                }
                None => (Mutation::Keep, false),
            })
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_put_keeps_finalizers_added_meanwhile() {
        let store = StateStore::in_memory().await.unwrap();
        let base = serve(store.clone()).await;
        let key = format!("{}fleet/viewers", ROLEBINDINGS_PREFIX);
        store.put_json(&key, &bare_binding()).await.unwrap();
        let url = format!("{}/api/v1/namespaces/fleet/rolebindings/viewers", base);

        let mut puts = Vec::new();
        for i in 0..8 {
            let url = url.clone();
            let mut edited = bare_binding();
            edited.spec.namespaces = vec![format!("app-{}", i)];
            puts.push(tokio::spawn(async move {
                reqwest::Client::new()
                    .put(&url)
                    .bearer_auth(TOKEN)
                    .json(&edited)
                    .send()
                    .await
                    .unwrap()
                    .status()
            }));
        }
        for i in 0..8 {
            assert!(attach(&store, &key, &format!("example.io/f{}", i)).await);
        }
        for put in puts {
            assert_eq!(put.await.unwrap(), StatusCode::OK);
        }

        let stored: RoleBinding = store.get_json(&key).await.unwrap().unwrap();
        assert_eq!(stored.finalizers.len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_racing_finalizer_never_orphans_it() {
        let store = StateStore::in_memory().await.unwrap();
        let base = serve(store.clone()).await;
        let key = format!("{}fleet/viewers", ROLEBINDINGS_PREFIX);
        let url = format!("{}/api/v1/namespaces/fleet/rolebindings/viewers", base);

        for _ in 0..10 {
            store.put_json(&key, &bare_binding()).await.unwrap();
            let request = tokio::spawn(
                reqwest::Client::new()
                    .delete(url.clone())
                    .bearer_auth(TOKEN)
                    .send(),
            );
            let attached = attach(&store, &key, ROLEBINDING_FINALIZER).await;
            let status = request.await.unwrap().unwrap().status();

            let stored: Option<RoleBinding> = store.get_json(&key).await.unwrap();
            if attached {
                // The finalizer landed first, so the record must survive as deleting.
                assert_eq!(status, StatusCode::ACCEPTED);
                let stored = stored.unwrap();
                assert!(stored.is_deleting());
                assert!(stored.has_finalizer(ROLEBINDING_FINALIZER));
            } else {
                assert_eq!(status, StatusCode::NO_CONTENT);
                assert!(stored.is_none());
            }
            store.delete(&key).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_http_client_maps_member_api_statuses() {
        let base = serve(StateStore::in_memory().await.unwrap()).await;
        let client = client_for(&base);

        let key = ObjectKey::role_binding("app-a", "viewers");
        assert_eq!(client.get(&key).await.unwrap(), None);
        assert!(matches!(
            client.delete(&key).await,
            Err(RemoteError::NotFound(_))
        ));

        let body = serde_json::to_value(remote::RoleBinding {
            name: "viewers".to_string(),
            namespace: "app-a".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            role_ref: remote::RoleRef::cluster_role("viewer"),
            subjects: vec![],
        })
        .unwrap();
        client.create(&key, &body).await.unwrap();
        assert!(matches!(
            client.create(&key, &body).await,
            Err(RemoteError::AlreadyExists(_))
        ));
        assert_eq!(
            client
                .list(pkg_controllers::remote::RbacKind::RoleBinding)
                .await
                .unwrap()
                .len(),
            1
        );

        let outcome = create_or_patch(
            &client,
            &ClusterRole {
                name: "viewer".to_string(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                rules: viewer_role().rules,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome, pkg_controllers::converge::Outcome::Created);
    }

    #[tokio::test]
    async fn test_propagation_to_member_over_http() {
        // Member cluster: a second server with its own store.
        let member_store = StateStore::in_memory().await.unwrap();
        let member = serve(member_store.clone()).await;

        let central = StateStore::in_memory().await.unwrap();
        central
            .put_json(&format!("{}fleet/viewer", ROLES_PREFIX), &viewer_role())
            .await
            .unwrap();
        central
            .put_json(
                &format!("{}fleet/platform", TEAMS_PREFIX),
                &Team {
                    name: "platform".to_string(),
                    namespace: "fleet".to_string(),
                    mapped_group: "g-platform".to_string(),
                },
            )
            .await
            .unwrap();
        central
            .put_json(
                &format!("{}fleet/edge-1", CLUSTERS_PREFIX),
                &Cluster {
                    name: "edge-1".to_string(),
                    namespace: "fleet".to_string(),
                    labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
                    created_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
        let kubeconfig = Kubeconfig::for_token("edge-1", &member, TOKEN);
        central
            .put_json(
                &format!("{}fleet/edge-1", SECRETS_PREFIX),
                &Secret {
                    name: "edge-1".to_string(),
                    namespace: "fleet".to_string(),
                    data: BTreeMap::from([(
                        KUBECONFIG_SECRET_KEY.to_string(),
                        encode_kubeconfig(&kubeconfig).unwrap(),
                    )]),
                    created_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
        let rb = RoleBinding {
            name: "viewers".to_string(),
            namespace: "fleet".to_string(),
            spec: RoleBindingSpec {
                role_ref: "viewer".to_string(),
                team_ref: "platform".to_string(),
                cluster_selector: ClusterSelector {
                    name: None,
                    label_selector: Some("env=prod".to_string()),
                    exclude: vec![],
                },
                namespaces: vec!["app-a".to_string(), "app-b".to_string()],
            },
            finalizers: vec![],
            deletion_timestamp: None,
            created_at: chrono::Utc::now(),
        };
        central
            .put_json(&format!("{}fleet/viewers", ROLEBINDINGS_PREFIX), &rb)
            .await
            .unwrap();

        let engine = RoleBindingEngine::new(
            central.clone(),
            Arc::new(SecretConnectionRegistry::new(
                central.clone(),
                Duration::from_secs(5),
            )),
            Arc::new(NoopEventRecorder),
            Arc::new(MetricsRegistry::new()),
            Duration::from_secs(5),
        );
        let report = engine.reconcile("fleet", "viewers").await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Converged);
        assert!(!report.needs_retry());

        let cr: ClusterRole = member_store
            .get_json(&format!("{}viewer", CLUSTERROLES_PREFIX))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cr.rules, viewer_role().rules);
        let bindings: Vec<remote::RoleBinding> =
            member_store.list_json(RBAC_ROLEBINDINGS_PREFIX).await.unwrap();
        let namespaces: Vec<&str> = bindings.iter().map(|b| b.namespace.as_str()).collect();
        assert_eq!(namespaces, vec!["app-a", "app-b"]);

        // Teardown over the same path.
        let mut deleting: RoleBinding = central
            .get_json(&format!("{}fleet/viewers", ROLEBINDINGS_PREFIX))
            .await
            .unwrap()
            .unwrap();
        deleting.deletion_timestamp = Some(chrono::Utc::now());
        central
            .put_json(&format!("{}fleet/viewers", ROLEBINDINGS_PREFIX), &deleting)
            .await
            .unwrap();
        let report = engine.reconcile("fleet", "viewers").await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Finalized);
        let bindings: Vec<remote::RoleBinding> =
            member_store.list_json(RBAC_ROLEBINDINGS_PREFIX).await.unwrap();
        assert!(bindings.is_empty());
    }
}
