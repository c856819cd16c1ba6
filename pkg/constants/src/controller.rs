//! Fleet RBAC controller constants.

/// Finalizer attached to every RoleBinding the engine has propagated.
pub const ROLEBINDING_FINALIZER: &str = "rbacfleet.io/remote-cleanup";

/// Key inside a cluster's connection Secret that holds the kubeconfig.
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Default number of concurrent reconcile workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default period of the full resync, in seconds.
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// Default delay before a RoleBinding with failed clusters is retried, in seconds.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 30;

/// Default per-request timeout against a member cluster, in seconds.
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;

/// Name reported as the source of recorded events.
pub const CONTROLLER_NAME: &str = "rbacfleet-rolebinding-controller";
