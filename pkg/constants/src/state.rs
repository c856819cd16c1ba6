//! State store key layout.
//!
//! Central objects live under `/registry/<plural>/<namespace>/<name>`.
//! Objects a member cluster serves to the fleet engine live under the
//! `clusterroles`, `clusterrolebindings` and `rbac-rolebindings` prefixes.

pub const ROLES_PREFIX: &str = "/registry/roles/";
pub const TEAMS_PREFIX: &str = "/registry/teams/";
pub const ROLEBINDINGS_PREFIX: &str = "/registry/rolebindings/";
pub const CLUSTERS_PREFIX: &str = "/registry/clusters/";
pub const SECRETS_PREFIX: &str = "/registry/secrets/";
pub const EVENTS_PREFIX: &str = "/registry/events/";

pub const CLUSTERROLES_PREFIX: &str = "/registry/clusterroles/";
pub const CLUSTERROLEBINDINGS_PREFIX: &str = "/registry/clusterrolebindings/";
pub const RBAC_ROLEBINDINGS_PREFIX: &str = "/registry/rbac-rolebindings/";

/// Stored but never appended to the watch log; nothing reconciles on them.
pub const UNWATCHED_PREFIXES: &[&str] = &[EVENTS_PREFIX];

/// Upper bound on attempts of one optimistic read-modify-write.
pub const MAX_MUTATE_ATTEMPTS: usize = 16;

/// Event series kept per namespace before the least recent is dropped.
pub const MAX_EVENTS_PER_NAMESPACE: usize = 1000;

/// Number of recent mutations kept by the in-memory watch log.
pub const EVENT_LOG_CAPACITY: usize = 4096;
