//! Network-related constants.

/// Default port for the rbacfleet API server.
pub const DEFAULT_API_PORT: u16 = 6443;

/// Default join/bearer token accepted by a freshly started server.
pub const DEFAULT_TOKEN: &str = "demo-token-123";

/// Path prefix of the RBAC API a member cluster serves.
pub const RBAC_API_PREFIX: &str = "/apis/rbac/v1";
