use serde::{Deserialize, Serialize};

/// Server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 6443
/// data-dir: /var/lib/rbacfleet/data
/// token: my-secret-token
/// workers: 4
/// resync-interval-secs: 300
/// retry-interval-secs: 30
/// remote-timeout-secs: 10
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Concurrent RoleBinding reconcile workers.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "retry-interval-secs")]
    pub retry_interval_secs: Option<u64>,
    /// Deadline for each call against a member cluster.
    #[serde(default, alias = "remote-timeout-secs")]
    pub remote_timeout_secs: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
