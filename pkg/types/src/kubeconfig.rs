//! Connection descriptors for member clusters.
//!
//! A descriptor is a kubeconfig document stored base64-encoded in the
//! cluster's Secret. Only the pieces needed to reach the API are read:
//! the server address of the current context, its bearer token and the
//! CA bundle.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::secret::Secret;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("secret {0} has no '{1}' entry")]
    MissingKey(String, String),
    #[error("descriptor is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("descriptor is not valid UTF-8")]
    Utf8,
    #[error("descriptor is not a valid kubeconfig: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("kubeconfig has no usable context")]
    NoContext,
    #[error("kubeconfig context '{0}' not found")]
    UnknownContext(String),
    #[error("kubeconfig cluster '{0}' not found")]
    UnknownCluster(String),
    #[error("kubeconfig user '{0}' not found")]
    UnknownUser(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default, rename = "current-context")]
    pub current_context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub server: String,
    #[serde(default, rename = "certificate-authority-data")]
    pub certificate_authority_data: Option<String>,
    #[serde(default, rename = "insecure-skip-tls-verify")]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: AuthInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthInfo {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRef {
    pub cluster: String,
    pub user: String,
}

/// Everything needed to open a client against one member cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub server: String,
    pub token: Option<String>,
    /// PEM bundle, already base64-decoded.
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
}

impl Kubeconfig {
    pub fn from_yaml(content: &str) -> Result<Self, DescriptorError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Resolve the current context. A kubeconfig without contexts but with
    /// exactly one cluster is accepted as-is (user optional).
    pub fn resolve(&self) -> Result<ConnectionDescriptor, DescriptorError> {
        let (cluster_name, user_name) = match &self.current_context {
            Some(ctx_name) => {
                let ctx = self
                    .contexts
                    .iter()
                    .find(|c| &c.name == ctx_name)
                    .ok_or_else(|| DescriptorError::UnknownContext(ctx_name.clone()))?;
                (ctx.context.cluster.clone(), Some(ctx.context.user.clone()))
            }
            None => match (self.contexts.as_slice(), self.clusters.as_slice()) {
                ([ctx], _) => (ctx.context.cluster.clone(), Some(ctx.context.user.clone())),
                ([], [only]) => (only.name.clone(), self.users.first().map(|u| u.name.clone())),
                _ => return Err(DescriptorError::NoContext),
            },
        };

        let endpoint = self
            .clusters
            .iter()
            .find(|c| c.name == cluster_name)
            .map(|c| &c.cluster)
            .ok_or_else(|| DescriptorError::UnknownCluster(cluster_name.clone()))?;

        let token = match user_name {
            Some(user) => self
                .users
                .iter()
                .find(|u| u.name == user)
                .map(|u| u.user.token.clone())
                .ok_or(DescriptorError::UnknownUser(user))?,
            None => None,
        };

        let ca_pem = endpoint
            .certificate_authority_data
            .as_deref()
            .map(|data| STANDARD.decode(data.trim()))
            .transpose()?;

        Ok(ConnectionDescriptor {
            server: endpoint.server.trim_end_matches('/').to_string(),
            token,
            ca_pem,
            insecure_skip_tls_verify: endpoint.insecure_skip_tls_verify,
        })
    }
}

/// Decode the kubeconfig stored under `key` in a cluster Secret.
pub fn descriptor_from_secret(
    secret: &Secret,
    key: &str,
) -> Result<ConnectionDescriptor, DescriptorError> {
    let encoded = secret
        .data
        .get(key)
        .ok_or_else(|| DescriptorError::MissingKey(secret.name.clone(), key.to_string()))?;
    let raw = STANDARD.decode(encoded.trim())?;
    let text = String::from_utf8(raw).map_err(|_| DescriptorError::Utf8)?;
    Kubeconfig::from_yaml(&text)?.resolve()
}

/// Encode a kubeconfig document the way `descriptor_from_secret` expects it.
pub fn encode_kubeconfig(kubeconfig: &Kubeconfig) -> Result<String, DescriptorError> {
    let yaml = serde_yaml::to_string(kubeconfig)?;
    Ok(STANDARD.encode(yaml))
}

impl Kubeconfig {
    /// Single-context kubeconfig with bearer-token auth.
    pub fn for_token(cluster: &str, server: &str, token: &str) -> Self {
        Self {
            clusters: vec![NamedCluster {
                name: cluster.to_string(),
                cluster: ClusterEndpoint {
                    server: server.to_string(),
                    certificate_authority_data: None,
                    insecure_skip_tls_verify: false,
                },
            }],
            users: vec![NamedUser {
                name: format!("{}-admin", cluster),
                user: AuthInfo {
                    token: Some(token.to_string()),
                },
            }],
            contexts: vec![NamedContext {
                name: cluster.to_string(),
                context: ContextRef {
                    cluster: cluster.to_string(),
                    user: format!("{}-admin", cluster),
                },
            }],
            current_context: Some(cluster.to_string()),
        }
    }
}
