use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use pkg_constants::network::RBAC_API_PREFIX;
use pkg_types::kubeconfig::ConnectionDescriptor;

use crate::remote::{ObjectKey, RbacKind, RemoteClient, RemoteError};

/// `RemoteClient` speaking to a member cluster's `/apis/rbac/v1` endpoints
/// over HTTP(S) with bearer-token auth.
pub struct HttpRemoteClient {
    http: reqwest::Client,
    server: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpRemoteClient {
    pub fn new(descriptor: &ConnectionDescriptor, timeout: Duration) -> Result<Self, RemoteError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(pem) = &descriptor.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| RemoteError::Descriptor(format!("invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if descriptor.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| RemoteError::Descriptor(e.to_string()))?;
        Ok(Self {
            http,
            server: descriptor.server.trim_end_matches('/').to_string(),
            token: descriptor.token.clone(),
            timeout,
        })
    }

    fn collection_url(&self, kind: RbacKind, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!(
                "{}{}/namespaces/{}/{}",
                self.server,
                RBAC_API_PREFIX,
                ns,
                kind.plural()
            ),
            None => format!("{}{}/{}", self.server, RBAC_API_PREFIX, kind.plural()),
        }
    }

    fn object_url(&self, key: &ObjectKey) -> String {
        format!(
            "{}/{}",
            self.collection_url(key.kind, key.namespace.as_deref()),
            key.name
        )
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, RemoteError> {
        debug!("{} {}", method, url);
        let mut req = self.http.request(method, url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().await.map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transport(e.to_string())
        }
    }

    async fn status_error(resp: reqwest::Response) -> RemoteError {
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        RemoteError::Status { status, message }
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, RemoteError> {
        let resp = self.send(Method::GET, &self.object_url(key), None).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => resp
                .json()
                .await
                .map(Some)
                .map_err(|e| RemoteError::Decode(e.to_string())),
            _ => Err(Self::status_error(resp).await),
        }
    }

    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<(), RemoteError> {
        let url = self.collection_url(key.kind, key.namespace.as_deref());
        let resp = self.send(Method::POST, &url, Some(object)).await?;
        match resp.status() {
            StatusCode::CONFLICT => Err(RemoteError::AlreadyExists(key.clone())),
            s if s.is_success() => Ok(()),
            _ => Err(Self::status_error(resp).await),
        }
    }

    async fn replace(&self, key: &ObjectKey, object: &Value) -> Result<(), RemoteError> {
        let resp = self
            .send(Method::PUT, &self.object_url(key), Some(object))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound(key.clone())),
            s if s.is_success() => Ok(()),
            _ => Err(Self::status_error(resp).await),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), RemoteError> {
        let resp = self
            .send(Method::DELETE, &self.object_url(key), None)
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound(key.clone())),
            s if s.is_success() => Ok(()),
            _ => Err(Self::status_error(resp).await),
        }
    }

    async fn list(&self, kind: RbacKind) -> Result<Vec<Value>, RemoteError> {
        let resp = self
            .send(Method::GET, &self.collection_url(kind, None), None)
            .await?;
        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}
