//! Cluster access seam
//!
//! Routers talk to the API server only through [`ClusterApi`], one instance
//! per resource kind. Production code uses [`KubeApi`] or [`VersionedApi`];
//! tests use an in-memory fake that tracks resourceVersions and writes.

use async_trait::async_trait;
use thiserror::Error;

mod live;

#[cfg(test)]
pub mod fake;

pub use live::{KubeApi, VersionedApi};

/// Errors returned by [`ClusterApi`] calls
#[derive(Debug, Error)]
pub enum ApiError {
    /// Stale resourceVersion or an object that already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// Target of a replace disappeared
    #[error("not found: {0}")]
    NotFound(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApiError {
    /// Classify a kube error by HTTP status
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 409 => {
                ApiError::Conflict(response.message.clone())
            }
            kube::Error::Api(response) if response.code == 404 => {
                ApiError::NotFound(response.message.clone())
            }
            other => ApiError::Kube(other),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }
}

/// Typed CRUD over one resource kind
///
/// `get` reports a missing object as `Ok(None)`. `delete` of a missing
/// object succeeds. `replace` must carry the resourceVersion it was read at.
/// Cluster-scoped kinds ignore `namespace`.
#[async_trait]
pub trait ClusterApi<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError>;
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError>;
    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ApiError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError>;
}
