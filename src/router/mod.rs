//! Traffic routers
//!
//! Each backend family implements [`Router`] and translates a [`Weights`]
//! split into its own route object. Routers are built once by
//! [`RouterFactory`] and are stateless apart from their cluster clients.

use crate::cluster::ApiError;
use crate::crd::Canary;
use async_trait::async_trait;
use thiserror::Error;

pub mod affinity;
pub mod apisix;
pub mod appmesh;
pub mod contour;
pub mod converge;
pub mod diff;
pub mod factory;
pub mod gateway_api;
pub mod gloo;
pub mod ingress;
pub mod istio;
pub mod knative;
pub mod kubernetes;
pub mod kuma;
pub mod matching;
pub mod metadata;
pub mod nop;
pub mod skipper;
pub mod smi;
pub mod traefik;
pub mod weights;

#[cfg(test)]
pub(crate) mod testing;

pub use factory::{Provider, RouterFactory, RouterOptions};
pub use weights::{initial_weights, Weights};

/// Errors returned by router operations
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{action} {kind} {name}.{namespace} failed: {source}")]
    Cluster {
        kind: String,
        name: String,
        namespace: String,
        action: &'static str,
        source: ApiError,
    },

    /// The live object exists but cannot be interpreted
    #[error("{kind} {name}.{namespace}: {reason}")]
    Malformed {
        kind: String,
        name: String,
        namespace: String,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing reference: {0}")]
    MissingReference(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RouterError {
    /// Wrap a cluster error with the object it concerns, for `map_err`
    pub fn cluster<'a>(
        kind: &'a str,
        name: &'a str,
        namespace: &'a str,
        action: &'static str,
    ) -> impl FnOnce(ApiError) -> RouterError + 'a {
        move |source| RouterError::Cluster {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            action,
            source,
        }
    }

    pub fn malformed(kind: &str, name: &str, namespace: &str, reason: impl Into<String>) -> Self {
        RouterError::Malformed {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &str, name: &str, namespace: &str) -> Self {
        Self::malformed(kind, name, namespace, "not found")
    }

    /// Error kind label used in metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouterError::Cluster { source, .. } if source.is_conflict() => "conflict",
            RouterError::Cluster { .. } => "cluster",
            RouterError::Malformed { .. } => "malformed",
            RouterError::InvalidInput(_) => "invalid_input",
            RouterError::MissingReference(_) => "missing_reference",
            RouterError::UnknownProvider(_) => "unknown_provider",
            RouterError::Serialization(_) => "serialization",
        }
    }
}

/// Contract shared by every traffic router
///
/// - `initialize` creates backing objects that carry no weights
/// - `reconcile` converges the route object shape, keeping live weights
/// - `get_routes` reads the live split by destination identity
/// - `set_routes` rewrites only the weighted destinations
/// - `finalize` hands the routing objects back or removes them
#[async_trait]
pub trait Router: Send + Sync {
    fn name(&self) -> &'static str;

    async fn initialize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError>;

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError>;

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError>;

    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError>;
}

/// Namespace of a canary, empty when unset
pub(crate) fn namespace_of(canary: &Canary) -> String {
    kube::ResourceExt::namespace(canary).unwrap_or_default()
}
