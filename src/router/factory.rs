//! Router selection
//!
//! The provider string is parsed once at startup. Canaries may override it,
//! in which case the override is parsed per reconcile and rejected the same
//! way.

use super::apisix::ApisixRouter;
use super::appmesh::AppMeshRouter;
use super::contour::ContourRouter;
use super::gateway_api::GatewayApiRouter;
use super::gloo::GlooRouter;
use super::ingress::IngressRouter;
use super::istio::IstioRouter;
use super::knative::KnativeRouter;
use super::kubernetes::{KubernetesDefaultRouter, KubernetesNoopRouter};
use super::kuma::KumaRouter;
use super::nop::NopRouter;
use super::skipper::SkipperRouter;
use super::smi::SmiRouter;
use super::traefik::TraefikRouter;
use super::{Router, RouterError};
use crate::cluster::{ClusterApi, KubeApi, VersionedApi};
use crate::crd::{smi, Canary};
use k8s_openapi::api::core::v1::ServicePort;
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{self, Debug};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmiVersion {
    V1alpha1,
    V1alpha2,
    V1alpha3,
}

impl SmiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmiVersion::V1alpha1 => "v1alpha1",
            SmiVersion::V1alpha2 => "v1alpha2",
            SmiVersion::V1alpha3 => "v1alpha3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayApiVersion {
    V1beta1,
    V1,
}

impl GatewayApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayApiVersion::V1beta1 => "v1beta1",
            GatewayApiVersion::V1 => "v1",
        }
    }
}

/// Traffic management backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Kubernetes,
    Istio,
    AppMesh,
    Smi { version: SmiVersion, mesh: String },
    Kuma,
    Contour,
    Gloo,
    Traefik,
    Apisix,
    Nginx,
    Skipper,
    Knative,
    GatewayApi(GatewayApiVersion),
}

impl FromStr for Provider {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let provider = match s {
            "kubernetes" => Provider::Kubernetes,
            "istio" => Provider::Istio,
            "appmesh" | "appmesh:v1beta2" => Provider::AppMesh,
            "linkerd" => Provider::Smi {
                version: SmiVersion::V1alpha1,
                mesh: s.to_string(),
            },
            "osm" => Provider::Smi {
                version: SmiVersion::V1alpha2,
                mesh: s.to_string(),
            },
            "kuma" => Provider::Kuma,
            "contour" => Provider::Contour,
            "traefik" => Provider::Traefik,
            "apisix" => Provider::Apisix,
            "nginx" => Provider::Nginx,
            "skipper" => Provider::Skipper,
            "knative" => Provider::Knative,
            "gatewayapi" | "gatewayapi:v1" => Provider::GatewayApi(GatewayApiVersion::V1),
            "gatewayapi:v1beta1" => Provider::GatewayApi(GatewayApiVersion::V1beta1),
            s if s == "gloo" || s.starts_with("gloo:") => Provider::Gloo,
            s if s.starts_with("smi:") => parse_smi(s)?,
            other => return Err(RouterError::UnknownProvider(other.to_string())),
        };
        Ok(provider)
    }
}

// smi:<version>[:<mesh>]
fn parse_smi(s: &str) -> Result<Provider, RouterError> {
    let mut parts = s.splitn(3, ':').skip(1);
    let version = match parts.next() {
        Some("v1alpha1") => SmiVersion::V1alpha1,
        Some("v1alpha2") => SmiVersion::V1alpha2,
        Some("v1alpha3") => SmiVersion::V1alpha3,
        _ => return Err(RouterError::UnknownProvider(s.to_string())),
    };
    let mesh = parts.next().unwrap_or_default().to_string();
    Ok(Provider::Smi { version, mesh })
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Kubernetes => write!(f, "kubernetes"),
            Provider::Istio => write!(f, "istio"),
            Provider::AppMesh => write!(f, "appmesh"),
            Provider::Smi { version, mesh } if mesh.is_empty() => {
                write!(f, "smi:{}", version.as_str())
            }
            Provider::Smi { version, mesh } => write!(f, "smi:{}:{}", version.as_str(), mesh),
            Provider::Kuma => write!(f, "kuma"),
            Provider::Contour => write!(f, "contour"),
            Provider::Gloo => write!(f, "gloo"),
            Provider::Traefik => write!(f, "traefik"),
            Provider::Apisix => write!(f, "apisix"),
            Provider::Nginx => write!(f, "nginx"),
            Provider::Skipper => write!(f, "skipper"),
            Provider::Knative => write!(f, "knative"),
            Provider::GatewayApi(version) => write!(f, "gatewayapi:{}", version.as_str()),
        }
    }
}

/// Settings shared by every router
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub provider: Provider,
    /// Label key the generated Services select on
    pub selector_label: String,
    /// Prefix of flowshift-owned annotations
    pub annotation_prefix: String,
    pub ingress_annotation_prefix: String,
    /// Ingress class stamped on generated Contour proxies
    pub ingress_class: Option<String>,
    pub include_label_prefix: Vec<String>,
    pub extra_ports: Vec<ServicePort>,
    pub set_owner_refs: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            provider: Provider::Kubernetes,
            selector_label: "app".to_string(),
            annotation_prefix: "flowshift.io".to_string(),
            ingress_annotation_prefix: "nginx.ingress.kubernetes.io".to_string(),
            ingress_class: None,
            include_label_prefix: Vec::new(),
            extra_ports: Vec::new(),
            set_owner_refs: true,
        }
    }
}

/// Builds routers over a shared kube client
pub struct RouterFactory {
    client: Client,
    options: RouterOptions,
}

impl RouterFactory {
    pub fn new(client: Client, options: RouterOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Router managing the apex, primary and canary Services
    ///
    /// A Service target is already routable, so it gets a noop router.
    pub fn kubernetes_router(&self, target_kind: &str) -> Box<dyn Router> {
        if target_kind == "Service" {
            return Box::new(KubernetesNoopRouter);
        }
        Box::new(KubernetesDefaultRouter::new(
            self.namespaced(),
            self.options.clone(),
        ))
    }

    /// Traffic router for a canary, honouring its provider override
    pub fn mesh_router(&self, canary: &Canary) -> Result<Box<dyn Router>, RouterError> {
        let provider = match canary.spec.provider.as_deref() {
            Some(p) if !p.is_empty() => p.parse()?,
            _ => self.options.provider.clone(),
        };
        Ok(self.router_for(&provider))
    }

    fn namespaced<K>(&self) -> Arc<dyn ClusterApi<K>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug
            + Send
            + Sync
            + 'static,
    {
        Arc::new(KubeApi::<K>::namespaced(self.client.clone()))
    }

    fn cluster_scoped<K>(&self) -> Arc<dyn ClusterApi<K>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    {
        Arc::new(KubeApi::<K>::cluster(self.client.clone()))
    }

    fn versioned<K>(&self, version: &str) -> Arc<dyn ClusterApi<K>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    {
        Arc::new(VersionedApi::<K>::new(self.client.clone(), version))
    }

    pub fn router_for(&self, provider: &Provider) -> Box<dyn Router> {
        let options = self.options.clone();
        match provider {
            Provider::Kubernetes => Box::new(NopRouter),
            Provider::Istio => Box::new(IstioRouter::new(
                self.namespaced(),
                self.namespaced(),
                options,
            )),
            Provider::AppMesh => Box::new(AppMeshRouter::new(
                self.namespaced(),
                self.namespaced(),
                self.namespaced(),
                options,
            )),
            Provider::Smi { version, mesh } => match version {
                SmiVersion::V1alpha1 => Box::new(SmiRouter::<smi::v1alpha1::TrafficSplit>::new(
                    self.namespaced(),
                    mesh,
                    options,
                )),
                SmiVersion::V1alpha2 => Box::new(SmiRouter::<smi::v1alpha2::TrafficSplit>::new(
                    self.namespaced(),
                    mesh,
                    options,
                )),
                SmiVersion::V1alpha3 => Box::new(SmiRouter::<smi::v1alpha2::TrafficSplit>::new(
                    self.versioned("v1alpha3"),
                    mesh,
                    options,
                )),
            },
            Provider::Kuma => Box::new(KumaRouter::new(
                self.cluster_scoped(),
                options,
            )),
            Provider::Contour => Box::new(ContourRouter::new(
                self.namespaced(),
                options,
            )),
            Provider::Gloo => Box::new(GlooRouter::new(
                self.namespaced(),
                self.namespaced(),
                self.namespaced(),
                options,
            )),
            Provider::Traefik => Box::new(TraefikRouter::new(
                self.namespaced(),
                options,
            )),
            Provider::Apisix => Box::new(ApisixRouter::new(
                self.namespaced(),
                options,
            )),
            Provider::Nginx => Box::new(IngressRouter::new(
                self.namespaced(),
                options,
            )),
            Provider::Skipper => Box::new(SkipperRouter::new(
                self.namespaced(),
                options,
            )),
            Provider::Knative => Box::new(KnativeRouter::new(
                self.namespaced(),
                options,
            )),
            Provider::GatewayApi(GatewayApiVersion::V1) => Box::new(GatewayApiRouter::new(
                self.namespaced(),
                GatewayApiVersion::V1,
                options,
            )),
            Provider::GatewayApi(GatewayApiVersion::V1beta1) => Box::new(GatewayApiRouter::new(
                self.versioned("v1beta1"),
                GatewayApiVersion::V1beta1,
                options,
            )),
        }
    }
}

#[cfg(test)]
#[path = "factory_test.rs"]
mod tests;
