//! ClusterIP Service management
//!
//! Every canary gets an apex Service selecting the primary pods plus
//! dedicated primary and canary Services. Mesh routers build on top of
//! these names.

use super::converge::converge;
use super::metadata::{
    filter_metadata, is_controlled_by_canary, is_owned_by, owner_references, KUBECTL_ANNOTATION,
};
use super::nop::static_weights;
use super::{namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::canary::CustomMetadata;
use crate::crd::Canary;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct KubernetesDefaultRouter {
    services: Arc<dyn ClusterApi<Service>>,
    options: RouterOptions,
}

impl KubernetesDefaultRouter {
    pub fn new(services: Arc<dyn ClusterApi<Service>>, options: RouterOptions) -> Self {
        Self { services, options }
    }

    fn service_ports(&self, canary: &Canary) -> Vec<ServicePort> {
        let service = &canary.spec.service;
        let target_port = match &service.target_port {
            Some(IntOrString::Int(0)) | None => IntOrString::Int(service.port),
            Some(IntOrString::String(s)) if s.is_empty() || s == "0" => {
                IntOrString::Int(service.port)
            }
            Some(port) => port.clone(),
        };

        let mut ports = vec![ServicePort {
            name: Some(
                service
                    .port_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "http".to_string()),
            ),
            protocol: Some("TCP".to_string()),
            port: service.port,
            target_port: Some(target_port),
            app_protocol: service.app_protocol.clone().filter(|p| !p.is_empty()),
            ..Default::default()
        }];
        ports.extend(self.options.extra_ports.iter().cloned());
        ports
    }

    fn desired_service(
        &self,
        canary: &Canary,
        name: &str,
        pod_selector: &str,
        metadata: Option<&CustomMetadata>,
    ) -> Service {
        let mut labels = metadata
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.insert(self.options.selector_label.clone(), name.to_string());
        let annotations = filter_metadata(metadata.and_then(|m| m.annotations.as_ref()));

        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace_of(canary)),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: owner_references(canary, self.options.set_owner_refs),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(BTreeMap::from([(
                    self.options.selector_label.clone(),
                    pod_selector.to_string(),
                )])),
                ports: Some(self.service_ports(canary)),
                ..Default::default()
            }),
            status: None,
        }
    }

    async fn reconcile_service(
        &self,
        canary: &Canary,
        name: &str,
        pod_selector: &str,
        metadata: Option<&CustomMetadata>,
    ) -> Result<(), RouterError> {
        let desired = self.desired_service(canary, name, pod_selector, metadata);
        converge(
            self.services.as_ref(),
            &namespace_of(canary),
            &canary.key(),
            desired,
            |live, desired| Ok(merge_service(live, desired, is_owned_by(&live.metadata, canary))),
        )
        .await?;
        Ok(())
    }

    /// Pod label value selecting the canary workload
    fn label_value(canary: &Canary) -> &str {
        &canary.spec.target_ref.name
    }
}

/// Service update for a live object, `None` when nothing changed
///
/// Ports and selector always follow the desired shape. Labels and
/// annotations are only managed on Services owned by the canary.
fn merge_service(live: &Service, desired: &Service, owned: bool) -> Option<Service> {
    let live_spec = live.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.clone().unwrap_or_default();

    let mut ports = desired_spec.ports.clone().unwrap_or_default();
    for port in ports.iter_mut() {
        let node_port = live_spec
            .ports
            .iter()
            .flatten()
            .find(|p| p.name == port.name && p.node_port.unwrap_or(0) > 0)
            .and_then(|p| p.node_port);
        if node_port.is_some() {
            port.node_port = node_port;
        }
    }

    let mut updated = live.clone();
    let mut changed = false;

    if sorted_ports(&ports) != sorted_ports(live_spec.ports.as_deref().unwrap_or_default())
        || desired_spec.selector != live_spec.selector
    {
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.ports = Some(ports);
        spec.selector = desired_spec.selector.clone();
        changed = true;
    }

    if owned {
        if desired.metadata.annotations.clone().unwrap_or_default()
            != live.metadata.annotations.clone().unwrap_or_default()
        {
            updated.metadata.annotations = desired.metadata.annotations.clone();
            changed = true;
        }
        if desired.metadata.labels != live.metadata.labels {
            updated.metadata.labels = desired.metadata.labels.clone();
            changed = true;
        }
    }

    if !changed {
        return None;
    }
    updated.metadata.annotations = Some(filter_metadata(updated.metadata.annotations.as_ref()));
    Some(updated)
}

fn sorted_ports(ports: &[ServicePort]) -> Vec<ServicePort> {
    let mut sorted = ports.to_vec();
    sorted.sort_by_key(|p| p.port);
    sorted
}

#[async_trait]
impl Router for KubernetesDefaultRouter {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    /// Creates the canary and primary Services
    async fn initialize(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let label = Self::label_value(canary);
        self.reconcile_service(
            canary,
            &names.canary,
            label,
            canary.spec.service.canary.as_ref(),
        )
        .await?;
        self.reconcile_service(
            canary,
            &names.primary,
            &format!("{}-primary", label),
            canary.spec.service.primary.as_ref(),
        )
        .await
    }

    /// Creates or updates the apex Service, selecting the primary pods
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        self.reconcile_service(
            canary,
            &names.apex,
            &format!("{}-primary", Self::label_value(canary)),
            canary.spec.service.apex.as_ref(),
        )
        .await
    }

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        Ok(static_weights(canary))
    }

    async fn set_routes(&self, _canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()
    }

    /// Points a foreign apex Service back at the workload pods
    ///
    /// Services controlled by a Canary are left alone, garbage collection
    /// removes them with their owner.
    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let namespace = namespace_of(canary);

        let Some(live) = self
            .services
            .get(&namespace, &names.apex)
            .await
            .map_err(RouterError::cluster("Service", &names.apex, &namespace, "get"))?
        else {
            debug!(canary = %canary.key(), service = %names.apex, "apex Service absent, nothing to finalize");
            return Ok(());
        };

        if is_controlled_by_canary(&live.metadata) {
            return Ok(());
        }

        let stored = live
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(KUBECTL_ANNOTATION));

        let Some(stored) = stored else {
            return self
                .reconcile_service(canary, &names.apex, Self::label_value(canary), None)
                .await;
        };

        let original: Service = serde_json::from_str(stored).map_err(|e| {
            RouterError::malformed(
                "Service",
                &names.apex,
                &namespace,
                format!("unreadable {} annotation: {}", KUBECTL_ANNOTATION, e),
            )
        })?;
        let mut restored = live.clone();
        restored.spec.get_or_insert_with(Default::default).selector =
            original.spec.and_then(|s| s.selector);
        self.services
            .replace(&namespace, &names.apex, &restored)
            .await
            .map_err(RouterError::cluster("Service", &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), service = %names.apex, "Service selector restored");
        Ok(())
    }
}

/// Router for canaries that target a Service directly
pub struct KubernetesNoopRouter;

#[async_trait]
impl Router for KubernetesNoopRouter {
    fn name(&self) -> &'static str {
        "kubernetes-noop"
    }

    async fn reconcile(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        Ok(static_weights(canary))
    }

    async fn set_routes(&self, _canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "kubernetes_test.rs"]
mod tests;
