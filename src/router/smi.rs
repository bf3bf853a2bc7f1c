//! SMI TrafficSplit router
//!
//! The split lists the canary backend first, then the primary. v1alpha1
//! encodes weights as quantities, later versions as integers; both go
//! through [`TrafficSplitKind`] so the router logic is shared.

use super::converge::converge;
use super::metadata::owner_references;
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::smi::{v1alpha1, v1alpha2};
use crate::crd::Canary;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "TrafficSplit";
const ISTIO_GATEWAYS_ANNOTATION: &str = "VirtualService.v1alpha3.networking.istio.io/spec.gateways";

/// A TrafficSplit version as seen by the router
pub trait TrafficSplitKind: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    fn build(name: &str, service: &str, backends: &[(String, u32)]) -> Self;

    /// Backend services and weights, in order
    fn backends(&self) -> Result<Vec<(String, u32)>, String>;

    fn set_backends(&mut self, backends: &[(String, u32)]);

    fn set_service(&mut self, service: &str);

    /// Spec with weights removed, for comparison
    fn shape(&self) -> (String, Vec<String>);
}

impl TrafficSplitKind for v1alpha1::TrafficSplit {
    fn build(name: &str, service: &str, backends: &[(String, u32)]) -> Self {
        let mut split = Self::new(
            name,
            v1alpha1::TrafficSplitSpec {
                service: service.to_string(),
                backends: Vec::new(),
                extra: BTreeMap::new(),
            },
        );
        split.set_backends(backends);
        split
    }

    fn backends(&self) -> Result<Vec<(String, u32)>, String> {
        self.spec
            .backends
            .iter()
            .map(|b| Ok((b.service.clone(), parse_quantity(&b.weight)?)))
            .collect()
    }

    fn set_backends(&mut self, backends: &[(String, u32)]) {
        self.spec.backends = backends
            .iter()
            .map(|(service, weight)| v1alpha1::TrafficSplitBackend {
                service: service.clone(),
                weight: Quantity(weight.to_string()),
            })
            .collect();
    }

    fn set_service(&mut self, service: &str) {
        self.spec.service = service.to_string();
    }

    fn shape(&self) -> (String, Vec<String>) {
        (
            self.spec.service.clone(),
            self.spec.backends.iter().map(|b| b.service.clone()).collect(),
        )
    }
}

impl TrafficSplitKind for v1alpha2::TrafficSplit {
    fn build(name: &str, service: &str, backends: &[(String, u32)]) -> Self {
        let mut split = Self::new(
            name,
            v1alpha2::TrafficSplitSpec {
                service: service.to_string(),
                backends: Vec::new(),
                extra: BTreeMap::new(),
            },
        );
        split.set_backends(backends);
        split
    }

    fn backends(&self) -> Result<Vec<(String, u32)>, String> {
        self.spec
            .backends
            .iter()
            .map(|b| {
                u32::try_from(b.weight)
                    .map(|w| (b.service.clone(), w))
                    .map_err(|_| format!("negative weight {} for {}", b.weight, b.service))
            })
            .collect()
    }

    fn set_backends(&mut self, backends: &[(String, u32)]) {
        self.spec.backends = backends
            .iter()
            .map(|(service, weight)| v1alpha2::TrafficSplitBackend {
                service: service.clone(),
                weight: i32::try_from(*weight).unwrap_or(i32::MAX),
            })
            .collect();
    }

    fn set_service(&mut self, service: &str) {
        self.spec.service = service.to_string();
    }

    fn shape(&self) -> (String, Vec<String>) {
        (
            self.spec.service.clone(),
            self.spec.backends.iter().map(|b| b.service.clone()).collect(),
        )
    }
}

/// Integer value of a weight quantity, rounded up
///
/// Accepts plain integers and milli values (`600m`).
pub fn parse_quantity(q: &Quantity) -> Result<u32, String> {
    let raw = q.0.trim();
    let invalid = || format!("unsupported weight quantity {:?}", raw);
    match raw.strip_suffix('m') {
        Some(milli) => {
            let milli: u64 = milli.parse().map_err(|_| invalid())?;
            u32::try_from(milli.div_ceil(1000)).map_err(|_| invalid())
        }
        None => raw.parse().map_err(|_| invalid()),
    }
}

pub struct SmiRouter<T: TrafficSplitKind> {
    splits: Arc<dyn ClusterApi<T>>,
    mesh: String,
    options: RouterOptions,
}

impl<T: TrafficSplitKind> SmiRouter<T> {
    pub fn new(splits: Arc<dyn ClusterApi<T>>, mesh: &str, options: RouterOptions) -> Self {
        Self {
            splits,
            mesh: mesh.to_string(),
            options,
        }
    }

    fn annotations(&self, canary: &Canary) -> Result<BTreeMap<String, String>, RouterError> {
        let mut annotations = BTreeMap::new();
        if self.mesh == "istio" && !canary.gateways().is_empty() {
            annotations.insert(
                ISTIO_GATEWAYS_ANNOTATION.to_string(),
                serde_json::to_string(canary.gateways())?,
            );
        }
        Ok(annotations)
    }

    fn backends(canary: &Canary, weights: Weights) -> Vec<(String, u32)> {
        let names = canary.service_names();
        vec![(names.canary, weights.canary), (names.primary, weights.primary)]
    }

    async fn get_split(&self, canary: &Canary) -> Result<T, RouterError> {
        let apex = canary.service_names().apex;
        let namespace = namespace_of(canary);
        self.splits
            .get(&namespace, &apex)
            .await
            .map_err(RouterError::cluster(KIND, &apex, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &apex, &namespace))
    }
}

#[async_trait]
impl<T: TrafficSplitKind> Router for SmiRouter<T> {
    fn name(&self) -> &'static str {
        "smi"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let service = canary
            .hosts()
            .first()
            .cloned()
            .unwrap_or_else(|| names.apex.clone());

        let mut desired = T::build(
            &names.apex,
            &service,
            &Self::backends(canary, initial_weights(canary)),
        );
        let meta = desired.meta_mut();
        meta.namespace = Some(namespace_of(canary));
        meta.annotations = Some(self.annotations(canary)?);
        meta.owner_references = owner_references(canary, self.options.set_owner_refs);

        let namespace = namespace_of(canary);
        converge(
            self.splits.as_ref(),
            &namespace,
            &canary.key(),
            desired,
            |live, desired| {
                if live.shape() == desired.shape() {
                    return Ok(None);
                }
                let live_weights = live.backends().unwrap_or_default();
                let mut backends = desired.backends().unwrap_or_default();
                for (service, weight) in backends.iter_mut() {
                    if let Some((_, w)) = live_weights.iter().find(|(s, _)| s == service) {
                        *weight = *w;
                    }
                }
                let mut updated = live.clone();
                updated.set_service(&desired.shape().0);
                updated.set_backends(&backends);
                Ok(Some(updated))
            },
        )
        .await?;
        Ok(())
    }

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let split = self.get_split(canary).await?;
        let backends = split
            .backends()
            .map_err(|reason| RouterError::malformed(KIND, &names.apex, &namespace, reason))?;

        let mut weights = Weights::default();
        for (service, weight) in backends {
            if service == names.primary {
                weights.primary = weight;
            } else if service == names.canary {
                weights.canary = weight;
            }
        }
        if weights.primary == 0 && weights.canary == 0 {
            return Err(RouterError::malformed(
                KIND,
                &names.apex,
                &namespace,
                format!("no backends for {} and {}", names.primary, names.canary),
            ));
        }
        Ok(weights)
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let mut split = self.get_split(canary).await?;

        split.set_backends(&Self::backends(canary, weights));
        self.splits
            .replace(&namespace, &names.apex, &split)
            .await
            .map_err(RouterError::cluster(KIND, &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "TrafficSplit routes updated");
        Ok(())
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "smi_test.rs"]
mod tests;
