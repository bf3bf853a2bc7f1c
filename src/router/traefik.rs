use super::converge::converge;
use super::metadata::{filter_metadata, owner_references, same_labels_and_annotations};
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::traefik::{TraefikService, TraefikServiceSpec, WeightedRoundRobin, WeightedService};
use crate::crd::Canary;
use async_trait::async_trait;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "TraefikService";

/// Traefik weighted round robin router
///
/// The canary entry is only listed while it receives traffic.
pub struct TraefikRouter {
    services: Arc<dyn ClusterApi<TraefikService>>,
    options: RouterOptions,
}

impl TraefikRouter {
    pub fn new(services: Arc<dyn ClusterApi<TraefikService>>, options: RouterOptions) -> Self {
        Self { services, options }
    }

    async fn get_service(&self, canary: &Canary) -> Result<TraefikService, RouterError> {
        let apex = canary.service_names().apex;
        let namespace = namespace_of(canary);
        self.services
            .get(&namespace, &apex)
            .await
            .map_err(RouterError::cluster(KIND, &apex, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &apex, &namespace))
    }
}

fn weighted(canary: &Canary, name: &str, weight: u32) -> WeightedService {
    WeightedService {
        name: name.to_string(),
        namespace: Some(namespace_of(canary)),
        port: canary.spec.service.port,
        weight: Some(weight),
        extra: BTreeMap::new(),
    }
}

/// Weighted list for a split, the canary only listed above 0
fn weighted_list(canary: &Canary, weights: Weights) -> Vec<WeightedService> {
    let names = canary.service_names();
    let mut list = vec![weighted(canary, &names.primary, weights.primary)];
    if weights.canary > 0 {
        list.push(weighted(canary, &names.canary, weights.canary));
    }
    list
}

fn services(spec: &TraefikServiceSpec) -> &[WeightedService] {
    spec.weighted
        .as_ref()
        .map(|w| w.services.as_slice())
        .unwrap_or_default()
}

fn mask_weights(spec: &mut TraefikServiceSpec) {
    for s in spec.weighted.iter_mut().flat_map(|w| w.services.iter_mut()) {
        s.weight = None;
    }
}

#[async_trait]
impl Router for TraefikRouter {
    fn name(&self) -> &'static str {
        "traefik"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let metadata = canary.spec.service.apex.clone().unwrap_or_default();
        let desired = TraefikService {
            metadata: ObjectMeta {
                name: Some(names.apex.clone()),
                namespace: Some(namespace_of(canary)),
                labels: Some(metadata.labels.unwrap_or_default()),
                annotations: Some(filter_metadata(metadata.annotations.as_ref())),
                owner_references: owner_references(canary, self.options.set_owner_refs),
                ..Default::default()
            },
            spec: TraefikServiceSpec {
                weighted: Some(WeightedRoundRobin {
                    services: weighted_list(canary, initial_weights(canary)),
                    extra: BTreeMap::new(),
                }),
                extra: BTreeMap::new(),
            },
        };

        converge(
            self.services.as_ref(),
            &namespace_of(canary),
            &canary.key(),
            desired,
            |live, desired| {
                let mut spec = desired.spec.clone();
                spec.extra = live.spec.extra.clone();
                if let Some(w) = spec.weighted.as_mut() {
                    // listing follows the live split, the initial one only applies on create
                    w.services = vec![weighted(canary, &names.primary, 100)];
                    if let Some(live_w) = &live.spec.weighted {
                        w.extra = live_w.extra.clone();
                        if live_w.services.iter().any(|s| s.name == names.canary) {
                            w.services.push(weighted(canary, &names.canary, 0));
                        }
                    }
                }

                let mut masked_live = live.spec.clone();
                mask_weights(&mut masked_live);
                let mut masked_desired = spec.clone();
                mask_weights(&mut masked_desired);
                if masked_live == masked_desired
                    && same_labels_and_annotations(&live.metadata, &desired.metadata)
                {
                    return Ok(None);
                }

                for s in spec.weighted.iter_mut().flat_map(|w| w.services.iter_mut()) {
                    if let Some(l) = services(&live.spec).iter().find(|l| l.name == s.name) {
                        s.weight = l.weight;
                    }
                }
                let mut updated = live.clone();
                updated.spec = spec;
                updated.metadata.labels = desired.metadata.labels.clone();
                updated.metadata.annotations = desired.metadata.annotations.clone();
                Ok(Some(updated))
            },
        )
        .await?;
        Ok(())
    }

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let service = self.get_service(canary).await?;

        services(&service.spec)
            .iter()
            .find(|s| s.name == names.primary)
            .map(|s| Weights::from_primary(s.weight.unwrap_or_default()))
            .ok_or_else(|| {
                RouterError::malformed(
                    KIND,
                    &names.apex,
                    &namespace,
                    format!("no weighted service {}", names.primary),
                )
            })
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let mut service = self.get_service(canary).await?;

        let list = weighted_list(canary, weights);
        service
            .spec
            .weighted
            .get_or_insert_with(WeightedRoundRobin::default)
            .services = list;

        self.services
            .replace(&namespace, &names.apex, &service)
            .await
            .map_err(RouterError::cluster(KIND, &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "TraefikService routes updated");
        Ok(())
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "traefik_test.rs"]
mod tests;
