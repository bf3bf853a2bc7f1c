use super::converge::converge;
use super::metadata::{canary_annotation, filter_metadata, owner_references};
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::kuma::{
    Selector, TrafficRoute, TrafficRouteConf, TrafficRouteSpec, TrafficRouteSplit, SERVICE_TAG,
};
use crate::crd::Canary;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "TrafficRoute";
const MESH_ANNOTATION: &str = "kuma.io/mesh";

/// Kuma TrafficRoute router
///
/// TrafficRoutes are cluster scoped, the mesh comes from the canary's
/// `kuma.io/mesh` annotation.
pub struct KumaRouter {
    routes: Arc<dyn ClusterApi<TrafficRoute>>,
    options: RouterOptions,
}

impl KumaRouter {
    pub fn new(routes: Arc<dyn ClusterApi<TrafficRoute>>, options: RouterOptions) -> Self {
        Self { routes, options }
    }

    async fn get_route(&self, canary: &Canary) -> Result<TrafficRoute, RouterError> {
        let apex = canary.service_names().apex;
        let namespace = namespace_of(canary);
        self.routes
            .get(&namespace, &apex)
            .await
            .map_err(RouterError::cluster(KIND, &apex, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &apex, &namespace))
    }
}

/// `<service>_<namespace>_svc_<port>`
fn kuma_service(canary: &Canary, service: &str) -> String {
    format!(
        "{}_{}_svc_{}",
        service,
        namespace_of(canary),
        canary.spec.service.port
    )
}

fn tag(value: String) -> BTreeMap<String, String> {
    BTreeMap::from([(SERVICE_TAG.to_string(), value)])
}

fn split(canary: &Canary, weights: Weights) -> Vec<TrafficRouteSplit> {
    let names = canary.service_names();
    vec![
        TrafficRouteSplit {
            weight: weights.primary,
            destination: tag(kuma_service(canary, &names.primary)),
        },
        TrafficRouteSplit {
            weight: weights.canary,
            destination: tag(kuma_service(canary, &names.canary)),
        },
    ]
}

fn mask_weights(spec: &mut TrafficRouteSpec) {
    for s in spec.conf.split.iter_mut() {
        s.weight = 0;
    }
}

#[async_trait]
impl Router for KumaRouter {
    fn name(&self) -> &'static str {
        "kuma"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let spec = TrafficRouteSpec {
            sources: vec![Selector {
                matches: tag("*".to_string()),
            }],
            destinations: vec![Selector {
                matches: tag(kuma_service(canary, &names.apex)),
            }],
            conf: TrafficRouteConf {
                split: split(canary, initial_weights(canary)),
                extra: BTreeMap::new(),
            },
            extra: BTreeMap::new(),
        };
        let mesh = canary_annotation(canary, MESH_ANNOTATION).unwrap_or("default");

        let metadata = canary.spec.service.apex.clone().unwrap_or_default();
        let annotations = metadata.annotations.unwrap_or_else(|| {
            BTreeMap::from([(
                format!("{}.service.kuma.io", canary.spec.service.port),
                "http".to_string(),
            )])
        });

        let mut desired = TrafficRoute::new(&names.apex, mesh, spec);
        desired.metadata.annotations = Some(filter_metadata(Some(&annotations)));
        desired.metadata.owner_references = owner_references(canary, self.options.set_owner_refs);

        converge(
            self.routes.as_ref(),
            &namespace_of(canary),
            &canary.key(),
            desired,
            |live, desired| {
                let mut masked_live = live.spec.clone();
                mask_weights(&mut masked_live);
                let mut masked_desired = desired.spec.clone();
                masked_desired.extra = live.spec.extra.clone();
                masked_desired.conf.extra = live.spec.conf.extra.clone();
                mask_weights(&mut masked_desired);
                if masked_live == masked_desired {
                    return Ok(None);
                }

                let mut spec = desired.spec.clone();
                spec.extra = live.spec.extra.clone();
                spec.conf.extra = live.spec.conf.extra.clone();
                for s in spec.conf.split.iter_mut() {
                    if let Some(l) = live
                        .spec
                        .conf
                        .split
                        .iter()
                        .find(|l| l.destination == s.destination)
                    {
                        s.weight = l.weight;
                    }
                }
                let mut updated = live.clone();
                updated.spec = spec;
                Ok(Some(updated))
            },
        )
        .await?;
        Ok(())
    }

    /// Reads the primary weight, the canary gets the rest
    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let names = canary.service_names();
        let route = self.get_route(canary).await?;

        let primary = route.spec.conf.split.iter().find(|s| {
            s.destination
                .get(SERVICE_TAG)
                .and_then(|svc| svc.split('_').next())
                == Some(names.primary.as_str())
        });

        match primary {
            Some(s) => Ok(Weights::from_primary(s.weight)),
            None => Err(RouterError::malformed(
                KIND,
                &names.apex,
                &namespace_of(canary),
                format!("no split for {} and {}", names.primary, names.canary),
            )),
        }
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let mut route = self.get_route(canary).await?;

        route.spec.conf.split = split(canary, weights);
        self.routes
            .replace(&namespace, &names.apex, &route)
            .await
            .map_err(RouterError::cluster(KIND, &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "TrafficRoute routes updated");
        Ok(())
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "kuma_test.rs"]
mod tests;
