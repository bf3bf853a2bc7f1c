use super::converge::converge;
use super::metadata::owner_references;
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::apisix::{ApisixRoute, ApisixRouteSpec, Backend, HttpRoute};
use crate::crd::Canary;
use async_trait::async_trait;
use kube::api::ObjectMeta;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "ApisixRoute";
const CANARY_PRIORITY: i32 = 10000;

/// APISIX router
///
/// Clones the user route that targets the apex Service into a
/// high-priority route splitting traffic between primary and canary.
pub struct ApisixRouter {
    routes: Arc<dyn ClusterApi<ApisixRoute>>,
    options: RouterOptions,
}

impl ApisixRouter {
    pub fn new(routes: Arc<dyn ClusterApi<ApisixRoute>>, options: RouterOptions) -> Self {
        Self { routes, options }
    }

    fn route_ref(canary: &Canary) -> Result<&str, RouterError> {
        canary
            .spec
            .route_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                RouterError::MissingReference(format!("canary {} has no routeRef", canary.key()))
            })
    }

    fn canary_route_name(canary: &Canary) -> Result<String, RouterError> {
        Ok(format!(
            "{}-{}-canary",
            Self::route_ref(canary)?,
            canary.service_names().apex
        ))
    }

    async fn get_canary_route(&self, canary: &Canary) -> Result<ApisixRoute, RouterError> {
        let name = Self::canary_route_name(canary)?;
        let namespace = namespace_of(canary);
        self.routes
            .get(&namespace, &name)
            .await
            .map_err(RouterError::cluster(KIND, &name, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &name, &namespace))
    }
}

/// Index of the first http route with a backend named `service`
fn target_route(spec: &ApisixRouteSpec, service: &str) -> Option<usize> {
    spec.http
        .iter()
        .position(|r| r.backends.iter().any(|b| b.service_name == service))
}

fn mask_weights(spec: &mut ApisixRouteSpec) {
    for b in spec.http.iter_mut().flat_map(|r| r.backends.iter_mut()) {
        b.weight = None;
    }
}

fn backend_weight(weight: u32) -> i32 {
    i32::try_from(weight).unwrap_or(i32::MAX)
}

#[async_trait]
impl Router for ApisixRouter {
    fn name(&self) -> &'static str {
        "apisix"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let route_ref = Self::route_ref(canary)?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);

        let user_route = self
            .routes
            .get(&namespace, route_ref)
            .await
            .map_err(RouterError::cluster(KIND, route_ref, &namespace, "get"))?
            .ok_or_else(|| {
                RouterError::MissingReference(format!(
                    "ApisixRoute {}.{} not found",
                    route_ref, namespace
                ))
            })?;

        if user_route.spec.http.is_empty() {
            return Err(RouterError::malformed(
                KIND,
                route_ref,
                &namespace,
                "spec.http is empty",
            ));
        }
        let index = target_route(&user_route.spec, &names.apex).ok_or_else(|| {
            RouterError::malformed(
                KIND,
                route_ref,
                &namespace,
                format!("no http route with backend {}", names.apex),
            )
        })?;
        let mut http: HttpRoute = user_route.spec.http[index].clone();
        if http.backends.len() != 1 {
            return Err(RouterError::malformed(
                KIND,
                route_ref,
                &namespace,
                format!("http route {} must have exactly one backend", http.name),
            ));
        }

        let weights = initial_weights(canary);
        http.priority = CANARY_PRIORITY;
        let primary = &mut http.backends[0];
        primary.service_name = names.primary.clone();
        primary.weight = Some(backend_weight(weights.primary));
        let canary_backend = Backend {
            service_name: names.canary.clone(),
            weight: Some(backend_weight(weights.canary)),
            ..primary.clone()
        };
        http.backends.push(canary_backend);

        let desired = ApisixRoute {
            metadata: ObjectMeta {
                name: Some(Self::canary_route_name(canary)?),
                namespace: Some(namespace.clone()),
                labels: user_route.metadata.labels.clone(),
                annotations: user_route.metadata.annotations.clone(),
                owner_references: owner_references(canary, self.options.set_owner_refs),
                ..Default::default()
            },
            spec: ApisixRouteSpec {
                http: vec![http],
                extra: user_route.spec.extra.clone(),
            },
        };

        converge(
            self.routes.as_ref(),
            &namespace,
            &canary.key(),
            desired,
            |live, desired| {
                let mut masked_live = live.spec.clone();
                mask_weights(&mut masked_live);
                let mut masked_desired = desired.spec.clone();
                mask_weights(&mut masked_desired);
                if masked_live == masked_desired {
                    return Ok(None);
                }

                let mut spec = desired.spec.clone();
                for b in spec.http.iter_mut().flat_map(|r| r.backends.iter_mut()) {
                    let live_weight = live
                        .spec
                        .http
                        .iter()
                        .flat_map(|r| r.backends.iter())
                        .find(|l| l.service_name == b.service_name)
                        .and_then(|l| l.weight);
                    if live_weight.is_some() {
                        b.weight = live_weight;
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

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let names = canary.service_names();
        let route = self.get_canary_route(canary).await?;
        let malformed = |reason: String| {
            RouterError::malformed(
                KIND,
                route.metadata.name.as_deref().unwrap_or_default(),
                &namespace_of(canary),
                reason,
            )
        };

        let index = target_route(&route.spec, &names.primary)
            .ok_or_else(|| malformed(format!("no http route with backend {}", names.primary)))?;
        let primary = route.spec.http[index]
            .backends
            .iter()
            .find(|b| b.service_name == names.primary)
            .and_then(|b| b.weight)
            .ok_or_else(|| malformed(format!("backend {} has no weight", names.primary)))?;
        Ok(Weights::from_primary(
            u32::try_from(primary.clamp(0, 100)).unwrap_or_default(),
        ))
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let name = Self::canary_route_name(canary)?;
        let mut route = self.get_canary_route(canary).await?;

        let index = target_route(&route.spec, &names.primary).ok_or_else(|| {
            RouterError::malformed(
                KIND,
                &name,
                &namespace,
                format!("no http route with backend {}", names.primary),
            )
        })?;
        for b in route.spec.http[index].backends.iter_mut() {
            if b.service_name == names.primary {
                b.weight = Some(backend_weight(weights.primary));
            } else if b.service_name == names.canary {
                b.weight = Some(backend_weight(weights.canary));
            }
        }

        self.routes
            .replace(&namespace, &name, &route)
            .await
            .map_err(RouterError::cluster(KIND, &name, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "ApisixRoute routes updated");
        Ok(())
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "apisix_test.rs"]
mod tests;
