use super::converge::converge;
use super::metadata::{filter_metadata, owner_references};
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::canary::HttpMatchRequest;
use crate::crd::contour::{
    HTTPProxy, HTTPProxySpec, HeaderMatchCondition, HeaderValue, HeadersPolicy, MatchCondition,
    RetryPolicy, Route, Service, TimeoutPolicy,
};
use crate::crd::Canary;
use async_trait::async_trait;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "HTTPProxy";
const DST_OVERRIDE_HEADER: &str = "l5d-dst-override";
const IDLE_TIMEOUT: &str = "5m";

/// Contour HTTPProxy router
pub struct ContourRouter {
    proxies: Arc<dyn ClusterApi<HTTPProxy>>,
    options: RouterOptions,
}

impl ContourRouter {
    pub fn new(proxies: Arc<dyn ClusterApi<HTTPProxy>>, options: RouterOptions) -> Self {
        Self { proxies, options }
    }

    async fn get_proxy(&self, canary: &Canary) -> Result<HTTPProxy, RouterError> {
        let apex = canary.service_names().apex;
        let namespace = namespace_of(canary);
        self.proxies
            .get(&namespace, &apex)
            .await
            .map_err(RouterError::cluster(KIND, &apex, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &apex, &namespace))
    }

    fn annotations(&self, canary: &Canary) -> BTreeMap<String, String> {
        let mut annotations = canary
            .spec
            .service
            .apex
            .as_ref()
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default();
        if let Some(class) = &self.options.ingress_class {
            annotations.insert("projectcontour.io/ingress.class".to_string(), class.clone());
            annotations.insert("kubernetes.io/ingress.class".to_string(), class.clone());
        }
        filter_metadata(Some(&annotations))
    }
}

/// Route prefix, taken from the first service match
fn prefix(canary: &Canary) -> String {
    canary
        .service_matches()
        .first()
        .and_then(|m| m.uri.as_ref())
        .and_then(|u| u.prefix.clone())
        .unwrap_or_else(|| "/".to_string())
}

/// One condition per analysis header, exact or contains; HTTPProxy has
/// no regex header match
fn header_conditions(
    prefix: &str,
    matches: &[HttpMatchRequest],
) -> Result<Vec<MatchCondition>, RouterError> {
    let mut conditions = Vec::new();
    for m in matches {
        for (name, value) in m.headers.iter().flatten() {
            let mut header = HeaderMatchCondition {
                name: name.clone(),
                ..Default::default()
            };
            if let Some(exact) = &value.exact {
                header.exact = Some(exact.clone());
            } else if let Some(contains) = value.suffix.as_ref().or(value.prefix.as_ref()) {
                header.contains = Some(contains.clone());
            } else {
                return Err(RouterError::InvalidInput(format!(
                    "HTTPProxy cannot match header {} on {:?}",
                    name, value
                )));
            }
            conditions.push(MatchCondition {
                prefix: Some(prefix.to_string()),
                header: Some(header),
            });
        }
    }
    if conditions.is_empty() {
        return Err(RouterError::InvalidInput(
            "HTTPProxy A/B routing needs at least one header match".to_string(),
        ));
    }
    Ok(conditions)
}

fn service(canary: &Canary, name: &str, weight: u32) -> Service {
    let port = canary.spec.service.port;
    Service {
        name: name.to_string(),
        port,
        weight: i64::from(weight),
        request_headers_policy: Some(HeadersPolicy {
            set: vec![HeaderValue {
                name: DST_OVERRIDE_HEADER.to_string(),
                value: format!(
                    "{}.{}.svc.cluster.local:{}",
                    name,
                    namespace_of(canary),
                    port
                ),
            }],
            remove: Vec::new(),
        }),
        extra: BTreeMap::new(),
    }
}

fn route(canary: &Canary, conditions: Vec<MatchCondition>, weights: Weights) -> Route {
    let names = canary.service_names();
    let svc = &canary.spec.service;
    Route {
        conditions,
        services: vec![
            service(canary, &names.primary, weights.primary),
            service(canary, &names.canary, weights.canary),
        ],
        timeout_policy: svc.timeout.as_ref().map(|t| TimeoutPolicy {
            response: Some(t.clone()),
            idle: Some(IDLE_TIMEOUT.to_string()),
        }),
        retry_policy: svc.retries.as_ref().map(|r| RetryPolicy {
            count: i64::from(r.attempts),
            per_try_timeout: r.per_try_timeout.clone(),
        }),
        extra: BTreeMap::new(),
    }
}

/// Routes for a split; A/B puts the header route first and pins the
/// fallback route to the primary
fn routes(canary: &Canary, weights: Weights) -> Result<Vec<Route>, RouterError> {
    let prefix = prefix(canary);
    let prefix_only = vec![MatchCondition {
        prefix: Some(prefix.clone()),
        header: None,
    }];
    let analysis = canary.analysis_matches();
    if analysis.is_empty() {
        return Ok(vec![route(canary, prefix_only, weights)]);
    }
    Ok(vec![
        route(canary, header_conditions(&prefix, analysis)?, weights),
        route(canary, prefix_only, Weights::new(100, 0)),
    ])
}

fn mask_weights(spec: &mut HTTPProxySpec) {
    for s in spec.routes.iter_mut().flat_map(|r| r.services.iter_mut()) {
        s.weight = 0;
    }
}

/// Copies route-level and spec-level fields contour or users added
fn keep_unmanaged(spec: &mut HTTPProxySpec, live: &HTTPProxySpec) {
    spec.extra = live.extra.clone();
    for (route, live_route) in spec.routes.iter_mut().zip(&live.routes) {
        route.extra = live_route.extra.clone();
    }
}

#[async_trait]
impl Router for ContourRouter {
    fn name(&self) -> &'static str {
        "contour"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let desired = HTTPProxy {
            metadata: ObjectMeta {
                name: Some(names.apex.clone()),
                namespace: Some(namespace_of(canary)),
                annotations: Some(self.annotations(canary)),
                owner_references: owner_references(canary, self.options.set_owner_refs),
                ..Default::default()
            },
            spec: HTTPProxySpec {
                routes: routes(canary, initial_weights(canary))?,
                extra: BTreeMap::new(),
            },
        };

        converge(
            self.proxies.as_ref(),
            &namespace_of(canary),
            &canary.key(),
            desired,
            |live, desired| {
                let mut spec = desired.spec.clone();
                keep_unmanaged(&mut spec, &live.spec);

                let mut masked_live = live.spec.clone();
                mask_weights(&mut masked_live);
                let mut masked_desired = spec.clone();
                mask_weights(&mut masked_desired);
                if masked_live == masked_desired {
                    return Ok(None);
                }

                // weights follow the service name of each route position
                for (route, live_route) in spec.routes.iter_mut().zip(&live.spec.routes) {
                    for s in route.services.iter_mut() {
                        if let Some(l) = live_route.services.iter().find(|l| l.name == s.name) {
                            s.weight = l.weight;
                        }
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
        let namespace = namespace_of(canary);
        let proxy = self.get_proxy(canary).await?;

        let services = proxy
            .spec
            .routes
            .first()
            .map(|r| r.services.as_slice())
            .unwrap_or_default();
        if services.len() < 2 {
            return Err(RouterError::malformed(
                KIND,
                &names.apex,
                &namespace,
                "first route has fewer than two services",
            ));
        }

        let primary = services
            .iter()
            .find(|s| s.name == names.primary)
            .ok_or_else(|| {
                RouterError::malformed(
                    KIND,
                    &names.apex,
                    &namespace,
                    format!("no service {}", names.primary),
                )
            })?;
        let primary = u32::try_from(primary.weight.clamp(0, 100)).unwrap_or_default();
        Ok(Weights::from_primary(primary))
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let desired = routes(canary, weights)?;
        let mut proxy = self.get_proxy(canary).await?;

        let live = std::mem::replace(&mut proxy.spec.routes, desired);
        for (route, live_route) in proxy.spec.routes.iter_mut().zip(&live) {
            route.extra = live_route.extra.clone();
        }
        self.proxies
            .replace(&namespace, &names.apex, &proxy)
            .await
            .map_err(RouterError::cluster(KIND, &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "HTTPProxy routes updated");
        Ok(())
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "contour_test.rs"]
mod tests;
