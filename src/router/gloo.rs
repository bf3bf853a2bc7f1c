use super::converge::converge;
use super::metadata::{
    filter_metadata, include_labels_by_prefix, owner_references, same_labels_and_annotations,
};
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::gloo::{
    Destination, HeaderMatcher, KubeUpstream, Matcher, MultiDestination, ResourceRef, Route,
    RouteAction, RouteTable, RouteTableSpec, Upstream, UpstreamSpec, WeightedDestination,
};
use crate::crd::Canary;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "RouteTable";
const UPSTREAM_KIND: &str = "Upstream";

/// Gloo Edge router
///
/// Gloo does not always discover the generated Services, so the router
/// creates one Upstream per backing Service and points a RouteTable at them.
pub struct GlooRouter {
    route_tables: Arc<dyn ClusterApi<RouteTable>>,
    upstreams: Arc<dyn ClusterApi<Upstream>>,
    services: Arc<dyn ClusterApi<Service>>,
    options: RouterOptions,
}

impl GlooRouter {
    pub fn new(
        route_tables: Arc<dyn ClusterApi<RouteTable>>,
        upstreams: Arc<dyn ClusterApi<Upstream>>,
        services: Arc<dyn ClusterApi<Service>>,
        options: RouterOptions,
    ) -> Self {
        Self {
            route_tables,
            upstreams,
            services,
            options,
        }
    }

    async fn get_route_table(&self, canary: &Canary) -> Result<RouteTable, RouterError> {
        let apex = canary.service_names().apex;
        let namespace = namespace_of(canary);
        self.route_tables
            .get(&namespace, &apex)
            .await
            .map_err(RouterError::cluster(KIND, &apex, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &apex, &namespace))
    }

    /// Upstream template referenced by `upstreamRef`
    async fn template(&self, canary: &Canary) -> Result<Option<Upstream>, RouterError> {
        let Some(reference) = &canary.spec.upstream_ref else {
            return Ok(None);
        };
        let namespace = reference
            .namespace
            .clone()
            .unwrap_or_else(|| namespace_of(canary));
        let template = self
            .upstreams
            .get(&namespace, &reference.name)
            .await
            .map_err(RouterError::cluster(
                UPSTREAM_KIND,
                &reference.name,
                &namespace,
                "get",
            ))?;
        template.map(Some).ok_or_else(|| {
            RouterError::MissingReference(format!(
                "upstream {}.{} not found",
                reference.name, namespace
            ))
        })
    }

    /// Creates the upstream for `service` unless it already exists
    async fn ensure_upstream(
        &self,
        canary: &Canary,
        name: &str,
        service: &str,
        template: Option<&Upstream>,
    ) -> Result<(), RouterError> {
        let namespace = namespace_of(canary);
        let existing = self
            .upstreams
            .get(&namespace, name)
            .await
            .map_err(RouterError::cluster(UPSTREAM_KIND, name, &namespace, "get"))?;
        if existing.is_some() {
            return Ok(());
        }

        let svc = self
            .services
            .get(&namespace, service)
            .await
            .map_err(RouterError::cluster("Service", service, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found("Service", service, &namespace))?;

        let mut spec = template
            .map(|t| UpstreamSpec {
                kube: None,
                extra: t.spec.extra.clone(),
            })
            .unwrap_or_default();
        spec.kube = Some(KubeUpstream {
            service_name: service.to_string(),
            service_namespace: namespace.clone(),
            service_port: u32::try_from(canary.spec.service.port).unwrap_or_default(),
            selector: svc.spec.and_then(|s| s.selector).unwrap_or_default(),
            extra: BTreeMap::new(),
        });
        let labels = template
            .and_then(|t| t.metadata.labels.as_ref())
            .map(|l| include_labels_by_prefix(l, &self.options.include_label_prefix))
            .filter(|l| !l.is_empty());

        let upstream = Upstream {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.clone()),
                labels,
                owner_references: owner_references(canary, self.options.set_owner_refs),
                ..Default::default()
            },
            spec,
        };
        self.upstreams
            .create(&namespace, &upstream)
            .await
            .map_err(RouterError::cluster(UPSTREAM_KIND, name, &namespace, "create"))?;
        info!(canary = %canary.key(), upstream = %name, "Upstream created");
        Ok(())
    }
}

fn upstream_name(canary: &Canary, side: &str) -> String {
    format!(
        "{}-{}-{}upstream-{}",
        namespace_of(canary),
        canary.service_names().apex,
        side,
        canary.spec.service.port
    )
}

/// Header and method matchers from the analysis matches
fn matchers(canary: &Canary) -> Vec<Matcher> {
    let mut headers = Vec::new();
    let mut methods = Vec::new();
    for m in canary.analysis_matches() {
        for (name, value) in m.headers.iter().flatten() {
            headers.push(match &value.regex {
                Some(regex) => HeaderMatcher {
                    name: name.clone(),
                    value: Some(regex.clone()),
                    regex: Some(true),
                },
                None => HeaderMatcher {
                    name: name.clone(),
                    value: value.exact.clone(),
                    regex: None,
                },
            });
        }
        if let Some(method) = m.method.as_ref().and_then(|s| s.exact.clone()) {
            methods.push(method);
        }
    }
    if headers.is_empty() && methods.is_empty() {
        return Vec::new();
    }
    vec![Matcher {
        headers,
        methods,
        extra: BTreeMap::new(),
    }]
}

fn destination(canary: &Canary, upstream: String, weight: u32) -> WeightedDestination {
    WeightedDestination {
        destination: Destination {
            upstream: ResourceRef {
                name: upstream,
                namespace: namespace_of(canary),
            },
        },
        weight,
    }
}

fn spec(canary: &Canary, weights: Weights) -> RouteTableSpec {
    RouteTableSpec {
        routes: vec![Route {
            matchers: matchers(canary),
            inheritable_path_matchers: Some(true),
            route_action: Some(RouteAction {
                multi: Some(MultiDestination {
                    destinations: vec![
                        destination(canary, upstream_name(canary, "primary"), weights.primary),
                        destination(canary, upstream_name(canary, "canary"), weights.canary),
                    ],
                }),
            }),
            extra: BTreeMap::new(),
        }],
        extra: BTreeMap::new(),
    }
}

fn destinations_mut(spec: &mut RouteTableSpec) -> impl Iterator<Item = &mut WeightedDestination> {
    spec.routes
        .iter_mut()
        .filter_map(|r| r.route_action.as_mut())
        .filter_map(|a| a.multi.as_mut())
        .flat_map(|m| m.destinations.iter_mut())
}

#[async_trait]
impl Router for GlooRouter {
    fn name(&self) -> &'static str {
        "gloo"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let template = self.template(canary).await?;
        self.ensure_upstream(
            canary,
            &upstream_name(canary, "primary"),
            &names.primary,
            template.as_ref(),
        )
        .await?;
        self.ensure_upstream(
            canary,
            &upstream_name(canary, "canary"),
            &names.canary,
            template.as_ref(),
        )
        .await?;

        let metadata = canary.spec.service.apex.clone().unwrap_or_default();
        let desired = RouteTable {
            metadata: ObjectMeta {
                name: Some(names.apex.clone()),
                namespace: Some(namespace_of(canary)),
                labels: Some(metadata.labels.unwrap_or_default()),
                annotations: Some(filter_metadata(metadata.annotations.as_ref())),
                owner_references: owner_references(canary, self.options.set_owner_refs),
                ..Default::default()
            },
            spec: spec(canary, initial_weights(canary)),
        };

        converge(
            self.route_tables.as_ref(),
            &namespace_of(canary),
            &canary.key(),
            desired,
            |live, desired| {
                let mut spec = desired.spec.clone();
                spec.extra = live.spec.extra.clone();

                let mut masked_live = live.spec.clone();
                destinations_mut(&mut masked_live).for_each(|d| d.weight = 0);
                let mut masked_desired = spec.clone();
                destinations_mut(&mut masked_desired).for_each(|d| d.weight = 0);

                if masked_live == masked_desired
                    && same_labels_and_annotations(&live.metadata, &desired.metadata)
                {
                    return Ok(None);
                }

                let mut live_spec = live.spec.clone();
                let live_destinations: Vec<WeightedDestination> =
                    destinations_mut(&mut live_spec).map(|d| d.clone()).collect();
                for d in destinations_mut(&mut spec) {
                    if let Some(l) = live_destinations
                        .iter()
                        .find(|l| l.destination == d.destination)
                    {
                        d.weight = l.weight;
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
        let table = self.get_route_table(canary).await?;

        let destinations = table
            .spec
            .routes
            .first()
            .and_then(|r| r.route_action.as_ref())
            .and_then(|a| a.multi.as_ref())
            .map(|m| m.destinations.as_slice())
            .unwrap_or_default();
        if destinations.len() < 2 {
            return Err(RouterError::malformed(
                KIND,
                &names.apex,
                &namespace,
                "destinations not found",
            ));
        }

        let primary = upstream_name(canary, "primary");
        destinations
            .iter()
            .find(|d| d.destination.upstream.name == primary)
            .map(|d| Weights::from_primary(d.weight))
            .ok_or_else(|| {
                RouterError::malformed(
                    KIND,
                    &names.apex,
                    &namespace,
                    format!("no destination for upstream {}", primary),
                )
            })
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let mut table = self.get_route_table(canary).await?;

        let extra = std::mem::take(&mut table.spec.extra);
        table.spec = spec(canary, weights);
        table.spec.extra = extra;
        self.route_tables
            .replace(&namespace, &names.apex, &table)
            .await
            .map_err(RouterError::cluster(KIND, &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "RouteTable routes updated");
        Ok(())
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "gloo_test.rs"]
mod tests;
