use super::converge::converge;
use super::metadata::{filter_metadata, owner_references};
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::appmesh::{
    Backend, DnsServiceDiscovery, Duration, HeaderMatchMethod, HttpRetryPolicy, HttpRoute,
    HttpRouteAction, HttpRouteHeader, HttpRouteMatch, HttpTimeout, Listener, ListenerTimeout,
    PortMapping, Reference, Route, ServiceDiscovery, VirtualNode, VirtualNodeSpec,
    VirtualRouter, VirtualRouterListener, VirtualRouterProvider, VirtualRouterSpec,
    VirtualService, VirtualServiceBackend, VirtualServiceProvider, VirtualServiceSpec,
    WeightedTarget,
};
use crate::crd::Canary;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const ROUTER_KIND: &str = "VirtualRouter";
const SVC_SUFFIX: &str = "svc.cluster.local.";
const GATEWAY_ANNOTATION_PREFIX: &str = "gateway.appmesh.k8s.aws";
const DEFAULT_RETRY_TIMEOUT_MS: i64 = 250;
const DEFAULT_RETRY_EVENT: &str = "gateway-error";

/// AWS App Mesh router
///
/// Owns two virtual nodes (primary and canary), two virtual routers and the
/// virtual services in front of them. The apex router's first route carries
/// the weighted split; the canary router always sends everything to the
/// canary node.
pub struct AppMeshRouter {
    nodes: Arc<dyn ClusterApi<VirtualNode>>,
    routers: Arc<dyn ClusterApi<VirtualRouter>>,
    services: Arc<dyn ClusterApi<VirtualService>>,
    options: RouterOptions,
}

impl AppMeshRouter {
    pub fn new(
        nodes: Arc<dyn ClusterApi<VirtualNode>>,
        routers: Arc<dyn ClusterApi<VirtualRouter>>,
        services: Arc<dyn ClusterApi<VirtualService>>,
        options: RouterOptions,
    ) -> Self {
        Self {
            nodes,
            routers,
            services,
            options,
        }
    }

    async fn get_router(&self, canary: &Canary) -> Result<VirtualRouter, RouterError> {
        let apex = canary.service_names().apex;
        let namespace = namespace_of(canary);
        self.routers
            .get(&namespace, &apex)
            .await
            .map_err(RouterError::cluster(ROUTER_KIND, &apex, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(ROUTER_KIND, &apex, &namespace))
    }

    async fn reconcile_node(
        &self,
        canary: &Canary,
        name: &str,
        pod_selector: &str,
    ) -> Result<(), RouterError> {
        let namespace = namespace_of(canary);
        let spec = VirtualNodeSpec {
            listeners: vec![Listener {
                port_mapping: port_mapping(canary),
                timeout: route_timeout(canary).map(|http| ListenerTimeout { http: Some(http) }),
            }],
            service_discovery: Some(ServiceDiscovery {
                dns: Some(DnsServiceDiscovery {
                    hostname: format!("{}.{}.{}", name, namespace, SVC_SUFFIX),
                }),
            }),
            pod_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    self.options.selector_label.clone(),
                    pod_selector.to_string(),
                )])),
                ..Default::default()
            }),
            backends: backends(canary),
            ..Default::default()
        };

        let mut desired = VirtualNode::new(name, spec);
        desired.metadata.namespace = Some(namespace.clone());
        desired.metadata.owner_references = owner_references(canary, self.options.set_owner_refs);

        converge(
            self.nodes.as_ref(),
            &namespace,
            &canary.key(),
            desired,
            |live, desired| {
                let mut spec = desired.spec.clone();
                spec.aws_name = live.spec.aws_name.clone();
                spec.mesh_ref = live.spec.mesh_ref.clone();
                spec.extra = live.spec.extra.clone();
                if spec == live.spec {
                    return Ok(None);
                }
                let mut updated = live.clone();
                updated.spec = spec;
                Ok(Some(updated))
            },
        )
        .await?;
        Ok(())
    }

    async fn reconcile_router(
        &self,
        canary: &Canary,
        name: &str,
        routes: Vec<Route>,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), RouterError> {
        let namespace = namespace_of(canary);
        let spec = VirtualRouterSpec {
            listeners: vec![VirtualRouterListener {
                port_mapping: port_mapping(canary),
            }],
            routes,
            ..Default::default()
        };
        let mut desired = VirtualRouter::new(name, spec);
        desired.metadata.namespace = Some(namespace.clone());
        desired.metadata.owner_references = owner_references(canary, self.options.set_owner_refs);

        converge(
            self.routers.as_ref(),
            &namespace,
            &canary.key(),
            desired,
            |live, desired| {
                let mut spec = desired.spec.clone();
                spec.aws_name = live.spec.aws_name.clone();
                spec.mesh_ref = live.spec.mesh_ref.clone();
                spec.extra = live.spec.extra.clone();

                let mut masked_live = live.spec.clone();
                mask_weights(&mut masked_live);
                let mut masked_desired = spec.clone();
                mask_weights(&mut masked_desired);
                if masked_live == masked_desired {
                    return Ok(None);
                }

                carry_weights(&live.spec, &mut spec);
                let mut updated = live.clone();
                updated.spec = spec;
                Ok(Some(updated))
            },
        )
        .await?;

        // the virtual service only points at the router, it is never rewritten
        let mut service = VirtualService::new(
            name,
            VirtualServiceSpec {
                provider: Some(VirtualServiceProvider {
                    virtual_router: Some(VirtualRouterProvider {
                        virtual_router_ref: Some(Reference {
                            name: name.to_string(),
                        }),
                    }),
                }),
                ..Default::default()
            },
        );
        service.metadata.namespace = Some(namespace.clone());
        service.metadata.owner_references = owner_references(canary, self.options.set_owner_refs);
        if !annotations.is_empty() {
            service.metadata.annotations = Some(filter_metadata(Some(&annotations)));
        }
        converge(
            self.services.as_ref(),
            &namespace,
            &canary.key(),
            service,
            |_, _| Ok(None),
        )
        .await?;
        Ok(())
    }
}

fn protocol(canary: &Canary) -> String {
    let grpc = canary
        .spec
        .service
        .port_name
        .as_deref()
        .is_some_and(|p| p.contains("grpc"));
    let protocol = if grpc { "grpc" } else { "http" };
    protocol.to_string()
}

/// Target port when it is numeric, the service port otherwise
fn container_port(canary: &Canary) -> i32 {
    match canary.spec.service.target_port {
        Some(IntOrString::Int(port)) if port > 0 => port,
        _ => canary.spec.service.port,
    }
}

fn port_mapping(canary: &Canary) -> PortMapping {
    PortMapping {
        port: container_port(canary),
        protocol: protocol(canary),
    }
}

/// Parses durations such as `250ms`, `15s` or `1m30s` into milliseconds
fn parse_millis(value: &str) -> Option<i64> {
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }
    let mut total = 0.0;
    while !rest.is_empty() {
        let unit_start = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
        let (number, tail) = rest.split_at(unit_start);
        let number: f64 = number.parse().ok()?;
        let unit_end = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale = match unit {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        total += number * scale;
        rest = tail;
    }
    Some(total as i64)
}

fn route_timeout(canary: &Canary) -> Option<HttpTimeout> {
    let millis = parse_millis(canary.spec.service.timeout.as_deref()?)?;
    Some(HttpTimeout {
        per_request: Some(Duration::millis(millis)),
    })
}

/// One retry on gateway errors within 250ms unless the canary says otherwise
fn retry_policy(canary: &Canary) -> Option<HttpRetryPolicy> {
    let retries = canary.spec.service.retries.as_ref()?;
    let timeout = retries
        .per_try_timeout
        .as_deref()
        .and_then(parse_millis)
        .unwrap_or(DEFAULT_RETRY_TIMEOUT_MS);
    let events = match retries.retry_on.as_deref() {
        Some(on) if !on.is_empty() => on.split(',').map(str::to_string).collect(),
        _ => vec![DEFAULT_RETRY_EVENT.to_string()],
    };
    Some(HttpRetryPolicy {
        max_retries: i64::from(retries.attempts.max(1)),
        per_retry_timeout: Duration::millis(timeout),
        http_retry_events: events,
    })
}

/// App Mesh routes match on a URI prefix only
fn route_prefix(canary: &Canary) -> String {
    canary
        .spec
        .service
        .matches
        .as_deref()
        .and_then(|m| m.first())
        .and_then(|m| m.uri.as_ref())
        .and_then(|uri| uri.prefix.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

fn header_matches(canary: &Canary) -> Vec<HttpRouteHeader> {
    canary
        .analysis_matches()
        .iter()
        .filter_map(|m| m.headers.as_ref())
        .flatten()
        .map(|(name, value)| HttpRouteHeader {
            name: name.clone(),
            matches: Some(HeaderMatchMethod {
                exact: value.exact.clone(),
                prefix: value.prefix.clone(),
                regex: value.regex.clone(),
                suffix: value.suffix.clone(),
            }),
        })
        .collect()
}

fn target(node: &str, weight: u32) -> WeightedTarget {
    WeightedTarget {
        virtual_node_ref: Some(Reference {
            name: node.to_string(),
        }),
        weight: i64::from(weight),
    }
}

/// Canary node first, primary node second
fn targets(canary: &Canary, weights: Weights) -> Vec<WeightedTarget> {
    let names = canary.service_names();
    vec![
        target(&names.canary, weights.canary),
        target(&names.primary, weights.primary),
    ]
}

fn http_route(
    canary: &Canary,
    headers: Vec<HttpRouteHeader>,
    weighted_targets: Vec<WeightedTarget>,
) -> HttpRoute {
    HttpRoute {
        matches: HttpRouteMatch {
            prefix: Some(route_prefix(canary)),
            headers,
        },
        action: HttpRouteAction { weighted_targets },
        retry_policy: retry_policy(canary),
        timeout: route_timeout(canary),
    }
}

/// Routes of the apex router
///
/// With A/B matches the first route only takes matching requests and a
/// lower priority route keeps everyone else on the primary.
fn apex_routes(canary: &Canary) -> Vec<Route> {
    let names = canary.service_names();
    let weights = initial_weights(canary);
    if canary.analysis_matches().is_empty() {
        return vec![Route {
            name: names.apex.clone(),
            priority: None,
            http_route: Some(http_route(canary, Vec::new(), targets(canary, weights))),
        }];
    }
    vec![
        Route {
            name: format!("{}-a", names.apex),
            priority: Some(10),
            http_route: Some(http_route(
                canary,
                header_matches(canary),
                targets(canary, weights),
            )),
        },
        Route {
            name: format!("{}-b", names.apex),
            priority: Some(20),
            http_route: Some(http_route(
                canary,
                Vec::new(),
                vec![target(&names.primary, 100)],
            )),
        },
    ]
}

fn canary_routes(canary: &Canary) -> Vec<Route> {
    vec![Route {
        name: canary.service_names().canary,
        priority: None,
        http_route: Some(http_route(
            canary,
            Vec::new(),
            targets(canary, Weights::new(0, 100)),
        )),
    }]
}

fn backends(canary: &Canary) -> Vec<Backend> {
    canary
        .spec
        .service
        .backends
        .iter()
        .flatten()
        .map(|backend| {
            let virtual_service = if backend.starts_with("arn:aws") {
                VirtualServiceBackend {
                    virtual_service_arn: Some(backend.clone()),
                    virtual_service_ref: None,
                }
            } else {
                VirtualServiceBackend {
                    virtual_service_arn: None,
                    virtual_service_ref: Some(Reference {
                        name: backend.clone(),
                    }),
                }
            };
            Backend { virtual_service }
        })
        .collect()
}

/// Annotations exposing the apex service through an App Mesh gateway
fn gateway_annotations(canary: &Canary) -> BTreeMap<String, String> {
    let hosts = canary.hosts();
    if hosts.is_empty() {
        return BTreeMap::new();
    }
    let service = &canary.spec.service;
    let mut annotations = BTreeMap::from([
        (format!("{}/expose", GATEWAY_ANNOTATION_PREFIX), "true".to_string()),
        (format!("{}/domain", GATEWAY_ANNOTATION_PREFIX), hosts.join(",")),
    ]);
    if let Some(timeout) = service.timeout.as_ref().filter(|t| !t.is_empty()) {
        annotations.insert(format!("{}/timeout", GATEWAY_ANNOTATION_PREFIX), timeout.clone());
    }
    if let Some(retries) = service.retries.as_ref().filter(|r| r.attempts > 0) {
        annotations.insert(
            format!("{}/retries", GATEWAY_ANNOTATION_PREFIX),
            retries.attempts.to_string(),
        );
    }
    annotations
}

fn mask_weights(spec: &mut VirtualRouterSpec) {
    for route in spec.routes.iter_mut() {
        if let Some(http) = route.http_route.as_mut() {
            for t in http.action.weighted_targets.iter_mut() {
                t.weight = 0;
            }
        }
    }
}

/// Copies live target weights onto `spec`, matched by route and node name
fn carry_weights(live: &VirtualRouterSpec, spec: &mut VirtualRouterSpec) {
    for route in spec.routes.iter_mut() {
        let Some(live_http) = live
            .routes
            .iter()
            .find(|r| r.name == route.name)
            .and_then(|r| r.http_route.as_ref())
        else {
            continue;
        };
        let Some(http) = route.http_route.as_mut() else {
            continue;
        };
        for t in http.action.weighted_targets.iter_mut() {
            if let Some(l) = live_http
                .action
                .weighted_targets
                .iter()
                .find(|l| l.virtual_node_ref == t.virtual_node_ref)
            {
                t.weight = l.weight;
            }
        }
    }
}

fn weight_of(targets: &[WeightedTarget], node: &str) -> u32 {
    targets
        .iter()
        .find(|t| t.virtual_node_ref.as_ref().is_some_and(|r| r.name == node))
        .map(|t| u32::try_from(t.weight.clamp(0, 100)).unwrap_or(0))
        .unwrap_or(0)
}

#[async_trait]
impl Router for AppMeshRouter {
    fn name(&self) -> &'static str {
        "appmesh"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let target = &canary.spec.target_ref.name;

        self.reconcile_node(canary, &names.primary, &format!("{}-primary", target))
            .await?;
        self.reconcile_node(canary, &names.canary, target).await?;

        self.reconcile_router(
            canary,
            &names.apex,
            apex_routes(canary),
            gateway_annotations(canary),
        )
        .await?;
        self.reconcile_router(canary, &names.canary, canary_routes(canary), BTreeMap::new())
            .await
    }

    /// Reads the split from the first route of the apex router
    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let router = self.get_router(canary).await?;

        let targets = router
            .spec
            .routes
            .first()
            .and_then(|r| r.http_route.as_ref())
            .map(|h| h.action.weighted_targets.as_slice())
            .filter(|t| t.len() == 2)
            .ok_or_else(|| {
                RouterError::malformed(
                    ROUTER_KIND,
                    &names.apex,
                    &namespace,
                    "first route does not have two weighted targets",
                )
            })?;

        let weights = Weights::new(
            weight_of(targets, &names.primary),
            weight_of(targets, &names.canary),
        );
        if weights.primary == 0 && weights.canary == 0 {
            return Err(RouterError::malformed(
                ROUTER_KIND,
                &names.apex,
                &namespace,
                format!("no routes for {} and {}", names.primary, names.canary),
            ));
        }
        Ok(weights)
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let mut router = self.get_router(canary).await?;

        let http = router
            .spec
            .routes
            .first_mut()
            .and_then(|r| r.http_route.as_mut())
            .ok_or_else(|| {
                RouterError::malformed(ROUTER_KIND, &names.apex, &namespace, "no HTTP route")
            })?;
        http.action = HttpRouteAction {
            weighted_targets: targets(canary, weights),
        };

        self.routers
            .replace(&namespace, &names.apex, &router)
            .await
            .map_err(RouterError::cluster(ROUTER_KIND, &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "VirtualRouter routes updated");
        Ok(())
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "appmesh_test.rs"]
mod tests;
