//! Istio VirtualService router
//!
//! The apex VirtualService carries a weighted rule over the primary and
//! canary hosts. Each host also gets a DestinationRule with the canary's
//! traffic policy.

use super::affinity::{self, Sticky, COOKIE_HEADER, SET_COOKIE_HEADER};
use super::converge::converge;
use super::diff::differs;
use super::matching::merge_match_conditions;
use super::metadata::{
    filter_metadata, is_owned_by, original_configuration_key, owner_references, KUBECTL_ANNOTATION,
};
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::canary::{HeaderOperations, Headers, HttpMatchRequest, StringMatch};
use crate::crd::istio::{
    Destination, DestinationRule, DestinationRuleSpec, HttpRoute, HttpRouteDestination, Percent,
    PortSelector, VirtualService, VirtualServiceSpec,
};
use crate::crd::Canary;
use async_trait::async_trait;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const KIND: &str = "VirtualService";
const MESH_GATEWAY: &str = "mesh";
const STICKY_ROUTE: &str = "sticky-route";

pub struct IstioRouter {
    virtual_services: Arc<dyn ClusterApi<VirtualService>>,
    destination_rules: Arc<dyn ClusterApi<DestinationRule>>,
    options: RouterOptions,
}

impl IstioRouter {
    pub fn new(
        virtual_services: Arc<dyn ClusterApi<VirtualService>>,
        destination_rules: Arc<dyn ClusterApi<DestinationRule>>,
        options: RouterOptions,
    ) -> Self {
        Self {
            virtual_services,
            destination_rules,
            options,
        }
    }

    async fn reconcile_destination_rule(
        &self,
        canary: &Canary,
        host: &str,
    ) -> Result<(), RouterError> {
        let mut desired = DestinationRule::new(
            host,
            DestinationRuleSpec {
                host: host.to_string(),
                traffic_policy: canary.spec.service.traffic_policy.clone(),
                extra: BTreeMap::new(),
            },
        );
        desired.metadata.namespace = Some(namespace_of(canary));
        desired.metadata.owner_references = owner_references(canary, self.options.set_owner_refs);

        converge(
            self.destination_rules.as_ref(),
            &namespace_of(canary),
            &canary.key(),
            desired,
            |live, desired| {
                let mut spec = desired.spec.clone();
                // fields the router does not manage stay as they are
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

    fn desired_virtual_service(&self, canary: &Canary) -> VirtualService {
        let names = canary.service_names();
        let service = &canary.spec.service;

        let (hosts, gateways) = if service.delegation {
            (Vec::new(), Vec::new())
        } else {
            let mut hosts = canary.hosts().to_vec();
            if !hosts.iter().any(|h| *h == names.apex || h == "*") {
                hosts.push(names.apex.clone());
            }
            let mut gateways = canary.gateways().to_vec();
            if gateways.is_empty() {
                gateways.push(MESH_GATEWAY.to_string());
            }
            (hosts, gateways)
        };

        let metadata = service.apex.clone().unwrap_or_default();
        let mut vs = VirtualService::new(
            &names.apex,
            VirtualServiceSpec {
                hosts,
                gateways,
                http: http_routes(canary, initial_weights(canary)),
                extra: BTreeMap::new(),
            },
        );
        vs.metadata = ObjectMeta {
            name: Some(names.apex.clone()),
            namespace: Some(namespace_of(canary)),
            labels: Some(metadata.labels.unwrap_or_default()),
            annotations: Some(filter_metadata(metadata.annotations.as_ref())),
            owner_references: owner_references(canary, self.options.set_owner_refs),
            ..Default::default()
        };
        vs
    }

    async fn reconcile_virtual_service(&self, canary: &Canary) -> Result<(), RouterError> {
        let desired = self.desired_virtual_service(canary);
        let snapshot_key = original_configuration_key(&self.options.annotation_prefix);

        converge(
            self.virtual_services.as_ref(),
            &namespace_of(canary),
            &canary.key(),
            desired,
            |live, desired| merge_virtual_service(live, desired, canary, &snapshot_key),
        )
        .await?;
        Ok(())
    }

    async fn get_virtual_service(&self, canary: &Canary) -> Result<VirtualService, RouterError> {
        let apex = canary.service_names().apex;
        let namespace = namespace_of(canary);
        self.virtual_services
            .get(&namespace, &apex)
            .await
            .map_err(RouterError::cluster(KIND, &apex, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &apex, &namespace))
    }
}

/// Live VirtualService update keeping weights and mirroring
fn merge_virtual_service(
    live: &VirtualService,
    desired: &VirtualService,
    canary: &Canary,
    snapshot_key: &str,
) -> Result<Option<VirtualService>, RouterError> {
    let mut annotations = desired.metadata.annotations.clone().unwrap_or_default();
    let live_annotations = live.metadata.annotations.clone().unwrap_or_default();
    for key in [KUBECTL_ANNOTATION, snapshot_key] {
        if let Some(v) = live_annotations.get(key) {
            annotations.insert(key.to_string(), v.clone());
        }
    }

    let mut spec = desired.spec.clone();
    spec.extra = live.spec.extra.clone();

    let sticky = uses_sticky_route(canary);
    let mut masked_desired = spec.clone();
    mask_weights(&mut masked_desired, sticky);
    let mut masked_live = live.spec.clone();
    mask_weights(&mut masked_live, sticky);

    let spec_changed = differs(&masked_desired, &masked_live)?;
    let labels_changed = desired.metadata.labels.clone().unwrap_or_default()
        != live.metadata.labels.clone().unwrap_or_default();
    let annotations_changed = annotations != live_annotations;

    if !spec_changed && !labels_changed && !annotations_changed {
        return Ok(None);
    }

    if spec_changed
        && !annotations.contains_key(KUBECTL_ANNOTATION)
        && !annotations.contains_key(snapshot_key)
        && !is_owned_by(&live.metadata, canary)
    {
        annotations.insert(snapshot_key.to_string(), serde_json::to_string(&live.spec)?);
    }

    carry_weights(&live.spec, &mut spec, canary, sticky);
    if sticky {
        // set_routes owns the sticky rule
        let live_sticky = live.spec.http.iter().filter(|h| is_sticky(h)).cloned();
        spec.http.splice(0..0, live_sticky);
    }

    let mut updated = live.clone();
    updated.spec = spec;
    updated.metadata.labels = desired.metadata.labels.clone();
    updated.metadata.annotations = Some(annotations);
    Ok(Some(updated))
}

/// Zero the fields `set_routes` owns
fn mask_weights(spec: &mut VirtualServiceSpec, sticky: bool) {
    if sticky {
        spec.http.retain(|h| !is_sticky(h));
    }
    for http in spec.http.iter_mut() {
        http.mirror = None;
        http.mirror_percentage = None;
        for route in http.route.iter_mut() {
            route.weight = 0;
            if sticky {
                route.headers = None;
            }
        }
    }
}

fn is_sticky(http: &HttpRoute) -> bool {
    http.name.as_deref() == Some(STICKY_ROUTE)
}

/// Session affinity applies to weighted splits, A/B rules take precedence
fn uses_sticky_route(canary: &Canary) -> bool {
    canary.session_affinity().is_some() && canary.analysis_matches().is_empty()
}

/// Copy the live split and mirror onto the weighted rule of `spec`
fn carry_weights(
    live: &VirtualServiceSpec,
    spec: &mut VirtualServiceSpec,
    canary: &Canary,
    sticky: bool,
) {
    let names = canary.service_names();
    let Some(live_rule) = weighted_rule(live, &names.canary) else {
        return;
    };
    let Some(rule) = spec.http.first_mut() else {
        return;
    };
    for route in rule.route.iter_mut() {
        if let Some(w) = live_rule
            .route
            .iter()
            .find(|r| r.destination.host == route.destination.host)
        {
            route.weight = w.weight;
            if sticky {
                route.headers = w.headers.clone();
            }
        }
    }
    rule.mirror = live_rule.mirror.clone();
    rule.mirror_percentage = live_rule.mirror_percentage.clone();
}

/// First http rule routing to the canary host, sticky rule excluded
fn weighted_rule<'a>(spec: &'a VirtualServiceSpec, canary_host: &str) -> Option<&'a HttpRoute> {
    spec.http.iter().find(|http| {
        !is_sticky(http)
            && http
                .route
                .iter()
                .any(|r| r.destination.host == canary_host)
    })
}

fn set_cookie_of(headers: Option<&Headers>) -> Option<(String, bool)> {
    headers?
        .response
        .as_ref()?
        .add
        .as_ref()?
        .get(SET_COOKIE_HEADER)
        .and_then(|v| affinity::parse_set_cookie(v))
}

/// Cookie canary responses set and cookie the sticky rule expires
fn live_cookies(spec: &VirtualServiceSpec, canary_host: &str) -> (Option<String>, Option<String>) {
    let active = weighted_rule(spec, canary_host)
        .and_then(|rule| rule.route.iter().find(|r| r.destination.host == canary_host))
        .and_then(|r| set_cookie_of(r.headers.as_ref()))
        .filter(|(_, expired)| !expired)
        .map(|(cookie, _)| cookie);
    let expiring = spec
        .http
        .iter()
        .find(|h| is_sticky(h))
        .and_then(|h| set_cookie_of(h.headers.as_ref()))
        .filter(|(_, expired)| *expired)
        .map(|(cookie, _)| cookie);
    (active, expiring)
}

fn add_set_cookie(headers: &mut Option<Headers>, value: String) {
    headers
        .get_or_insert_with(Headers::default)
        .response
        .get_or_insert_with(HeaderOperations::default)
        .add
        .get_or_insert_with(BTreeMap::new)
        .insert(SET_COOKIE_HEADER.to_string(), value);
}

/// Sticky rule ahead of the weighted one
fn sticky_routes(
    canary: &Canary,
    mut weighted: HttpRoute,
    sticky: Sticky,
    max_age: i64,
) -> Vec<HttpRoute> {
    let names = canary.service_names();
    let mut rule = weighted.clone();
    rule.name = Some(STICKY_ROUTE.to_string());
    rule.mirror = None;
    rule.mirror_percentage = None;

    let cookie_match = |cookie: &str| {
        let matched = HttpMatchRequest {
            headers: Some(BTreeMap::from([(
                COOKIE_HEADER.to_string(),
                StringMatch::regex(affinity::cookie_regex(cookie)),
            )])),
            ..Default::default()
        };
        Some(merge_match_conditions(&[matched], canary.service_matches()))
    };

    match sticky {
        Sticky::Pin(cookie) => {
            for route in weighted.route.iter_mut() {
                if route.destination.host == names.canary {
                    add_set_cookie(&mut route.headers, affinity::set_cookie(&cookie, max_age));
                }
            }
            rule.matches = cookie_match(&cookie);
            rule.route = vec![
                destination(canary, &names.primary, 0),
                destination(canary, &names.canary, 100),
            ];
        }
        Sticky::Expire(cookie) => {
            rule.matches = cookie_match(&cookie);
            add_set_cookie(&mut rule.headers, affinity::expire_cookie(&cookie));
        }
        Sticky::Idle => return vec![weighted],
    }
    vec![rule, weighted]
}

fn destination(canary: &Canary, host: &str, weight: u32) -> HttpRouteDestination {
    let service = &canary.spec.service;
    let behind_gateway = canary
        .gateways()
        .first()
        .map(|g| g != MESH_GATEWAY)
        .unwrap_or(false);
    let port = (service.port_discovery && (behind_gateway || service.delegation)).then(|| {
        PortSelector {
            number: u32::try_from(service.port).unwrap_or_default(),
        }
    });

    HttpRouteDestination {
        destination: Destination {
            host: host.to_string(),
            subset: None,
            port,
        },
        weight: i32::try_from(weight).unwrap_or(i32::MAX),
        headers: None,
    }
}

fn http_route(
    canary: &Canary,
    matches: Option<Vec<HttpMatchRequest>>,
    route: Vec<HttpRouteDestination>,
) -> HttpRoute {
    let service = &canary.spec.service;
    HttpRoute {
        name: None,
        matches,
        route,
        rewrite: service.rewrite.clone(),
        timeout: service.timeout.clone(),
        retries: service.retries.clone(),
        cors_policy: service.cors_policy.clone(),
        headers: service.headers.clone(),
        mirror: None,
        mirror_percentage: None,
    }
}

/// Http rules for a split
///
/// With A/B matches the first rule carries the merged matches and the
/// split, the second sends everything else to the primary.
fn http_routes(canary: &Canary, weights: Weights) -> Vec<HttpRoute> {
    let names = canary.service_names();
    let service_matches = canary.spec.service.matches.clone();
    let weighted = vec![
        destination(canary, &names.primary, weights.primary),
        destination(canary, &names.canary, weights.canary),
    ];

    if canary.analysis_matches().is_empty() {
        return vec![http_route(canary, service_matches, weighted)];
    }

    let merged = merge_match_conditions(canary.analysis_matches(), canary.service_matches());
    vec![
        http_route(canary, Some(merged), weighted),
        http_route(
            canary,
            service_matches,
            vec![destination(canary, &names.primary, 100)],
        ),
    ]
}

#[async_trait]
impl Router for IstioRouter {
    fn name(&self) -> &'static str {
        "istio"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let service = &canary.spec.service;
        if service.delegation && (!canary.hosts().is_empty() || !canary.gateways().is_empty()) {
            return Err(RouterError::InvalidInput(format!(
                "VirtualService {} cannot have hosts or gateways when delegation is enabled",
                canary.key()
            )));
        }

        let names = canary.service_names();
        self.reconcile_destination_rule(canary, &names.canary).await?;
        self.reconcile_destination_rule(canary, &names.primary).await?;
        self.reconcile_virtual_service(canary).await
    }

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let names = canary.service_names();
        let vs = self.get_virtual_service(canary).await?;

        let mut weights = Weights::default();
        if let Some(rule) = weighted_rule(&vs.spec, &names.canary) {
            for route in &rule.route {
                let weight = u32::try_from(route.weight).unwrap_or_default();
                if route.destination.host == names.primary {
                    weights.primary = weight;
                } else if route.destination.host == names.canary {
                    weights.canary = weight;
                }
            }
            weights.mirrored = rule
                .mirror
                .as_ref()
                .map(|m| !m.host.is_empty())
                .unwrap_or(false);
        }

        if weights.primary == 0 && weights.canary == 0 {
            return Err(RouterError::malformed(
                KIND,
                &names.apex,
                &namespace_of(canary),
                format!(
                    "no routes for {} and {}",
                    names.primary, names.canary
                ),
            ));
        }
        Ok(weights)
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let mut vs = self.get_virtual_service(canary).await?;

        let mut http = http_routes(canary, weights);
        if weights.mirrored && canary.analysis_matches().is_empty() {
            if let Some(rule) = http.first_mut() {
                rule.mirror = Some(Destination {
                    host: names.canary.clone(),
                    ..Default::default()
                });
                let mirror_weight = canary.mirror_weight();
                if mirror_weight > 0 {
                    rule.mirror_percentage = Some(Percent {
                        value: f64::from(mirror_weight),
                    });
                }
            }
        }
        let affinity = canary
            .session_affinity()
            .filter(|_| uses_sticky_route(canary));
        if let Some(affinity) = affinity {
            let (active, expiring) = live_cookies(&vs.spec, &names.canary);
            let sticky = Sticky::next(&affinity.cookie_name, weights.canary, active, expiring);
            if let Some(weighted) = http.pop() {
                http = sticky_routes(canary, weighted, sticky, affinity.max_age());
            }
        }
        vs.spec.http = http;

        self.virtual_services
            .replace(&namespace, &names.apex, &vs)
            .await
            .map_err(RouterError::cluster(KIND, &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "VirtualService routes updated");
        Ok(())
    }

    /// Restores the spec saved before the router took over
    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let snapshot_key = original_configuration_key(&self.options.annotation_prefix);
        let mut vs = self.get_virtual_service(canary).await?;
        let annotations = vs.metadata.annotations.clone().unwrap_or_default();

        let unreadable = |key: &str, e: serde_json::Error| {
            RouterError::malformed(
                KIND,
                &names.apex,
                &namespace,
                format!("unreadable {} annotation: {}", key, e),
            )
        };

        let stored = if let Some(applied) = annotations.get(KUBECTL_ANNOTATION) {
            let original: VirtualService = serde_json::from_str(applied)
                .map_err(|e| unreadable(KUBECTL_ANNOTATION, e))?;
            original.spec
        } else if let Some(snapshot) = annotations.get(&snapshot_key) {
            serde_json::from_str::<VirtualServiceSpec>(snapshot)
                .map_err(|e| unreadable(snapshot_key.as_str(), e))?
        } else {
            warn!(
                canary = %canary.key(),
                "VirtualService {}.{} original configuration not found, unable to revert",
                names.apex,
                namespace
            );
            return Ok(());
        };

        vs.spec = stored;
        self.virtual_services
            .replace(&namespace, &names.apex, &vs)
            .await
            .map_err(RouterError::cluster(KIND, &names.apex, &namespace, "update"))?;
        info!(canary = %canary.key(), "VirtualService {} restored", names.apex);
        Ok(())
    }
}

#[cfg(test)]
#[path = "istio_test.rs"]
mod tests;
