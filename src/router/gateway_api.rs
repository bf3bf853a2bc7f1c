//! Gateway API HTTPRoute router
//!
//! Routes are built in a small local model covering the fields this router
//! manages and transcoded into the `gateway-api` types on write. Reads go
//! the other way, so foreign fields on a live route never block parsing.

use super::affinity::{self, Sticky, COOKIE_HEADER, SET_COOKIE_HEADER};
use super::converge::converge;
use super::diff::prune;
use super::factory::GatewayApiVersion;
use super::metadata::{filter_metadata, owner_references};
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::canary::{HttpMatchRequest, StringMatch};
use crate::crd::Canary;
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::{HTTPRoute, HTTPRouteSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "HTTPRoute";
const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";
const REQUEST_MIRROR: &str = "RequestMirror";
const RESPONSE_HEADER_MODIFIER: &str = "ResponseHeaderModifier";
const REGULAR_EXPRESSION: &str = "RegularExpression";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct RouteSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parent_refs: Vec<ParentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hostnames: Vec<String>,
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ParentRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    section_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Rule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    matches: Vec<RouteMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    backend_refs: Vec<BackendRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeouts: Option<Timeouts>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct RouteMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<TypedMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    headers: Vec<NamedMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    query_params: Vec<NamedMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct TypedMatch {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct NamedMatch {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct BackendRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    filters: Vec<Filter>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Filter {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_header_modifier: Option<HeaderFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_header_modifier: Option<HeaderFilter>,
    #[serde(rename = "urlRewrite", skip_serializing_if = "Option::is_none")]
    url_rewrite: Option<UrlRewrite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_mirror: Option<RequestMirror>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
struct HeaderFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    set: Vec<Header>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    add: Vec<Header>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    remove: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct Header {
    name: String,
    value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct UrlRewrite {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathModifier>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct PathModifier {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    replace_prefix_match: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct RequestMirror {
    backend_ref: BackendRef,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct Timeouts {
    request: String,
}

impl RouteSpec {
    fn into_spec(self) -> Result<HTTPRouteSpec, RouterError> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    fn from_spec(spec: &HTTPRouteSpec) -> Result<Self, RouterError> {
        Ok(serde_json::from_value(serde_json::to_value(spec)?)?)
    }
}

/// Gateway API router for `gateway.networking.k8s.io` v1 and v1beta1
pub struct GatewayApiRouter {
    routes: Arc<dyn ClusterApi<HTTPRoute>>,
    version: GatewayApiVersion,
    options: RouterOptions,
}

impl GatewayApiRouter {
    pub fn new(
        routes: Arc<dyn ClusterApi<HTTPRoute>>,
        version: GatewayApiVersion,
        options: RouterOptions,
    ) -> Self {
        Self {
            routes,
            version,
            options,
        }
    }

    async fn get_route(&self, canary: &Canary) -> Result<HTTPRoute, RouterError> {
        let apex = canary.service_names().apex;
        let namespace = namespace_of(canary);
        self.routes
            .get(&namespace, &apex)
            .await
            .map_err(RouterError::cluster(KIND, &apex, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &apex, &namespace))
    }
}

fn parent_refs(canary: &Canary) -> Result<Vec<ParentRef>, RouterError> {
    let refs = canary.spec.service.gateway_refs.as_deref().unwrap_or_default();
    if refs.is_empty() {
        return Err(RouterError::MissingReference(format!(
            "canary {} has no gatewayRefs",
            canary.key()
        )));
    }
    Ok(refs
        .iter()
        .map(|r| ParentRef {
            group: Some(GATEWAY_GROUP.to_string()),
            kind: Some("Gateway".to_string()),
            name: r.name.clone(),
            namespace: r.namespace.clone(),
            section_name: r.section_name.clone(),
            port: r.port,
        })
        .collect())
}

fn unsupported(what: &str, selector: &impl std::fmt::Debug) -> RouterError {
    RouterError::InvalidInput(format!(
        "Gateway API does not support the {} selector {:?}",
        what, selector
    ))
}

fn named_matches(
    what: &str,
    selectors: Option<&BTreeMap<String, StringMatch>>,
) -> Result<Vec<NamedMatch>, RouterError> {
    let mut out = Vec::new();
    for (name, selector) in selectors.into_iter().flatten() {
        let (kind, value) = if let Some(exact) = &selector.exact {
            ("Exact", exact)
        } else if let Some(regex) = &selector.regex {
            ("RegularExpression", regex)
        } else {
            return Err(unsupported(what, selector));
        };
        out.push(NamedMatch {
            name: name.clone(),
            kind: kind.to_string(),
            value: value.clone(),
        });
    }
    Ok(out)
}

/// Translates request predicates into HTTPRoute matches
fn route_matches(requests: &[HttpMatchRequest]) -> Result<Vec<RouteMatch>, RouterError> {
    let mut matches = Vec::new();
    for request in requests {
        let path = match &request.uri {
            None => None,
            Some(uri) => Some(if let Some(regex) = &uri.regex {
                TypedMatch {
                    kind: "RegularExpression".to_string(),
                    value: regex.clone(),
                }
            } else if let Some(exact) = &uri.exact {
                TypedMatch {
                    kind: "Exact".to_string(),
                    value: exact.clone(),
                }
            } else if let Some(prefix) = &uri.prefix {
                TypedMatch {
                    kind: "PathPrefix".to_string(),
                    value: prefix.clone(),
                }
            } else {
                return Err(unsupported("path", uri));
            }),
        };
        let method = match &request.method {
            None => None,
            Some(m) => Some(m.exact.clone().ok_or_else(|| unsupported("method", m))?),
        };
        let m = RouteMatch {
            path,
            headers: named_matches("header", request.headers.as_ref())?,
            query_params: named_matches("query", request.query_params.as_ref())?,
            method,
        };
        if m != RouteMatch::default() {
            matches.push(m);
        }
    }
    Ok(matches)
}

/// Service matches, defaulting to a `/` prefix
fn service_matches(canary: &Canary) -> Result<Vec<RouteMatch>, RouterError> {
    let mut matches = route_matches(canary.service_matches())?;
    if matches.is_empty() {
        matches.push(RouteMatch {
            path: Some(TypedMatch {
                kind: "PathPrefix".to_string(),
                value: "/".to_string(),
            }),
            ..Default::default()
        });
    }
    Ok(matches)
}

/// Every analysis match combined with every service match
fn merge_matches(analysis: &[RouteMatch], service: &[RouteMatch]) -> Vec<RouteMatch> {
    if analysis.is_empty() {
        return service.to_vec();
    }
    if service.is_empty() {
        return analysis.to_vec();
    }
    let mut merged = Vec::with_capacity(analysis.len() * service.len());
    for a in analysis {
        for s in service {
            let mut m = s.clone();
            if !a.headers.is_empty() {
                m.headers = a.headers.clone();
            }
            if !a.query_params.is_empty() {
                m.query_params = a.query_params.clone();
            }
            merged.push(m);
        }
    }
    merged
}

fn header_filter(kind: &str, ops: &crate::crd::canary::HeaderOperations) -> Filter {
    let headers = |map: &Option<BTreeMap<String, String>>| -> Vec<Header> {
        map.iter()
            .flatten()
            .map(|(name, value)| Header {
                name: name.clone(),
                value: value.clone(),
            })
            .collect()
    };
    let modifier = HeaderFilter {
        set: headers(&ops.set),
        add: headers(&ops.add),
        remove: ops.remove.clone().unwrap_or_default(),
    };
    let mut filter = Filter {
        kind: kind.to_string(),
        ..Default::default()
    };
    if kind == "RequestHeaderModifier" {
        filter.request_header_modifier = Some(modifier);
    } else {
        filter.response_header_modifier = Some(modifier);
    }
    filter
}

/// Header modifiers and URL rewrite from the service spec
fn filters(canary: &Canary) -> Vec<Filter> {
    let svc = &canary.spec.service;
    let mut filters = Vec::new();
    if let Some(headers) = &svc.headers {
        if let Some(request) = &headers.request {
            filters.push(header_filter("RequestHeaderModifier", request));
        }
        if let Some(response) = &headers.response {
            filters.push(header_filter("ResponseHeaderModifier", response));
        }
    }
    if let Some(rewrite) = &svc.rewrite {
        filters.push(Filter {
            kind: "URLRewrite".to_string(),
            url_rewrite: Some(UrlRewrite {
                hostname: rewrite.authority.clone().filter(|a| !a.is_empty()),
                path: rewrite
                    .uri
                    .clone()
                    .filter(|u| !u.is_empty())
                    .map(|uri| PathModifier {
                        kind: "ReplacePrefixMatch".to_string(),
                        replace_prefix_match: Some(uri),
                    }),
            }),
            ..Default::default()
        });
    }
    filters
}

fn backend_ref(canary: &Canary, name: &str, weight: u32) -> BackendRef {
    BackendRef {
        group: Some(String::new()),
        kind: Some("Service".to_string()),
        name: name.to_string(),
        port: Some(canary.spec.service.port),
        weight: Some(i32::try_from(weight).unwrap_or(i32::MAX)),
        filters: Vec::new(),
    }
}

fn mirror_filter(canary: &Canary) -> Filter {
    let mut backend = backend_ref(canary, &canary.service_names().canary, 0);
    backend.weight = None;
    Filter {
        kind: REQUEST_MIRROR.to_string(),
        request_mirror: Some(RequestMirror {
            backend_ref: backend,
        }),
        ..Default::default()
    }
}

fn is_canary_mirror(filter: &Filter, canary_service: &str) -> bool {
    filter.kind == REQUEST_MIRROR
        && filter
            .request_mirror
            .as_ref()
            .is_some_and(|m| m.backend_ref.name == canary_service)
}

/// Desired route spec for a split
///
/// With A/B matches the first rule carries the merged matches and the
/// weights, the second routes everything else to the primary.
fn route_spec(canary: &Canary, weights: Weights) -> Result<RouteSpec, RouterError> {
    let names = canary.service_names();
    let svc = &canary.spec.service;
    let matches = service_matches(canary)?;
    let timeouts = svc.timeout.as_ref().map(|t| Timeouts { request: t.clone() });

    let mut weighted = Rule {
        matches: matches.clone(),
        filters: filters(canary),
        backend_refs: vec![
            backend_ref(canary, &names.primary, weights.primary),
            backend_ref(canary, &names.canary, weights.canary),
        ],
        timeouts: timeouts.clone(),
    };
    if weights.mirrored && canary.iterations() > 0 {
        weighted.filters.push(mirror_filter(canary));
    }

    let mut rules = vec![weighted];
    let analysis = route_matches(canary.analysis_matches())?;
    if !analysis.is_empty() {
        rules[0].matches = merge_matches(&analysis, &matches);
        rules.push(Rule {
            matches,
            filters: filters(canary),
            backend_refs: vec![backend_ref(canary, &names.primary, 100)],
            timeouts,
        });
    }

    Ok(RouteSpec {
        parent_refs: parent_refs(canary)?,
        hostnames: canary.hosts().to_vec(),
        rules,
    })
}

/// Cookie name when sticky rules apply, A/B rules take precedence
fn sticky_cookie(canary: &Canary) -> Option<&str> {
    canary
        .session_affinity()
        .filter(|_| canary.analysis_matches().is_empty())
        .map(|a| a.cookie_name.as_str())
}

/// Rule matching a regex `Cookie` header naming `cookie_name`
fn is_sticky(rule: &Rule, cookie_name: Option<&str>) -> bool {
    let Some(cookie_name) = cookie_name else {
        return false;
    };
    rule.matches.iter().flat_map(|m| &m.headers).any(|h| {
        h.name == COOKIE_HEADER && h.kind == REGULAR_EXPRESSION && h.value.contains(cookie_name)
    })
}

fn response_set_cookie(filters: &[Filter]) -> Option<(String, bool)> {
    filters
        .iter()
        .filter_map(|f| f.response_header_modifier.as_ref())
        .flat_map(|m| &m.add)
        .find(|h| h.name == SET_COOKIE_HEADER)
        .and_then(|h| affinity::parse_set_cookie(&h.value))
}

/// Cookie canary responses set and cookie the sticky rule expires
fn live_cookies(
    spec: &RouteSpec,
    cookie_name: &str,
    canary_service: &str,
) -> (Option<String>, Option<String>) {
    let (sticky, weighted): (Vec<&Rule>, Vec<&Rule>) = spec
        .rules
        .iter()
        .partition(|r| is_sticky(r, Some(cookie_name)));
    let active = weighted
        .iter()
        .flat_map(|r| &r.backend_refs)
        .filter(|b| b.name == canary_service)
        .find_map(|b| response_set_cookie(&b.filters))
        .filter(|(_, expired)| !expired)
        .map(|(cookie, _)| cookie);
    let expiring = sticky
        .iter()
        .find_map(|r| response_set_cookie(&r.filters))
        .filter(|(_, expired)| *expired)
        .map(|(cookie, _)| cookie);
    (active, expiring)
}

fn add_response_header(filters: &mut Vec<Filter>, name: &str, value: String) {
    let header = Header {
        name: name.to_string(),
        value,
    };
    if let Some(modifier) = filters
        .iter_mut()
        .find_map(|f| f.response_header_modifier.as_mut())
    {
        modifier.add.push(header);
        return;
    }
    filters.push(Filter {
        kind: RESPONSE_HEADER_MODIFIER.to_string(),
        response_header_modifier: Some(HeaderFilter {
            add: vec![header],
            ..Default::default()
        }),
        ..Default::default()
    });
}

/// Copy of the weighted rule matching requests that carry `cookie`
fn cookie_rule(canary: &Canary, weighted: &Rule, cookie: &str) -> Result<Rule, RouterError> {
    let mut rule = weighted.clone();
    rule.filters
        .retain(|f| !is_canary_mirror(f, &canary.service_names().canary));
    let matched = RouteMatch {
        headers: vec![NamedMatch {
            name: COOKIE_HEADER.to_string(),
            kind: REGULAR_EXPRESSION.to_string(),
            value: affinity::cookie_regex(cookie),
        }],
        ..Default::default()
    };
    rule.matches = merge_matches(&[matched], &service_matches(canary)?);
    Ok(rule)
}

/// Sticky rule ahead of the weighted one
fn sticky_rules(
    canary: &Canary,
    mut weighted: Rule,
    sticky: Sticky,
    max_age: i64,
) -> Result<Vec<Rule>, RouterError> {
    let names = canary.service_names();
    match sticky {
        Sticky::Pin(cookie) => {
            let mut rule = cookie_rule(canary, &weighted, &cookie)?;
            rule.backend_refs = vec![
                backend_ref(canary, &names.primary, 0),
                backend_ref(canary, &names.canary, 100),
            ];
            for b in weighted.backend_refs.iter_mut().filter(|b| b.name == names.canary) {
                add_response_header(
                    &mut b.filters,
                    SET_COOKIE_HEADER,
                    affinity::set_cookie(&cookie, max_age),
                );
            }
            Ok(vec![rule, weighted])
        }
        Sticky::Expire(cookie) => {
            let mut rule = cookie_rule(canary, &weighted, &cookie)?;
            add_response_header(
                &mut rule.filters,
                SET_COOKIE_HEADER,
                affinity::expire_cookie(&cookie),
            );
            Ok(vec![rule, weighted])
        }
        Sticky::Idle => Ok(vec![weighted]),
    }
}

/// Spec as pruned JSON with backend weights and canary mirrors removed
///
/// With a sticky cookie the sticky rules and backend filters are left out
/// as well, set_routes owns them.
fn comparable(
    spec: &RouteSpec,
    canary_service: &str,
    sticky: Option<&str>,
) -> Result<Value, RouterError> {
    let mut spec = spec.clone();
    spec.rules.retain(|r| !is_sticky(r, sticky));
    for rule in spec.rules.iter_mut() {
        rule.filters.retain(|f| !is_canary_mirror(f, canary_service));
        for b in rule.backend_refs.iter_mut() {
            b.weight = None;
            if sticky.is_some() {
                b.filters.clear();
            }
        }
    }
    Ok(prune(serde_json::to_value(spec)?))
}

#[async_trait]
impl Router for GatewayApiRouter {
    fn name(&self) -> &'static str {
        "gatewayapi"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let names = canary.service_names();
        let spec = route_spec(canary, initial_weights(canary))?;
        let metadata = canary.spec.service.apex.clone().unwrap_or_default();

        let mut desired = HTTPRoute::new(&names.apex, spec.clone().into_spec()?);
        desired.metadata.namespace = Some(namespace_of(canary));
        desired.metadata.labels = Some(metadata.labels.unwrap_or_default());
        desired.metadata.annotations = Some(filter_metadata(metadata.annotations.as_ref()));
        desired.metadata.owner_references =
            owner_references(canary, self.options.set_owner_refs);

        converge(
            self.routes.as_ref(),
            &namespace_of(canary),
            &canary.key(),
            desired,
            |live, desired| {
                let live_spec = RouteSpec::from_spec(&live.spec)?;

                // annotations added by other controllers are kept
                let mut annotations = desired.metadata.annotations.clone().unwrap_or_default();
                for (k, v) in live.metadata.annotations.iter().flatten() {
                    annotations.entry(k.clone()).or_insert_with(|| v.clone());
                }
                let labels = desired.metadata.labels.clone().unwrap_or_default();

                let sticky = sticky_cookie(canary);
                if comparable(&live_spec, &names.canary, sticky)?
                    == comparable(&spec, &names.canary, sticky)?
                    && live.metadata.labels.clone().unwrap_or_default() == labels
                    && live.metadata.annotations.clone().unwrap_or_default() == annotations
                {
                    return Ok(None);
                }

                let (live_sticky, live_rules): (Vec<&Rule>, Vec<&Rule>) =
                    live_spec.rules.iter().partition(|r| is_sticky(r, sticky));
                let mut merged = spec.clone();
                for (rule, live_rule) in merged.rules.iter_mut().zip(live_rules) {
                    for b in rule.backend_refs.iter_mut() {
                        if let Some(l) = live_rule.backend_refs.iter().find(|l| l.name == b.name) {
                            b.weight = l.weight;
                            if sticky.is_some() {
                                b.filters = l.filters.clone();
                            }
                        }
                    }
                    rule.filters.extend(
                        live_rule
                            .filters
                            .iter()
                            .filter(|f| is_canary_mirror(f, &names.canary))
                            .cloned(),
                    );
                }

                merged.rules.splice(0..0, live_sticky.into_iter().cloned());

                let mut updated = live.clone();
                updated.spec = merged.into_spec()?;
                updated.metadata.labels = Some(labels);
                updated.metadata.annotations = Some(annotations);
                Ok(Some(updated))
            },
        )
        .await?;
        Ok(())
    }

    /// Reads the rule with exactly two backends
    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let route = self.get_route(canary).await?;
        let spec = RouteSpec::from_spec(&route.spec)?;

        let sticky = sticky_cookie(canary);
        let mut weights = None;
        let mut mirrored = false;
        for rule in spec.rules.iter().filter(|r| !is_sticky(r, sticky)) {
            if rule.backend_refs.len() == 2 {
                let weight_of = |name: &str| {
                    rule.backend_refs
                        .iter()
                        .find(|b| b.name == name)
                        .and_then(|b| b.weight)
                        .map(|w| u32::try_from(w).unwrap_or_default())
                        .unwrap_or_default()
                };
                weights = Some((weight_of(&names.primary), weight_of(&names.canary)));
            }
            mirrored |= rule.filters.iter().any(|f| is_canary_mirror(f, &names.canary));
        }

        match weights {
            Some((primary, canary_weight)) if primary > 0 || canary_weight > 0 => Ok(Weights {
                primary,
                canary: canary_weight,
                mirrored,
            }),
            Some(_) => Err(RouterError::malformed(
                KIND,
                &names.apex,
                &namespace,
                "primary and canary weights are both 0",
            )),
            None => Err(RouterError::malformed(
                KIND,
                &names.apex,
                &namespace,
                "no rule with primary and canary backends",
            )),
        }
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let mut route = self.get_route(canary).await?;

        let mut spec = route_spec(canary, weights)?;
        let affinity = canary
            .session_affinity()
            .filter(|_| sticky_cookie(canary).is_some());
        if let Some(affinity) = affinity {
            let live = RouteSpec::from_spec(&route.spec)?;
            let (active, expiring) = live_cookies(&live, &affinity.cookie_name, &names.canary);
            let sticky = Sticky::next(&affinity.cookie_name, weights.canary, active, expiring);
            if let Some(weighted) = spec.rules.pop() {
                spec.rules = sticky_rules(canary, weighted, sticky, affinity.max_age())?;
            }
        }
        route.spec = spec.into_spec()?;
        self.routes
            .replace(&namespace, &names.apex, &route)
            .await
            .map_err(RouterError::cluster(KIND, &names.apex, &namespace, "update"))?;
        info!(
            canary = %canary.key(),
            %weights,
            version = self.version.as_str(),
            "HTTPRoute routes updated"
        );
        Ok(())
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "gateway_api_test.rs"]
mod tests;
