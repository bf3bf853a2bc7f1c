use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canary is a Custom Resource describing how traffic is shifted between
/// the primary and canary versions of a workload.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "flowshift.io",
    version = "v1beta1",
    kind = "Canary",
    namespaced,
    status = "CanaryStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.canaryWeight"}"#,
    printcolumn = r#"{"name":"LastTransitionTime", "type":"string", "jsonPath":".status.lastTransitionTime"}"#
)]
pub struct CanarySpec {
    /// Workload the canary is attached to
    #[serde(rename = "targetRef")]
    pub target_ref: TargetRef,

    /// Overrides the controller-wide mesh provider for this canary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Ingress used by annotation-based routers (nginx, skipper)
    #[serde(rename = "ingressRef", skip_serializing_if = "Option::is_none")]
    pub ingress_ref: Option<TargetRef>,

    /// Route used by the APISIX router
    #[serde(rename = "routeRef", skip_serializing_if = "Option::is_none")]
    pub route_ref: Option<TargetRef>,

    /// Gloo upstream used as a template for generated upstreams
    #[serde(rename = "upstreamRef", skip_serializing_if = "Option::is_none")]
    pub upstream_ref: Option<UpstreamRef>,

    /// Service exposing the workload
    pub service: CanaryService,

    /// Analysis settings consumed by the routers (matches, mirroring, initialization)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<CanaryAnalysis>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TargetRef {
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct UpstreamRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Service section of the canary spec
///
/// Everything the routers need to build the apex, primary and canary
/// routing objects lives here.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryService {
    /// Apex name override (defaults to targetRef.name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub port: i32,

    /// Name of the generated service port (default: http)
    #[serde(rename = "portName", skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,

    #[serde(rename = "targetPort", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,

    /// Set the destination port on mesh routes bound to an ingress gateway
    #[serde(rename = "portDiscovery", default)]
    pub port_discovery: bool,

    #[serde(rename = "appProtocol", skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateways: Option<Vec<String>>,

    /// App Mesh virtual services the workload calls, by name or ARN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backends: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,

    /// Emit a delegate VirtualService (no hosts, no gateways)
    #[serde(default)]
    pub delegation: bool,

    #[serde(rename = "gatewayRefs", skip_serializing_if = "Option::is_none")]
    pub gateway_refs: Option<Vec<GatewayRef>>,

    /// Destination rule traffic policy, copied verbatim
    #[serde(rename = "trafficPolicy", skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub traffic_policy: Option<serde_json::Value>,

    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<HttpMatchRequest>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<HttpRewrite>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<HttpRetry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    #[serde(rename = "corsPolicy", skip_serializing_if = "Option::is_none")]
    pub cors_policy: Option<CorsPolicy>,

    /// Metadata added to the generated apex objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apex: Option<CustomMetadata>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<CustomMetadata>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CustomMetadata>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GatewayRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "sectionName", skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CustomMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// HTTP request match predicate
///
/// The wire shape is shared with Istio's HTTPMatchRequest so it can be
/// copied into VirtualServices unchanged.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatchRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<StringMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<StringMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<StringMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<StringMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, StringMatch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_params: Option<BTreeMap<String, StringMatch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_uri_case: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub without_headers: Option<BTreeMap<String, StringMatch>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct StringMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl StringMatch {
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            exact: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Self {
            prefix: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn regex(value: impl Into<String>) -> Self {
        Self {
            regex: Some(value.into()),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HttpRewrite {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HttpRetry {
    pub attempts: i32,
    #[serde(rename = "perTryTimeout", skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,
    #[serde(rename = "retryOn", skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Headers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOperations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<HeaderOperations>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HeaderOperations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_origins: Option<Vec<StringMatch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_methods: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_headers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expose_headers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_credentials: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryAnalysis {
    /// Time between analysis steps (e.g., "1m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Number of iterations for blue/green style analysis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<i32>,

    /// Mirror traffic to the canary during analysis
    #[serde(default)]
    pub mirror: bool,

    /// Percentage of traffic mirrored when mirroring is enabled
    #[serde(rename = "mirrorWeight", skip_serializing_if = "Option::is_none")]
    pub mirror_weight: Option<i32>,

    /// A/B testing match predicates
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<HttpMatchRequest>>,

    /// Seed new route objects with all traffic on the canary
    #[serde(rename = "progressiveInitialization", default)]
    pub progressive_initialization: bool,

    /// Cookie-based session affinity for the canary run
    #[serde(rename = "sessionAffinity", skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<SessionAffinity>,

    #[serde(rename = "maxWeight", skip_serializing_if = "Option::is_none")]
    pub max_weight: Option<i32>,

    #[serde(rename = "stepWeight", skip_serializing_if = "Option::is_none")]
    pub step_weight: Option<i32>,
}

/// Pins clients that reached the canary to it for the rest of the run
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SessionAffinity {
    #[serde(rename = "cookieName")]
    pub cookie_name: String,

    /// Cookie lifetime in seconds, one day when unset
    #[serde(rename = "maxAge", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
}

impl SessionAffinity {
    pub fn max_age(&self) -> i64 {
        self.max_age.filter(|age| *age > 0).unwrap_or(86_400)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<CanaryPhase>,

    /// Canary weight last observed on the route object
    #[serde(rename = "canaryWeight", skip_serializing_if = "Option::is_none")]
    pub canary_weight: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<i32>,

    /// RFC3339 timestamp of the last phase change
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CanaryPhase {
    #[default]
    Initializing,
    Initialized,
    Waiting,
    Progressing,
    Promoting,
    Finalising,
    Succeeded,
    Failed,
}

/// Derived service names for a canary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNames {
    pub apex: String,
    pub primary: String,
    pub canary: String,
}

impl Canary {
    /// Apex, primary and canary names
    ///
    /// apex is `service.name` when set, otherwise `targetRef.name`.
    pub fn service_names(&self) -> ServiceNames {
        let apex = self
            .spec
            .service
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.spec.target_ref.name.clone());
        ServiceNames {
            primary: format!("{}-primary", apex),
            canary: format!("{}-canary", apex),
            apex,
        }
    }

    /// `name.namespace`, used as the log key
    pub fn key(&self) -> String {
        format!(
            "{}.{}",
            self.name_any(),
            self.namespace().unwrap_or_default()
        )
    }

    pub fn analysis_matches(&self) -> &[HttpMatchRequest] {
        self.spec
            .analysis
            .as_ref()
            .and_then(|a| a.matches.as_deref())
            .unwrap_or_default()
    }

    pub fn service_matches(&self) -> &[HttpMatchRequest] {
        self.spec.service.matches.as_deref().unwrap_or_default()
    }

    pub fn iterations(&self) -> i32 {
        self.spec
            .analysis
            .as_ref()
            .and_then(|a| a.iterations)
            .unwrap_or(0)
    }

    pub fn mirror_weight(&self) -> i32 {
        self.spec
            .analysis
            .as_ref()
            .and_then(|a| a.mirror_weight)
            .unwrap_or(0)
    }

    pub fn progressive_initialization(&self) -> bool {
        self.spec
            .analysis
            .as_ref()
            .map(|a| a.progressive_initialization)
            .unwrap_or(false)
    }

    pub fn session_affinity(&self) -> Option<&SessionAffinity> {
        self.spec
            .analysis
            .as_ref()
            .and_then(|a| a.session_affinity.as_ref())
    }

    pub fn hosts(&self) -> &[String] {
        self.spec.service.hosts.as_deref().unwrap_or_default()
    }

    pub fn gateways(&self) -> &[String] {
        self.spec.service.gateways.as_deref().unwrap_or_default()
    }
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

#[cfg(test)]
#[path = "canary_test.rs"]
mod tests;
