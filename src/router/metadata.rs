//! Labels, annotations and ownership of generated objects

use crate::crd::Canary;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeMap;

pub const KUBECTL_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

const TOOLKIT_MARKER: &str = "toolkit.fluxcd.io";
const TOOLKIT_RECONCILE_KEY: &str = "kustomize.toolkit.fluxcd.io/reconcile";
const HELM_DRIFT_DETECTION_KEY: &str = "helm.toolkit.fluxcd.io/driftDetection";
const TOOLKIT_DISABLED: &str = "disabled";

/// Annotation holding the pre-takeover spec of an adopted object
pub fn original_configuration_key(prefix: &str) -> String {
    format!("{}/original-configuration", prefix)
}

/// Annotations for a generated object
///
/// Copies `meta` and marks the object so GitOps toolkits do not revert
/// weight changes.
pub fn filter_metadata(meta: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut out = meta.cloned().unwrap_or_default();
    out.insert(
        TOOLKIT_RECONCILE_KEY.to_string(),
        TOOLKIT_DISABLED.to_string(),
    );
    out.insert(
        HELM_DRIFT_DETECTION_KEY.to_string(),
        TOOLKIT_DISABLED.to_string(),
    );
    out
}

/// Labels whose key starts with one of `prefixes`
///
/// `*` matches every key and an empty prefix matches none. GitOps toolkit
/// labels are never copied.
pub fn include_labels_by_prefix(
    labels: &BTreeMap<String, String>,
    prefixes: &[String],
) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(key, _)| !key.contains(TOOLKIT_MARKER))
        .filter(|(key, _)| {
            prefixes
                .iter()
                .any(|p| p == "*" || (!p.is_empty() && key.starts_with(p.as_str())))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Controller owner reference to `canary`, or nothing when disabled
pub fn owner_references(canary: &Canary, enabled: bool) -> Option<Vec<OwnerReference>> {
    if !enabled {
        return None;
    }
    canary.controller_owner_ref(&()).map(|r| vec![r])
}

/// True when this canary, matched by name, is the controller of `meta`
pub fn is_owned_by(meta: &ObjectMeta, canary: &Canary) -> bool {
    let name = canary.meta().name.as_deref();
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.kind == "Canary" && Some(r.name.as_str()) == name)
}

/// True when any Canary is the controller of `meta`
pub fn is_controlled_by_canary(meta: &ObjectMeta) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.kind == "Canary")
}

/// Labels and annotations of `desired` already present on `live`,
/// treating absent maps as empty
pub fn same_labels_and_annotations(live: &ObjectMeta, desired: &ObjectMeta) -> bool {
    fn or_empty(map: &Option<BTreeMap<String, String>>) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        map.as_ref().unwrap_or(&EMPTY)
    }
    or_empty(&live.labels) == or_empty(&desired.labels)
        && or_empty(&live.annotations) == or_empty(&desired.annotations)
}

/// Annotation value from a canary, if set
pub fn canary_annotation<'a>(canary: &'a Canary, key: &str) -> Option<&'a str> {
    canary
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}
