//! Kuma TrafficRoute
//!
//! Kuma resources are cluster scoped and carry `mesh` next to `spec`, so
//! the type implements `Resource` by hand instead of deriving it.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ClusterResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;

pub const SERVICE_TAG: &str = "kuma.io/service";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrafficRoute {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub mesh: String,
    pub spec: TrafficRouteSpec,
}

impl TrafficRoute {
    pub fn new(name: &str, mesh: &str, spec: TrafficRouteSpec) -> Self {
        Self {
            api_version: Self::api_version(&()).into_owned(),
            kind: Self::kind(&()).into_owned(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            mesh: mesh.to_string(),
            spec,
        }
    }
}

impl Resource for TrafficRoute {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "TrafficRoute".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "kuma.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1alpha1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "trafficroutes".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrafficRouteSpec {
    #[serde(default)]
    pub sources: Vec<Selector>,
    #[serde(default)]
    pub destinations: Vec<Selector>,
    #[serde(default)]
    pub conf: TrafficRouteConf,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Selector {
    #[serde(rename = "match")]
    pub matches: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrafficRouteConf {
    #[serde(default)]
    pub split: Vec<TrafficRouteSplit>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrafficRouteSplit {
    #[serde(default)]
    pub weight: u32,
    pub destination: BTreeMap<String, String>,
}
