//! SMI TrafficSplit resources
//!
//! v1alpha1 encodes weights as quantities, v1alpha2 and later as plain
//! integers. v1alpha3 shares the v1alpha2 wire shape and is served through
//! a version-overriding client.

pub mod v1alpha1 {
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::CustomResource;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::collections::BTreeMap;

    #[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
    #[kube(
        group = "split.smi-spec.io",
        version = "v1alpha1",
        kind = "TrafficSplit",
        namespaced,
        schema = "disabled"
    )]
    pub struct TrafficSplitSpec {
        pub service: String,
        #[serde(default)]
        pub backends: Vec<TrafficSplitBackend>,
        #[serde(flatten)]
        pub extra: BTreeMap<String, Value>,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
    pub struct TrafficSplitBackend {
        pub service: String,
        pub weight: Quantity,
    }
}

pub mod v1alpha2 {
    use kube::CustomResource;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::collections::BTreeMap;

    #[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
    #[kube(
        group = "split.smi-spec.io",
        version = "v1alpha2",
        kind = "TrafficSplit",
        namespaced,
        schema = "disabled"
    )]
    pub struct TrafficSplitSpec {
        pub service: String,
        #[serde(default)]
        pub backends: Vec<TrafficSplitBackend>,
        #[serde(flatten)]
        pub extra: BTreeMap<String, Value>,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
    pub struct TrafficSplitBackend {
        pub service: String,
        #[serde(default)]
        pub weight: i32,
    }
}
