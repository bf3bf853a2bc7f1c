//! Fixtures shared by router tests

use crate::crd::canary::{CanaryService, TargetRef};
use crate::crd::{Canary, CanarySpec};
use crate::router::RouterOptions;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const NAMESPACE: &str = "default";

/// podinfo canary targeting a Deployment on port 9898
pub fn podinfo() -> Canary {
    Canary {
        metadata: ObjectMeta {
            name: Some("podinfo".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some("6d1f4a8e-0000-4000-8000-000000000001".to_string()),
            ..Default::default()
        },
        spec: CanarySpec {
            target_ref: TargetRef {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: "podinfo".to_string(),
            },
            provider: None,
            ingress_ref: None,
            route_ref: None,
            upstream_ref: None,
            service: CanaryService {
                port: 9898,
                ..Default::default()
            },
            analysis: None,
        },
        status: None,
    }
}

/// podinfo with A/B analysis matching on a header and a cookie
pub fn podinfo_ab() -> Canary {
    let yaml = r#"
    iterations: 10
    match:
    - headers:
        x-canary:
          regex: ".*insider.*"
    - headers:
        cookie:
          regex: "^(.*?;)?(canary=always)(;.*)?$"
    "#;
    let mut canary = podinfo();
    canary.spec.analysis = Some(serde_yaml::from_str(yaml).unwrap());
    canary
}

pub fn options() -> RouterOptions {
    RouterOptions::default()
}

/// podinfo seeding new route objects with all traffic on the canary
pub fn podinfo_progressive() -> Canary {
    let mut canary = podinfo();
    canary
        .spec
        .analysis
        .get_or_insert_with(Default::default)
        .progressive_initialization = true;
    canary
}
