#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::cluster::fake::FakeApi;
use crate::crd::canary::TargetRef;
use crate::router::metadata::owner_references;
use crate::router::testing::{options, podinfo, NAMESPACE};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
};

const CANARY_INGRESS: &str = "podinfo-canary";

fn path(service: &str) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some("/".to_string()),
        path_type: "ImplementationSpecific".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: None,
            }),
            ..Default::default()
        },
    }
}

fn user_ingress() -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some("podinfo".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                PREDICATE_KEY.to_string(),
                "Header(\"X-Env\", \"prod\")".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some("app.example.com".to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![path("podinfo"), path("docs")],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn fixture() -> (Arc<FakeApi<Ingress>>, SkipperRouter, Canary) {
    let api = Arc::new(FakeApi::new());
    api.insert(NAMESPACE, user_ingress());
    let router = SkipperRouter::new(api.clone(), options());
    let mut canary = podinfo();
    canary.spec.ingress_ref = Some(TargetRef {
        api_version: Some("networking.k8s.io/v1".to_string()),
        kind: "Ingress".to_string(),
        name: "podinfo".to_string(),
    });
    (api, router, canary)
}

fn predicate(api: &FakeApi<Ingress>) -> String {
    api.stored(NAMESPACE, CANARY_INGRESS)
        .unwrap()
        .metadata
        .annotations
        .unwrap()[PREDICATE_KEY]
        .clone()
}

#[test]
fn test_insert_predicate() {
    assert_eq!(insert_predicate("", ROUTE_WEIGHT), "Weight(100)");
    assert_eq!(
        insert_predicate("Weight(100) && Path(\"/\")", ROUTE_DISABLED),
        "False() && Path(\"/\")"
    );
}

#[tokio::test]
async fn test_reconcile_splits_paths() {
    let (api, router, canary) = fixture();

    router.reconcile(&canary).await.unwrap();

    let clone = api.stored(NAMESPACE, CANARY_INGRESS).unwrap();
    let paths = clone.spec.unwrap().rules.unwrap()[0]
        .http
        .clone()
        .unwrap()
        .paths;
    let backends: Vec<_> = paths
        .iter()
        .map(|p| p.backend.service.as_ref().unwrap().name.as_str())
        .collect();
    assert_eq!(backends, vec!["podinfo-primary", "docs", "podinfo-canary"]);

    let annotations = clone.metadata.annotations.unwrap();
    assert_eq!(
        annotations[BACKEND_WEIGHTS_KEY],
        r#"{"podinfo-canary":0,"podinfo-primary":100}"#
    );
    assert_eq!(
        annotations[PREDICATE_KEY],
        "False() && Header(\"X-Env\", \"prod\")"
    );
}

#[tokio::test]
async fn test_podinfo_scenario() {
    let (api, router, canary) = fixture();

    router.reconcile(&canary).await.unwrap();
    assert_eq!(router.get_routes(&canary).await.unwrap(), Weights::new(100, 0));

    router.set_routes(&canary, Weights::new(50, 50)).await.unwrap();
    assert_eq!(router.get_routes(&canary).await.unwrap(), Weights::new(50, 50));
    assert!(predicate(&api).starts_with(ROUTE_WEIGHT));

    let writes = api.writes();
    assert!(router.set_routes(&canary, Weights::new(0, 0)).await.is_err());
    router.reconcile(&canary).await.unwrap();
    assert_eq!(api.writes(), writes);
    assert_eq!(router.get_routes(&canary).await.unwrap(), Weights::new(50, 50));

    router.set_routes(&canary, Weights::new(100, 0)).await.unwrap();
    assert!(predicate(&api).starts_with("False() && "));
}

#[tokio::test]
async fn test_get_routes_requires_both_backends() {
    let (api, router, canary) = fixture();
    router.reconcile(&canary).await.unwrap();

    let mut clone = api.stored(NAMESPACE, CANARY_INGRESS).unwrap();
    clone.metadata.annotations.as_mut().unwrap().insert(
        BACKEND_WEIGHTS_KEY.to_string(),
        r#"{"podinfo-primary":100}"#.to_string(),
    );
    api.insert(NAMESPACE, clone.clone());
    assert!(matches!(
        router.get_routes(&canary).await,
        Err(RouterError::Malformed { .. })
    ));

    clone.metadata.annotations.as_mut().unwrap().remove(BACKEND_WEIGHTS_KEY);
    api.insert(NAMESPACE, clone);
    assert!(matches!(
        router.get_routes(&canary).await,
        Err(RouterError::Malformed { .. })
    ));
}

#[tokio::test]
async fn test_finalize_deletes_clone() {
    let (api, router, canary) = fixture();
    router.reconcile(&canary).await.unwrap();

    router.finalize(&canary).await.unwrap();

    assert!(api.stored(NAMESPACE, CANARY_INGRESS).is_none());
    assert!(api.stored(NAMESPACE, "podinfo").is_some());
}

#[tokio::test]
async fn test_finalize_keeps_foreign_clone() {
    let (api, router, canary) = fixture();
    router.reconcile(&canary).await.unwrap();
    let mut other = podinfo();
    other.metadata.name = Some("other".to_string());
    let mut clone = api.stored(NAMESPACE, CANARY_INGRESS).unwrap();
    clone.metadata.owner_references = owner_references(&other, true);
    api.insert(NAMESPACE, clone);
    let writes = api.writes();

    router.finalize(&canary).await.unwrap();

    assert!(api.stored(NAMESPACE, CANARY_INGRESS).is_some());
    assert_eq!(api.writes(), writes);
}

#[tokio::test]
async fn test_progressive_initialization_on_create_only() {
    let (api, router, mut canary) = fixture();
    canary
        .spec
        .analysis
        .get_or_insert_with(Default::default)
        .progressive_initialization = true;

    router.reconcile(&canary).await.unwrap();
    assert_eq!(router.get_routes(&canary).await.unwrap(), Weights::new(0, 100));
    assert!(predicate(&api).starts_with(ROUTE_WEIGHT));

    router.set_routes(&canary, Weights::new(100, 0)).await.unwrap();
    let writes = api.writes();
    router.reconcile(&canary).await.unwrap();

    assert_eq!(api.writes(), writes);
    assert_eq!(router.get_routes(&canary).await.unwrap(), Weights::new(100, 0));
}
