#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::cluster::fake::FakeApi;
use crate::router::metadata::owner_references;
use crate::router::testing::{options, podinfo, NAMESPACE};

fn router(api: &Arc<FakeApi<Service>>) -> KubernetesDefaultRouter {
    KubernetesDefaultRouter::new(api.clone(), options())
}

fn selector(svc: &Service) -> BTreeMap<String, String> {
    svc.spec.clone().unwrap().selector.unwrap()
}

fn foreign_apex(selector_value: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("podinfo".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([("team".to_string(), "web".to_string())])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                selector_value.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

#[tokio::test]
async fn test_initialize_creates_primary_and_canary_services() {
    let api = Arc::new(FakeApi::new());
    let canary = podinfo();

    router(&api).initialize(&canary).await.unwrap();

    let canary_svc = api.stored(NAMESPACE, "podinfo-canary").unwrap();
    let primary_svc = api.stored(NAMESPACE, "podinfo-primary").unwrap();
    assert_eq!(selector(&canary_svc)["app"], "podinfo");
    assert_eq!(selector(&primary_svc)["app"], "podinfo-primary");
    assert_eq!(
        primary_svc.metadata.labels.as_ref().unwrap()["app"],
        "podinfo-primary"
    );
    assert_eq!(api.writes(), 2);
}

#[tokio::test]
async fn test_reconcile_creates_apex_service() {
    let api = Arc::new(FakeApi::new());
    let canary = podinfo();

    router(&api).reconcile(&canary).await.unwrap();

    let apex = api.stored(NAMESPACE, "podinfo").unwrap();
    let spec = apex.spec.clone().unwrap();
    assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    assert_eq!(selector(&apex)["app"], "podinfo-primary");
    let port = &spec.ports.unwrap()[0];
    assert_eq!(port.name.as_deref(), Some("http"));
    assert_eq!(port.port, 9898);
    assert_eq!(port.protocol.as_deref(), Some("TCP"));
    assert_eq!(port.target_port, Some(IntOrString::Int(9898)));
    let annotations = apex.metadata.annotations.unwrap();
    assert_eq!(
        annotations["kustomize.toolkit.fluxcd.io/reconcile"],
        "disabled"
    );
    let owners = apex.metadata.owner_references.unwrap();
    assert_eq!(owners[0].kind, "Canary");
    assert_eq!(owners[0].controller, Some(true));
}

#[tokio::test]
async fn test_reconcile_twice_writes_once() {
    let api = Arc::new(FakeApi::new());
    let canary = podinfo();
    let router = router(&api);

    router.initialize(&canary).await.unwrap();
    router.reconcile(&canary).await.unwrap();
    let writes = api.writes();
    router.initialize(&canary).await.unwrap();
    router.reconcile(&canary).await.unwrap();

    assert_eq!(api.writes(), writes);
}

#[tokio::test]
async fn test_port_change_keeps_node_port() {
    let api = Arc::new(FakeApi::new());
    let mut canary = podinfo();
    let router = router(&api);
    router.reconcile(&canary).await.unwrap();

    let mut live = api.stored(NAMESPACE, "podinfo").unwrap();
    live.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30080);
    api.insert(NAMESPACE, live);

    canary.spec.service.target_port = Some(IntOrString::String("http".to_string()));
    router.reconcile(&canary).await.unwrap();

    let apex = api.stored(NAMESPACE, "podinfo").unwrap();
    let port = &apex.spec.unwrap().ports.unwrap()[0];
    assert_eq!(port.node_port, Some(30080));
    assert_eq!(
        port.target_port,
        Some(IntOrString::String("http".to_string()))
    );
}

#[tokio::test]
async fn test_extra_ports_and_app_protocol() {
    let api = Arc::new(FakeApi::new());
    let mut canary = podinfo();
    canary.spec.service.app_protocol = Some("http".to_string());
    canary.spec.service.port_name = Some("web".to_string());
    let mut opts = options();
    opts.extra_ports = vec![ServicePort {
        name: Some("metrics".to_string()),
        protocol: Some("TCP".to_string()),
        port: 9797,
        target_port: Some(IntOrString::Int(9797)),
        ..Default::default()
    }];

    KubernetesDefaultRouter::new(api.clone(), opts)
        .reconcile(&canary)
        .await
        .unwrap();

    let ports = api
        .stored(NAMESPACE, "podinfo")
        .unwrap()
        .spec
        .unwrap()
        .ports
        .unwrap();
    assert_eq!(ports.len(), 2);
    assert_eq!(ports[0].name.as_deref(), Some("web"));
    assert_eq!(ports[0].app_protocol.as_deref(), Some("http"));
    assert_eq!(ports[1].port, 9797);
}

#[tokio::test]
async fn test_foreign_service_keeps_its_labels() {
    let api = Arc::new(FakeApi::new());
    api.insert(NAMESPACE, foreign_apex("podinfo"));

    router(&api).reconcile(&podinfo()).await.unwrap();

    let apex = api.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(selector(&apex)["app"], "podinfo-primary");
    assert_eq!(apex.metadata.labels.unwrap()["team"], "web");
}

#[tokio::test]
async fn test_finalize_restores_selector_from_kubectl_annotation() {
    let api = Arc::new(FakeApi::new());
    let mut apex = foreign_apex("podinfo-primary");
    let original = serde_json::to_string(&foreign_apex("podinfo-original")).unwrap();
    apex.metadata.annotations = Some(BTreeMap::from([(
        KUBECTL_ANNOTATION.to_string(),
        original,
    )]));
    api.insert(NAMESPACE, apex);

    router(&api).finalize(&podinfo()).await.unwrap();

    let apex = api.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(selector(&apex)["app"], "podinfo-original");
}

#[tokio::test]
async fn test_finalize_without_annotation_selects_workload() {
    let api = Arc::new(FakeApi::new());
    api.insert(NAMESPACE, foreign_apex("podinfo-primary"));

    router(&api).finalize(&podinfo()).await.unwrap();

    let apex = api.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(selector(&apex)["app"], "podinfo");
}

#[tokio::test]
async fn test_finalize_skips_canary_controlled_service() {
    let api = Arc::new(FakeApi::new());
    let mut other = podinfo();
    other.metadata.name = Some("other".to_string());
    let mut apex = foreign_apex("podinfo-primary");
    apex.metadata.owner_references = owner_references(&other, true);
    api.insert(NAMESPACE, apex);

    router(&api).finalize(&podinfo()).await.unwrap();

    assert_eq!(api.writes(), 0);
    let apex = api.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(selector(&apex)["app"], "podinfo-primary");
}

#[tokio::test]
async fn test_finalize_with_absent_apex_is_ok() {
    let api = Arc::new(FakeApi::new());

    router(&api).finalize(&podinfo()).await.unwrap();

    assert_eq!(api.writes(), 0);
}

#[tokio::test]
async fn test_noop_router_does_nothing() {
    let router = KubernetesNoopRouter;
    let canary = podinfo();

    router.initialize(&canary).await.unwrap();
    router.reconcile(&canary).await.unwrap();
    router.finalize(&canary).await.unwrap();
    assert_eq!(
        router.get_routes(&canary).await.unwrap(),
        Weights::new(100, 0)
    );
}
