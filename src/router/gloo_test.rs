#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::cluster::fake::FakeApi;
use crate::crd::canary::{HttpMatchRequest, StringMatch, UpstreamRef};
use crate::router::testing::{options, podinfo, podinfo_ab, podinfo_progressive, NAMESPACE};
use k8s_openapi::api::core::v1::ServiceSpec;
use serde_json::json;

struct Fixture {
    tables: Arc<FakeApi<RouteTable>>,
    upstreams: Arc<FakeApi<Upstream>>,
    router: GlooRouter,
}

fn backing_service(name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn fixture_with(options: RouterOptions) -> Fixture {
    let tables = Arc::new(FakeApi::new());
    let upstreams = Arc::new(FakeApi::new());
    let services = Arc::new(FakeApi::new());
    services.insert(NAMESPACE, backing_service("podinfo-primary"));
    services.insert(NAMESPACE, backing_service("podinfo-canary"));
    let router = GlooRouter::new(tables.clone(), upstreams.clone(), services, options);
    Fixture {
        tables,
        upstreams,
        router,
    }
}

fn fixture() -> Fixture {
    fixture_with(options())
}

#[tokio::test]
async fn test_reconcile_creates_upstreams_and_route_table() {
    let f = fixture();
    let canary = podinfo();

    f.router.reconcile(&canary).await.unwrap();

    let primary = f
        .upstreams
        .stored(NAMESPACE, "default-podinfo-primaryupstream-9898")
        .unwrap();
    let kube = primary.spec.kube.unwrap();
    assert_eq!(kube.service_name, "podinfo-primary");
    assert_eq!(kube.service_namespace, "default");
    assert_eq!(kube.service_port, 9898);
    assert_eq!(kube.selector["app"], "podinfo-primary");
    assert!(f
        .upstreams
        .stored(NAMESPACE, "default-podinfo-canaryupstream-9898")
        .is_some());

    let table = f.tables.stored(NAMESPACE, "podinfo").unwrap();
    let route = &table.spec.routes[0];
    assert_eq!(route.inheritable_path_matchers, Some(true));
    assert!(route.matchers.is_empty());
    let destinations = &route.route_action.as_ref().unwrap().multi.as_ref().unwrap().destinations;
    assert_eq!(
        destinations[0].destination.upstream.name,
        "default-podinfo-primaryupstream-9898"
    );
    assert_eq!(destinations[0].weight, 100);
    assert_eq!(destinations[1].weight, 0);
}

#[tokio::test]
async fn test_podinfo_scenario() {
    let f = fixture();
    let canary = podinfo();

    f.router.reconcile(&canary).await.unwrap();
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(100, 0));

    f.router.set_routes(&canary, Weights::new(50, 50)).await.unwrap();
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(50, 50));

    let writes = f.tables.writes() + f.upstreams.writes();
    assert!(f.router.set_routes(&canary, Weights::new(0, 0)).await.is_err());
    f.router.reconcile(&canary).await.unwrap();
    assert_eq!(f.tables.writes() + f.upstreams.writes(), writes);
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(50, 50));
}

#[tokio::test]
async fn test_ab_matchers() {
    let f = fixture();
    let mut canary = podinfo_ab();
    canary
        .spec
        .analysis
        .as_mut()
        .unwrap()
        .matches
        .as_mut()
        .unwrap()
        .push(HttpMatchRequest {
            headers: Some(BTreeMap::from([(
                "x-user".to_string(),
                StringMatch::exact("beta"),
            )])),
            method: Some(StringMatch::exact("GET")),
            ..Default::default()
        });

    f.router.reconcile(&canary).await.unwrap();

    let table = f.tables.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(table.spec.routes.len(), 1);
    assert_eq!(table.spec.routes[0].matchers.len(), 1);
    let matcher = &table.spec.routes[0].matchers[0];
    assert_eq!(matcher.headers.len(), 3);
    assert_eq!(matcher.headers[0].name, "x-canary");
    assert_eq!(matcher.headers[0].regex, Some(true));
    assert_eq!(matcher.headers[2].value.as_deref(), Some("beta"));
    assert_eq!(matcher.headers[2].regex, None);
    assert_eq!(matcher.methods, vec!["GET".to_string()]);
}

#[tokio::test]
async fn test_upstream_template() {
    let f = fixture_with(RouterOptions {
        include_label_prefix: vec!["team".to_string()],
        ..options()
    });
    f.upstreams.insert(
        "gloo-system",
        Upstream {
            metadata: ObjectMeta {
                name: Some("podinfo-config".to_string()),
                labels: Some(BTreeMap::from([
                    ("team".to_string(), "payments".to_string()),
                    ("tier".to_string(), "web".to_string()),
                ])),
                ..Default::default()
            },
            spec: UpstreamSpec {
                kube: None,
                extra: BTreeMap::from([("useHttp2".to_string(), json!(true))]),
            },
        },
    );
    let mut canary = podinfo();
    canary.spec.upstream_ref = Some(UpstreamRef {
        name: "podinfo-config".to_string(),
        namespace: Some("gloo-system".to_string()),
    });

    f.router.reconcile(&canary).await.unwrap();

    let upstream = f
        .upstreams
        .stored(NAMESPACE, "default-podinfo-canaryupstream-9898")
        .unwrap();
    assert_eq!(upstream.spec.extra["useHttp2"], json!(true));
    assert_eq!(upstream.spec.kube.unwrap().service_name, "podinfo-canary");
    let labels = upstream.metadata.labels.unwrap();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels["team"], "payments");
}

#[tokio::test]
async fn test_missing_template_is_reported() {
    let f = fixture();
    let mut canary = podinfo();
    canary.spec.upstream_ref = Some(UpstreamRef {
        name: "absent".to_string(),
        namespace: None,
    });

    assert!(matches!(
        f.router.reconcile(&canary).await,
        Err(RouterError::MissingReference(_))
    ));
}

#[tokio::test]
async fn test_missing_backing_service() {
    let tables = Arc::new(FakeApi::<RouteTable>::new());
    let router = GlooRouter::new(
        tables.clone(),
        Arc::new(FakeApi::<Upstream>::new()),
        Arc::new(FakeApi::<Service>::new()),
        options(),
    );

    assert!(router.reconcile(&podinfo()).await.is_err());
    assert!(tables.stored(NAMESPACE, "podinfo").is_none());
}

#[tokio::test]
async fn test_reconcile_keeps_weights_on_matcher_change() {
    let f = fixture();
    let mut canary = podinfo();
    f.router.reconcile(&canary).await.unwrap();
    f.router.set_routes(&canary, Weights::new(20, 80)).await.unwrap();

    canary.spec.analysis = podinfo_ab().spec.analysis;
    f.router.reconcile(&canary).await.unwrap();

    let table = f.tables.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(table.spec.routes[0].matchers[0].headers.len(), 2);
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(20, 80));
}

#[tokio::test]
async fn test_progressive_initialization_on_create_only() {
    let f = fixture();
    let canary = podinfo_progressive();

    f.router.reconcile(&canary).await.unwrap();
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(0, 100));

    f.router.set_routes(&canary, Weights::new(100, 0)).await.unwrap();
    let writes = f.tables.writes() + f.upstreams.writes();
    f.router.reconcile(&canary).await.unwrap();

    assert_eq!(f.tables.writes() + f.upstreams.writes(), writes);
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(100, 0));
}
