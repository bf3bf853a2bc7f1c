#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::cluster::fake::FakeApi;
use crate::crd::canary::{CanaryAnalysis, HttpRetry, SessionAffinity, StringMatch};
use crate::router::testing::{options, podinfo, podinfo_ab, podinfo_progressive, NAMESPACE};

struct Fixture {
    vs: Arc<FakeApi<VirtualService>>,
    dr: Arc<FakeApi<DestinationRule>>,
    router: IstioRouter,
}

fn fixture() -> Fixture {
    let vs = Arc::new(FakeApi::new());
    let dr = Arc::new(FakeApi::new());
    let router = IstioRouter::new(vs.clone(), dr.clone(), options());
    Fixture { vs, dr, router }
}

fn hosts_and_weights(vs: &VirtualService) -> Vec<(String, i32)> {
    vs.spec.http[0]
        .route
        .iter()
        .map(|r| (r.destination.host.clone(), r.weight))
        .collect()
}

#[tokio::test]
async fn test_reconcile_creates_destination_rules_and_virtual_service() {
    let f = fixture();
    let mut canary = podinfo();
    canary.spec.service.traffic_policy = Some(serde_json::json!({"tls": {"mode": "ISTIO_MUTUAL"}}));

    f.router.reconcile(&canary).await.unwrap();

    let primary_dr = f.dr.stored(NAMESPACE, "podinfo-primary").unwrap();
    assert_eq!(primary_dr.spec.host, "podinfo-primary");
    assert_eq!(
        primary_dr.spec.traffic_policy.unwrap()["tls"]["mode"],
        "ISTIO_MUTUAL"
    );
    assert!(f.dr.stored(NAMESPACE, "podinfo-canary").is_some());

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.hosts, vec!["podinfo".to_string()]);
    assert_eq!(vs.spec.gateways, vec!["mesh".to_string()]);
    assert_eq!(
        hosts_and_weights(&vs),
        vec![
            ("podinfo-primary".to_string(), 100),
            ("podinfo-canary".to_string(), 0)
        ]
    );
}

#[tokio::test]
async fn test_podinfo_scenario() {
    let f = fixture();
    let canary = podinfo();

    f.router.reconcile(&canary).await.unwrap();
    assert_eq!(
        f.router.get_routes(&canary).await.unwrap(),
        Weights::new(100, 0)
    );

    f.router
        .set_routes(&canary, Weights::new(50, 50))
        .await
        .unwrap();
    assert_eq!(
        f.router.get_routes(&canary).await.unwrap(),
        Weights::new(50, 50)
    );

    let writes = f.vs.writes();
    let err = f
        .router
        .set_routes(&canary, Weights::new(0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidInput(_)));
    assert_eq!(f.vs.writes(), writes);
    assert_eq!(
        f.router.get_routes(&canary).await.unwrap(),
        Weights::new(50, 50)
    );
}

#[tokio::test]
async fn test_reconcile_is_idempotent_and_keeps_weights() {
    let f = fixture();
    let canary = podinfo();
    f.router.reconcile(&canary).await.unwrap();
    f.router
        .set_routes(&canary, Weights::new(70, 30))
        .await
        .unwrap();

    let writes = f.vs.writes() + f.dr.writes();
    f.router.reconcile(&canary).await.unwrap();

    assert_eq!(f.vs.writes() + f.dr.writes(), writes);
    assert_eq!(
        f.router.get_routes(&canary).await.unwrap(),
        Weights::new(70, 30)
    );
}

#[tokio::test]
async fn test_shape_change_preserves_live_weights() {
    let f = fixture();
    let mut canary = podinfo();
    f.router.reconcile(&canary).await.unwrap();
    f.router
        .set_routes(&canary, Weights::new(60, 40))
        .await
        .unwrap();

    canary.spec.service.timeout = Some("30s".to_string());
    canary.spec.service.retries = Some(HttpRetry {
        attempts: 3,
        per_try_timeout: Some("1s".to_string()),
        retry_on: None,
    });
    f.router.reconcile(&canary).await.unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.http[0].timeout.as_deref(), Some("30s"));
    assert_eq!(vs.spec.http[0].retries.as_ref().unwrap().attempts, 3);
    assert_eq!(
        f.router.get_routes(&canary).await.unwrap(),
        Weights::new(60, 40)
    );
}

#[tokio::test]
async fn test_set_routes_leaves_unmanaged_fields() {
    let f = fixture();
    let canary = podinfo();
    f.router.reconcile(&canary).await.unwrap();
    let mut vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    vs.spec
        .extra
        .insert("exportTo".to_string(), serde_json::json!(["."]));
    vs.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert("team".to_string(), "web".to_string());
    f.vs.insert(NAMESPACE, vs);

    f.router
        .set_routes(&canary, Weights::new(90, 10))
        .await
        .unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.extra["exportTo"], serde_json::json!(["."]));
    assert_eq!(vs.metadata.labels.unwrap()["team"], "web");
    assert_eq!(vs.spec.hosts, vec!["podinfo".to_string()]);
}

#[tokio::test]
async fn test_mirroring() {
    let f = fixture();
    let mut canary = podinfo();
    canary.spec.analysis = Some(Default::default());
    canary.spec.analysis.as_mut().unwrap().mirror_weight = Some(25);
    f.router.reconcile(&canary).await.unwrap();

    f.router
        .set_routes(&canary, Weights::mirrored(100, 0))
        .await
        .unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.http[0].mirror.as_ref().unwrap().host, "podinfo-canary");
    assert_eq!(vs.spec.http[0].mirror_percentage.as_ref().unwrap().value, 25.0);
    assert_eq!(
        f.router.get_routes(&canary).await.unwrap(),
        Weights::mirrored(100, 0)
    );

    // reconcile neither drops the mirror nor writes
    let writes = f.vs.writes();
    f.router.reconcile(&canary).await.unwrap();
    assert_eq!(f.vs.writes(), writes);
    assert!(f.router.get_routes(&canary).await.unwrap().mirrored);
}

#[tokio::test]
async fn test_ab_testing_rules() {
    let f = fixture();
    let mut canary = podinfo_ab();
    canary.spec.service.matches = Some(vec![
        HttpMatchRequest {
            uri: Some(StringMatch::prefix("/api")),
            ..Default::default()
        },
        HttpMatchRequest {
            uri: Some(StringMatch::prefix("/web")),
            ..Default::default()
        },
    ]);

    f.router.reconcile(&canary).await.unwrap();
    f.router
        .set_routes(&canary, Weights::new(0, 100))
        .await
        .unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.http.len(), 2);
    // 2 analysis matches x 2 service matches
    assert_eq!(vs.spec.http[0].matches.as_ref().unwrap().len(), 4);
    assert_eq!(vs.spec.http[1].matches.as_ref().unwrap().len(), 2);
    assert_eq!(vs.spec.http[1].route.len(), 1);
    assert_eq!(vs.spec.http[1].route[0].destination.host, "podinfo-primary");
    assert_eq!(vs.spec.http[1].route[0].weight, 100);
    assert_eq!(
        f.router.get_routes(&canary).await.unwrap(),
        Weights::new(0, 100)
    );
}

#[tokio::test]
async fn test_gateway_hosts_and_port_discovery() {
    let f = fixture();
    let mut canary = podinfo();
    canary.spec.service.hosts = Some(vec!["app.example.com".to_string()]);
    canary.spec.service.gateways = Some(vec!["public-gateway".to_string()]);
    canary.spec.service.port_discovery = true;

    f.router.reconcile(&canary).await.unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(
        vs.spec.hosts,
        vec!["app.example.com".to_string(), "podinfo".to_string()]
    );
    assert_eq!(vs.spec.gateways, vec!["public-gateway".to_string()]);
    let port = vs.spec.http[0].route[0].destination.port.as_ref().unwrap();
    assert_eq!(port.number, 9898);
}

#[tokio::test]
async fn test_wildcard_host_is_not_extended() {
    let f = fixture();
    let mut canary = podinfo();
    canary.spec.service.hosts = Some(vec!["*".to_string()]);

    f.router.reconcile(&canary).await.unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.hosts, vec!["*".to_string()]);
    assert!(vs.spec.http[0].route[0].destination.port.is_none());
}

#[tokio::test]
async fn test_delegation() {
    let f = fixture();
    let mut canary = podinfo();
    canary.spec.service.delegation = true;

    f.router.reconcile(&canary).await.unwrap();
    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert!(vs.spec.hosts.is_empty());
    assert!(vs.spec.gateways.is_empty());

    canary.spec.service.hosts = Some(vec!["app.example.com".to_string()]);
    let err = f.router.reconcile(&canary).await.unwrap_err();
    assert!(matches!(err, RouterError::InvalidInput(_)));
}

#[tokio::test]
async fn test_foreign_virtual_service_is_snapshotted_and_restored() {
    let f = fixture();
    let canary = podinfo();
    let original = VirtualServiceSpec {
        hosts: vec!["podinfo".to_string()],
        http: vec![HttpRoute {
            route: vec![HttpRouteDestination {
                destination: Destination {
                    host: "podinfo".to_string(),
                    ..Default::default()
                },
                weight: 100,
                headers: None,
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    f.vs.insert(NAMESPACE, VirtualService::new("podinfo", original.clone()));

    f.router.reconcile(&canary).await.unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    let snapshot = &vs.metadata.annotations.as_ref().unwrap()["flowshift.io/original-configuration"];
    assert_eq!(
        serde_json::from_str::<VirtualServiceSpec>(snapshot).unwrap(),
        original
    );
    assert_eq!(vs.spec.http[0].route.len(), 2);

    f.router.finalize(&canary).await.unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec, original);
}

#[tokio::test]
async fn test_finalize_prefers_kubectl_annotation() {
    let f = fixture();
    let canary = podinfo();
    let applied = VirtualService::new(
        "podinfo",
        VirtualServiceSpec {
            hosts: vec!["applied.example.com".to_string()],
            ..Default::default()
        },
    );
    let mut live = VirtualService::new("podinfo", VirtualServiceSpec::default());
    live.metadata.annotations = Some(BTreeMap::from([
        (
            KUBECTL_ANNOTATION.to_string(),
            serde_json::to_string(&applied).unwrap(),
        ),
        (
            "flowshift.io/original-configuration".to_string(),
            "{}".to_string(),
        ),
    ]));
    f.vs.insert(NAMESPACE, live);

    f.router.finalize(&canary).await.unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.hosts, vec!["applied.example.com".to_string()]);
}

#[tokio::test]
async fn test_finalize_without_snapshot_is_ok() {
    let f = fixture();
    let canary = podinfo();
    f.router.reconcile(&canary).await.unwrap();
    let writes = f.vs.writes();

    f.router.finalize(&canary).await.unwrap();

    assert_eq!(f.vs.writes(), writes);
}

#[tokio::test]
async fn test_get_routes_errors() {
    let f = fixture();
    let canary = podinfo();

    assert!(matches!(
        f.router.get_routes(&canary).await,
        Err(RouterError::Malformed { .. })
    ));

    f.vs.insert(
        NAMESPACE,
        VirtualService::new("podinfo", VirtualServiceSpec::default()),
    );
    assert!(matches!(
        f.router.get_routes(&canary).await,
        Err(RouterError::Malformed { .. })
    ));
}

#[tokio::test]
async fn test_progressive_initialization_on_create_only() {
    let f = fixture();
    let canary = podinfo_progressive();

    f.router.reconcile(&canary).await.unwrap();
    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(
        hosts_and_weights(&vs),
        vec![("podinfo-primary".to_string(), 0), ("podinfo-canary".to_string(), 100)]
    );
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(0, 100));

    f.router.set_routes(&canary, Weights::new(100, 0)).await.unwrap();
    let writes = f.vs.writes() + f.dr.writes();
    f.router.reconcile(&canary).await.unwrap();

    assert_eq!(f.vs.writes() + f.dr.writes(), writes);
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(100, 0));
}

fn podinfo_sticky() -> Canary {
    let mut canary = podinfo();
    canary.spec.analysis = Some(CanaryAnalysis {
        session_affinity: Some(SessionAffinity {
            cookie_name: "flowshift".to_string(),
            max_age: Some(3600),
        }),
        ..Default::default()
    });
    canary
}

fn set_cookie(headers: Option<&Headers>) -> Option<String> {
    headers?.response.as_ref()?.add.as_ref()?.get("Set-Cookie").cloned()
}

#[tokio::test]
async fn test_session_affinity_pins_canary_clients() {
    let f = fixture();
    let canary = podinfo_sticky();
    f.router.reconcile(&canary).await.unwrap();

    f.router.set_routes(&canary, Weights::new(90, 10)).await.unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.http.len(), 2);
    let sticky = &vs.spec.http[0];
    assert_eq!(sticky.name.as_deref(), Some("sticky-route"));
    assert_eq!(sticky.route[0].weight, 0);
    assert_eq!(sticky.route[1].destination.host, "podinfo-canary");
    assert_eq!(sticky.route[1].weight, 100);
    let cookie = set_cookie(vs.spec.http[1].route[1].headers.as_ref()).unwrap();
    assert!(cookie.starts_with("flowshift="));
    assert!(cookie.ends_with("; Max-Age=3600"));
    let value = cookie.trim_end_matches("; Max-Age=3600").trim_start_matches("flowshift=");
    let regex = sticky.matches.as_ref().unwrap()[0].headers.as_ref().unwrap()["Cookie"]
        .regex
        .clone()
        .unwrap();
    assert_eq!(regex, format!(".*flowshift.*{}.*", value));
    assert!(vs.spec.http[1].route[0].headers.is_none());
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(90, 10));

    // the cookie survives later steps and reconciles
    f.router.set_routes(&canary, Weights::new(80, 20)).await.unwrap();
    let writes = f.vs.writes() + f.dr.writes();
    f.router.reconcile(&canary).await.unwrap();
    assert_eq!(f.vs.writes() + f.dr.writes(), writes);
    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert_eq!(vs.spec.http[0].name.as_deref(), Some("sticky-route"));
    assert_eq!(set_cookie(vs.spec.http[1].route[1].headers.as_ref()), Some(cookie.clone()));
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(80, 20));
}

#[tokio::test]
async fn test_session_affinity_expires_cookie_after_run() {
    let f = fixture();
    let canary = podinfo_sticky();
    f.router.reconcile(&canary).await.unwrap();
    f.router.set_routes(&canary, Weights::new(90, 10)).await.unwrap();
    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    let cookie = set_cookie(vs.spec.http[1].route[1].headers.as_ref())
        .unwrap()
        .trim_end_matches("; Max-Age=3600")
        .to_string();

    for _ in 0..2 {
        f.router.set_routes(&canary, Weights::new(100, 0)).await.unwrap();

        let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
        let sticky = &vs.spec.http[0];
        assert_eq!(
            set_cookie(sticky.headers.as_ref()),
            Some(format!("{}; Max-Age=-1", cookie))
        );
        assert_eq!(sticky.route[0].weight, 100);
        assert!(vs.spec.http[1].route[1].headers.is_none());
        assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(100, 0));
    }
}

#[tokio::test]
async fn test_session_affinity_yields_to_ab_rules() {
    let f = fixture();
    let mut canary = podinfo_ab();
    canary.spec.analysis.as_mut().unwrap().session_affinity = Some(SessionAffinity {
        cookie_name: "flowshift".to_string(),
        max_age: None,
    });
    f.router.reconcile(&canary).await.unwrap();

    f.router.set_routes(&canary, Weights::new(0, 100)).await.unwrap();

    let vs = f.vs.stored(NAMESPACE, "podinfo").unwrap();
    assert!(vs.spec.http.iter().all(|h| h.name.is_none()));
    assert_eq!(f.router.get_routes(&canary).await.unwrap(), Weights::new(0, 100));
}
