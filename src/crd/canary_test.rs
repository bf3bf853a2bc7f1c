#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use kube::CustomResourceExt;

const PODINFO: &str = r#"
apiVersion: flowshift.io/v1beta1
kind: Canary
metadata:
  name: podinfo
  namespace: test
spec:
  targetRef:
    apiVersion: apps/v1
    kind: Deployment
    name: podinfo
  service:
    port: 9898
    portName: http
    hosts:
    - app.example.com
    gateways:
    - public-gateway.istio-system.svc.cluster.local
    match:
    - uri:
        prefix: /podinfo
    retries:
      attempts: 3
      perTryTimeout: 1s
    trafficPolicy:
      tls:
        mode: ISTIO_MUTUAL
  analysis:
    interval: 1m
    iterations: 10
    mirror: true
    mirrorWeight: 20
    match:
    - headers:
        x-canary:
          exact: insider
"#;

#[test]
fn test_canary_deserialize_from_yaml() {
    let canary: Canary = serde_yaml::from_str(PODINFO).expect("Failed to deserialize Canary");

    assert_eq!(canary.metadata.name.as_deref(), Some("podinfo"));
    assert_eq!(canary.spec.target_ref.kind, "Deployment");
    assert_eq!(canary.spec.service.port, 9898);
    assert_eq!(canary.hosts(), ["app.example.com".to_string()]);
    assert_eq!(canary.service_matches().len(), 1);
    assert_eq!(
        canary.service_matches()[0].uri,
        Some(StringMatch::prefix("/podinfo"))
    );
    assert_eq!(canary.iterations(), 10);
    assert_eq!(canary.mirror_weight(), 20);

    let analysis = canary.analysis_matches();
    assert_eq!(analysis.len(), 1);
    let headers = analysis[0].headers.as_ref().unwrap();
    assert_eq!(headers["x-canary"], StringMatch::exact("insider"));

    let policy = canary.spec.service.traffic_policy.as_ref().unwrap();
    assert_eq!(policy["tls"]["mode"], "ISTIO_MUTUAL");
}

#[test]
fn test_service_names_default_to_target_ref() {
    let canary: Canary = serde_yaml::from_str(PODINFO).unwrap();

    let names = canary.service_names();

    assert_eq!(names.apex, "podinfo");
    assert_eq!(names.primary, "podinfo-primary");
    assert_eq!(names.canary, "podinfo-canary");
    assert_eq!(canary.key(), "podinfo.test");
}

#[test]
fn test_service_name_overrides_apex() {
    let mut canary: Canary = serde_yaml::from_str(PODINFO).unwrap();
    canary.spec.service.name = Some("frontend".to_string());

    let names = canary.service_names();

    assert_eq!(names.apex, "frontend");
    assert_eq!(names.primary, "frontend-primary");
    assert_eq!(names.canary, "frontend-canary");
}

#[test]
fn test_minimal_canary_uses_defaults() {
    let yaml = r#"
apiVersion: flowshift.io/v1beta1
kind: Canary
metadata:
  name: api
spec:
  targetRef:
    name: api
  service:
    port: 80
"#;

    let canary: Canary = serde_yaml::from_str(yaml).unwrap();

    assert!(canary.spec.analysis.is_none());
    assert_eq!(canary.iterations(), 0);
    assert_eq!(canary.mirror_weight(), 0);
    assert!(!canary.progressive_initialization());
    assert!(canary.analysis_matches().is_empty());
    assert!(canary.service_matches().is_empty());
    assert!(canary.gateways().is_empty());
    assert!(!canary.spec.service.delegation);
}

#[test]
fn test_status_phase_round_trips_as_string() {
    let status = CanaryStatus {
        phase: Some(CanaryPhase::Progressing),
        canary_weight: Some(30),
        ..Default::default()
    };

    let json = serde_json::to_value(&status).unwrap();

    assert_eq!(json["phase"], "Progressing");
    assert_eq!(json["canaryWeight"], 30);
    assert!(json.get("iterations").is_none());
}

#[test]
fn test_crd_has_status_subresource_and_columns() {
    let crd = Canary::crd();

    assert_eq!(crd.spec.group, "flowshift.io");
    assert_eq!(crd.spec.names.kind, "Canary");
    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1beta1");
    assert!(version.subresources.as_ref().unwrap().status.is_some());
    let columns = version.additional_printer_columns.as_ref().unwrap();
    assert!(columns.iter().any(|c| c.name == "Weight"));
}
