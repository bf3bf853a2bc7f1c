#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::router::testing::{options, podinfo};

fn factory() -> RouterFactory {
    let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
    let client = Client::try_from(config).unwrap();
    RouterFactory::new(client, options())
}

#[test]
fn test_parse_known_providers() {
    let cases = [
        ("kubernetes", Provider::Kubernetes),
        ("istio", Provider::Istio),
        ("appmesh", Provider::AppMesh),
        ("appmesh:v1beta2", Provider::AppMesh),
        ("kuma", Provider::Kuma),
        ("contour", Provider::Contour),
        ("gloo", Provider::Gloo),
        ("gloo:v1", Provider::Gloo),
        ("traefik", Provider::Traefik),
        ("apisix", Provider::Apisix),
        ("nginx", Provider::Nginx),
        ("skipper", Provider::Skipper),
        ("knative", Provider::Knative),
        ("gatewayapi", Provider::GatewayApi(GatewayApiVersion::V1)),
        ("gatewayapi:v1", Provider::GatewayApi(GatewayApiVersion::V1)),
        (
            "gatewayapi:v1beta1",
            Provider::GatewayApi(GatewayApiVersion::V1beta1),
        ),
    ];

    for (input, expected) in cases {
        assert_eq!(input.parse::<Provider>().unwrap(), expected, "{}", input);
    }
}

#[test]
fn test_parse_smi_variants() {
    assert_eq!(
        "linkerd".parse::<Provider>().unwrap(),
        Provider::Smi {
            version: SmiVersion::V1alpha1,
            mesh: "linkerd".to_string()
        }
    );
    assert_eq!(
        "osm".parse::<Provider>().unwrap(),
        Provider::Smi {
            version: SmiVersion::V1alpha2,
            mesh: "osm".to_string()
        }
    );
    assert_eq!(
        "smi:v1alpha1:istio".parse::<Provider>().unwrap(),
        Provider::Smi {
            version: SmiVersion::V1alpha1,
            mesh: "istio".to_string()
        }
    );
    assert_eq!(
        "smi:v1alpha3".parse::<Provider>().unwrap(),
        Provider::Smi {
            version: SmiVersion::V1alpha3,
            mesh: String::new()
        }
    );
}

#[test]
fn test_unknown_provider_fails_fast() {
    for input in ["consul", "appmesh:v1beta1", "smi:v2", "", "Istio"] {
        assert!(matches!(
            input.parse::<Provider>(),
            Err(RouterError::UnknownProvider(_))
        ));
    }
}

#[test]
fn test_provider_display_round_trips() {
    for input in ["istio", "appmesh", "smi:v1alpha2:linkerd", "gatewayapi:v1beta1", "kuma"] {
        let provider: Provider = input.parse().unwrap();
        assert_eq!(provider.to_string().parse::<Provider>().unwrap(), provider);
    }
}

#[tokio::test]
async fn test_kubernetes_router_by_target_kind() {
    let factory = factory();

    assert_eq!(factory.kubernetes_router("Service").name(), "kubernetes-noop");
    assert_eq!(factory.kubernetes_router("Deployment").name(), "kubernetes");
    assert_eq!(factory.kubernetes_router("DaemonSet").name(), "kubernetes");
}

#[tokio::test]
async fn test_mesh_router_uses_default_provider() {
    let factory = factory();

    let router = factory.mesh_router(&podinfo()).unwrap();

    assert_eq!(router.name(), "nop");
}

#[tokio::test]
async fn test_mesh_router_honours_override() {
    let factory = factory();
    let mut canary = podinfo();

    canary.spec.provider = Some("gatewayapi:v1beta1".to_string());
    assert_eq!(factory.mesh_router(&canary).unwrap().name(), "gatewayapi");

    canary.spec.provider = Some("smi:v1alpha1".to_string());
    assert_eq!(factory.mesh_router(&canary).unwrap().name(), "smi");

    canary.spec.provider = Some("appmesh".to_string());
    assert_eq!(factory.mesh_router(&canary).unwrap().name(), "appmesh");

    canary.spec.provider = Some("consul".to_string());
    assert!(matches!(
        factory.mesh_router(&canary),
        Err(RouterError::UnknownProvider(_))
    ));
}

#[tokio::test]
async fn test_every_provider_builds_a_router() {
    let factory = factory();
    let names = [
        ("istio", "istio"),
        ("appmesh", "appmesh"),
        ("linkerd", "smi"),
        ("kuma", "kuma"),
        ("contour", "contour"),
        ("gloo", "gloo"),
        ("traefik", "traefik"),
        ("apisix", "apisix"),
        ("nginx", "nginx"),
        ("skipper", "skipper"),
        ("knative", "knative"),
        ("gatewayapi:v1", "gatewayapi"),
        ("kubernetes", "nop"),
    ];

    for (provider, name) in names {
        let router = factory.router_for(&provider.parse().unwrap());
        assert_eq!(router.name(), name, "{}", provider);
    }
}
