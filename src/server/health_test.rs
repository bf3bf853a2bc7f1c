#![allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap for brevity

use super::metrics::create_metrics;
use super::*;
use crate::server::shutdown::shutdown_channel;
use std::time::Duration;

/// Polls /healthz until the server accepts connections
async fn wait_for_server(port: u16, max_retries: u32) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=max_retries {
        match client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < max_retries => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {} attempts: {}", max_retries, e),
        }
    }
    client
}

async fn get(client: &reqwest::Client, port: u16, path: &str) -> reqwest::Response {
    client
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server")
}

#[tokio::test]
async fn test_healthz_returns_200() {
    let readiness = ReadinessState::new();
    let port = 18180;
    let metrics = create_metrics().unwrap();
    let (_stop, signal) = shutdown_channel();
    let server =
        tokio::spawn(async move { run_health_server(port, readiness, metrics, signal).await });

    let client = wait_for_server(port, 10).await;

    assert_eq!(get(&client, port, "/healthz").await.status(), 200);
    server.abort();
}

#[tokio::test]
async fn test_readyz_follows_readiness() {
    let readiness = ReadinessState::new();
    let port = 18181;
    let metrics = create_metrics().unwrap();
    let server_readiness = readiness.clone();
    let (_stop, signal) = shutdown_channel();
    let server = tokio::spawn(async move {
        run_health_server(port, server_readiness, metrics, signal).await
    });

    let client = wait_for_server(port, 10).await;

    assert_eq!(get(&client, port, "/readyz").await.status(), 503);
    readiness.set_ready();
    assert_eq!(get(&client, port, "/readyz").await.status(), 200);
    readiness.set_not_ready();
    assert_eq!(get(&client, port, "/readyz").await.status(), 503);
    server.abort();
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let port = 18182;
    let metrics = create_metrics().unwrap();
    metrics.set_canary_weight("podinfo", "default", 20);
    let server_metrics = metrics.clone();
    let (_stop, signal) = shutdown_channel();
    let server = tokio::spawn(async move {
        run_health_server(port, ReadinessState::new(), server_metrics, signal).await
    });

    let client = wait_for_server(port, 10).await;
    let response = get(&client, port, "/metrics").await;

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("flowshift_canary_weight"));
    server.abort();
}

#[tokio::test]
async fn test_server_stops_on_shutdown() {
    let port = 18183;
    let metrics = create_metrics().unwrap();
    let (stop, signal) = shutdown_channel();
    let server = tokio::spawn(async move {
        run_health_server(port, ReadinessState::new(), metrics, signal).await
    });
    wait_for_server(port, 10).await;

    stop.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(2), server).await;
    assert!(result.unwrap().unwrap().is_ok());
}

#[test]
fn test_readiness_state_transitions() {
    let state = ReadinessState::new();
    assert!(!state.is_ready());

    state.set_ready();
    let cloned = state.clone();
    assert!(cloned.is_ready());
}
