use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_shutdown_is_observed_by_every_clone() {
    let (controller, signal) = shutdown_channel();
    let other = signal.clone();
    assert!(!signal.is_shutdown());

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(other.is_shutdown());
}

#[tokio::test]
async fn test_wait_returns_after_shutdown() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok());
    assert!(signal.is_shutdown());
}

#[tokio::test]
async fn test_wait_returns_when_controller_dropped() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok());
    assert!(!signal.is_shutdown());
}
