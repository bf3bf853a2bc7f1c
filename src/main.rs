use flowshift::config::Config;
use flowshift::controller::{error_policy, reconcile, Context};
use flowshift::crd::Canary;
use flowshift::router::RouterFactory;
use flowshift::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        provider = %config.router.provider,
        selector_label = %config.router.selector_label,
        "Starting flowshift controller"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_port = config.health_port;
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) =
            run_health_server(health_port, health_readiness, health_metrics, shutdown_signal).await
        {
            warn!(error = %e, "Health server failed");
        }
    });
    info!(port = health_port, "Health server task spawned");

    let routers = RouterFactory::new(client.clone(), config.router);
    let ctx = Arc::new(Context::new(client.clone(), routers, Some(metrics)));
    let canaries = Api::<Canary>::all(client);

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // error_policy logs failures
    let controller = Controller::new(canaries, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok((canary, action)) = res {
                info!(canary = %canary.name, namespace = ?canary.namespace, ?action, "Reconciled");
            }
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server task did not stop cleanly");
    }

    info!("flowshift controller shut down");
    Ok(())
}
