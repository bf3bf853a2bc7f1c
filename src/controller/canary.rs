use crate::controller::clock::{Clock, SystemClock};
use crate::controller::progression::{next_status, next_step, requeue_interval};
use crate::crd::{Canary, CanaryStatus};
use crate::router::{Router, RouterError, RouterFactory, Weights};
use crate::server::{ControllerMetrics, SharedMetrics};
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::ResourceExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Finalizer that keeps a Canary around until its routes are released
pub const FINALIZER: &str = "flowshift.io/finalizer";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Canary missing namespace")]
    MissingNamespace,

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<ReconcileError>>),
}

/// Hands out the routers for a canary
///
/// Implemented by [`RouterFactory`]; tests supply routers backed by fakes.
pub trait RouterSource: Send + Sync {
    fn kubernetes_router(&self, target_kind: &str) -> Box<dyn Router>;

    fn mesh_router(&self, canary: &Canary) -> Result<Box<dyn Router>, RouterError>;
}

impl RouterSource for RouterFactory {
    fn kubernetes_router(&self, target_kind: &str) -> Box<dyn Router> {
        RouterFactory::kubernetes_router(self, target_kind)
    }

    fn mesh_router(&self, canary: &Canary) -> Result<Box<dyn Router>, RouterError> {
        RouterFactory::mesh_router(self, canary)
    }
}

pub struct Context {
    pub client: kube::Client,
    pub routers: Arc<dyn RouterSource>,
    pub clock: Arc<dyn Clock>,
    /// Router call counts, durations and the canary weight gauge
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        client: kube::Client,
        routers: impl RouterSource + 'static,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            client,
            routers: Arc::new(routers),
            clock: Arc::new(SystemClock),
            metrics,
        }
    }
}

/// Reconcile a Canary
///
/// The finalizer is added before any route object is touched, so a deleted
/// Canary always gets its routes released.
pub async fn reconcile(canary: Arc<Canary>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = canary
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let canaries: Api<Canary> = Api::namespaced(ctx.client.clone(), &namespace);
    let (api, ctx) = (&canaries, ctx.as_ref());

    finalizer(api, FINALIZER, canary, |event| async move {
        match event {
            Event::Apply(canary) => apply(&canary, api, ctx).await,
            Event::Cleanup(canary) => cleanup(&canary, ctx).await,
        }
    })
    .await
    .map_err(|e| ReconcileError::Finalizer(Box::new(e)))
}

async fn apply(
    canary: &Canary,
    canaries: &Api<Canary>,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let name = canary.name_any();
    let kubernetes = ctx
        .routers
        .kubernetes_router(&canary.spec.target_ref.kind);
    let mesh = ctx.routers.mesh_router(canary)?;

    let status = advance(
        canary,
        kubernetes.as_ref(),
        mesh.as_ref(),
        ctx.metrics.as_deref(),
        ctx.clock.now(),
    )
    .await?;

    if canary.status.as_ref().and_then(|s| s.phase) != status.phase {
        info!(canary = %canary.key(), phase = ?status.phase, "Canary phase changed");
    }

    canaries
        .patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;

    Ok(Action::requeue(requeue_interval(canary)))
}

/// One tick: converge the Services and route object, then step the split
///
/// Returns the status to record. `set_routes` is only called when the
/// progression asks for a different split than the live one.
pub async fn advance(
    canary: &Canary,
    kubernetes: &dyn Router,
    mesh: &dyn Router,
    metrics: Option<&ControllerMetrics>,
    now: DateTime<Utc>,
) -> Result<CanaryStatus, ReconcileError> {
    let key = canary.key();

    timed(metrics, kubernetes.name(), "initialize", kubernetes.initialize(canary)).await?;
    timed(metrics, kubernetes.name(), "reconcile", kubernetes.reconcile(canary)).await?;
    timed(metrics, mesh.name(), "reconcile", mesh.reconcile(canary)).await?;
    let current = timed(metrics, mesh.name(), "get_routes", mesh.get_routes(canary)).await?;

    let step = next_step(canary, current);
    let weights = match step.weights {
        Some(weights) if weights != current => {
            timed(
                metrics,
                mesh.name(),
                "set_routes",
                mesh.set_routes(canary, weights),
            )
            .await?;
            info!(canary = %key, router = mesh.name(), from = %current, to = %weights, "Traffic shifted");
            weights
        }
        _ => {
            debug!(canary = %key, router = mesh.name(), weights = %current, "Traffic unchanged");
            current
        }
    };

    if let Some(metrics) = metrics {
        metrics.set_canary_weight(
            &canary.name_any(),
            &canary.namespace().unwrap_or_default(),
            weights.canary,
        );
    }

    Ok(next_status(canary.status.as_ref(), step.phase, weights, now))
}

async fn cleanup(canary: &Canary, ctx: &Context) -> Result<Action, ReconcileError> {
    let kubernetes = ctx
        .routers
        .kubernetes_router(&canary.spec.target_ref.kind);
    let mesh = ctx.routers.mesh_router(canary)?;

    release(
        canary,
        kubernetes.as_ref(),
        mesh.as_ref(),
        ctx.metrics.as_deref(),
    )
    .await?;
    Ok(Action::await_change())
}

/// Hand the route object and Services back before the Canary is deleted
pub async fn release(
    canary: &Canary,
    kubernetes: &dyn Router,
    mesh: &dyn Router,
    metrics: Option<&ControllerMetrics>,
) -> Result<(), ReconcileError> {
    timed(metrics, mesh.name(), "finalize", mesh.finalize(canary)).await?;
    timed(metrics, kubernetes.name(), "finalize", kubernetes.finalize(canary)).await?;

    if let Some(metrics) = metrics {
        metrics.remove_canary(&canary.name_any(), &canary.namespace().unwrap_or_default());
    }
    info!(canary = %canary.key(), "Routes released");
    Ok(())
}

/// Runs one router call and records its outcome
async fn timed<T>(
    metrics: Option<&ControllerMetrics>,
    router: &str,
    operation: &str,
    call: impl Future<Output = Result<T, RouterError>>,
) -> Result<T, RouterError> {
    let start = Instant::now();
    let result = call.await;
    if let Some(metrics) = metrics {
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.metric_label(),
        };
        metrics.record_router_operation(router, operation, outcome, start.elapsed().as_secs_f64());
    }
    result
}

/// Requeue after a failed reconcile
pub fn error_policy(canary: Arc<Canary>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    warn!(canary = %canary.key(), error = %error, "Reconcile failed, will retry");
    Action::requeue(ERROR_REQUEUE)
}

pub const ERROR_REQUEUE: Duration = Duration::from_secs(10);

#[cfg(test)]
#[path = "canary_test.rs"]
mod tests;
