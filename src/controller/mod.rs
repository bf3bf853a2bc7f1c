//! Canary controller
//!
//! A thin driver over the routers: every tick converges the Services and
//! the route object, then moves the split one step.

pub mod canary;
pub mod clock;
pub mod progression;

pub use canary::{error_policy, reconcile, Context, ReconcileError, RouterSource, FINALIZER};
