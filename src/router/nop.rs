use super::{Router, RouterError, Weights};
use crate::crd::Canary;
use async_trait::async_trait;

/// Router for providers that need no route object
pub struct NopRouter;

/// Split reported by routers without weights
///
/// A canary with iterations runs a blue/green style analysis where the
/// canary takes all test traffic.
pub fn static_weights(canary: &Canary) -> Weights {
    if canary.iterations() > 0 {
        Weights::new(0, 100)
    } else {
        Weights::new(100, 0)
    }
}

#[async_trait]
impl Router for NopRouter {
    fn name(&self) -> &'static str {
        "nop"
    }

    async fn reconcile(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        Ok(static_weights(canary))
    }

    async fn set_routes(&self, _canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}
