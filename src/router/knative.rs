//! Knative Serving router
//!
//! The target is a Knative Service. The revision serving when the canary
//! was first reconciled is pinned as primary and the latest revision is the
//! canary.

use super::{namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::knative::{Service as KnativeService, TrafficTarget};
use crate::crd::Canary;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "Service.serving.knative.dev";

pub struct KnativeRouter {
    services: Arc<dyn ClusterApi<KnativeService>>,
    options: RouterOptions,
}

impl KnativeRouter {
    pub fn new(services: Arc<dyn ClusterApi<KnativeService>>, options: RouterOptions) -> Self {
        Self { services, options }
    }

    fn primary_revision_key(&self) -> String {
        format!("{}/primary-revision", self.options.annotation_prefix)
    }

    async fn get_service(&self, canary: &Canary) -> Result<KnativeService, RouterError> {
        let name = &canary.spec.target_ref.name;
        let namespace = namespace_of(canary);
        self.services
            .get(&namespace, name)
            .await
            .map_err(RouterError::cluster(KIND, name, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, name, &namespace))
    }

    async fn update(&self, canary: &Canary, service: &KnativeService) -> Result<(), RouterError> {
        let name = &canary.spec.target_ref.name;
        let namespace = namespace_of(canary);
        self.services
            .replace(&namespace, name, service)
            .await
            .map_err(RouterError::cluster(KIND, name, &namespace, "update"))?;
        Ok(())
    }

    fn primary_revision(
        &self,
        canary: &Canary,
        service: &KnativeService,
    ) -> Result<String, RouterError> {
        service
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&self.primary_revision_key()))
            .cloned()
            .ok_or_else(|| {
                RouterError::malformed(
                    KIND,
                    &canary.spec.target_ref.name,
                    &namespace_of(canary),
                    format!("annotation {} not found", self.primary_revision_key()),
                )
            })
    }
}

#[async_trait]
impl Router for KnativeRouter {
    fn name(&self) -> &'static str {
        "knative"
    }

    /// Pins the latest created revision as primary, once
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let mut service = self.get_service(canary).await?;
        let key = self.primary_revision_key();
        if service
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(&key))
        {
            return Ok(());
        }

        let revision = service
            .status
            .as_ref()
            .and_then(|s| s.latest_created_revision_name.clone())
            .ok_or_else(|| {
                RouterError::malformed(
                    KIND,
                    &canary.spec.target_ref.name,
                    &namespace_of(canary),
                    "no revision created yet",
                )
            })?;
        service
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key, revision.clone());
        self.update(canary, &service).await?;
        info!(canary = %canary.key(), %revision, "Knative primary revision pinned");
        Ok(())
    }

    /// Reads the split Knative reports as applied
    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let service = self.get_service(canary).await?;
        let primary_revision = self.primary_revision(canary, &service)?;
        let traffic = service
            .status
            .as_ref()
            .map(|s| s.traffic.as_slice())
            .unwrap_or_default();

        let malformed = |reason: &str| {
            RouterError::malformed(
                KIND,
                &canary.spec.target_ref.name,
                &namespace_of(canary),
                reason,
            )
        };
        let percent = |target: Option<&TrafficTarget>, side: &str| -> Result<u32, RouterError> {
            let target = target.ok_or_else(|| malformed(&format!("no {} traffic target", side)))?;
            target
                .percent
                .and_then(|p| u32::try_from(p).ok())
                .ok_or_else(|| malformed(&format!("{} traffic target has no percent", side)))
        };

        let canary_weight = percent(
            traffic.iter().find(|t| t.latest_revision == Some(true)),
            "canary",
        )?;
        let primary = percent(
            traffic
                .iter()
                .find(|t| t.revision_name.as_deref() == Some(primary_revision.as_str())),
            "primary",
        )?;
        Ok(Weights::new(primary, canary_weight))
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let mut service = self.get_service(canary).await?;
        let primary_revision = self.primary_revision(canary, &service)?;

        service.spec.traffic = vec![
            TrafficTarget {
                latest_revision: Some(true),
                percent: Some(i64::from(weights.canary)),
                ..Default::default()
            },
            TrafficTarget {
                revision_name: Some(primary_revision),
                percent: Some(i64::from(weights.primary)),
                ..Default::default()
            },
        ];
        self.update(canary, &service).await?;
        info!(canary = %canary.key(), %weights, "Knative traffic updated");
        Ok(())
    }

    /// Drops the primary revision pin
    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError> {
        let mut service = self.get_service(canary).await?;
        let key = self.primary_revision_key();
        let removed = service
            .metadata
            .annotations
            .as_mut()
            .and_then(|a| a.remove(&key));
        if removed.is_some() {
            self.update(canary, &service).await?;
            info!(canary = %canary.key(), "Knative primary revision released");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "knative_test.rs"]
mod tests;
