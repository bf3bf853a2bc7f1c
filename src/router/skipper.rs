//! Skipper ingress router
//!
//! The user ingress stays untouched. A `<ingress>-canary` clone routes the
//! same paths to both primary and canary and carries the split in the
//! `zalando.org/backend-weights` annotation. A `Weight(100)` predicate makes
//! the clone win over the user ingress, `False()` switches it off.

use super::converge::converge;
use super::ingress::{get_user_ingress, ingress_names};
use super::metadata::{filter_metadata, is_owned_by, owner_references, KUBECTL_ANNOTATION};
use super::{initial_weights, namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::Canary;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const KIND: &str = "Ingress";
const PREDICATE_KEY: &str = "zalando.org/skipper-predicate";
const BACKEND_WEIGHTS_KEY: &str = "zalando.org/backend-weights";
const ROUTE_WEIGHT: &str = "Weight(100)";
const ROUTE_DISABLED: &str = "False()";

pub struct SkipperRouter {
    ingresses: Arc<dyn ClusterApi<Ingress>>,
    options: RouterOptions,
}

impl SkipperRouter {
    pub fn new(ingresses: Arc<dyn ClusterApi<Ingress>>, options: RouterOptions) -> Self {
        Self { ingresses, options }
    }

    async fn get_canary_ingress(&self, canary: &Canary) -> Result<Ingress, RouterError> {
        let (_, name) = ingress_names(canary)?;
        let namespace = namespace_of(canary);
        self.ingresses
            .get(&namespace, &name)
            .await
            .map_err(RouterError::cluster(KIND, &name, &namespace, "get"))?
            .ok_or_else(|| RouterError::not_found(KIND, &name, &namespace))
    }
}

/// Puts `predicate` first, dropping any previous routing toggle
fn insert_predicate(raw: &str, predicate: &str) -> String {
    let mut predicates = vec![predicate];
    predicates.extend(
        raw.split("&&")
            .map(str::trim)
            .filter(|p| !p.is_empty() && *p != ROUTE_WEIGHT && *p != ROUTE_DISABLED),
    );
    predicates.join(" && ")
}

/// Flips apex paths to the primary and appends a canary copy of each
fn split_paths(spec: &mut IngressSpec, apex: &str, primary: &str, canary: &str) -> bool {
    let mut found = false;
    for rule in spec.rules.iter_mut().flatten() {
        let Some(http) = rule.http.as_mut() else {
            continue;
        };
        let mut canary_paths = Vec::new();
        for path in http.paths.iter_mut() {
            if let Some(service) = path.backend.service.as_mut() {
                if service.name == apex {
                    service.name = primary.to_string();
                    let mut copy = path.clone();
                    if let Some(s) = copy.backend.service.as_mut() {
                        s.name = canary.to_string();
                    }
                    canary_paths.push(copy);
                    found = true;
                }
            }
        }
        http.paths.extend(canary_paths);
    }
    found
}

fn apply_weights(
    annotations: &mut BTreeMap<String, String>,
    canary: &Canary,
    weights: Weights,
) -> Result<(), RouterError> {
    let names = canary.service_names();
    let backend_weights = BTreeMap::from([
        (names.primary, weights.primary),
        (names.canary, weights.canary),
    ]);
    annotations.insert(
        BACKEND_WEIGHTS_KEY.to_string(),
        serde_json::to_string(&backend_weights)?,
    );
    let toggle = if weights.canary == 0 {
        ROUTE_DISABLED
    } else {
        ROUTE_WEIGHT
    };
    let current = annotations.get(PREDICATE_KEY).cloned().unwrap_or_default();
    annotations.insert(PREDICATE_KEY.to_string(), insert_predicate(&current, toggle));
    Ok(())
}

#[async_trait]
impl Router for SkipperRouter {
    fn name(&self) -> &'static str {
        "skipper"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let (name, canary_name) = ingress_names(canary)?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let ingress = get_user_ingress(self.ingresses.as_ref(), &namespace, &name).await?;

        let mut spec = ingress.spec.clone().unwrap_or_default();
        if !split_paths(&mut spec, &names.apex, &names.primary, &names.canary) {
            return Err(RouterError::malformed(
                KIND,
                &name,
                &namespace,
                format!("backend {} not found", names.apex),
            ));
        }

        let mut annotations = filter_metadata(ingress.metadata.annotations.as_ref());
        annotations.remove(KUBECTL_ANNOTATION);
        apply_weights(&mut annotations, canary, initial_weights(canary))?;

        let desired = Ingress {
            metadata: ObjectMeta {
                name: Some(canary_name),
                namespace: Some(namespace.clone()),
                labels: ingress.metadata.labels.clone(),
                annotations: Some(annotations),
                owner_references: owner_references(canary, self.options.set_owner_refs),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        };

        converge(
            self.ingresses.as_ref(),
            &namespace,
            &canary.key(),
            desired,
            |live, desired| {
                // live annotations carry the current split
                if live.spec == desired.spec {
                    return Ok(None);
                }
                let mut updated = live.clone();
                updated.spec = desired.spec.clone();
                Ok(Some(updated))
            },
        )
        .await?;
        Ok(())
    }

    async fn get_routes(&self, canary: &Canary) -> Result<Weights, RouterError> {
        let names = canary.service_names();
        let ingress = self.get_canary_ingress(canary).await?;
        let name = ingress.metadata.name.clone().unwrap_or_default();
        let namespace = namespace_of(canary);
        let malformed = |reason: String| RouterError::malformed(KIND, &name, &namespace, reason);

        let raw = ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BACKEND_WEIGHTS_KEY))
            .ok_or_else(|| malformed(format!("annotation {} not found", BACKEND_WEIGHTS_KEY)))?;
        let backend_weights: BTreeMap<String, u32> = serde_json::from_str(raw)
            .map_err(|e| malformed(format!("invalid {}: {}", BACKEND_WEIGHTS_KEY, e)))?;

        let weight_of = |service: &str| {
            backend_weights
                .get(service)
                .copied()
                .ok_or_else(|| malformed(format!("no weight for backend {}", service)))
        };
        let weights = Weights::new(weight_of(&names.primary)?, weight_of(&names.canary)?);
        debug!(canary = %canary.key(), %weights, "Skipper routes read");
        Ok(weights)
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let (_, name) = ingress_names(canary)?;
        let namespace = namespace_of(canary);
        let mut ingress = self.get_canary_ingress(canary).await?;

        let annotations = ingress.metadata.annotations.get_or_insert_with(BTreeMap::new);
        apply_weights(annotations, canary, weights)?;

        self.ingresses
            .replace(&namespace, &name, &ingress)
            .await
            .map_err(RouterError::cluster(KIND, &name, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "Skipper routes updated");
        Ok(())
    }

    /// Deletes the clone when this canary owns it
    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError> {
        let (_, name) = ingress_names(canary)?;
        let namespace = namespace_of(canary);
        let Some(ingress) = self
            .ingresses
            .get(&namespace, &name)
            .await
            .map_err(RouterError::cluster(KIND, &name, &namespace, "get"))?
        else {
            return Ok(());
        };
        if !is_owned_by(&ingress.metadata, canary) {
            debug!(canary = %canary.key(), ingress = %name, "Ingress not owned, left in place");
            return Ok(());
        }
        self.ingresses
            .delete(&namespace, &name)
            .await
            .map_err(RouterError::cluster(KIND, &name, &namespace, "delete"))?;
        info!(canary = %canary.key(), ingress = %name, "Skipper canary ingress deleted");
        Ok(())
    }
}

#[cfg(test)]
#[path = "skipper_test.rs"]
mod tests;
