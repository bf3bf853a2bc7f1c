//! NGINX ingress canary router
//!
//! The user ingress is cloned into `<ingress>-canary` pointing at the canary
//! Service. NGINX splits traffic from the canary annotations on the clone.

use super::converge::converge;
use super::metadata::{filter_metadata, is_owned_by, owner_references, KUBECTL_ANNOTATION};
use super::{namespace_of, Router, RouterError, RouterOptions, Weights};
use crate::cluster::ClusterApi;
use crate::crd::Canary;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const KIND: &str = "Ingress";

pub struct IngressRouter {
    ingresses: Arc<dyn ClusterApi<Ingress>>,
    options: RouterOptions,
}

/// Name of the user ingress and of its canary clone
pub(crate) fn ingress_names(canary: &Canary) -> Result<(String, String), RouterError> {
    let name = canary
        .spec
        .ingress_ref
        .as_ref()
        .map(|r| r.name.clone())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            RouterError::MissingReference(format!("canary {} has no ingressRef", canary.key()))
        })?;
    let canary_name = format!("{}-canary", name);
    Ok((name, canary_name))
}

/// Reads the user ingress, reporting its absence as a missing reference
pub(crate) async fn get_user_ingress(
    api: &dyn ClusterApi<Ingress>,
    namespace: &str,
    name: &str,
) -> Result<Ingress, RouterError> {
    api.get(namespace, name)
        .await
        .map_err(RouterError::cluster(KIND, name, namespace, "get"))?
        .ok_or_else(|| {
            RouterError::MissingReference(format!("Ingress {}.{} not found", name, namespace))
        })
}

/// Renames every rule backend pointing at `from`, returning whether any did
pub(crate) fn swap_backend(spec: &mut IngressSpec, from: &str, to: &str) -> bool {
    let mut found = false;
    for rule in spec.rules.iter_mut().flatten() {
        for path in rule.http.iter_mut().flat_map(|h| h.paths.iter_mut()) {
            if let Some(service) = path.backend.service.as_mut() {
                if service.name == from {
                    service.name = to.to_string();
                    found = true;
                }
            }
        }
    }
    found
}

impl IngressRouter {
    pub fn new(ingresses: Arc<dyn ClusterApi<Ingress>>, options: RouterOptions) -> Self {
        Self { ingresses, options }
    }

    fn annotation(&self, suffix: &str) -> String {
        format!("{}/{}", self.options.ingress_annotation_prefix, suffix)
    }

    /// Annotations without any canary routing rule
    fn without_canary(
        &self,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        let canary_prefix = self.annotation("canary");
        filter_metadata(annotations)
            .into_iter()
            .filter(|(k, _)| !k.starts_with(&canary_prefix) && k != KUBECTL_ANNOTATION)
            .collect()
    }

    /// Canary enabled with no traffic
    fn disabled(
        &self,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        let mut out = self.without_canary(annotations);
        out.insert(self.annotation("canary"), "true".to_string());
        out.insert(self.annotation("canary-weight"), "0".to_string());
        out
    }

    /// Header and cookie rules from the analysis matches
    ///
    /// NGINX supports a single header and a single cookie, the last of each wins.
    fn header_rules(
        &self,
        canary: &Canary,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        let mut out = self.without_canary(annotations);
        out.insert(self.annotation("canary"), "true".to_string());
        for m in canary.analysis_matches() {
            for (name, value) in m.headers.iter().flatten() {
                if name == "cookie" {
                    if let Some(exact) = &value.exact {
                        out.insert(self.annotation("canary-by-cookie"), exact.clone());
                    }
                    continue;
                }
                out.insert(self.annotation("canary-by-header"), name.clone());
                if let Some(exact) = &value.exact {
                    out.insert(self.annotation("canary-by-header-value"), exact.clone());
                }
                if let Some(regex) = &value.regex {
                    out.insert(self.annotation("canary-by-header-pattern"), regex.clone());
                }
            }
        }
        out
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

#[async_trait]
impl Router for IngressRouter {
    fn name(&self) -> &'static str {
        "nginx"
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let (name, canary_name) = ingress_names(canary)?;
        let names = canary.service_names();
        let namespace = namespace_of(canary);
        let ingress = get_user_ingress(self.ingresses.as_ref(), &namespace, &name).await?;

        let mut spec = ingress.spec.clone().unwrap_or_default();
        if !swap_backend(&mut spec, &names.apex, &names.canary) {
            return Err(RouterError::malformed(
                KIND,
                &name,
                &namespace,
                format!("backend {} not found", names.apex),
            ));
        }

        let desired = Ingress {
            metadata: ObjectMeta {
                name: Some(canary_name),
                namespace: Some(namespace.clone()),
                labels: ingress.metadata.labels.clone(),
                annotations: Some(self.disabled(ingress.metadata.annotations.as_ref())),
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
        let ingress = self.get_canary_ingress(canary).await?;
        let annotations = ingress.metadata.annotations.unwrap_or_default();

        if !canary.analysis_matches().is_empty()
            && (annotations.contains_key(&self.annotation("canary-by-cookie"))
                || annotations.contains_key(&self.annotation("canary-by-header")))
        {
            return Ok(Weights::new(0, 100));
        }

        let weight = match annotations.get(&self.annotation("canary-weight")) {
            None => 0,
            Some(value) => value
                .parse::<u32>()
                .ok()
                .filter(|w| *w <= 100)
                .ok_or_else(|| {
                    RouterError::malformed(
                        KIND,
                        ingress.metadata.name.as_deref().unwrap_or_default(),
                        &namespace_of(canary),
                        format!("invalid canary-weight {:?}", value),
                    )
                })?,
        };
        Ok(Weights::from_canary(weight))
    }

    async fn set_routes(&self, canary: &Canary, weights: Weights) -> Result<(), RouterError> {
        weights.validate()?;
        let (_, name) = ingress_names(canary)?;
        let namespace = namespace_of(canary);
        let mut ingress = self.get_canary_ingress(canary).await?;

        let current = ingress.metadata.annotations.take();
        let annotations = if weights.canary == 0 {
            self.disabled(current.as_ref())
        } else if !canary.analysis_matches().is_empty() {
            self.header_rules(canary, current.as_ref())
        } else {
            let mut out = current.unwrap_or_default();
            out.insert(self.annotation("canary"), "true".to_string());
            out.insert(self.annotation("canary-weight"), weights.canary.to_string());
            out
        };
        ingress.metadata.annotations = Some(annotations);

        self.ingresses
            .replace(&namespace, &name, &ingress)
            .await
            .map_err(RouterError::cluster(KIND, &name, &namespace, "update"))?;
        info!(canary = %canary.key(), %weights, "Ingress routes updated");
        Ok(())
    }

    /// Deletes the canary ingress when this canary owns it
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
        if is_owned_by(&ingress.metadata, canary) {
            self.ingresses
                .delete(&namespace, &name)
                .await
                .map_err(RouterError::cluster(KIND, &name, &namespace, "delete"))?;
            info!(canary = %canary.key(), ingress = %name, "Ingress deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "ingress_test.rs"]
mod tests;
