//! Create-or-update of route objects
//!
//! Every adapter funnels its writes through [`converge`] so that a second
//! pass with unchanged input performs no writes and live weights survive a
//! shape change.

use super::RouterError;
use crate::cluster::ClusterApi;
use kube::Resource;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converged {
    Created,
    Updated,
    Unchanged,
}

/// Bring the object named by `desired` to the desired shape
///
/// When the object is absent `desired` is created as is. When it exists
/// `merge(live, desired)` decides: `Some(obj)` is written back with the
/// live resourceVersion, `None` leaves the object untouched.
pub async fn converge<K, M>(
    api: &dyn ClusterApi<K>,
    namespace: &str,
    canary_key: &str,
    desired: K,
    merge: M,
) -> Result<Converged, RouterError>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync,
    M: FnOnce(&K, &K) -> Result<Option<K>, RouterError>,
{
    let kind = K::kind(&()).to_string();
    let name = desired.meta().name.clone().unwrap_or_default();

    let live = api
        .get(namespace, &name)
        .await
        .map_err(RouterError::cluster(&kind, &name, namespace, "get"))?;

    let Some(live) = live else {
        api.create(namespace, &desired)
            .await
            .map_err(RouterError::cluster(&kind, &name, namespace, "create"))?;
        info!(canary = %canary_key, kind = %kind, name = %name, "{} created", kind);
        return Ok(Converged::Created);
    };

    match merge(&live, &desired)? {
        Some(mut updated) => {
            updated.meta_mut().resource_version = live.meta().resource_version.clone();
            api.replace(namespace, &name, &updated)
                .await
                .map_err(RouterError::cluster(&kind, &name, namespace, "update"))?;
            info!(canary = %canary_key, kind = %kind, name = %name, "{} updated", kind);
            Ok(Converged::Updated)
        }
        None => {
            debug!(canary = %canary_key, kind = %kind, name = %name, "{} unchanged", kind);
            Ok(Converged::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeApi;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn config(value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("routes".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("v".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    fn replace_when_data_differs(
        live: &ConfigMap,
        desired: &ConfigMap,
    ) -> Result<Option<ConfigMap>, RouterError> {
        if live.data == desired.data {
            return Ok(None);
        }
        let mut updated = live.clone();
        updated.data = desired.data.clone();
        Ok(Some(updated))
    }

    #[tokio::test]
    async fn test_converge_creates_then_noops() {
        let api = FakeApi::<ConfigMap>::new();

        let first = converge(&api, "test", "c.test", config("a"), replace_when_data_differs)
            .await
            .unwrap();
        let second = converge(&api, "test", "c.test", config("a"), replace_when_data_differs)
            .await
            .unwrap();

        assert_eq!(first, Converged::Created);
        assert_eq!(second, Converged::Unchanged);
        assert_eq!(api.writes(), 1);
    }

    #[tokio::test]
    async fn test_converge_updates_with_live_resource_version() {
        let api = FakeApi::<ConfigMap>::new();
        api.insert("test", config("a"));

        let result = converge(&api, "test", "c.test", config("b"), replace_when_data_differs)
            .await
            .unwrap();

        assert_eq!(result, Converged::Updated);
        let stored = api.stored("test", "routes").unwrap();
        assert_eq!(stored.data.unwrap()["v"], "b");
    }

    #[tokio::test]
    async fn test_converge_propagates_merge_error() {
        let api = FakeApi::<ConfigMap>::new();
        api.insert("test", config("a"));

        let result = converge(&api, "test", "c.test", config("b"), |_, _| {
            Err(RouterError::InvalidInput("boom".to_string()))
        })
        .await;

        assert!(matches!(result, Err(RouterError::InvalidInput(_))));
        assert_eq!(api.writes(), 0);
    }
}
