use super::{ApiError, ClusterApi};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;

/// [`ClusterApi`] backed by a typed `kube::Api`
pub struct KubeApi<K> {
    client: Client,
    scoped: fn(Client, &str) -> Api<K>,
}

impl<K> KubeApi<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn namespaced(client: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            client,
            scoped: |client, namespace| Api::namespaced(client, namespace),
        }
    }

    /// Cluster-scoped kinds, the namespace argument is ignored
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            scoped: |client, _| Api::all(client),
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        (self.scoped)(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ClusterApi<K> for KubeApi<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(ApiError::from_kube)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        self.api(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(ApiError::from_kube)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ApiError> {
        self.api(namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(ApiError::from_kube)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(ApiError::from_kube(e)),
        }
    }
}

/// [`ClusterApi`] serving `K` at an API version other than its own
///
/// Used for kinds whose wire schema is unchanged across versions (Gateway API
/// v1beta1, SMI v1alpha3). Requests go through `DynamicObject` and the
/// payload is transcoded to and from `K`.
pub struct VersionedApi<K> {
    client: Client,
    resource: ApiResource,
    _kind: PhantomData<fn() -> K>,
}

impl<K> VersionedApi<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn new(client: Client, version: &str) -> Self {
        let mut resource = ApiResource::erase::<K>(&());
        resource.api_version = if resource.group.is_empty() {
            version.to_string()
        } else {
            format!("{}/{}", resource.group, version)
        };
        resource.version = version.to_string();
        Self {
            client,
            resource,
            _kind: PhantomData,
        }
    }

    pub fn api_version(&self) -> &str {
        &self.resource.api_version
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

impl<K> VersionedApi<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    fn to_dynamic(&self, obj: &K) -> Result<DynamicObject, ApiError> {
        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "apiVersion".to_string(),
                self.resource.api_version.clone().into(),
            );
            map.insert("kind".to_string(), self.resource.kind.clone().into());
        }
        Ok(serde_json::from_value(value)?)
    }

    fn from_dynamic(obj: DynamicObject) -> Result<K, ApiError> {
        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "apiVersion".to_string(),
                K::api_version(&()).into_owned().into(),
            );
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl<K> ClusterApi<K> for VersionedApi<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError> {
        let found = self
            .api(namespace)
            .get_opt(name)
            .await
            .map_err(ApiError::from_kube)?;
        found.map(Self::from_dynamic).transpose()
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        let dynamic = self.to_dynamic(obj)?;
        let created = self
            .api(namespace)
            .create(&PostParams::default(), &dynamic)
            .await
            .map_err(ApiError::from_kube)?;
        Self::from_dynamic(created)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ApiError> {
        let dynamic = self.to_dynamic(obj)?;
        let replaced = self
            .api(namespace)
            .replace(name, &PostParams::default(), &dynamic)
            .await
            .map_err(ApiError::from_kube)?;
        Self::from_dynamic(replaced)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(ApiError::from_kube(e)),
        }
    }
}
