//! In-memory [`ClusterApi`] for router tests

use super::{ApiError, ClusterApi};
use async_trait::async_trait;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Stores objects keyed by (namespace, name)
///
/// Assigns a fresh resourceVersion on every write and rejects replaces that
/// carry a stale one, like the API server does.
pub struct FakeApi<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    version: AtomicU64,
    writes: AtomicUsize,
}

impl<K> Default for FakeApi<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            writes: AtomicUsize::new(0),
        }
    }
}

impl<K> FakeApi<K>
where
    K: Resource + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting a write
    pub fn insert(&self, namespace: &str, mut obj: K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        obj.meta_mut().resource_version = Some(self.next_version());
        self.objects
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), obj);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of create, replace and delete calls that succeeded
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl<K> ClusterApi<K> for FakeApi<K>
where
    K: Resource + Clone + Send + Sync,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError> {
        Ok(self.stored(namespace, name))
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(ApiError::Conflict(format!("{} already exists", name)));
        }
        let mut created = obj.clone();
        created.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ApiError> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().unwrap();
        let live = objects
            .get(&key)
            .ok_or_else(|| ApiError::NotFound(name.to_string()))?;
        let sent = obj.meta().resource_version.as_deref();
        if sent.is_some() && sent != live.meta().resource_version.as_deref() {
            return Err(ApiError::Conflict(format!(
                "{} was modified, resourceVersion {:?} is stale",
                name, sent
            )));
        }
        let mut replaced = obj.clone();
        replaced.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, replaced.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let removed = self
            .objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
