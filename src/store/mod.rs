//! Object repositories
//!
//! Adapters implementing the `ObjectStore` port: one backed by the API
//! server, one in memory. `Stores` bundles a repository per kind so every
//! component receives its dependencies explicitly.

pub mod kube_api;
pub mod memory;
pub mod patch;

pub use kube_api::KubeStore;
pub use memory::MemoryStore;

use crate::crd::{
    BlockDevice, BlockDeviceClaim, PoolCluster, PoolInstance, Volume, VolumeConfig, VolumePolicy,
    VolumeReplica,
};
use crate::domain::ports::{ObjectStore, ObjectStoreRef};
use crate::error::{Error, Result};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;

/// Bounds shared by every stored kind
pub trait StoredObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<T> StoredObject for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// One repository per kind
#[derive(Clone)]
pub struct Stores {
    pub pool_clusters: ObjectStoreRef<PoolCluster>,
    pub pool_instances: ObjectStoreRef<PoolInstance>,
    pub block_devices: ObjectStoreRef<BlockDevice>,
    pub claims: ObjectStoreRef<BlockDeviceClaim>,
    pub volume_configs: ObjectStoreRef<VolumeConfig>,
    pub volume_policies: ObjectStoreRef<VolumePolicy>,
    pub volumes: ObjectStoreRef<Volume>,
    pub replicas: ObjectStoreRef<VolumeReplica>,
    pub budgets: ObjectStoreRef<PodDisruptionBudget>,
}

impl Stores {
    /// Repositories backed by the API server, scoped to one namespace
    pub fn kube(client: Client, namespace: &str) -> Self {
        Self {
            pool_clusters: Arc::new(KubeStore::new(client.clone(), namespace)),
            pool_instances: Arc::new(KubeStore::new(client.clone(), namespace)),
            block_devices: Arc::new(KubeStore::new(client.clone(), namespace)),
            claims: Arc::new(KubeStore::new(client.clone(), namespace)),
            volume_configs: Arc::new(KubeStore::new(client.clone(), namespace)),
            volume_policies: Arc::new(KubeStore::new(client.clone(), namespace)),
            volumes: Arc::new(KubeStore::new(client.clone(), namespace)),
            replicas: Arc::new(KubeStore::new(client.clone(), namespace)),
            budgets: Arc::new(KubeStore::new(client, namespace)),
        }
    }

    /// Empty in-memory repositories
    pub fn in_memory(namespace: &str) -> Self {
        Self {
            pool_clusters: Arc::new(MemoryStore::new(namespace)),
            pool_instances: Arc::new(MemoryStore::new(namespace)),
            block_devices: Arc::new(MemoryStore::new(namespace)),
            claims: Arc::new(MemoryStore::new(namespace)),
            volume_configs: Arc::new(MemoryStore::new(namespace)),
            volume_policies: Arc::new(MemoryStore::new(namespace)),
            volumes: Arc::new(MemoryStore::new(namespace)),
            replicas: Arc::new(MemoryStore::new(namespace)),
            budgets: Arc::new(MemoryStore::new(namespace)),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Return the stored object named like `obj`, creating it when absent.
///
/// The boolean is true when this call created the object.
pub async fn get_or_create<K: StoredObject>(
    store: &dyn ObjectStore<K>,
    obj: &K,
) -> Result<(K, bool)> {
    let name = obj.name_any();
    if let Some(existing) = store.get(&name).await? {
        return Ok((existing, false));
    }
    match store.create(obj).await {
        Ok(created) => Ok((created, true)),
        // Lost a race with another writer
        Err(Error::ResourceExists { kind, name }) => store
            .get(&name)
            .await?
            .map(|existing| (existing, false))
            .ok_or(Error::ResourceNotFound { kind, name }),
        Err(e) => Err(e),
    }
}

/// Add a finalizer when missing
pub async fn ensure_finalizer<K: StoredObject>(
    store: &dyn ObjectStore<K>,
    obj: &K,
    finalizer: &str,
) -> Result<K> {
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().push(finalizer.to_string());
    store.patch(obj, &updated).await
}

/// Drop a finalizer; the object disappears if it was the last one on a
/// deleting object.
pub async fn remove_finalizer<K: StoredObject>(
    store: &dyn ObjectStore<K>,
    obj: &K,
    finalizer: &str,
) -> Result<()> {
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let mut updated = obj.clone();
    let remaining: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    updated.meta_mut().finalizers = if remaining.is_empty() {
        None
    } else {
        Some(remaining)
    };
    match store.patch(obj, &updated).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether the object has been marked for deletion
pub fn is_deleting<K: StoredObject>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
