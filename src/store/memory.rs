//! In-memory object store
//!
//! Implements the repository port with the API-server behaviors the
//! reconciliation core relies on: resourceVersion conflicts, generateName,
//! status-subresource separation and finalizer-gated deletion.

use super::{patch, StoredObject};
use crate::domain::ports::{LabelSelector, ObjectStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::RwLock;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of the random suffix appended to a generateName prefix
const GENERATED_SUFFIX_LEN: usize = 5;

/// In-memory repository for one kind
pub struct MemoryStore<K> {
    namespace: String,
    objects: RwLock<BTreeMap<String, K>>,
    revision: AtomicU64,
}

impl<K: StoredObject> MemoryStore<K> {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            objects: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn not_found(name: &str) -> Error {
        Error::ResourceNotFound {
            kind: Self::kind(),
            name: name.to_string(),
        }
    }

    fn check_revision(stored: &K, incoming: &K) -> Result<()> {
        match incoming.resource_version() {
            Some(rv) if Some(&rv) != stored.resource_version().as_ref() => Err(Error::Conflict {
                kind: Self::kind(),
                name: stored.name_any(),
            }),
            _ => Ok(()),
        }
    }

    fn generate_name(prefix: &str) -> String {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_SUFFIX_LEN)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        format!("{}{}", prefix, suffix)
    }

    /// Store `obj` over `stored`, finishing a pending deletion when the last
    /// finalizer is gone.
    fn commit(&self, objects: &mut BTreeMap<String, K>, mut obj: K) -> K {
        let name = obj.name_any();
        obj.meta_mut().resource_version = Some(self.next_revision());
        if obj.meta().deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            objects.remove(&name);
        } else {
            objects.insert(name, obj.clone());
        }
        obj
    }
}

/// Copy server-owned metadata from the stored object onto an incoming one
fn preserve_server_fields(stored: &Value, incoming: &mut Value) {
    for field in ["uid", "creationTimestamp", "deletionTimestamp", "generation"] {
        match stored["metadata"].get(field) {
            Some(value) => incoming["metadata"][field] = value.clone(),
            None => {
                if let Some(meta) = incoming["metadata"].as_object_mut() {
                    meta.remove(field);
                }
            }
        }
    }
}

fn replace_status(from: &Value, into: &mut Value) {
    match (from.get("status"), into.as_object_mut()) {
        (Some(status), Some(map)) => {
            map.insert("status".to_string(), status.clone());
        }
        (None, Some(map)) => {
            map.remove("status");
        }
        _ => {}
    }
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.objects.read().get(name).cloned())
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|obj| selector.matches(obj.labels()))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        let name = match (obj.meta().name.clone(), obj.meta().generate_name.clone()) {
            (Some(name), _) if !name.is_empty() => name,
            (_, Some(prefix)) => Self::generate_name(&prefix),
            _ => {
                return Err(Error::Internal(format!(
                    "{} has neither name nor generateName",
                    Self::kind()
                )))
            }
        };

        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: Self::kind(),
                name,
            });
        }

        // Status is never accepted on create
        let mut value = serde_json::to_value(&obj)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }
        obj = serde_json::from_value(value)?;

        let meta = obj.meta_mut();
        meta.name = Some(name);
        meta.namespace = Some(self.namespace.clone());
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        meta.generation = Some(1);

        Ok(self.commit(&mut objects, obj))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut objects = self.objects.write();
        let stored = objects.get(&name).ok_or_else(|| Self::not_found(&name))?;
        Self::check_revision(stored, obj)?;

        let stored_value = serde_json::to_value(stored)?;
        let mut value = serde_json::to_value(obj)?;
        preserve_server_fields(&stored_value, &mut value);
        replace_status(&stored_value, &mut value);
        if stored_value.get("spec") != value.get("spec") {
            let generation = stored.meta().generation.unwrap_or(1) + 1;
            value["metadata"]["generation"] = Value::from(generation);
        }

        let updated: K = serde_json::from_value(value)?;
        Ok(self.commit(&mut objects, updated))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut objects = self.objects.write();
        let stored = objects.get(&name).ok_or_else(|| Self::not_found(&name))?;
        Self::check_revision(stored, obj)?;

        let mut value = serde_json::to_value(stored)?;
        replace_status(&serde_json::to_value(obj)?, &mut value);

        let updated: K = serde_json::from_value(value)?;
        Ok(self.commit(&mut objects, updated))
    }

    async fn patch(&self, old: &K, new: &K) -> Result<K> {
        let name = old.name_any();
        let mut changes = patch::diff(&serde_json::to_value(old)?, &serde_json::to_value(new)?);
        if let Some(map) = changes.as_object_mut() {
            map.remove("status");
        }

        let mut objects = self.objects.write();
        let stored = objects.get(&name).ok_or_else(|| Self::not_found(&name))?;
        if patch::is_empty(&changes) {
            return Ok(stored.clone());
        }

        let stored_value = serde_json::to_value(stored)?;
        let mut value = stored_value.clone();
        patch::apply(&mut value, &changes);
        preserve_server_fields(&stored_value, &mut value);

        let patched: K = serde_json::from_value(value)?;
        Ok(self.commit(&mut objects, patched))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut objects = self.objects.write();
        let Some(stored) = objects.get(name) else {
            return Ok(());
        };
        if stored.finalizers().is_empty() {
            objects.remove(name);
            return Ok(());
        }
        if stored.meta().deletion_timestamp.is_none() {
            let mut marked = stored.clone();
            marked.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
            self.commit(&mut objects, marked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Volume, VolumePhase, VolumeSpec, VolumeStatus};
    use assert_matches::assert_matches;

    fn volume(name: &str) -> Volume {
        Volume::new(
            name,
            VolumeSpec {
                capacity_bytes: 1 << 30,
                replication_factor: 3,
                desired_replication_factor: 3,
                consistency_factor: 2,
                target_ip: None,
                queue_depth: None,
                lu_workers: None,
                replica_details: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_drops_status() {
        let store = MemoryStore::<Volume>::new("storage");
        let mut vol = volume("vol-1");
        vol.status = Some(VolumeStatus {
            phase: VolumePhase::Healthy,
            ..Default::default()
        });

        let created = store.create(&vol).await.unwrap();
        assert!(created.status.is_none());
        assert_eq!(created.namespace().as_deref(), Some("storage"));
        assert!(created.uid().is_some());

        let err = store.create(&vol).await.unwrap_err();
        assert_matches!(err, Error::ResourceExists { .. });
    }

    #[tokio::test]
    async fn test_update_detects_conflicts() {
        let store = MemoryStore::<Volume>::new("storage");
        let created = store.create(&volume("vol-1")).await.unwrap();

        let mut first = created.clone();
        first.spec.desired_replication_factor = 2;
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.spec.capacity_bytes = 2 << 30;
        assert_matches!(store.update(&stale).await, Err(Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_status_is_a_separate_subresource() {
        let store = MemoryStore::<Volume>::new("storage");
        let created = store.create(&volume("vol-1")).await.unwrap();

        let mut with_status = created.clone();
        with_status.status = Some(VolumeStatus {
            capacity_bytes: 1 << 30,
            ..Default::default()
        });
        let updated = store.update_status(&with_status).await.unwrap();
        assert_eq!(updated.status_capacity(), 1 << 30);

        // A spec update carrying no status keeps the stored status
        let mut spec_change = updated.clone();
        spec_change.status = None;
        spec_change.spec.capacity_bytes = 2 << 30;
        let updated = store.update(&spec_change).await.unwrap();
        assert_eq!(updated.status_capacity(), 1 << 30);
        assert_eq!(updated.spec.capacity_bytes, 2 << 30);
    }

    #[tokio::test]
    async fn test_patch_applies_only_the_diff() {
        let store = MemoryStore::<Volume>::new("storage");
        let created = store.create(&volume("vol-1")).await.unwrap();

        // A concurrent writer changes capacity
        let mut other = created.clone();
        other.spec.capacity_bytes = 4 << 30;
        store.update(&other).await.unwrap();

        let mut desired = created.clone();
        desired.spec.desired_replication_factor = 2;
        let patched = store.patch(&created, &desired).await.unwrap();
        assert_eq!(patched.spec.desired_replication_factor, 2);
        assert_eq!(patched.spec.capacity_bytes, 4 << 30);
    }

    #[tokio::test]
    async fn test_finalizers_gate_deletion() {
        let store = MemoryStore::<Volume>::new("storage");
        let mut vol = volume("vol-1");
        vol.metadata.finalizers = Some(vec!["test/finalizer".into()]);
        store.create(&vol).await.unwrap();

        store.delete("vol-1").await.unwrap();
        let marked = store.get("vol-1").await.unwrap().unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        let mut released = marked.clone();
        released.metadata.finalizers = None;
        store.update(&released).await.unwrap();
        assert!(store.get("vol-1").await.unwrap().is_none());

        // Deleting something absent is not an error
        store.delete("vol-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_generate_name() {
        let store = MemoryStore::<Volume>::new("storage");
        let mut vol = volume("");
        vol.metadata.name = None;
        vol.metadata.generate_name = Some("cluster-".into());
        let created = store.create(&vol).await.unwrap();
        let name = created.name_any();
        assert!(name.starts_with("cluster-"));
        assert_eq!(name.len(), "cluster-".len() + GENERATED_SUFFIX_LEN);
    }
}
