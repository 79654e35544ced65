//! Initial replica placement
//!
//! Places the pending replicas of a Pending VolumeConfig on usable pools of
//! its cluster, then binds it. The usable-pool check happens before anything
//! is created: either every pending replica gets a pool or none is created.

use super::VolumeEngine;
use crate::crd::{
    replica_id, replica_name, PoolInstance, ReplicaPhase, Volume, VolumeConfig,
    VolumeConfigPhase, VolumeConfigStatus, VolumeReplica, VolumeReplicaSpec, VolumeReplicaStatus,
    CLUSTER_LABEL, POOL_INSTANCE_LABEL, VOLUME_LABEL,
};
use crate::domain::ports::{EventKind, LabelSelector};
use crate::error::{Error, Result};
use crate::store::get_or_create;
use kube::ResourceExt;
use rand::seq::SliceRandom;
use tracing::{debug, info};

/// Outcome of a placement pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Pools that received a replica during this pass
    pub created: Vec<String>,
    /// Pools hosting a replica after the pass
    pub pools: Vec<String>,
}

/// Desired replica object of `vc` on `pool`
pub fn new_replica(vc: &VolumeConfig, volume: &Volume, pool: &str) -> VolumeReplica {
    let policy = &vc.spec.policy.replica;
    let mut replica = VolumeReplica::new(
        &replica_name(vc.name(), pool),
        VolumeReplicaSpec {
            replica_id: replica_id(vc.name(), pool),
            capacity_bytes: vc.spec.capacity_bytes,
            target_ip: volume.spec.target_ip.clone(),
            zvol_workers: policy.zvol_workers,
            compression: policy.compression.clone(),
            clone_source: vc
                .spec
                .source
                .as_ref()
                .map(|s| format!("{}@{}", s.volume, s.snapshot)),
        },
    );
    let labels = replica.labels_mut();
    labels.insert(VOLUME_LABEL.to_string(), vc.name().to_string());
    labels.insert(POOL_INSTANCE_LABEL.to_string(), pool.to_string());
    labels.insert(CLUSTER_LABEL.to_string(), vc.spec.cluster.clone());
    replica
}

/// Shuffle for fairness, then move the pool on the publish host to the front
pub fn order_pools(pools: &mut [PoolInstance], affinity_host: Option<&str>) {
    pools.shuffle(&mut rand::rng());
    if let Some(host) = affinity_host {
        if let Some(index) = pools.iter().position(|p| p.spec.host_name == host) {
            pools.swap(0, index);
        }
    }
}

/// Sorted pool names hosting the given replicas
pub fn hosting_pools(replicas: &[VolumeReplica]) -> Vec<String> {
    let mut pools: Vec<String> = replicas
        .iter()
        .filter_map(|r| r.pool_name().map(str::to_string))
        .collect();
    pools.sort();
    pools.dedup();
    pools
}

impl VolumeEngine {
    /// Replicas of a volume, as observed in the store
    pub async fn volume_replicas(&self, volume: &str) -> Result<Vec<VolumeReplica>> {
        self.stores
            .replicas
            .list(&LabelSelector::label(VOLUME_LABEL, volume))
            .await
    }

    /// Pools that may receive a new replica of `vc`
    pub async fn usable_pools(
        &self,
        vc: &VolumeConfig,
        hosting: &[String],
    ) -> Result<Vec<PoolInstance>> {
        let mut candidates = self
            .stores
            .pool_instances
            .list(&LabelSelector::label(CLUSTER_LABEL, &vc.spec.cluster))
            .await?;

        let explicit = vc.spec.policy.replica_pool_names();
        if !explicit.is_empty() {
            if explicit.len() != vc.spec.replica_count as usize {
                return Err(Error::Validation(format!(
                    "volume {} lists {} replica pools for {} replicas",
                    vc.name(),
                    explicit.len(),
                    vc.spec.replica_count
                )));
            }
            candidates.retain(|p| explicit.iter().any(|name| name == p.name()));
        }

        candidates.retain(|p| !hosting.iter().any(|name| name == p.name()));

        if let Some(source) = &vc.spec.source {
            let source_pools = hosting_pools(&self.volume_replicas(&source.volume).await?);
            candidates.retain(|p| source_pools.iter().any(|name| name == p.name()));
        }
        Ok(candidates)
    }

    /// Place pending replicas and bind the VolumeConfig
    pub async fn place_replicas(
        &self,
        vc: &VolumeConfig,
        volume: &Volume,
    ) -> Result<(VolumeConfig, Placement)> {
        let existing = self.volume_replicas(vc.name()).await?;
        let hosting = hosting_pools(&existing);
        let pending = (vc.spec.replica_count as usize).saturating_sub(existing.len());

        let mut usable = self.usable_pools(vc, &hosting).await?;
        if usable.len() < pending {
            return Err(Error::InsufficientPools {
                volume: vc.name().to_string(),
                required: pending,
                usable: usable.len(),
            });
        }

        let affinity_host = if vc.spec.policy.provision.replica_affinity {
            vc.spec.publish.node_id.as_deref()
        } else {
            None
        };
        order_pools(&mut usable, affinity_host);

        let mut placement = Placement::default();
        for pool in usable.iter().take(pending) {
            let desired = new_replica(vc, volume, pool.name());
            let (_, created) = get_or_create(self.stores.replicas.as_ref(), &desired).await?;
            if created {
                debug!(volume = %vc.name(), pool = %pool.name(), "Replica created");
            }
            placement.created.push(pool.name().to_string());
        }

        // Bind from what is observed, not from what was just attempted
        placement.pools = hosting_pools(&self.volume_replicas(vc.name()).await?);

        let mut updated = vc.clone();
        let status = updated.status.get_or_insert_with(VolumeConfigStatus::default);
        status.phase = VolumeConfigPhase::Bound;
        status.pool_info = placement.pools.clone();
        status.capacity_bytes = vc.spec.capacity_bytes;
        let updated = self.stores.volume_configs.update_status(&updated).await?;

        info!(
            volume = %vc.name(),
            pools = ?placement.pools,
            "Volume bound"
        );
        self.event(
            &updated,
            EventKind::Normal,
            "Provisioned",
            format!("replicas placed on {}", placement.pools.join(", ")),
        )
        .await;
        Ok((updated, placement))
    }

    /// Create a rebuilding replica of `vc` on `pool`
    pub(super) async fn create_recreate_replica(
        &self,
        vc: &VolumeConfig,
        volume: &Volume,
        pool: &str,
    ) -> Result<()> {
        let desired = new_replica(vc, volume, pool);
        let (mut replica, created) =
            get_or_create(self.stores.replicas.as_ref(), &desired).await?;
        if created {
            info!(volume = %vc.name(), pool = %pool, "Replica created for scale up");
        }
        // A replica left without a phase by an earlier failed pass must not
        // look like a fresh empty one
        let phase = replica.status.as_ref().map(|s| s.phase).unwrap_or_default();
        if phase == ReplicaPhase::Empty {
            replica.status = Some(VolumeReplicaStatus {
                phase: ReplicaPhase::Recreate,
            });
            self.stores.replicas.update_status(&replica).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::events::MemoryRecorder;
    use crate::crd::{ReplicaPoolInfo, VolumeSource};
    use crate::testing;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    async fn setup(pools: &[(&str, &str)]) -> (VolumeEngine, Arc<MemoryRecorder>) {
        let stores = testing::stores();
        for (name, host) in pools {
            testing::seed_pool(&stores, name, testing::CLUSTER, host).await;
        }
        let recorder = Arc::new(MemoryRecorder::new());
        (VolumeEngine::new(stores, recorder.clone()), recorder)
    }

    async fn bound(engine: &VolumeEngine, vc: VolumeConfig) -> Result<(VolumeConfig, Placement)> {
        let vc = engine.stores.volume_configs.create(&vc).await.unwrap();
        let volume = engine.ensure_volume(&vc).await.unwrap();
        engine.place_replicas(&vc, &volume).await
    }

    #[tokio::test]
    async fn test_three_replicas_on_three_pools() {
        let (engine, recorder) =
            setup(&[("c1-a", "node-a"), ("c1-b", "node-b"), ("c1-c", "node-c")]).await;

        let (vc, placement) = bound(&engine, testing::volume_config("vol-1", 3, 1 << 30))
            .await
            .unwrap();

        assert_eq!(placement.created.len(), 3);
        assert_eq!(placement.pools, vec!["c1-a", "c1-b", "c1-c"]);
        assert_eq!(vc.phase(), VolumeConfigPhase::Bound);
        assert_eq!(vc.status_pools(), placement.pools);
        assert_eq!(vc.status_capacity(), 1 << 30);

        let replicas = engine.volume_replicas("vol-1").await.unwrap();
        assert_eq!(replicas.len(), 3);
        for replica in &replicas {
            let pool = replica.pool_name().unwrap();
            assert_eq!(replica.spec.replica_id, replica_id("vol-1", pool));
        }
        assert_eq!(recorder.reasons(), vec!["Provisioned".to_string()]);
    }

    #[tokio::test]
    async fn test_not_enough_pools_creates_nothing() {
        let (engine, _) = setup(&[("c1-a", "node-a"), ("c1-b", "node-b")]).await;

        let err = bound(&engine, testing::volume_config("vol-1", 3, 1 << 30))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::InsufficientPools {
                required: 3,
                usable: 2,
                ..
            }
        );
        assert!(engine.volume_replicas("vol-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_skips_pools_already_hosting() {
        let (engine, _) =
            setup(&[("c1-a", "node-a"), ("c1-b", "node-b"), ("c1-c", "node-c")]).await;
        let vc = testing::volume_config("vol-1", 3, 1 << 30);
        let vc = engine.stores.volume_configs.create(&vc).await.unwrap();
        let volume = engine.ensure_volume(&vc).await.unwrap();

        // A previous pass crashed after placing one replica
        engine
            .stores
            .replicas
            .create(&new_replica(&vc, &volume, "c1-b"))
            .await
            .unwrap();

        let (_, placement) = engine.place_replicas(&vc, &volume).await.unwrap();
        assert_eq!(placement.created.len(), 2);
        assert!(!placement.created.contains(&"c1-b".to_string()));
        assert_eq!(engine.volume_replicas("vol-1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_explicit_pool_list_must_match_replica_count() {
        let (engine, _) = setup(&[("c1-a", "node-a"), ("c1-b", "node-b")]).await;
        let mut vc = testing::volume_config("vol-1", 2, 1 << 30);
        vc.spec.policy.replica_pool_info = vec![ReplicaPoolInfo {
            pool_name: "c1-a".into(),
        }];
        assert_matches!(bound(&engine, vc).await, Err(Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_explicit_pool_list_restricts_candidates() {
        let (engine, _) =
            setup(&[("c1-a", "node-a"), ("c1-b", "node-b"), ("c1-c", "node-c")]).await;
        let mut vc = testing::volume_config("vol-1", 2, 1 << 30);
        vc.spec.policy.replica_pool_info = ["c1-a", "c1-c"]
            .iter()
            .map(|p| ReplicaPoolInfo {
                pool_name: p.to_string(),
            })
            .collect();

        let (_, placement) = bound(&engine, vc).await.unwrap();
        assert_eq!(placement.pools, vec!["c1-a", "c1-c"]);
    }

    #[tokio::test]
    async fn test_clone_follows_source_pools() {
        let (engine, _) =
            setup(&[("c1-a", "node-a"), ("c1-b", "node-b"), ("c1-c", "node-c")]).await;
        let mut source = testing::volume_config("src", 2, 1 << 30);
        source.spec.policy.replica_pool_info = ["c1-a", "c1-b"]
            .iter()
            .map(|p| ReplicaPoolInfo {
                pool_name: p.to_string(),
            })
            .collect();
        bound(&engine, source).await.unwrap();

        let mut clone = testing::volume_config("clone", 2, 1 << 30);
        clone.spec.source = Some(VolumeSource {
            volume: "src".into(),
            snapshot: "snap1".into(),
        });
        let (_, placement) = bound(&engine, clone).await.unwrap();
        assert_eq!(placement.pools, vec!["c1-a", "c1-b"]);

        let replica = engine
            .stores
            .replicas
            .get(&replica_name("clone", "c1-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.spec.clone_source.as_deref(), Some("src@snap1"));
    }

    #[test]
    fn test_affinity_moves_publish_host_first() {
        let mut pools: Vec<PoolInstance> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| {
                testing::pool_instance(
                    &format!("c1-{}", n),
                    &format!("node-{}", n),
                    crate::crd::RaidType::Stripe,
                    &[&["sdb"]],
                    &[],
                )
            })
            .collect();
        for _ in 0..10 {
            order_pools(&mut pools, Some("node-c"));
            assert_eq!(pools[0].name(), "c1-c");
            assert_eq!(pools.len(), 4);
        }
    }
}
