//! PoolCluster controller
//!
//! Validates the pool specs of a cluster, claims their block devices,
//! creates one PoolInstance per pool and keeps instance specs in step with
//! the cluster. Pool realization itself happens in the per-node pool manager.

use super::runner::{Action, Reconciler};
use crate::crd::{
    claim_name, BlockDeviceClaim, BlockDeviceClaimSpec, BlockDeviceClaimStatus, BlockDeviceRef,
    BlockDeviceStatus, ClaimPhase, ClaimState, PoolCluster, PoolClusterStatus, PoolConfig,
    PoolInstance, PoolInstanceSpec, PoolPhase, PoolSpec, RaidGroup, RaidType, CLUSTER_LABEL,
    HOST_LABEL,
    POOL_PROTECTION_FINALIZER, PREDECESSOR_ANNOTATION,
};
use crate::domain::ports::{EventKind, EventRecorderRef, LabelSelector};
use crate::error::{Error, Result};
use crate::store::{get_or_create, Stores};
use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

// =============================================================================
// Validation
// =============================================================================

/// Check a cluster spec against itself and against the instances realized
/// from its previous version.
pub fn validate(cluster: &PoolCluster, instances: &[PoolInstance]) -> Result<()> {
    let by_host: HashMap<&str, &PoolInstance> = instances
        .iter()
        .map(|i| (i.spec.host_name.as_str(), i))
        .collect();
    let mut hosts = HashSet::new();
    let mut devices = HashSet::new();

    for (index, pool) in cluster.spec.pools.iter().enumerate() {
        let host = pool.host_name().ok_or_else(|| {
            Error::Validation(format!(
                "pool {} must select a node with the {} label",
                index, HOST_LABEL
            ))
        })?;
        if !hosts.insert(host) {
            return Err(Error::Validation(format!(
                "host {} is used by more than one pool",
                host
            )));
        }
        if pool.data_raid_groups.is_empty() {
            return Err(Error::Validation(format!(
                "pool on {} has no data raid groups",
                host
            )));
        }

        let config = pool
            .pool_config
            .with_defaults(cluster.spec.default_pool_config.as_ref());
        let groups = pool
            .data_raid_groups
            .iter()
            .map(|g| (g, config.data_raid_group_type))
            .chain(
                pool.write_cache_raid_groups
                    .iter()
                    .map(|g| (g, config.write_cache_type())),
            );
        for (group, raid) in groups {
            if group.block_devices.len() < raid.min_devices() {
                return Err(Error::Validation(format!(
                    "{} raid group on {} needs at least {} devices, got {}",
                    raid,
                    host,
                    raid.min_devices(),
                    group.block_devices.len()
                )));
            }
        }

        for device in pool.block_device_names() {
            if !devices.insert(device) {
                return Err(Error::Validation(format!(
                    "block device {} is listed more than once",
                    device
                )));
            }
        }

        if let Some(instance) = by_host.get(host) {
            validate_change(
                host,
                config.data_raid_group_type,
                &instance.spec.data_raid_groups,
                &pool.data_raid_groups,
            )?;
            validate_change(
                host,
                config.write_cache_type(),
                &instance.spec.write_cache_raid_groups,
                &pool.write_cache_raid_groups,
            )?;
        }
    }
    Ok(())
}

/// Raid groups may be added but not removed, and at most one device per
/// group may be swapped in one change. Stripe groups have no redundancy to
/// resilver from, so their devices cannot be swapped at all.
fn validate_change(
    host: &str,
    raid: RaidType,
    current: &[RaidGroup],
    desired: &[RaidGroup],
) -> Result<()> {
    if desired.len() < current.len() {
        return Err(Error::Validation(format!(
            "raid groups cannot be removed from the pool on {}",
            host
        )));
    }
    for (index, (old, new)) in current.iter().zip(desired).enumerate() {
        if old.block_devices.len() != new.block_devices.len() {
            return Err(Error::Validation(format!(
                "raid group {} on {} cannot change its device count",
                index, host
            )));
        }
        let swapped = old
            .device_names()
            .iter()
            .zip(new.device_names())
            .filter(|(a, b)| **a != *b)
            .count();
        if swapped > 0 && raid == RaidType::Stripe {
            return Err(Error::Validation(format!(
                "raid group {} on {} is a stripe and its devices cannot be replaced",
                index, host
            )));
        }
        if swapped > 1 {
            return Err(Error::Validation(format!(
                "raid group {} on {} replaces {} devices at once, only one is allowed",
                index, host, swapped
            )));
        }
    }
    Ok(())
}

/// Devices that replace another device at the same raid group position,
/// new device name to predecessor name
pub fn replacements(current: &PoolInstanceSpec, desired: &PoolSpec) -> BTreeMap<String, String> {
    let pairs = current
        .data_raid_groups
        .iter()
        .zip(&desired.data_raid_groups)
        .chain(
            current
                .write_cache_raid_groups
                .iter()
                .zip(&desired.write_cache_raid_groups),
        );
    let mut out = BTreeMap::new();
    for (old, new) in pairs {
        for (a, b) in old.device_names().into_iter().zip(new.device_names()) {
            if a != b {
                out.insert(b.to_string(), a.to_string());
            }
        }
    }
    out
}

/// Instance spec for a pool, carrying over device links already resolved
pub fn instance_spec(
    pool: &PoolSpec,
    defaults: Option<&PoolConfig>,
    current: Option<&PoolInstanceSpec>,
) -> PoolInstanceSpec {
    let resolved: HashMap<&str, &BlockDeviceRef> = current
        .map(|spec| {
            spec.data_raid_groups
                .iter()
                .chain(&spec.write_cache_raid_groups)
                .flat_map(|g| &g.block_devices)
                .map(|bd| (bd.block_device_name.as_str(), bd))
                .collect()
        })
        .unwrap_or_default();
    let carry = |groups: &[RaidGroup]| -> Vec<RaidGroup> {
        groups
            .iter()
            .map(|g| RaidGroup {
                block_devices: g
                    .block_devices
                    .iter()
                    .map(|bd| match resolved.get(bd.block_device_name.as_str()) {
                        Some(known) if bd.dev_link.is_none() => (*known).clone(),
                        _ => bd.clone(),
                    })
                    .collect(),
            })
            .collect()
    };

    PoolInstanceSpec {
        host_name: pool.host_name().unwrap_or_default().to_string(),
        node_selector: pool.node_selector.clone(),
        pool_config: pool.pool_config.with_defaults(defaults),
        data_raid_groups: carry(&pool.data_raid_groups),
        write_cache_raid_groups: carry(&pool.write_cache_raid_groups),
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Queue key of the cluster owning a pool instance
pub fn owner_keys(instance: &PoolInstance) -> Vec<String> {
    instance
        .labels()
        .get(CLUSTER_LABEL)
        .cloned()
        .into_iter()
        .collect()
}

pub struct PoolClusterController {
    stores: Stores,
    recorder: EventRecorderRef,
}

impl PoolClusterController {
    pub fn new(stores: Stores, recorder: EventRecorderRef) -> Self {
        Self { stores, recorder }
    }

    async fn instances(&self, cluster: &str) -> Result<Vec<PoolInstance>> {
        self.stores
            .pool_instances
            .list(&LabelSelector::label(CLUSTER_LABEL, cluster))
            .await
    }

    /// Claim one device for `cluster`
    async fn claim(&self, cluster: &str, device: &str, predecessor: Option<&str>) -> Result<()> {
        let bd = self
            .stores
            .block_devices
            .get(device)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "BlockDevice".into(),
                name: device.to_string(),
            })?;

        let mut desired = BlockDeviceClaim::new(
            &claim_name(device),
            BlockDeviceClaimSpec {
                block_device_name: device.to_string(),
                node_name: bd.spec.node_name.clone(),
            },
        );
        desired
            .labels_mut()
            .insert(CLUSTER_LABEL.to_string(), cluster.to_string());
        desired.metadata.finalizers = Some(vec![POOL_PROTECTION_FINALIZER.to_string()]);
        if let Some(predecessor) = predecessor {
            desired
                .annotations_mut()
                .insert(PREDECESSOR_ANNOTATION.to_string(), predecessor.to_string());
        }

        let (mut claim, created) = get_or_create(self.stores.claims.as_ref(), &desired).await?;
        let owner = claim.labels().get(CLUSTER_LABEL).cloned().unwrap_or_default();
        if owner != cluster {
            return Err(Error::DeviceClaimedByOther {
                device: device.to_string(),
                owner,
            });
        }
        if !created {
            return Ok(());
        }

        claim.status = Some(BlockDeviceClaimStatus {
            phase: ClaimPhase::Bound,
        });
        self.stores.claims.update_status(&claim).await?;
        let mut bd = bd;
        bd.status = Some(BlockDeviceStatus {
            claim_state: ClaimState::Claimed,
        });
        self.stores.block_devices.update_status(&bd).await?;
        debug!(cluster = %cluster, device = %device, "Block device claimed");
        Ok(())
    }

    async fn converge(&self, cluster: &PoolCluster) -> Result<PoolClusterStatus> {
        let name = cluster.name_any();
        let existing = self.instances(&name).await?;
        validate(cluster, &existing)?;

        let defaults = cluster.spec.default_pool_config.as_ref();
        let by_host: HashMap<String, PoolInstance> = existing
            .iter()
            .map(|i| (i.spec.host_name.clone(), i.clone()))
            .collect();

        for pool in &cluster.spec.pools {
            let host = pool.host_name().unwrap_or_default();
            let current = by_host.get(host);
            let swaps = current
                .map(|i| replacements(&i.spec, pool))
                .unwrap_or_default();
            for device in pool.block_device_names() {
                self.claim(&name, device, swaps.get(device).map(String::as_str))
                    .await?;
            }

            let spec = instance_spec(pool, defaults, current.map(|i| &i.spec));
            match current {
                Some(instance) if instance.spec != spec => {
                    let mut updated = instance.clone();
                    updated.spec = spec;
                    self.stores.pool_instances.patch(instance, &updated).await?;
                    info!(cluster = %name, host = %host, "Pool instance updated");
                }
                Some(_) => {}
                None => {
                    let created = self.stores.pool_instances.create(&new_instance(&name, spec)).await?;
                    info!(
                        cluster = %name,
                        host = %host,
                        instance = %created.name(),
                        "Pool instance created"
                    );
                }
            }
        }

        let wanted: HashSet<&str> = cluster.spec.pools.iter().filter_map(|p| p.host_name()).collect();
        for instance in existing.iter().filter(|i| !wanted.contains(i.spec.host_name.as_str())) {
            self.stores.pool_instances.delete(instance.name()).await?;
            info!(cluster = %name, instance = %instance.name(), "Pool instance removed");
        }

        let instances = self.instances(&name).await?;
        Ok(PoolClusterStatus {
            desired_instances: cluster.spec.pools.len() as u32,
            provisioned_instances: instances.iter().filter(|i| i.was_provisioned()).count() as u32,
            healthy_instances: instances
                .iter()
                .filter(|i| i.phase() == PoolPhase::Online)
                .count() as u32,
            conditions: cluster
                .status
                .as_ref()
                .map(|s| s.conditions.clone())
                .unwrap_or_default(),
        })
    }
}

fn new_instance(cluster: &str, spec: PoolInstanceSpec) -> PoolInstance {
    let mut labels = BTreeMap::new();
    labels.insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    labels.insert(HOST_LABEL.to_string(), spec.host_name.clone());
    PoolInstance {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", cluster)),
            labels: Some(labels),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

#[async_trait]
impl Reconciler for PoolClusterController {
    fn name(&self) -> &'static str {
        "pool-cluster"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        let Some(cluster) = self.stores.pool_clusters.get(key).await? else {
            return Ok(Action::await_change());
        };

        match self.converge(&cluster).await {
            Ok(status) => {
                let changed = cluster.status.as_ref().map(|s| {
                    (s.desired_instances, s.provisioned_instances, s.healthy_instances)
                }) != Some((
                    status.desired_instances,
                    status.provisioned_instances,
                    status.healthy_instances,
                ));
                if changed {
                    let mut updated = cluster.clone();
                    updated.status = Some(status);
                    self.stores.pool_clusters.update_status(&updated).await?;
                }
                Ok(Action::await_change())
            }
            Err(e) => {
                if e.is_user_facing() {
                    self.recorder
                        .publish(
                            cluster.object_ref(&()),
                            EventKind::Warning,
                            e.reason(),
                            e.to_string(),
                        )
                        .await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::events::MemoryRecorder;
    use crate::crd::{PoolClusterSpec, PoolInstanceStatus};
    use crate::testing;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn pool(host: &str, groups: &[&[&str]]) -> PoolSpec {
        let mut node_selector = BTreeMap::new();
        node_selector.insert(HOST_LABEL.to_string(), host.to_string());
        PoolSpec {
            node_selector,
            data_raid_groups: groups.iter().map(|g| testing::raid_group(g)).collect(),
            write_cache_raid_groups: Vec::new(),
            pool_config: PoolConfig {
                data_raid_group_type: RaidType::Mirror,
                ..Default::default()
            },
        }
    }

    fn cluster(pools: Vec<PoolSpec>) -> PoolCluster {
        PoolCluster::new(
            testing::CLUSTER,
            PoolClusterSpec {
                pools,
                default_pool_config: Some(PoolConfig {
                    compression: Some("lz4".into()),
                    ..Default::default()
                }),
            },
        )
    }

    async fn setup(devices: &[(&str, &str)]) -> (PoolClusterController, Stores, Arc<MemoryRecorder>) {
        let stores = testing::stores();
        for (device, node) in devices {
            stores
                .block_devices
                .create(&testing::block_device(device, node))
                .await
                .unwrap();
        }
        let recorder = Arc::new(MemoryRecorder::new());
        (
            PoolClusterController::new(stores.clone(), recorder.clone()),
            stores,
            recorder,
        )
    }

    const DEVICES: [(&str, &str); 5] = [
        ("sda", "node-a"),
        ("sdb", "node-a"),
        ("sdc", "node-b"),
        ("sdd", "node-b"),
        ("sde", "node-b"),
    ];

    #[test]
    fn test_validation_rules() {
        let mut no_host = pool("node-a", &[&["sda", "sdb"]]);
        no_host.node_selector.clear();
        assert_matches!(validate(&cluster(vec![no_host]), &[]), Err(Error::Validation(_)));

        let same_host = vec![pool("node-a", &[&["sda", "sdb"]]), pool("node-a", &[&["sdc", "sdd"]])];
        assert_matches!(validate(&cluster(same_host), &[]), Err(Error::Validation(_)));

        let short_mirror = vec![pool("node-a", &[&["sda"]])];
        assert_matches!(validate(&cluster(short_mirror), &[]), Err(Error::Validation(_)));

        let shared_device = vec![pool("node-a", &[&["sda", "sdb"]]), pool("node-b", &[&["sdb", "sdc"]])];
        assert_matches!(validate(&cluster(shared_device), &[]), Err(Error::Validation(_)));

        let no_groups = vec![pool("node-a", &[])];
        assert_matches!(validate(&cluster(no_groups), &[]), Err(Error::Validation(_)));

        let ok = vec![pool("node-a", &[&["sda", "sdb"]]), pool("node-b", &[&["sdc", "sdd"]])];
        assert!(validate(&cluster(ok), &[]).is_ok());
    }

    #[test]
    fn test_change_rules_against_existing_instance() {
        let existing = testing::pool_instance(
            "c1-a",
            "node-a",
            RaidType::Mirror,
            &[&["sda", "sdb"], &["sdc", "sdd"]],
            &[],
        );
        let instances = vec![existing];

        let removed = cluster(vec![pool("node-a", &[&["sda", "sdb"]])]);
        assert_matches!(validate(&removed, &instances), Err(Error::Validation(_)));

        let double_swap = cluster(vec![pool("node-a", &[&["sdx", "sdy"], &["sdc", "sdd"]])]);
        assert_matches!(validate(&double_swap, &instances), Err(Error::Validation(_)));

        let single_swap = cluster(vec![pool("node-a", &[&["sda", "sdx"], &["sdc", "sdd"]])]);
        assert!(validate(&single_swap, &instances).is_ok());
        let swaps = replacements(&instances[0].spec, &single_swap.spec.pools[0]);
        assert_eq!(swaps.get("sdx").map(String::as_str), Some("sdb"));
        assert_eq!(swaps.len(), 1);

        let grown = cluster(vec![pool(
            "node-a",
            &[&["sda", "sdb"], &["sdc", "sdd"], &["sde", "sdf"]],
        )]);
        assert!(validate(&grown, &instances).is_ok());
    }

    #[test]
    fn test_stripe_device_cannot_be_swapped() {
        let existing =
            testing::pool_instance("c1-a", "node-a", RaidType::Stripe, &[&["sda"], &["sdb"]], &[]);
        let instances = vec![existing];
        let striped = |groups: &[&[&str]]| {
            let mut spec = pool("node-a", groups);
            spec.pool_config.data_raid_group_type = RaidType::Stripe;
            cluster(vec![spec])
        };

        let swapped = striped(&[&["sda"], &["sdc"]]);
        assert_matches!(
            validate(&swapped, &instances),
            Err(Error::Validation(msg)) if msg.contains("stripe")
        );

        let grown = striped(&[&["sda"], &["sdb"], &["sdc"]]);
        assert!(validate(&grown, &instances).is_ok());
    }

    #[tokio::test]
    async fn test_creates_claims_and_instances() {
        let (controller, stores, _) = setup(&DEVICES).await;
        let pc = cluster(vec![
            pool("node-a", &[&["sda", "sdb"]]),
            pool("node-b", &[&["sdc", "sdd"]]),
        ]);
        stores.pool_clusters.create(&pc).await.unwrap();

        controller.reconcile(testing::CLUSTER).await.unwrap();

        let instances = controller.instances(testing::CLUSTER).await.unwrap();
        assert_eq!(instances.len(), 2);
        for instance in &instances {
            assert!(instance.name().starts_with("c1-"));
            assert_eq!(instance.spec.pool_config.compression.as_deref(), Some("lz4"));
            assert_eq!(
                instance.labels().get(HOST_LABEL),
                Some(&instance.spec.host_name)
            );
        }

        let claim = stores.claims.get("bdc-sdc").await.unwrap().unwrap();
        assert_eq!(claim.spec.node_name, "node-b");
        assert!(claim.finalizers().contains(&POOL_PROTECTION_FINALIZER.to_string()));
        assert_eq!(claim.status.map(|s| s.phase), Some(ClaimPhase::Bound));
        let bd = stores.block_devices.get("sdc").await.unwrap().unwrap();
        assert_eq!(bd.status.map(|s| s.claim_state), Some(ClaimState::Claimed));

        let status = stores
            .pool_clusters
            .get(testing::CLUSTER)
            .await
            .unwrap()
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.desired_instances, 2);
        assert_eq!(status.provisioned_instances, 0);

        // Second pass is a no-op
        controller.reconcile(testing::CLUSTER).await.unwrap();
        assert_eq!(controller.instances(testing::CLUSTER).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_device_claimed_by_other_cluster() {
        let (controller, stores, recorder) = setup(&DEVICES).await;
        testing::seed_claim(&stores, "sda", "c2", None).await;
        stores
            .pool_clusters
            .create(&cluster(vec![pool("node-a", &[&["sda", "sdb"]])]))
            .await
            .unwrap();

        assert_matches!(
            controller.reconcile(testing::CLUSTER).await,
            Err(Error::DeviceClaimedByOther { .. })
        );
        assert_eq!(recorder.reasons(), vec!["ValidationFailed".to_string()]);
        assert!(controller.instances(testing::CLUSTER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replacement_marks_predecessor_and_updates_instance() {
        let (controller, stores, _) = setup(&[("sda", "node-a"), ("sdb", "node-a"), ("sdx", "node-a")]).await;
        let pc = stores
            .pool_clusters
            .create(&cluster(vec![pool("node-a", &[&["sda", "sdb"]])]))
            .await
            .unwrap();
        controller.reconcile(testing::CLUSTER).await.unwrap();

        let mut swapped = pc.clone();
        swapped.spec.pools = vec![pool("node-a", &[&["sda", "sdx"]])];
        stores.pool_clusters.patch(&pc, &swapped).await.unwrap();
        controller.reconcile(testing::CLUSTER).await.unwrap();

        let claim = stores.claims.get("bdc-sdx").await.unwrap().unwrap();
        assert_eq!(claim.predecessor(), Some("sdb"));
        let instances = controller.instances(testing::CLUSTER).await.unwrap();
        assert_eq!(
            instances[0].spec.data_raid_groups[0].device_names(),
            vec!["sda", "sdx"]
        );
        // The predecessor claim stays until the pool manager releases it
        assert!(stores.claims.get("bdc-sdb").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_removed_host_deletes_instance() {
        let (controller, stores, _) = setup(&DEVICES).await;
        let pc = stores
            .pool_clusters
            .create(&cluster(vec![
                pool("node-a", &[&["sda", "sdb"]]),
                pool("node-b", &[&["sdc", "sdd"]]),
            ]))
            .await
            .unwrap();
        controller.reconcile(testing::CLUSTER).await.unwrap();

        // Mark one instance provisioned and healthy
        let mut instance = controller
            .instances(testing::CLUSTER)
            .await
            .unwrap()
            .into_iter()
            .find(|i| i.spec.host_name == "node-a")
            .unwrap();
        instance.status = Some(PoolInstanceStatus {
            phase: PoolPhase::Online,
            ..Default::default()
        });
        stores.pool_instances.update_status(&instance).await.unwrap();

        let mut shrunk = pc.clone();
        shrunk.spec.pools.truncate(1);
        stores.pool_clusters.patch(&pc, &shrunk).await.unwrap();
        controller.reconcile(testing::CLUSTER).await.unwrap();

        let instances = controller.instances(testing::CLUSTER).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].spec.host_name, "node-a");
        let status = stores
            .pool_clusters
            .get(testing::CLUSTER)
            .await
            .unwrap()
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.desired_instances, 1);
        assert_eq!(status.healthy_instances, 1);
    }
}
