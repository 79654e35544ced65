//! Replica scale up / scale down
//!
//! The desired pool list is the policy's replica pool list; the current one
//! is the VolumeConfig status. Status only advances after the replica object
//! mutation behind it has been observed to succeed.

use super::VolumeEngine;
use crate::crd::{
    consistency_factor, replica_id, replica_name, Volume, VolumeConfig, VolumeConfigPhase,
    CLUSTER_LABEL,
};
use crate::domain::ports::{EventKind, LabelSelector};
use crate::error::{Error, Result};
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Shape of the difference between desired and current pool lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleChange {
    None,
    /// Pools to add
    Up(Vec<String>),
    /// The single pool to remove
    Down(String),
    /// More than one pool removed at once
    MultipleRemovals(Vec<String>),
    /// Pools added and removed at the same time
    Migration {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

/// Classify the change between the desired and the current pool lists
pub fn scale_change(desired: &[String], current: &[String]) -> ScaleChange {
    let desired: BTreeSet<&String> = desired.iter().collect();
    let current: BTreeSet<&String> = current.iter().collect();
    let added: Vec<String> = desired.difference(&current).map(|s| s.to_string()).collect();
    let removed: Vec<String> = current.difference(&desired).map(|s| s.to_string()).collect();

    match (added.is_empty(), removed.len()) {
        (true, 0) => ScaleChange::None,
        (false, 0) => ScaleChange::Up(added),
        (true, 1) => ScaleChange::Down(removed.into_iter().next().unwrap_or_default()),
        (true, _) => ScaleChange::MultipleRemovals(removed),
        (false, _) => ScaleChange::Migration { added, removed },
    }
}

impl VolumeEngine {
    /// Drive one step of replica scaling for a bound VolumeConfig
    pub async fn scale(&self, vc: &VolumeConfig) -> Result<VolumeConfig> {
        let desired = vc.spec.policy.replica_pool_names();
        if desired.is_empty() || vc.phase() != VolumeConfigPhase::Bound {
            return Ok(vc.clone());
        }
        let current = vc.status_pools();

        match scale_change(&desired, &current) {
            ScaleChange::None => Ok(vc.clone()),
            ScaleChange::Up(added) => self.scale_up(vc, &desired, &added).await,
            ScaleChange::Down(removed) => self.scale_down(vc, &desired, &removed).await,
            ScaleChange::MultipleRemovals(removed) => Err(Error::Validation(format!(
                "only one replica can be removed at a time, requested removal of {}",
                removed.join(", ")
            ))),
            ScaleChange::Migration { added, removed } => {
                warn!(
                    volume = %vc.name(),
                    added = ?added,
                    removed = ?removed,
                    "Replica migration is not supported"
                );
                self.event(
                    vc,
                    EventKind::Warning,
                    "MigrationNotSupported",
                    format!(
                        "cannot add {} and remove {} in one change",
                        added.join(", "),
                        removed.join(", ")
                    ),
                )
                .await;
                Ok(vc.clone())
            }
        }
    }

    pub(super) async fn get_volume(&self, vc: &VolumeConfig) -> Result<Volume> {
        self.stores
            .volumes
            .get(vc.name())
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Volume".into(),
                name: vc.name().to_string(),
            })
    }

    async fn scale_up(
        &self,
        vc: &VolumeConfig,
        desired: &[String],
        added: &[String],
    ) -> Result<VolumeConfig> {
        let known: BTreeSet<String> = self
            .stores
            .pool_instances
            .list(&LabelSelector::label(CLUSTER_LABEL, &vc.spec.cluster))
            .await?
            .iter()
            .map(|p| p.name_any())
            .collect();
        let unknown: Vec<&str> = added
            .iter()
            .filter(|pool| !known.contains(pool.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(Error::Validation(format!(
                "cannot scale up volume {}: pools {} are not part of cluster {}",
                vc.name(),
                unknown.join(", "),
                vc.spec.cluster
            )));
        }

        let mut volume = self.get_volume(vc).await?;
        let target = desired.len() as u32;
        if volume.spec.desired_replication_factor < target {
            let mut raised = volume.clone();
            raised.spec.desired_replication_factor = target;
            volume = self.stores.volumes.patch(&volume, &raised).await?;
            info!(volume = %vc.name(), desired_replication_factor = target, "Scaling up");
        }

        for pool in added {
            self.create_recreate_replica(vc, &volume, pool).await?;
        }

        let mut pools = desired.to_vec();
        pools.sort();
        let mut updated = vc.clone();
        if let Some(status) = updated.status.as_mut() {
            status.pool_info = pools;
        }
        let updated = self.stores.volume_configs.update_status(&updated).await?;
        self.event(
            &updated,
            EventKind::Normal,
            "ScaledUp",
            format!("replicas added on {}", added.join(", ")),
        )
        .await;

        self.reconcile_budget(&updated).await
    }

    async fn scale_down(
        &self,
        vc: &VolumeConfig,
        desired: &[String],
        removed: &str,
    ) -> Result<VolumeConfig> {
        let mut volume = self.get_volume(vc).await?;
        let target = desired.len() as u32;
        let removed_id = replica_id(vc.name(), removed);

        if volume.spec.desired_replication_factor > target
            || volume
                .spec
                .replica_details
                .known_replicas
                .contains_key(&removed_id)
        {
            let mut lowered = volume.clone();
            lowered.spec.desired_replication_factor = target;
            lowered.spec.replica_details.known_replicas.remove(&removed_id);
            volume = self.stores.volumes.patch(&volume, &lowered).await?;
            info!(
                volume = %vc.name(),
                pool = %removed,
                desired_replication_factor = target,
                "Scaling down"
            );
        }

        if volume.is_scale_down_in_progress() {
            debug!(volume = %vc.name(), "Waiting for the target to drop the replica");
            return Err(Error::ScaleDownInProgress {
                volume: vc.name().to_string(),
            });
        }

        self.stores
            .replicas
            .delete(&replica_name(vc.name(), removed))
            .await?;

        if volume.spec.replication_factor != target {
            let mut settled = volume.clone();
            settled.spec.replication_factor = target;
            settled.spec.consistency_factor = consistency_factor(target);
            self.stores.volumes.patch(&volume, &settled).await?;
        }

        let mut updated = vc.clone();
        if let Some(status) = updated.status.as_mut() {
            status.pool_info = desired.to_vec();
        }
        let updated = self.stores.volume_configs.update_status(&updated).await?;
        self.event(
            &updated,
            EventKind::Normal,
            "ScaledDown",
            format!("replica removed from {}", removed),
        )
        .await;

        self.reconcile_budget(&updated).await
    }
}
