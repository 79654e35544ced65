//! Volume target provisioning

use super::VolumeEngine;
use crate::crd::{consistency_factor, Volume, VolumeConfig, VolumeSpec, CLUSTER_LABEL};
use crate::error::Result;
use crate::store::get_or_create;
use kube::ResourceExt;
use tracing::info;

/// Desired Volume for a VolumeConfig
pub fn volume_for(vc: &VolumeConfig) -> Volume {
    let rf = vc.spec.replica_count;
    let mut volume = Volume::new(
        vc.name(),
        VolumeSpec {
            capacity_bytes: vc.spec.capacity_bytes,
            replication_factor: rf,
            desired_replication_factor: rf,
            consistency_factor: consistency_factor(rf),
            target_ip: None,
            queue_depth: vc.spec.policy.target.queue_depth.clone(),
            lu_workers: vc.spec.policy.target.lu_workers,
            replica_details: Default::default(),
        },
    );
    volume
        .labels_mut()
        .insert(CLUSTER_LABEL.to_string(), vc.spec.cluster.clone());
    volume
}

impl VolumeEngine {
    /// Get or create the Volume backing a VolumeConfig
    pub async fn ensure_volume(&self, vc: &VolumeConfig) -> Result<Volume> {
        let (volume, created) = get_or_create(self.stores.volumes.as_ref(), &volume_for(vc)).await?;
        if created {
            info!(
                volume = %vc.name(),
                replication_factor = volume.spec.replication_factor,
                consistency_factor = volume.spec.consistency_factor,
                "Volume created"
            );
        }
        Ok(volume)
    }
}
