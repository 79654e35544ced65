//! Capacity resize coordination
//!
//! A resize starts when the requested capacity exceeds the confirmed one:
//! the Volume capacity is raised and the `Resizing` condition set. It
//! finishes once the target reports serving at least its spec capacity.

use super::VolumeEngine;
use crate::crd::{
    remove_condition, set_condition, Condition, ConditionStatus, Volume, VolumeConfig,
    VolumeConfigPhase, RESIZING_CONDITION,
};
use crate::domain::ports::EventKind;
use crate::error::Result;
use tracing::{debug, info};

impl VolumeEngine {
    /// Advance the resize state machine of a bound VolumeConfig by one step
    pub async fn resize(&self, vc: &VolumeConfig) -> Result<VolumeConfig> {
        if vc.phase() != VolumeConfigPhase::Bound {
            return Ok(vc.clone());
        }
        let desired = vc.spec.capacity_bytes;
        if !vc.is_resizing() && desired <= vc.status_capacity() {
            return Ok(vc.clone());
        }

        let volume = self.get_volume(vc).await?;
        if vc.is_resizing() {
            return self.poll_resize(vc, volume).await;
        }

        if volume.spec.capacity_bytes < desired && volume.is_resize_in_progress() {
            debug!(
                volume = %vc.name(),
                "Previous resize still outstanding, waiting before the next one"
            );
            return Ok(vc.clone());
        }
        self.raise_capacity(vc, &volume).await?;

        let mut updated = vc.clone();
        if let Some(status) = updated.status.as_mut() {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    RESIZING_CONDITION,
                    ConditionStatus::True,
                    "ResizeStarted",
                    format!("resizing from {} to {} bytes", status.capacity_bytes, desired),
                ),
            );
        }
        let updated = self.stores.volume_configs.update_status(&updated).await?;
        info!(volume = %vc.name(), capacity_bytes = desired, "Resize started");
        self.event(
            &updated,
            EventKind::Normal,
            "ResizeStarted",
            format!("resizing to {} bytes", desired),
        )
        .await;
        Ok(updated)
    }

    async fn poll_resize(&self, vc: &VolumeConfig, volume: Volume) -> Result<VolumeConfig> {
        let desired = vc.spec.capacity_bytes;

        // Capacity requested again while the last resize was running
        if volume.spec.capacity_bytes < desired {
            if !volume.is_resize_in_progress() {
                self.raise_capacity(vc, &volume).await?;
            }
            return Ok(vc.clone());
        }
        if volume.is_resize_in_progress() {
            debug!(
                volume = %vc.name(),
                served = volume.status_capacity(),
                requested = volume.spec.capacity_bytes,
                "Resize in progress"
            );
            return Ok(vc.clone());
        }

        let mut updated = vc.clone();
        if let Some(status) = updated.status.as_mut() {
            remove_condition(&mut status.conditions, RESIZING_CONDITION);
            status.capacity_bytes = desired;
        }
        let updated = self.stores.volume_configs.update_status(&updated).await?;
        info!(volume = %vc.name(), capacity_bytes = desired, "Resize finished");
        self.event(
            &updated,
            EventKind::Normal,
            "ResizeSuccess",
            format!("volume resized to {} bytes", desired),
        )
        .await;
        Ok(updated)
    }

    async fn raise_capacity(&self, vc: &VolumeConfig, volume: &Volume) -> Result<()> {
        let desired = vc.spec.capacity_bytes;
        if volume.spec.capacity_bytes >= desired {
            return Ok(());
        }
        let mut raised = volume.clone();
        raised.spec.capacity_bytes = desired;
        self.stores.volumes.patch(volume, &raised).await?;
        Ok(())
    }
}
