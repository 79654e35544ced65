//! VolumeConfig controller
//!
//! One pass runs the volume steps in order: policy defaulting, target
//! provisioning, initial placement, disruption budget, resize and scaling.
//! Each step hands the object it wrote to the next one.

use super::runner::{Action, Reconciler};
use crate::crd::{
    Volume, VolumeConfig, VolumeConfigPhase, VolumeReplica, VOLUME_PROTECTION_FINALIZER,
};
use crate::error::{Result, IN_PROGRESS_REQUEUE};
use crate::store::{ensure_finalizer, is_deleting, remove_finalizer};
use crate::volume::VolumeEngine;
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

/// Queue key for changes to a Volume
pub fn volume_keys(volume: &Volume) -> Vec<String> {
    vec![volume.name_any()]
}

/// Queue key for changes to a VolumeReplica
pub fn replica_keys(replica: &VolumeReplica) -> Vec<String> {
    replica.volume_name().map(str::to_string).into_iter().collect()
}

pub struct VolumeConfigController {
    engine: VolumeEngine,
}

impl VolumeConfigController {
    pub fn new(engine: VolumeEngine) -> Self {
        Self { engine }
    }

    async fn finalize(&self, vc: &VolumeConfig) -> Result<Action> {
        let released = self.engine.release_budget(vc).await?;
        remove_finalizer(
            self.engine.stores().volume_configs.as_ref(),
            &released,
            VOLUME_PROTECTION_FINALIZER,
        )
        .await?;
        info!(volume = %vc.name(), "Volume config finalized");
        Ok(Action::await_change())
    }

    async fn converge(&self, vc: VolumeConfig) -> Result<Action> {
        let vc = self.engine.default_policy(&vc).await?;
        let volume = self.engine.ensure_volume(&vc).await?;
        let vc = if vc.phase() == VolumeConfigPhase::Pending {
            self.engine.place_replicas(&vc, &volume).await?.0
        } else {
            vc
        };
        let vc = self.engine.reconcile_budget(&vc).await?;
        let vc = self.engine.resize(&vc).await?;
        let vc = self.engine.scale(&vc).await?;

        if vc.is_resizing() {
            debug!(volume = %vc.name(), "Resize outstanding");
            return Ok(Action::requeue(IN_PROGRESS_REQUEUE));
        }
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for VolumeConfigController {
    fn name(&self) -> &'static str {
        "volume-config"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        let Some(vc) = self.engine.stores().volume_configs.get(key).await? else {
            return Ok(Action::await_change());
        };
        if is_deleting(&vc) {
            return self.finalize(&vc).await;
        }
        let vc = ensure_finalizer(
            self.engine.stores().volume_configs.as_ref(),
            &vc,
            VOLUME_PROTECTION_FINALIZER,
        )
        .await?;

        match self.converge(vc.clone()).await {
            Ok(action) => Ok(action),
            Err(e) => {
                self.engine.report(&vc, &e).await;
                Err(e)
            }
        }
    }
}
