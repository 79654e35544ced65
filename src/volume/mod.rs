//! Replica placement, scaling and protection for replicated volumes
//!
//! - `policy`: policy defaulting
//! - `provision`: the realized Volume target
//! - `placement`: initial replica placement
//! - `scaling`: one-step scale up / scale down
//! - `budget`: disruption budgets over the pools backing HA volumes
//! - `resize`: capacity resize coordination

pub mod budget;
pub mod placement;
pub mod policy;
pub mod provision;
pub mod resize;
pub mod scaling;

pub use budget::{budget_pools, budget_selector, is_ha, selector_matches};
pub use placement::Placement;
pub use scaling::{scale_change, ScaleChange};

use crate::crd::VolumeConfig;
use crate::domain::ports::{EventKind, EventRecorderRef};
use crate::error::Error;
use crate::store::Stores;
use kube::Resource;

/// Drives a VolumeConfig toward its desired replica layout
pub struct VolumeEngine {
    stores: Stores,
    recorder: EventRecorderRef,
}

impl VolumeEngine {
    pub fn new(stores: Stores, recorder: EventRecorderRef) -> Self {
        Self { stores, recorder }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Surface a reconcile failure the user can act on as a Warning event
    pub async fn report(&self, vc: &VolumeConfig, error: &Error) {
        if error.is_user_facing() {
            self.event(vc, EventKind::Warning, error.reason(), error.to_string())
                .await;
        }
    }

    async fn event(&self, vc: &VolumeConfig, kind: EventKind, reason: &str, message: String) {
        self.recorder
            .publish(vc.object_ref(&()), kind, reason, message)
            .await;
    }
}
