//! Disk replacement with resilver tracking
//!
//! A claim whose predecessor annotation names another device marks a
//! replacement. The replace command is issued once; the new device is then
//! tracked until the topology shows it as a plain leaf and the last scan is
//! a finished resilver. Only then is the predecessor's claim released.

use super::{command, PoolEngine};
use crate::crd::{
    claim_name, set_condition, BlockDeviceClaim, Condition, ConditionStatus, PoolInstance,
    DISK_REPLACEMENT_CONDITION, POOL_PROTECTION_FINALIZER, PREDECESSOR_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::store::remove_finalizer;
use kube::ResourceExt;
use tracing::{debug, info};

/// Outcome of one replacement pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacementReport {
    /// New devices still resilvering (or whose replace was just issued)
    pub in_progress: Vec<String>,
    /// New devices whose replacement completed during this pass
    pub completed: Vec<String>,
}

impl ReplacementReport {
    pub fn is_outstanding(&self) -> bool {
        !self.in_progress.is_empty()
    }
}

impl PoolEngine {
    /// Drive every outstanding replacement one step
    pub async fn replace_disks(&self, instance: &PoolInstance) -> Result<ReplacementReport> {
        let mut report = ReplacementReport::default();
        let mut errors = Vec::new();
        let mut topology = None;

        for device in instance.spec.block_device_names() {
            let Some(claim) = self.stores.claims.get(&claim_name(&device)).await? else {
                continue;
            };
            let Some(predecessor) = claim.predecessor().map(str::to_string) else {
                continue;
            };

            let paths = async {
                let new_path = self.device_link(&device).await?;
                let old_path = self.device_link(&predecessor).await?;
                Ok::<_, Error>((new_path, old_path))
            }
            .await;
            let (new_path, old_path) = match paths {
                Ok(paths) => paths,
                Err(e) => {
                    errors.push(e);
                    report.in_progress.push(device);
                    continue;
                }
            };

            if topology.is_none() {
                match self.topology() {
                    Ok(current) => topology = Some(current),
                    Err(e) => {
                        errors.push(e);
                        report.in_progress.push(device);
                        break;
                    }
                }
            }
            let Some(current) = topology.as_ref() else {
                continue;
            };

            if !current.contains(&new_path) {
                info!(
                    pool = %self.pool_name,
                    old = %old_path,
                    new = %new_path,
                    "Replacing device"
                );
                if let Err(e) = self.run(&command::replace(&self.pool_name, &old_path, &new_path)) {
                    errors.push(e);
                } else {
                    // The tree changed; re-read it before the next device
                    topology = None;
                }
                report.in_progress.push(device);
                continue;
            }

            if !current.is_resilver_complete(&new_path) {
                debug!(pool = %self.pool_name, device = %new_path, "Resilver in progress");
                report.in_progress.push(device);
                continue;
            }

            match self.release_predecessor(&claim, &predecessor).await {
                Ok(()) => {
                    info!(
                        pool = %self.pool_name,
                        device = %device,
                        predecessor = %predecessor,
                        "Disk replacement completed"
                    );
                    report.completed.push(device);
                }
                Err(e) => {
                    errors.push(e);
                    report.in_progress.push(device);
                }
            }
        }

        Error::aggregate(format!("replace disks of pool {}", self.pool_name), errors)?;
        Ok(report)
    }

    /// Release the replaced device's claim and clear the predecessor marker
    async fn release_predecessor(&self, claim: &BlockDeviceClaim, predecessor: &str) -> Result<()> {
        let claims = self.stores.claims.as_ref();
        if let Some(old_claim) = claims.get(&claim_name(predecessor)).await? {
            remove_finalizer(claims, &old_claim, POOL_PROTECTION_FINALIZER).await?;
            claims.delete(&old_claim.name_any()).await?;
        }

        let mut updated = claim.clone();
        updated.annotations_mut().remove(PREDECESSOR_ANNOTATION);
        claims.patch(claim, &updated).await?;
        Ok(())
    }
}

/// Reflect a replacement pass in the DiskReplacement condition
///
/// True while anything is outstanding; flips to False with a success reason
/// only once a previously raised condition has nothing left.
pub fn apply_replacement_condition(
    conditions: &mut Vec<Condition>,
    report: &ReplacementReport,
    currently_true: bool,
) {
    if report.is_outstanding() {
        set_condition(
            conditions,
            Condition::new(
                DISK_REPLACEMENT_CONDITION,
                ConditionStatus::True,
                "DiskReplacementInProgress",
                format!("replacing {}", report.in_progress.join(", ")),
            ),
        );
    } else if currently_true {
        set_condition(
            conditions,
            Condition::new(
                DISK_REPLACEMENT_CONDITION,
                ConditionStatus::False,
                "DiskReplacementSuccess",
                "all disk replacements completed",
            ),
        );
    }
}
