//! Volume policy defaulting
//!
//! The inline policy wins; unset fields are filled from the VolumePolicy
//! named by annotation, then from hard defaults.

use super::VolumeEngine;
use crate::crd::{VolumeConfig, VolumePolicySpec, VOLUME_POLICY_ANNOTATION};
use crate::error::{Error, Result};
use kube::ResourceExt;
use tracing::debug;

pub const DEFAULT_QUEUE_DEPTH: &str = "32";
pub const DEFAULT_LU_WORKERS: u32 = 6;
pub const DEFAULT_ZVOL_WORKERS: u32 = 1;
pub const DEFAULT_COMPRESSION: &str = "lz4";

/// Fill fields unset in `inline` from `shared`
pub fn merge_policy(inline: &VolumePolicySpec, shared: &VolumePolicySpec) -> VolumePolicySpec {
    let mut merged = inline.clone();
    merged.provision.replica_affinity |= shared.provision.replica_affinity;

    let target = &mut merged.target;
    target.queue_depth = target
        .queue_depth
        .take()
        .or_else(|| shared.target.queue_depth.clone());
    target.lu_workers = target.lu_workers.or(shared.target.lu_workers);
    target.priority_class_name = target
        .priority_class_name
        .take()
        .or_else(|| shared.target.priority_class_name.clone());

    let replica = &mut merged.replica;
    replica.zvol_workers = replica.zvol_workers.or(shared.replica.zvol_workers);
    replica.compression = replica
        .compression
        .take()
        .or_else(|| shared.replica.compression.clone());

    if merged.replica_pool_info.is_empty() {
        merged.replica_pool_info = shared.replica_pool_info.clone();
    }
    merged
}

/// Apply hard defaults to unset tunables
pub fn apply_defaults(policy: &mut VolumePolicySpec) {
    policy
        .target
        .queue_depth
        .get_or_insert_with(|| DEFAULT_QUEUE_DEPTH.to_string());
    policy.target.lu_workers.get_or_insert(DEFAULT_LU_WORKERS);
    policy.replica.zvol_workers.get_or_insert(DEFAULT_ZVOL_WORKERS);
    policy
        .replica
        .compression
        .get_or_insert_with(|| DEFAULT_COMPRESSION.to_string());
}

impl VolumeEngine {
    /// Resolve the effective policy and persist it on the VolumeConfig
    pub async fn default_policy(&self, vc: &VolumeConfig) -> Result<VolumeConfig> {
        let mut policy = vc.spec.policy.clone();

        if let Some(name) = vc
            .annotations()
            .get(VOLUME_POLICY_ANNOTATION)
            .filter(|n| !n.is_empty())
        {
            let shared = self
                .stores
                .volume_policies
                .get(name)
                .await?
                .ok_or_else(|| {
                    Error::Validation(format!("volume policy {} not found", name))
                })?;
            policy = merge_policy(&policy, &shared.spec.policy);
        }
        apply_defaults(&mut policy);

        if policy == vc.spec.policy {
            return Ok(vc.clone());
        }
        debug!(volume = %vc.name(), "Persisting defaulted policy");
        let mut updated = vc.clone();
        updated.spec.policy = policy;
        self.stores.volume_configs.patch(vc, &updated).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::events::MemoryRecorder;
    use crate::crd::{ReplicaPoolInfo, VolumePolicy, VolumePolicyObjectSpec};
    use crate::testing;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[test]
    fn test_defaults_fill_only_unset_fields() {
        let mut policy = VolumePolicySpec::default();
        policy.target.lu_workers = Some(2);
        apply_defaults(&mut policy);
        assert_eq!(policy.target.queue_depth.as_deref(), Some("32"));
        assert_eq!(policy.target.lu_workers, Some(2));
        assert_eq!(policy.replica.zvol_workers, Some(1));
        assert_eq!(policy.replica.compression.as_deref(), Some("lz4"));
    }

    #[test]
    fn test_inline_policy_wins_over_shared() {
        let mut inline = VolumePolicySpec::default();
        inline.replica.compression = Some("zstd".into());
        let mut shared = VolumePolicySpec::default();
        shared.replica.compression = Some("gzip".into());
        shared.target.lu_workers = Some(8);
        shared.replica_pool_info = vec![ReplicaPoolInfo {
            pool_name: "c1-a".into(),
        }];

        let merged = merge_policy(&inline, &shared);
        assert_eq!(merged.replica.compression.as_deref(), Some("zstd"));
        assert_eq!(merged.target.lu_workers, Some(8));
        assert_eq!(merged.replica_pool_names(), vec!["c1-a".to_string()]);
    }

    #[tokio::test]
    async fn test_default_policy_from_annotation() {
        let stores = testing::stores();
        let engine = VolumeEngine::new(stores.clone(), Arc::new(MemoryRecorder::new()));

        let mut shared = VolumePolicySpec::default();
        shared.target.queue_depth = Some("64".into());
        stores
            .volume_policies
            .create(&VolumePolicy::new(
                "fast",
                VolumePolicyObjectSpec { policy: shared },
            ))
            .await
            .unwrap();

        let mut vc = testing::volume_config("vol-1", 3, 1 << 30);
        vc.annotations_mut()
            .insert(VOLUME_POLICY_ANNOTATION.into(), "fast".into());
        let vc = stores.volume_configs.create(&vc).await.unwrap();

        let defaulted = engine.default_policy(&vc).await.unwrap();
        assert_eq!(defaulted.spec.policy.target.queue_depth.as_deref(), Some("64"));
        assert_eq!(defaulted.spec.policy.target.lu_workers, Some(DEFAULT_LU_WORKERS));

        // Already defaulted: no further change
        let again = engine.default_policy(&defaulted).await.unwrap();
        assert_eq!(again.resource_version(), defaulted.resource_version());
    }

    #[tokio::test]
    async fn test_missing_policy_is_a_validation_error() {
        let stores = testing::stores();
        let engine = VolumeEngine::new(stores.clone(), Arc::new(MemoryRecorder::new()));
        let mut vc = testing::volume_config("vol-1", 3, 1 << 30);
        vc.annotations_mut()
            .insert(VOLUME_POLICY_ANNOTATION.into(), "missing".into());
        let vc = stores.volume_configs.create(&vc).await.unwrap();

        assert_matches!(engine.default_policy(&vc).await, Err(Error::Validation(_)));
    }
}
