//! VolumeConfig and VolumePolicy CRDs
//!
//! A VolumeConfig is the desired state of one replicated volume: capacity,
//! replica count and the policy that decides where replicas live.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{find_condition, Condition};
use super::DISRUPTION_BUDGET_LABEL;

/// Condition present while a capacity resize is outstanding
pub const RESIZING_CONDITION: &str = "Resizing";

// =============================================================================
// VolumeConfig CRD
// =============================================================================

/// Desired configuration of a replicated volume
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.topology.io",
    version = "v1",
    kind = "VolumeConfig",
    plural = "volumeconfigs",
    shortname = "vc",
    status = "VolumeConfigStatus",
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.capacityBytes"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicaCount"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfigSpec {
    /// Requested capacity in bytes
    pub capacity_bytes: u64,

    /// Requested number of replicas
    pub replica_count: u32,

    /// Pool cluster hosting the replicas
    pub cluster: String,

    /// Target and replica tunables
    #[serde(default)]
    pub policy: VolumePolicySpec,

    /// Node the volume is published on
    #[serde(default)]
    pub publish: PublishSpec,

    /// Set when this volume is a clone of another volume's snapshot
    #[serde(default)]
    pub source: Option<VolumeSource>,
}

/// Publish information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublishSpec {
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Clone source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    pub volume: String,
    pub snapshot: String,
}

// =============================================================================
// Policy
// =============================================================================

/// Volume policy: target/replica tunables and explicit replica placement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumePolicySpec {
    #[serde(default)]
    pub provision: ProvisionPolicy,

    #[serde(default)]
    pub target: TargetPolicy,

    #[serde(default)]
    pub replica: ReplicaPolicy,

    /// Explicit pool per replica; empty means "let the engine choose"
    #[serde(default)]
    pub replica_pool_info: Vec<ReplicaPoolInfo>,
}

impl VolumePolicySpec {
    /// Pool names from the explicit assignment list
    pub fn replica_pool_names(&self) -> Vec<String> {
        self.replica_pool_info.iter().map(|p| p.pool_name.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionPolicy {
    /// Place one replica on the pool of the publish node
    #[serde(default)]
    pub replica_affinity: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetPolicy {
    #[serde(default)]
    pub queue_depth: Option<String>,
    #[serde(default)]
    pub lu_workers: Option<u32>,
    #[serde(default)]
    pub priority_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaPolicy {
    #[serde(default)]
    pub zvol_workers: Option<u32>,
    #[serde(default)]
    pub compression: Option<String>,
}

/// One entry of the explicit replica placement list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaPoolInfo {
    pub pool_name: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the VolumeConfig
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfigStatus {
    #[serde(default)]
    pub phase: VolumeConfigPhase,

    /// Pools confirmed to host a replica
    #[serde(default)]
    pub pool_info: Vec<String>,

    /// Capacity the volume was last confirmed at
    #[serde(default)]
    pub capacity_bytes: u64,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumeConfigPhase {
    #[default]
    Pending,
    Bound,
}

impl std::fmt::Display for VolumeConfigPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeConfigPhase::Pending => write!(f, "Pending"),
            VolumeConfigPhase::Bound => write!(f, "Bound"),
        }
    }
}

impl VolumeConfig {
    /// Get the volume name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn phase(&self) -> VolumeConfigPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Pools confirmed to host a replica
    pub fn status_pools(&self) -> Vec<String> {
        self.status
            .as_ref()
            .map(|s| s.pool_info.clone())
            .unwrap_or_default()
    }

    pub fn status_capacity(&self) -> u64 {
        self.status.as_ref().map(|s| s.capacity_bytes).unwrap_or(0)
    }

    /// Disruption budget currently protecting this volume
    pub fn budget_name(&self) -> Option<&str> {
        self.labels()
            .get(DISRUPTION_BUDGET_LABEL)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn is_resizing(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, RESIZING_CONDITION))
            .map(Condition::is_true)
            .unwrap_or(false)
    }
}

// =============================================================================
// VolumePolicy CRD
// =============================================================================

/// Shared policy merged into volume configs that reference it by annotation
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.topology.io",
    version = "v1",
    kind = "VolumePolicy",
    plural = "volumepolicies",
    shortname = "vp",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumePolicyObjectSpec {
    #[serde(default)]
    pub policy: VolumePolicySpec,
}
