//! PoolInstance CRD
//!
//! The realized pool on one storage node. Created by the pool-cluster
//! controller, mutated by the per-node pool manager.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::{find_condition, Condition};
use super::pool_cluster::{PoolConfig, RaidGroup};

/// Condition raised while a block device replacement is outstanding
pub const DISK_REPLACEMENT_CONDITION: &str = "DiskReplacement";

/// Condition raised while raid groups are being added to the pool
pub const POOL_EXPANSION_CONDITION: &str = "PoolExpansion";

/// Condition raised while any leaf device is unusable
pub const DISK_UNAVAILABLE_CONDITION: &str = "DiskUnavailable";

/// Condition raised when a provisioned pool can no longer be found
pub const POOL_LOST_CONDITION: &str = "PoolLost";

// =============================================================================
// PoolInstance CRD
// =============================================================================

/// PoolInstance is one pool on one node
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.topology.io",
    version = "v1",
    kind = "PoolInstance",
    plural = "poolinstances",
    shortname = "pi",
    status = "PoolInstanceStatus",
    printcolumn = r#"{"name": "Host", "type": "string", "jsonPath": ".spec.hostName"}"#,
    printcolumn = r#"{"name": "Free", "type": "integer", "jsonPath": ".status.capacity.free"}"#,
    printcolumn = r#"{"name": "ReadOnly", "type": "boolean", "jsonPath": ".status.readOnly"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PoolInstanceSpec {
    /// Host the pool lives on
    pub host_name: String,

    /// Node selector copied from the pool spec
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Effective pool configuration
    #[serde(default)]
    pub pool_config: PoolConfig,

    /// Raid groups holding data
    #[serde(default)]
    pub data_raid_groups: Vec<RaidGroup>,

    /// Raid groups used as a separate write log
    #[serde(default)]
    pub write_cache_raid_groups: Vec<RaidGroup>,
}

impl PoolInstanceSpec {
    /// Every block device name in every raid group
    pub fn block_device_names(&self) -> Vec<String> {
        self.data_raid_groups
            .iter()
            .chain(self.write_cache_raid_groups.iter())
            .flat_map(|rg| rg.block_devices.iter().map(|bd| bd.block_device_name.clone()))
            .collect()
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the PoolInstance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolInstanceStatus {
    /// Current phase
    #[serde(default)]
    pub phase: PoolPhase,

    /// Capacity in bytes
    #[serde(default)]
    pub capacity: PoolCapacity,

    /// Whether the pool was switched read-only by the threshold
    #[serde(default)]
    pub read_only: bool,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Pool phase, derived from the pool health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PoolPhase {
    #[default]
    Pending,
    Online,
    Degraded,
    Faulted,
    Offline,
    Removed,
    Unavail,
    Error,
}

impl PoolPhase {
    /// Map a pool health string onto a phase
    pub fn from_health(health: &str) -> Self {
        match health.trim() {
            "ONLINE" => PoolPhase::Online,
            "DEGRADED" => PoolPhase::Degraded,
            "FAULTED" => PoolPhase::Faulted,
            "OFFLINE" => PoolPhase::Offline,
            "REMOVED" => PoolPhase::Removed,
            "UNAVAIL" => PoolPhase::Unavail,
            _ => PoolPhase::Error,
        }
    }
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolPhase::Pending => write!(f, "Pending"),
            PoolPhase::Online => write!(f, "Online"),
            PoolPhase::Degraded => write!(f, "Degraded"),
            PoolPhase::Faulted => write!(f, "Faulted"),
            PoolPhase::Offline => write!(f, "Offline"),
            PoolPhase::Removed => write!(f, "Removed"),
            PoolPhase::Unavail => write!(f, "Unavail"),
            PoolPhase::Error => write!(f, "Error"),
        }
    }
}

/// Pool capacity in bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolCapacity {
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub zfs: ZfsCapacity,
}

/// Filesystem-level accounting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZfsCapacity {
    #[serde(default)]
    pub logical_used: u64,
}

impl PoolCapacity {
    /// Used capacity as a whole percentage of total
    pub fn used_percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((self.used as f64 / self.total as f64) * 100.0) as u32
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl PoolInstance {
    /// Get the instance name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Current phase, Pending when no status was ever written
    pub fn phase(&self) -> PoolPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether a pool was ever realized for this instance
    pub fn was_provisioned(&self) -> bool {
        self.phase() != PoolPhase::Pending
    }

    /// Whether the given condition is currently True
    pub fn condition_true(&self, r#type: &str) -> bool {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, r#type))
            .map(Condition::is_true)
            .unwrap_or(false)
    }

    /// Name of an on-disk pool that should be imported under our name
    pub fn existing_pool_name(&self) -> Option<&str> {
        self.annotations()
            .get(super::EXISTING_POOL_ANNOTATION)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}
