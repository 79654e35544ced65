//! PoolCluster CRD
//!
//! Declarative description of a set of pools, one per storage node, each
//! assembled from raid groups of block devices.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::Condition;
use super::HOST_LABEL;

// =============================================================================
// PoolCluster CRD
// =============================================================================

/// PoolCluster lists the pools that should exist across the storage nodes.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.topology.io",
    version = "v1",
    kind = "PoolCluster",
    plural = "poolclusters",
    shortname = "pc",
    status = "PoolClusterStatus",
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".status.desiredInstances"}"#,
    printcolumn = r#"{"name": "Provisioned", "type": "integer", "jsonPath": ".status.provisionedInstances"}"#,
    printcolumn = r#"{"name": "Healthy", "type": "integer", "jsonPath": ".status.healthyInstances"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PoolClusterSpec {
    /// Pools, one per storage node
    #[serde(default)]
    pub pools: Vec<PoolSpec>,

    /// Defaults applied to every pool that leaves a config field unset
    #[serde(default)]
    pub default_pool_config: Option<PoolConfig>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// A single pool on a single node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Node selector; must pin the pool to one host
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Raid groups holding data
    #[serde(default)]
    pub data_raid_groups: Vec<RaidGroup>,

    /// Raid groups used as a separate write log
    #[serde(default)]
    pub write_cache_raid_groups: Vec<RaidGroup>,

    /// Pool configuration
    #[serde(default)]
    pub pool_config: PoolConfig,
}

impl PoolSpec {
    /// Host this pool is pinned to
    pub fn host_name(&self) -> Option<&str> {
        self.node_selector.get(HOST_LABEL).map(String::as_str)
    }

    /// Every block device name in every raid group
    pub fn block_device_names(&self) -> impl Iterator<Item = &str> {
        self.data_raid_groups
            .iter()
            .chain(self.write_cache_raid_groups.iter())
            .flat_map(|rg| rg.block_devices.iter().map(|bd| bd.block_device_name.as_str()))
    }
}

/// A redundancy unit of block devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RaidGroup {
    #[serde(default)]
    pub block_devices: Vec<BlockDeviceRef>,
}

impl RaidGroup {
    pub fn device_names(&self) -> Vec<&str> {
        self.block_devices
            .iter()
            .map(|bd| bd.block_device_name.as_str())
            .collect()
    }
}

/// A block device participating in a raid group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    /// Name of the BlockDevice resource
    pub block_device_name: String,

    /// Device link resolved by the pool manager
    #[serde(default)]
    pub dev_link: Option<String>,

    /// Capacity in bytes, as observed when the device was resolved
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
}

/// Raid layout of a group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    #[default]
    Stripe,
    Mirror,
    Raidz,
    Raidz2,
}

impl RaidType {
    /// Keyword placed in front of the devices on a pool command line
    pub fn vdev_keyword(&self) -> Option<&'static str> {
        match self {
            RaidType::Stripe => None,
            RaidType::Mirror => Some("mirror"),
            RaidType::Raidz => Some("raidz"),
            RaidType::Raidz2 => Some("raidz2"),
        }
    }

    /// Minimum number of devices a group of this type needs
    pub fn min_devices(&self) -> usize {
        match self {
            RaidType::Stripe => 1,
            RaidType::Mirror => 2,
            RaidType::Raidz => 3,
            RaidType::Raidz2 => 4,
        }
    }
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidType::Stripe => write!(f, "stripe"),
            RaidType::Mirror => write!(f, "mirror"),
            RaidType::Raidz => write!(f, "raidz"),
            RaidType::Raidz2 => write!(f, "raidz2"),
        }
    }
}

/// Per-pool configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Raid type of the data raid groups
    #[serde(default)]
    pub data_raid_group_type: RaidType,

    /// Raid type of the write-cache raid groups
    #[serde(default)]
    pub write_cache_group_type: Option<RaidType>,

    /// Compression algorithm set on the pool root dataset
    #[serde(default)]
    pub compression: Option<String>,

    /// Resource requests/limits for the pool manager
    #[serde(default)]
    pub resources: Option<BTreeMap<String, String>>,

    /// Priority class for the pool manager
    #[serde(default)]
    pub priority_class_name: Option<String>,

    /// Used-capacity percentage at which the pool turns read-only
    #[serde(default)]
    pub ro_threshold_percent: Option<u32>,
}

impl PoolConfig {
    /// Fill unset fields from the cluster defaults
    pub fn with_defaults(&self, defaults: Option<&PoolConfig>) -> PoolConfig {
        let Some(defaults) = defaults else {
            return self.clone();
        };
        PoolConfig {
            data_raid_group_type: self.data_raid_group_type,
            write_cache_group_type: self.write_cache_group_type.or(defaults.write_cache_group_type),
            compression: self.compression.clone().or_else(|| defaults.compression.clone()),
            resources: self.resources.clone().or_else(|| defaults.resources.clone()),
            priority_class_name: self
                .priority_class_name
                .clone()
                .or_else(|| defaults.priority_class_name.clone()),
            ro_threshold_percent: self.ro_threshold_percent.or(defaults.ro_threshold_percent),
        }
    }

    /// Raid type used for write-cache groups
    pub fn write_cache_type(&self) -> RaidType {
        self.write_cache_group_type.unwrap_or(RaidType::Stripe)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the PoolCluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolClusterStatus {
    /// Number of pools in the spec
    #[serde(default)]
    pub desired_instances: u32,

    /// Number of pool instances that exist
    #[serde(default)]
    pub provisioned_instances: u32,

    /// Number of pool instances that are Online
    #[serde(default)]
    pub healthy_instances: u32,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
