//! BlockDevice and BlockDeviceClaim CRDs
//!
//! A BlockDevice is a physical disk discovered on a node; a claim binds it
//! to exactly one pool cluster.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::PREDECESSOR_ANNOTATION;

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// A physical disk on a storage node
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.topology.io",
    version = "v1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".spec.path"}"#,
    printcolumn = r#"{"name": "ClaimState", "type": "string", "jsonPath": ".status.claimState"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Node the device is attached to
    pub node_name: String,

    /// Kernel device path, e.g. /dev/sdb
    pub path: String,

    /// Stable links to the device
    #[serde(default)]
    pub dev_links: Vec<DevLink>,

    /// Capacity in bytes
    #[serde(default)]
    pub capacity_bytes: u64,
}

/// A family of stable device links
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevLink {
    /// by-id, by-path, ...
    pub kind: String,
    #[serde(default)]
    pub links: Vec<String>,
}

/// Status of a BlockDevice
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    #[serde(default)]
    pub claim_state: ClaimState,
}

/// Claim state of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed,
    Released,
}

impl BlockDevice {
    /// Resolve the most stable path for this device: by-id, then by-path,
    /// then the kernel path.
    pub fn device_link(&self) -> String {
        for kind in ["by-id", "by-path"] {
            if let Some(link) = self
                .spec
                .dev_links
                .iter()
                .find(|dl| dl.kind == kind)
                .and_then(|dl| dl.links.first())
            {
                return link.clone();
            }
        }
        self.spec.path.clone()
    }
}

// =============================================================================
// BlockDeviceClaim CRD
// =============================================================================

/// Binds one block device to one pool cluster
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.topology.io",
    version = "v1",
    kind = "BlockDeviceClaim",
    plural = "blockdeviceclaims",
    shortname = "bdc",
    status = "BlockDeviceClaimStatus",
    printcolumn = r#"{"name": "BlockDevice", "type": "string", "jsonPath": ".spec.blockDeviceName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimSpec {
    /// The claimed device
    pub block_device_name: String,

    /// Node the device lives on
    #[serde(default)]
    pub node_name: String,
}

/// Status of a claim
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
}

/// Claim phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
}

impl BlockDeviceClaim {
    /// Name of the device this claim's device is replacing, if any
    pub fn predecessor(&self) -> Option<&str> {
        self.annotations()
            .get(PREDECESSOR_ANNOTATION)
            .map(String::as_str)
            .filter(|p| !p.is_empty() && *p != self.spec.block_device_name)
    }
}

/// Claim name for a block device
pub fn claim_name(block_device: &str) -> String {
    format!("bdc-{}", block_device)
}
