//! Volume and VolumeReplica CRDs
//!
//! The Volume is the realized target of a VolumeConfig; each VolumeReplica
//! is one copy of the volume's data on one pool.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{POOL_INSTANCE_LABEL, VOLUME_LABEL};

// =============================================================================
// Volume CRD
// =============================================================================

/// The realized volume target
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.topology.io",
    version = "v1",
    kind = "Volume",
    plural = "volumes",
    shortname = "vol",
    status = "VolumeStatus",
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.capacityBytes"}"#,
    printcolumn = r#"{"name": "RF", "type": "integer", "jsonPath": ".spec.replicationFactor"}"#,
    printcolumn = r#"{"name": "DesiredRF", "type": "integer", "jsonPath": ".spec.desiredReplicationFactor"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Capacity in bytes
    pub capacity_bytes: u64,

    /// Number of replicas the target replicates to
    pub replication_factor: u32,

    /// In-flight replica count target while scaling
    pub desired_replication_factor: u32,

    /// Write quorum size
    pub consistency_factor: u32,

    /// Target service address
    #[serde(default)]
    pub target_ip: Option<String>,

    #[serde(default)]
    pub queue_depth: Option<String>,

    #[serde(default)]
    pub lu_workers: Option<u32>,

    /// Replicas the target should accept
    #[serde(default)]
    pub replica_details: ReplicaDetails,
}

/// Known replicas, replica ID to pool name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaDetails {
    #[serde(default)]
    pub known_replicas: BTreeMap<String, String>,
}

/// Status reported by the data path
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    #[serde(default)]
    pub phase: VolumePhase,

    /// Capacity currently served
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Replicas the target currently tracks
    #[serde(default)]
    pub replica_details: ReplicaDetails,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumePhase {
    #[default]
    Init,
    Healthy,
    Degraded,
    Offline,
}

/// Write quorum for a replication factor
pub fn consistency_factor(replication_factor: u32) -> u32 {
    replication_factor / 2 + 1
}

impl Volume {
    /// A scale down is in flight while the target still tracks more replicas
    /// than the desired replication factor.
    pub fn is_scale_down_in_progress(&self) -> bool {
        let tracked = self
            .status
            .as_ref()
            .map(|s| s.replica_details.known_replicas.len())
            .unwrap_or(0);
        tracked > self.spec.desired_replication_factor as usize
    }

    pub fn status_capacity(&self) -> u64 {
        self.status.as_ref().map(|s| s.capacity_bytes).unwrap_or(0)
    }

    /// A resize is outstanding while the served capacity is below the spec
    pub fn is_resize_in_progress(&self) -> bool {
        self.spec.capacity_bytes > self.status_capacity()
    }
}

// =============================================================================
// VolumeReplica CRD
// =============================================================================

/// One copy of a volume on one pool
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.topology.io",
    version = "v1",
    kind = "VolumeReplica",
    plural = "volumereplicas",
    shortname = "vr",
    status = "VolumeReplicaStatus",
    printcolumn = r#"{"name": "ReplicaID", "type": "string", "jsonPath": ".spec.replicaId"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicaSpec {
    /// Stable replica identity
    pub replica_id: String,

    /// Capacity in bytes
    pub capacity_bytes: u64,

    #[serde(default)]
    pub target_ip: Option<String>,

    #[serde(default)]
    pub zvol_workers: Option<u32>,

    #[serde(default)]
    pub compression: Option<String>,

    /// `volume@snapshot` to clone from
    #[serde(default)]
    pub clone_source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicaStatus {
    #[serde(default)]
    pub phase: ReplicaPhase,
}

/// Replica lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReplicaPhase {
    /// Freshly placed, no data yet
    #[default]
    Empty,
    /// Added by a scale up; must rebuild from peers
    Recreate,
    Online,
    Degraded,
    Offline,
    Error,
}

impl VolumeReplica {
    /// Pool instance hosting this replica
    pub fn pool_name(&self) -> Option<&str> {
        self.labels().get(POOL_INSTANCE_LABEL).map(String::as_str)
    }

    /// Volume this replica belongs to
    pub fn volume_name(&self) -> Option<&str> {
        self.labels().get(VOLUME_LABEL).map(String::as_str)
    }
}

/// Object name of the replica of `volume` on `pool`
pub fn replica_name(volume: &str, pool: &str) -> String {
    format!("{}-{}", volume, pool)
}

/// Deterministic replica ID for a volume/pool pair
pub fn replica_id(volume: &str, pool: &str) -> String {
    let key = format!("{}/{}", volume, pool);
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes())
        .simple()
        .to_string()
        .to_uppercase()
}
