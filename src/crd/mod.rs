//! Custom Resource Definitions for the storage topology control plane
//!
//! This module contains all CRD types:
//! - PoolCluster: declarative description of pools across storage nodes
//! - PoolInstance: the realized pool on one node
//! - BlockDevice / BlockDeviceClaim: physical disks and their pool binding
//! - VolumeConfig / VolumePolicy: desired volume shape and tunables
//! - Volume / VolumeReplica: realized target and its per-pool replicas

pub mod block_device;
pub mod condition;
pub mod pool_cluster;
pub mod pool_instance;
pub mod volume;
pub mod volume_config;

pub use block_device::*;
pub use condition::*;
pub use pool_cluster::*;
pub use pool_instance::*;
pub use volume::*;
pub use volume_config::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;

/// API group shared by every resource in this crate
pub const API_GROUP: &str = "storage.topology.io";

/// Label carrying the owning pool cluster name
pub const CLUSTER_LABEL: &str = "storage.topology.io/pool-cluster";

/// Label carrying the pool instance name (on replicas and pool pods)
pub const POOL_INSTANCE_LABEL: &str = "storage.topology.io/pool-instance";

/// Label carrying the volume name (on replicas)
pub const VOLUME_LABEL: &str = "storage.topology.io/volume";

/// Label on a volume config naming the disruption budget protecting it
pub const DISRUPTION_BUDGET_LABEL: &str = "storage.topology.io/disruption-budget";

/// Well-known node host name label
pub const HOST_LABEL: &str = "kubernetes.io/hostname";

/// Annotation on a claim naming the block device it replaces
pub const PREDECESSOR_ANNOTATION: &str = "storage.topology.io/predecessor";

/// Annotation on a pool instance naming an on-disk pool to import and rename
pub const EXISTING_POOL_ANNOTATION: &str = "storage.topology.io/existing-pool-name";

/// Annotation on a volume config naming the VolumePolicy to merge
pub const VOLUME_POLICY_ANNOTATION: &str = "storage.topology.io/volume-policy";

/// Finalizer guarding pool instances and block device claims
pub const POOL_PROTECTION_FINALIZER: &str = "storage.topology.io/pool-protection";

/// Finalizer guarding volume configs until their budget is released
pub const VOLUME_PROTECTION_FINALIZER: &str = "storage.topology.io/volume-protection";
