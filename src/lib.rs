//! Storage Topology Operator
//!
//! Control plane for replicated block storage built on node-local pools.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Cluster Controller                            │
//! │  ┌────────────────────┐   ┌────────────────────────────────────────┐ │
//! │  │ PoolCluster        │   │ VolumeConfig                           │ │
//! │  │ validate / claim / │   │ policy / provision / place / budget /  │ │
//! │  │ PoolInstances      │   │ resize / scale                         │ │
//! │  └─────────┬──────────┘   └───────────────────┬────────────────────┘ │
//! │            │        WorkQueue + workers       │                      │
//! └────────────┼──────────────────────────────────┼──────────────────────┘
//!              │ PoolInstance                     │ Volume / VolumeReplica
//! ┌────────────┴─────────────┐          ┌─────────┴──────────────────────┐
//! │ Pool Manager (per node)  │          │ Data path (out of scope)       │
//! │ create / import / expand │          │ target + replica servers       │
//! │ replace / properties     │          └────────────────────────────────┘
//! └──────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`pool`]: per-node pool topology engine
//! - [`volume`]: replica placement, scaling, disruption budgets, resize
//! - [`controller`]: reconcile loops and the controller runtime
//! - [`store`]: object repositories (API server and in-memory)
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: ports implemented by the adapters
//! - [`config`], [`metrics`], [`error`]: process plumbing

pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod store;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{OperatorConfig, PoolManagerConfig};

pub use controller::{
    Action, KubeRecorder, MemoryRecorder, PoolClusterController, PoolManager, Reconciler,
    VolumeConfigController, WorkQueue,
};

pub use crd::{
    BlockDevice, BlockDeviceClaim, PoolCluster, PoolInstance, Volume, VolumeConfig, VolumePolicy,
    VolumeReplica,
};

pub use domain::ports::{
    EventKind, EventRecorder, Executor, LabelSelector, ObjectStore, ObjectStoreRef,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::ControllerMetrics;

pub use pool::{PoolEngine, ShellExecutor, Topology};

pub use store::{KubeStore, MemoryStore, Stores};

pub use volume::VolumeEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
