//! Reconcile loops
//!
//! - `pool_cluster`: PoolCluster to PoolInstances and device claims
//! - `pool_instance`: the per-node pool manager
//! - `volume_config`: VolumeConfig to Volume, replicas and budgets
//! - `runner` / `workqueue`: the shared controller runtime
//! - `events`: event recorders

pub mod events;
pub mod pool_cluster;
pub mod pool_instance;
pub mod runner;
pub mod volume_config;
pub mod workqueue;

pub use events::{KubeRecorder, MemoryRecorder};
pub use pool_cluster::PoolClusterController;
pub use pool_instance::PoolManager;
pub use runner::{Action, Reconciler};
pub use volume_config::VolumeConfigController;
pub use workqueue::WorkQueue;
