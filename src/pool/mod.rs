//! Per-node pool topology engine
//!
//! - `engine`: create, expand, import and destroy a pool
//! - `replacement`: disk replacement with resilver tracking
//! - `properties`: cached pool/dataset property reconciliation
//! - `status`: health and capacity observation
//! - `topology`: the vdev tree reported by the node
//! - `command`: command lines handed to the executor

pub mod command;
pub mod engine;
pub mod executor;
pub mod properties;
pub mod replacement;
pub mod status;
pub mod topology;

pub use engine::PoolEngine;
pub use executor::ShellExecutor;
pub use properties::{PropertyCache, PropertyScope};
pub use replacement::{apply_replacement_condition, ReplacementReport};
pub use status::PoolUsage;
pub use topology::{ScanStats, Topology, Vdev};

/// Canonical on-disk pool name for a name seed
pub fn pool_name(seed: &str) -> String {
    format!("pool-{}", seed)
}
