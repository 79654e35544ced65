//! Process configuration
//!
//! Built once from command-line flags (with environment fallbacks) and
//! passed by reference to the controllers.

use crate::error::{Error, Result};
use crate::pool::pool_name;
use std::net::SocketAddr;
use std::time::Duration;

/// Default pool cache file on the storage node
pub const DEFAULT_CACHE_FILE: &str = "/tmp/pool/pool.cache";

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Configuration(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid {} {}: {}", field, value, e)))
}

// =============================================================================
// Cluster Controller
// =============================================================================

/// Configuration of the cluster-wide controller process
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub namespace: String,
    pub resync_interval: Duration,
    pub workers: usize,
    pub health_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
}

impl OperatorConfig {
    pub fn new(
        namespace: &str,
        resync_interval_secs: u64,
        workers: usize,
        health_addr: &str,
        metrics_addr: &str,
    ) -> Result<Self> {
        required("namespace", namespace)?;
        if resync_interval_secs == 0 {
            return Err(Error::Configuration(
                "resync interval must be at least one second".into(),
            ));
        }
        if workers == 0 {
            return Err(Error::Configuration("at least one worker is required".into()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            resync_interval: Duration::from_secs(resync_interval_secs),
            workers,
            health_addr: parse_addr("health address", health_addr)?,
            metrics_addr: parse_addr("metrics address", metrics_addr)?,
        })
    }
}

// =============================================================================
// Pool Manager
// =============================================================================

/// Configuration of the per-node pool manager process
#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    pub namespace: String,
    /// PoolInstance this process manages
    pub instance_name: String,
    /// Seed the on-disk pool name is derived from
    pub pool_name_seed: String,
    pub cache_file: String,
    pub resync_interval: Duration,
    pub health_addr: SocketAddr,
}

impl PoolManagerConfig {
    pub fn new(
        namespace: &str,
        instance_name: &str,
        pool_name_seed: &str,
        cache_file: &str,
        resync_interval_secs: u64,
        health_addr: &str,
    ) -> Result<Self> {
        required("namespace", namespace)?;
        required("pool instance name", instance_name)?;
        required("pool name seed", pool_name_seed)?;
        required("pool cache file", cache_file)?;
        if resync_interval_secs == 0 {
            return Err(Error::Configuration(
                "resync interval must be at least one second".into(),
            ));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            instance_name: instance_name.to_string(),
            pool_name_seed: pool_name_seed.to_string(),
            cache_file: cache_file.to_string(),
            resync_interval: Duration::from_secs(resync_interval_secs),
            health_addr: parse_addr("health address", health_addr)?,
        })
    }

    /// On-disk name of the managed pool
    pub fn pool_name(&self) -> String {
        pool_name(&self.pool_name_seed)
    }
}
