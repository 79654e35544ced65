//! Pool and dataset property reconciliation
//!
//! Reading a property is an expensive round trip on the node, so the last
//! value seen per pool is cached. One mutex guards the cache and is held for
//! the whole probe-then-set sequence: concurrent workers never race to set
//! the same property.

use super::{command, PoolEngine};
use crate::crd::PoolInstance;
use crate::domain::ports::Executor;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

/// Where a property lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyScope {
    /// Property of the pool itself (`zpool get/set`)
    Pool,
    /// Property of the pool's root dataset (`zfs get/set`)
    Dataset,
}

impl PropertyScope {
    fn key(&self, property: &str) -> String {
        match self {
            PropertyScope::Pool => format!("pool:{}", property),
            PropertyScope::Dataset => format!("dataset:{}", property),
        }
    }
}

/// Last known property values, per pool
#[derive(Debug, Default)]
pub struct PropertyCache {
    values: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl PropertyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `property` has `value`, issuing a set only when the live
    /// value differs. Returns whether a set command was issued.
    pub fn ensure(
        &self,
        executor: &dyn Executor,
        pool: &str,
        scope: PropertyScope,
        property: &str,
        value: &str,
    ) -> Result<bool> {
        let key = scope.key(property);
        let mut values = self.values.lock();
        let cached = values.entry(pool.to_string()).or_default();
        if cached.get(&key).map(String::as_str) == Some(value) {
            return Ok(false);
        }

        let wrap = |e: Error| Error::Pool {
            pool: pool.to_string(),
            reason: format!("property {}: {}", property, e),
        };

        let get = match scope {
            PropertyScope::Pool => command::get_pool_property(pool, property),
            PropertyScope::Dataset => command::get_dataset_property(pool, property),
        };
        let live = executor.execute(&get).map_err(wrap)?;
        let live = String::from_utf8_lossy(&live).trim().to_string();
        if live == value {
            debug!(pool = %pool, property = %property, value = %value, "Property already set");
            cached.insert(key, live);
            return Ok(false);
        }

        let set = match scope {
            PropertyScope::Pool => command::set_pool_property(pool, property, value),
            PropertyScope::Dataset => command::set_dataset_property(pool, property, value),
        };
        executor.execute(&set).map_err(wrap)?;
        info!(pool = %pool, property = %property, from = %live, to = %value, "Property updated");
        cached.insert(key, value.to_string());
        Ok(true)
    }

    /// Forget everything known about a pool
    pub fn invalidate(&self, pool: &str) {
        self.values.lock().remove(pool);
    }
}

impl PoolEngine {
    /// Reconcile compression and the read-only switch. Returns whether the
    /// pool should now be reported read-only.
    pub fn reconcile_properties(&self, instance: &PoolInstance, used_percent: u32) -> Result<bool> {
        let config = &instance.spec.pool_config;

        if let Some(compression) = config.compression.as_deref() {
            self.properties.ensure(
                self.executor.as_ref(),
                &self.pool_name,
                PropertyScope::Dataset,
                "compression",
                compression,
            )?;
        }

        let read_only = config
            .ro_threshold_percent
            .map(|threshold| threshold > 0 && used_percent >= threshold)
            .unwrap_or(false);
        self.properties.ensure(
            self.executor.as_ref(),
            &self.pool_name,
            PropertyScope::Dataset,
            "readonly",
            if read_only { "on" } else { "off" },
        )?;

        Ok(read_only)
    }
}
