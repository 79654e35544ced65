//! Pool health and capacity

use super::{command, PoolEngine};
use crate::crd::{PoolCapacity, PoolPhase, ZfsCapacity};
use crate::error::{Error, Result};
use std::str::FromStr;

/// One line of `zpool list -Hp -o health,size,alloc,free`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolUsage {
    pub phase: PoolPhase,
    pub size: u64,
    pub allocated: u64,
    pub free: u64,
}

impl FromStr for PoolUsage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let expected_field = |name| Error::Parse(format!("missing '{}' in pool list output", name));
        let failed_to_parse =
            |name, err: std::num::ParseIntError| Error::Parse(format!("field '{}': {}", name, err));

        let mut values = s.split_whitespace();
        let phase = PoolPhase::from_health(values.next().ok_or_else(|| expected_field("health"))?);
        let size = values
            .next()
            .ok_or_else(|| expected_field("size"))?
            .parse::<u64>()
            .map_err(|e| failed_to_parse("size", e))?;
        let allocated = values
            .next()
            .ok_or_else(|| expected_field("alloc"))?
            .parse::<u64>()
            .map_err(|e| failed_to_parse("alloc", e))?;
        let free = values
            .next()
            .ok_or_else(|| expected_field("free"))?
            .parse::<u64>()
            .map_err(|e| failed_to_parse("free", e))?;

        Ok(PoolUsage {
            phase,
            size,
            allocated,
            free,
        })
    }
}

/// Parse a single numeric property value
pub fn parse_bytes(raw: &str) -> Result<u64> {
    let value = raw.trim();
    value
        .parse::<u64>()
        .map_err(|e| Error::Parse(format!("'{}': {}", value, e)))
}

impl PoolEngine {
    /// Observe the pool's phase and capacity
    pub fn observe(&self) -> Result<(PoolPhase, PoolCapacity)> {
        let raw = self.run(&command::list_capacity(&self.pool_name))?;
        let usage: PoolUsage = String::from_utf8_lossy(&raw).trim().parse()?;

        let raw = self.run(&command::get_dataset_property(&self.pool_name, "logicalused"))?;
        let logical_used = parse_bytes(&String::from_utf8_lossy(&raw))?;

        Ok((
            usage.phase,
            PoolCapacity {
                used: usage.allocated,
                free: usage.free,
                total: usage.size,
                zfs: ZfsCapacity { logical_used },
            },
        ))
    }
}
