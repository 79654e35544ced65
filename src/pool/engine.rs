//! Pool Topology Engine
//!
//! Builds and extends a pool from raid-group specs, imports existing pools
//! (optionally renaming them) and tears pools down. Command failures are
//! wrapped with pool context and returned; the outer reconcile loop retries.

use super::command;
use super::properties::PropertyCache;
use super::topology::Topology;
use crate::crd::{claim_name, PoolInstance, RaidGroup, RaidType, EXISTING_POOL_ANNOTATION};
use crate::domain::ports::ExecutorRef;
use crate::error::{Error, Result};
use crate::store::Stores;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Node-local engine operating on one pool
pub struct PoolEngine {
    pub(super) executor: ExecutorRef,
    pub(super) stores: Stores,
    pub(super) pool_name: String,
    pub(super) cache_file: String,
    pub(super) properties: PropertyCache,
}

impl PoolEngine {
    pub fn new(
        executor: ExecutorRef,
        stores: Stores,
        pool_name: impl Into<String>,
        cache_file: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            stores,
            pool_name: pool_name.into(),
            cache_file: cache_file.into(),
            properties: PropertyCache::new(),
        }
    }

    /// Name of the pool on disk
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Run a command, wrapping failures with pool context
    pub(super) fn run(&self, cmd: &str) -> Result<Vec<u8>> {
        self.executor.execute(cmd).map_err(|e| Error::Pool {
            pool: self.pool_name.clone(),
            reason: e.to_string(),
        })
    }

    // =========================================================================
    // Probes
    // =========================================================================

    /// Whether the pool is imported on this node
    pub fn exists(&self) -> Result<bool> {
        match self.executor.execute(&command::exists_probe(&self.pool_name)) {
            Ok(_) => Ok(true),
            Err(Error::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Names of pools found on disk that could be imported
    pub fn importable_pools(&self) -> Result<Vec<String>> {
        let raw = match self.executor.execute(&command::list_importable()) {
            Ok(raw) => raw,
            // Nothing to import
            Err(Error::Command { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .filter_map(|line| line.trim().strip_prefix("pool:"))
            .map(|name| name.trim().to_string())
            .collect())
    }

    /// Current vdev tree
    pub fn topology(&self) -> Result<Topology> {
        let raw = self.run(&command::dump(&self.pool_name))?;
        Topology::parse(&raw)
    }

    // =========================================================================
    // Device Resolution
    // =========================================================================

    /// Resolve the stable device path of a block device
    pub async fn device_link(&self, block_device: &str) -> Result<String> {
        let device = self
            .stores
            .block_devices
            .get(block_device)
            .await?
            .ok_or_else(|| Error::DeviceNotFound {
                device: block_device.to_string(),
            })?;
        Ok(device.device_link())
    }

    /// Resolve every device of a raid group, preferring links already
    /// recorded on the instance
    pub async fn resolve_group(&self, group: &RaidGroup) -> Result<Vec<String>> {
        let mut paths = Vec::with_capacity(group.block_devices.len());
        for bd in &group.block_devices {
            let path = match bd.dev_link.as_deref() {
                Some(link) if !link.is_empty() => link.to_string(),
                _ => self.device_link(&bd.block_device_name).await?,
            };
            paths.push(path);
        }
        Ok(paths)
    }

    /// Every raid group with its layout and role
    fn groups(instance: &PoolInstance) -> Vec<(&RaidGroup, RaidType, bool)> {
        let config = &instance.spec.pool_config;
        instance
            .spec
            .data_raid_groups
            .iter()
            .map(|rg| (rg, config.data_raid_group_type, false))
            .chain(
                instance
                    .spec
                    .write_cache_raid_groups
                    .iter()
                    .map(|rg| (rg, config.write_cache_type(), true)),
            )
            .collect()
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create the pool from the first data raid group and add the rest.
    ///
    /// Short-circuits when the pool exists; refuses when a pool with our
    /// name is importable from disk.
    pub async fn create(&self, instance: &PoolInstance) -> Result<()> {
        if self.exists()? {
            debug!(pool = %self.pool_name, "Pool already exists, skipping create");
            return Ok(());
        }
        if self.importable_pools()?.iter().any(|p| p == &self.pool_name) {
            return Err(Error::PoolImportable {
                pool: self.pool_name.clone(),
            });
        }

        let groups = Self::groups(instance);
        let Some(((first, raid, _), rest)) = groups.split_first() else {
            return Err(Error::Validation(format!(
                "pool {} has no data raid groups",
                self.pool_name
            )));
        };

        let devices = self.resolve_group(first).await?;
        let config = &instance.spec.pool_config;
        self.run(&command::create(
            &self.pool_name,
            &self.cache_file,
            config.compression.as_deref(),
            *raid,
            &devices,
        ))?;
        info!(pool = %self.pool_name, raid = %raid, devices = ?devices, "Pool created");

        let mut errors = Vec::new();
        for (group, raid, write_cache) in rest {
            if let Err(e) = self.add_group(group, *raid, *write_cache).await {
                warn!(pool = %self.pool_name, error = %e, "Failed to add raid group");
                errors.push(e);
            }
        }
        Error::aggregate(format!("create pool {}", self.pool_name), errors)
    }

    async fn add_group(&self, group: &RaidGroup, raid: RaidType, write_cache: bool) -> Result<()> {
        let devices = self.resolve_group(group).await?;
        self.run(&command::add(&self.pool_name, raid, &devices, write_cache))?;
        info!(
            pool = %self.pool_name,
            raid = %raid,
            write_cache,
            devices = ?devices,
            "Raid group added"
        );
        Ok(())
    }

    // =========================================================================
    // Expansion
    // =========================================================================

    /// Add raid groups that are not yet part of the pool. Returns how many
    /// were added.
    ///
    /// A group holding a device that replaces another one is an in-place
    /// swap and is left to [`PoolEngine::replace_disks`].
    pub async fn expand(&self, instance: &PoolInstance) -> Result<usize> {
        let topology = self.topology()?;
        let mut added = 0;
        let mut errors = Vec::new();

        for (group, raid, write_cache) in Self::groups(instance) {
            match self.holds_replacement(group).await {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            }
            let devices = match self.resolve_group(group).await {
                Ok(devices) => devices,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if topology.contains_any(&devices) {
                continue;
            }
            match self.run(&command::add(&self.pool_name, raid, &devices, write_cache)) {
                Ok(_) => {
                    info!(pool = %self.pool_name, devices = ?devices, "Pool expanded");
                    added += 1;
                }
                Err(e) => errors.push(e),
            }
        }

        Error::aggregate(format!("expand pool {}", self.pool_name), errors)?;
        Ok(added)
    }

    async fn holds_replacement(&self, group: &RaidGroup) -> Result<bool> {
        for device in group.device_names() {
            if let Some(claim) = self.stores.claims.get(&claim_name(device)).await? {
                if claim.predecessor().is_some() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // =========================================================================
    // Import
    // =========================================================================

    /// Import the pool by cache file, then by directory scan, renaming an
    /// existing on-disk pool when the instance names one.
    pub async fn import(&self, instance: &PoolInstance) -> Result<()> {
        let existing = instance.existing_pool_name();
        let source = existing.unwrap_or(&self.pool_name);
        let rename_to = existing.map(|_| self.pool_name.as_str());

        let attempts = [
            command::import_from_cache(&self.cache_file, source, rename_to),
            command::import_from_scan(&self.cache_file, source, rename_to),
        ];
        let mut reasons = Vec::new();
        let mut imported = false;
        for cmd in &attempts {
            match self.executor.execute(cmd) {
                Ok(_) => {
                    imported = true;
                    break;
                }
                Err(e) => reasons.push(e.to_string()),
            }
        }
        if !imported {
            return Err(Error::Import {
                pool: self.pool_name.clone(),
                reason: reasons.join("; "),
            });
        }
        info!(pool = %self.pool_name, source = %source, "Pool imported");
        self.properties.invalidate(&self.pool_name);

        if existing.is_some() {
            let mut updated = instance.clone();
            updated.annotations_mut().remove(EXISTING_POOL_ANNOTATION);
            self.stores.pool_instances.patch(instance, &updated).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Destroy the pool and clear the labels of every device
    pub async fn delete(&self, instance: &PoolInstance) -> Result<()> {
        if self.exists()? {
            self.run(&command::destroy(&self.pool_name))?;
            info!(pool = %self.pool_name, "Pool destroyed");
        }
        self.properties.invalidate(&self.pool_name);

        let mut errors = Vec::new();
        for (group, _, _) in Self::groups(instance) {
            let devices = match self.resolve_group(group).await {
                Ok(devices) => devices,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            for device in devices {
                if let Err(e) = self.run(&command::labelclear(&device)) {
                    errors.push(e);
                }
            }
        }
        Error::aggregate(format!("clear labels of pool {}", self.pool_name), errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PoolPhase;
    use crate::testing::{self, FakeNode};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const POOL: &str = "pool-a1";

    async fn engine(node: &Arc<FakeNode>, devices: &[&str]) -> PoolEngine {
        let stores = testing::stores();
        for bd in devices {
            stores
                .block_devices
                .create(&testing::block_device(bd, "node-1"))
                .await
                .unwrap();
        }
        PoolEngine::new(node.clone(), stores, POOL, "/tmp/pool/pool.cache")
    }

    #[tokio::test]
    async fn test_create_mirror_with_write_cache() {
        let node = Arc::new(FakeNode::new());
        let engine = engine(&node, &["d1", "d2", "d3"]).await;
        let instance = testing::pool_instance(
            "c1-abcde",
            "node-1",
            RaidType::Mirror,
            &[&["d1", "d2"]],
            &[&["d3"]],
        );

        engine.create(&instance).await.unwrap();

        let mutations = node.mutations();
        assert_eq!(
            mutations,
            vec![
                "zpool create -f -o cachefile=/tmp/pool/pool.cache pool-a1 mirror /dev/d1 /dev/d2"
                    .to_string(),
                "zpool add -f pool-a1 log /dev/d3".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_twice_issues_one_create() {
        let node = Arc::new(FakeNode::new());
        let engine = engine(&node, &["d1", "d2"]).await;
        let instance =
            testing::pool_instance("c1-abcde", "node-1", RaidType::Stripe, &[&["d1"], &["d2"]], &[]);

        engine.create(&instance).await.unwrap();
        engine.create(&instance).await.unwrap();

        assert_eq!(node.count("zpool create"), 1);
        assert_eq!(node.count("zpool add"), 1);
    }

    #[tokio::test]
    async fn test_create_refuses_importable_pool() {
        let node = Arc::new(FakeNode::new());
        node.add_importable(POOL);
        let engine = engine(&node, &["d1"]).await;
        let instance = testing::pool_instance("c1-abcde", "node-1", RaidType::Stripe, &[&["d1"]], &[]);

        assert_matches!(engine.create(&instance).await, Err(Error::PoolImportable { .. }));
        assert_eq!(node.count("zpool create"), 0);
    }

    #[tokio::test]
    async fn test_create_accumulates_add_failures() {
        let node = Arc::new(FakeNode::new());
        node.fail_on("zpool add -f pool-a1 /dev/d2", "device busy");
        let engine = engine(&node, &["d1", "d2", "d3"]).await;
        let instance = testing::pool_instance(
            "c1-abcde",
            "node-1",
            RaidType::Stripe,
            &[&["d1"], &["d2"], &["d3"]],
            &[],
        );

        let err = engine.create(&instance).await.unwrap_err();
        assert_matches!(err, Error::Aggregate { ref errors, .. } if errors.len() == 1);
        // The group after the failed one was still added
        assert_eq!(node.count("zpool add -f pool-a1 /dev/d3"), 1);

        // Next pass: the pool exists, expansion picks up the missing group
        node.clear_failures();
        assert_eq!(engine.expand(&instance).await.unwrap(), 1);
        assert_eq!(engine.expand(&instance).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expand_leaves_swapped_device_to_replacement() {
        let node = Arc::new(FakeNode::new());
        let engine = engine(&node, &["d1", "d2", "d3"]).await;
        let original =
            testing::pool_instance("c1-abcde", "node-1", RaidType::Stripe, &[&["d1"], &["d2"]], &[]);
        engine.create(&original).await.unwrap();
        testing::seed_claim(&engine.stores, "d3", "c1", Some("d2")).await;

        let swapped =
            testing::pool_instance("c1-abcde", "node-1", RaidType::Stripe, &[&["d1"], &["d3"]], &[]);
        assert_eq!(engine.expand(&swapped).await.unwrap(), 0);
        assert_eq!(node.count("zpool add -f pool-a1 /dev/d3"), 0);

        let report = engine.replace_disks(&swapped).await.unwrap();
        assert_eq!(report.in_progress, vec!["d3".to_string()]);
        assert_eq!(node.count("zpool replace -f pool-a1 /dev/d2 /dev/d3"), 1);

        // Still skipped while the new device resilvers
        assert_eq!(engine.expand(&swapped).await.unwrap(), 0);
        assert_eq!(node.count("zpool add"), 1);
    }

    #[tokio::test]
    async fn test_create_without_device_fails() {
        let node = Arc::new(FakeNode::new());
        let engine = engine(&node, &[]).await;
        let instance = testing::pool_instance("c1-abcde", "node-1", RaidType::Stripe, &[&["d1"]], &[]);
        assert_matches!(engine.create(&instance).await, Err(Error::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_import_renames_and_clears_annotation() {
        let node = Arc::new(FakeNode::new());
        node.add_importable("legacy-pool");
        let engine = engine(&node, &["d1"]).await;
        let mut instance =
            testing::pool_instance("c1-abcde", "node-1", RaidType::Stripe, &[&["d1"]], &[]);
        instance
            .annotations_mut()
            .insert(EXISTING_POOL_ANNOTATION.into(), "legacy-pool".into());
        let instance = engine.stores.pool_instances.create(&instance).await.unwrap();

        engine.import(&instance).await.unwrap();
        assert!(engine.exists().unwrap());
        // Cache file is missing, so the scan path did the import
        assert_eq!(node.count("zpool import -d"), 1);

        let stored = engine
            .stores
            .pool_instances
            .get("c1-abcde")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.existing_pool_name().is_none());
    }

    #[tokio::test]
    async fn test_import_failure() {
        let node = Arc::new(FakeNode::new());
        let engine = engine(&node, &["d1"]).await;
        let instance = testing::pool_instance("c1-abcde", "node-1", RaidType::Stripe, &[&["d1"]], &[]);
        assert_matches!(engine.import(&instance).await, Err(Error::Import { .. }));
    }

    #[tokio::test]
    async fn test_delete_destroys_and_clears_labels() {
        let node = Arc::new(FakeNode::new());
        let engine = engine(&node, &["d1", "d2"]).await;
        let instance =
            testing::pool_instance("c1-abcde", "node-1", RaidType::Mirror, &[&["d1", "d2"]], &[]);
        engine.create(&instance).await.unwrap();

        engine.delete(&instance).await.unwrap();
        assert!(!engine.exists().unwrap());
        assert_eq!(node.count("zpool labelclear -f"), 2);
    }

    #[tokio::test]
    async fn test_observe_capacity() {
        let node = Arc::new(FakeNode::with_pool(POOL));
        node.set_usage(1000, 250, 1 << 20);
        let engine = engine(&node, &[]).await;

        let (phase, capacity) = engine.observe().unwrap();
        assert_eq!(phase, PoolPhase::Online);
        assert_eq!(capacity.total, 1000);
        assert_eq!(capacity.used, 250);
        assert_eq!(capacity.free, 750);
        assert_eq!(capacity.zfs.logical_used, 1 << 20);
        assert_eq!(capacity.used_percent(), 25);
    }
}
