//! Test support: a fake storage node and object fixtures

use crate::crd::{
    claim_name, BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, BlockDeviceRef,
    BlockDeviceSpec, PoolConfig, PoolInstance, PoolInstanceSpec, PoolInstanceStatus, PoolPhase,
    RaidGroup, RaidType, CLUSTER_LABEL, HOST_LABEL, POOL_PROTECTION_FINALIZER,
    PREDECESSOR_ANNOTATION, VolumeConfig, VolumeConfigSpec,
};
use crate::domain::ports::Executor;
use crate::error::{Error, Result};
use crate::pool::topology::{ScanStats, Topology, Vdev, VDEV_REPLACING};
use crate::store::Stores;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

pub const NAMESPACE: &str = "storage";
pub const CLUSTER: &str = "c1";

const RAID_KEYWORDS: [&str; 3] = ["mirror", "raidz", "raidz2"];

// =============================================================================
// Fake Node
// =============================================================================

/// Stateful stand-in for a storage node's pool command line
///
/// Understands the command lines built by `pool::command` and keeps a single
/// pool's vdev tree in memory.
#[derive(Default)]
pub struct FakeNode {
    state: Mutex<NodeState>,
}

#[derive(Default)]
struct NodeState {
    commands: Vec<String>,
    pool: Option<Topology>,
    importable: Vec<Topology>,
    cache_imports: bool,
    failures: Vec<(String, String)>,
    properties: HashMap<String, String>,
    size: u64,
    allocated: u64,
    logical_used: u64,
}

fn empty_topology(name: &str) -> Topology {
    Topology {
        name: name.to_string(),
        state: "ONLINE".into(),
        vdev_tree: Vdev {
            vdev_type: "root".into(),
            path: None,
            state: Some("ONLINE".into()),
            is_log: false,
            children: Vec::new(),
        },
        scan_stats: None,
    }
}

/// Positional arguments, skipping flags and the values of value flags
fn positional(args: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        match *arg {
            "-o" | "-O" | "-c" | "-d" => skip = true,
            a if a.starts_with('-') => {}
            a => out.push(a.to_string()),
        }
    }
    out
}

/// Top-level vdevs for one raid group
fn group_vdevs(args: &[String], is_log: bool) -> Vec<Vdev> {
    let (keyword, devices) = match args.first() {
        Some(first) if RAID_KEYWORDS.contains(&first.as_str()) => (Some(first.clone()), &args[1..]),
        _ => (None, args),
    };
    let leaves = devices.iter().map(Vdev::leaf);
    match keyword {
        Some(keyword) => vec![Vdev {
            vdev_type: keyword,
            path: None,
            state: Some("ONLINE".into()),
            is_log,
            children: leaves.collect(),
        }],
        None => leaves
            .map(|mut leaf| {
                leaf.is_log = is_log;
                leaf
            })
            .collect(),
    }
}

fn replace_leaf(vdev: &mut Vdev, old: &str, new: &str) -> bool {
    for child in vdev.children.iter_mut() {
        if child.is_leaf() && child.is_device(old) {
            let old_leaf = child.clone();
            *child = Vdev {
                vdev_type: VDEV_REPLACING.into(),
                path: None,
                state: Some("DEGRADED".into()),
                is_log: old_leaf.is_log,
                children: vec![old_leaf, Vdev::leaf(new)],
            };
            return true;
        }
        if replace_leaf(child, old, new) {
            return true;
        }
    }
    false
}

fn collapse_replacing(vdev: &mut Vdev) {
    for child in vdev.children.iter_mut() {
        if child.vdev_type == VDEV_REPLACING {
            if let Some(new_leaf) = child.children.last().cloned() {
                *child = new_leaf;
            }
        } else {
            collapse_replacing(child);
        }
    }
}

fn set_leaf_state(vdev: &mut Vdev, device: &str, state: &str) {
    if vdev.is_device(device) {
        vdev.state = Some(state.to_string());
    }
    for child in vdev.children.iter_mut() {
        set_leaf_state(child, device, state);
    }
}

impl FakeNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// A node where `name` already exists
    pub fn with_pool(name: &str) -> Self {
        let node = Self::new();
        node.state.lock().pool = Some(empty_topology(name));
        node
    }

    /// Make a pool importable from disk
    pub fn add_importable(&self, name: &str) {
        self.state.lock().importable.push(empty_topology(name));
    }

    /// Let imports through the cache file succeed
    pub fn enable_cache_imports(&self) {
        self.state.lock().cache_imports = true;
    }

    /// Fail every command starting with `prefix`
    pub fn fail_on(&self, prefix: &str, reason: &str) {
        self.state
            .lock()
            .failures
            .push((prefix.to_string(), reason.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn set_property(&self, property: &str, value: &str) {
        self.state
            .lock()
            .properties
            .insert(property.to_string(), value.to_string());
    }

    pub fn property(&self, property: &str) -> Option<String> {
        self.state.lock().properties.get(property).cloned()
    }

    pub fn set_usage(&self, size: u64, allocated: u64, logical_used: u64) {
        let mut state = self.state.lock();
        state.size = size;
        state.allocated = allocated;
        state.logical_used = logical_used;
    }

    pub fn set_health(&self, health: &str) {
        if let Some(pool) = self.state.lock().pool.as_mut() {
            pool.state = health.to_string();
        }
    }

    pub fn set_device_state(&self, device: &str, state: &str) {
        if let Some(pool) = self.state.lock().pool.as_mut() {
            set_leaf_state(&mut pool.vdev_tree, device, state);
        }
    }

    /// Complete every running resilver
    pub fn finish_resilver(&self) {
        if let Some(pool) = self.state.lock().pool.as_mut() {
            collapse_replacing(&mut pool.vdev_tree);
            pool.scan_stats = Some(ScanStats {
                function: "resilver".into(),
                state: "finished".into(),
            });
        }
    }

    pub fn topology(&self) -> Option<Topology> {
        self.state.lock().pool.clone()
    }

    /// Every command executed so far
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Commands that change node state
    pub fn mutations(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| {
                let args: Vec<&str> = c.split_whitespace().collect();
                match args.get(1).copied() {
                    Some("create" | "add" | "replace" | "destroy" | "labelclear" | "set") => true,
                    Some("import") => !positional(&args[2..]).is_empty(),
                    _ => false,
                }
            })
            .collect()
    }

    /// Number of executed commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn dispatch(state: &mut NodeState, args: &[&str]) -> std::result::Result<String, String> {
        let (tool, sub, rest) = match args {
            [tool, sub, rest @ ..] => (*tool, *sub, rest),
            _ => return Err("usage".into()),
        };
        let pos = positional(rest);
        let pool_named = |state: &NodeState, name: Option<&String>| -> bool {
            match (state.pool.as_ref(), name) {
                (Some(pool), Some(name)) => &pool.name == name,
                _ => false,
            }
        };

        match (tool, sub) {
            (_, "get") => {
                let (property, target) = (pos.first(), pos.get(1));
                if !pool_named(state, target) {
                    return Err(format!(
                        "cannot open '{}': dataset does not exist",
                        target.map(String::as_str).unwrap_or_default()
                    ));
                }
                let value = match property.map(String::as_str) {
                    Some("name") => target.cloned().unwrap_or_default(),
                    Some("logicalused") => state.logical_used.to_string(),
                    Some(p) => state
                        .properties
                        .get(p)
                        .cloned()
                        .unwrap_or_else(|| "off".to_string()),
                    None => return Err("missing property".into()),
                };
                Ok(format!("{}\n", value))
            }
            (_, "set") => {
                if !pool_named(state, pos.get(1)) {
                    return Err("dataset does not exist".into());
                }
                let Some((property, value)) = pos.first().and_then(|kv| kv.split_once('=')) else {
                    return Err("bad property".into());
                };
                state
                    .properties
                    .insert(property.to_string(), value.to_string());
                Ok(String::new())
            }
            ("zpool", "import") if pos.is_empty() => {
                if state.importable.is_empty() {
                    return Err("no pools available to import".into());
                }
                Ok(state
                    .importable
                    .iter()
                    .map(|t| format!("   pool: {}\n     id: 1\n  state: ONLINE\n", t.name))
                    .collect())
            }
            ("zpool", "import") => {
                if rest.contains(&"-c") && !state.cache_imports {
                    return Err("failed to open cache file".into());
                }
                let name = &pos[0];
                let new_name = pos.get(1).unwrap_or(name);
                let Some(index) = state.importable.iter().position(|t| &t.name == name) else {
                    return Err(format!("cannot import '{}': no such pool available", name));
                };
                let mut pool = state.importable.remove(index);
                pool.name = new_name.clone();
                state.pool = Some(pool);
                Ok(String::new())
            }
            ("zpool", "create") => {
                let Some((name, group)) = pos.split_first() else {
                    return Err("missing pool name".into());
                };
                if state.pool.is_some() {
                    return Err(format!("cannot create '{}': pool already exists", name));
                }
                let mut pool = empty_topology(name);
                pool.vdev_tree.children = group_vdevs(group, false);
                state.pool = Some(pool);
                Ok(String::new())
            }
            ("zpool", "add") => {
                if !pool_named(state, pos.first()) {
                    return Err("no such pool".into());
                }
                let (is_log, group) = match pos.get(1).map(String::as_str) {
                    Some("log") => (true, &pos[2..]),
                    _ => (false, &pos[1..]),
                };
                let vdevs = group_vdevs(group, is_log);
                if let Some(pool) = state.pool.as_mut() {
                    pool.vdev_tree.children.extend(vdevs);
                }
                Ok(String::new())
            }
            ("zpool", "replace") => {
                if !pool_named(state, pos.first()) || pos.len() < 3 {
                    return Err("no such pool".into());
                }
                let pool = state.pool.as_mut().ok_or("no such pool")?;
                if !replace_leaf(&mut pool.vdev_tree, &pos[1], &pos[2]) {
                    return Err(format!("no such device in pool: {}", pos[1]));
                }
                pool.scan_stats = Some(ScanStats {
                    function: "resilver".into(),
                    state: "scanning".into(),
                });
                Ok(String::new())
            }
            ("zpool", "dump") => {
                if !pool_named(state, pos.first()) {
                    return Err("no such pool".into());
                }
                serde_json::to_string(&state.pool).map_err(|e| e.to_string())
            }
            ("zpool", "list") => {
                let pool = state.pool.as_ref().ok_or("no such pool")?;
                Ok(format!(
                    "{}\t{}\t{}\t{}\n",
                    pool.state,
                    state.size,
                    state.allocated,
                    state.size.saturating_sub(state.allocated)
                ))
            }
            ("zpool", "destroy") => {
                if !pool_named(state, pos.first()) {
                    return Err("no such pool".into());
                }
                state.pool = None;
                state.properties.clear();
                Ok(String::new())
            }
            ("zpool", "labelclear") => Ok(String::new()),
            _ => Err(format!("unknown command {} {}", tool, sub)),
        }
    }
}

impl Executor for FakeNode {
    fn execute(&self, command: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.commands.push(command.to_string());

        let injected = state
            .failures
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reason)| reason.clone());
        let outcome = match injected {
            Some(reason) => Err(reason),
            None => {
                let args: Vec<&str> = command.split_whitespace().collect();
                Self::dispatch(&mut state, &args)
            }
        };

        outcome.map(String::into_bytes).map_err(|reason| Error::Command {
            command: command.to_string(),
            reason,
        })
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn stores() -> Stores {
    Stores::in_memory(NAMESPACE)
}

pub fn block_device(name: &str, node: &str) -> BlockDevice {
    BlockDevice::new(
        name,
        BlockDeviceSpec {
            node_name: node.to_string(),
            path: format!("/dev/{}", name),
            dev_links: Vec::new(),
            capacity_bytes: 10 << 30,
        },
    )
}

pub fn raid_group(devices: &[&str]) -> RaidGroup {
    RaidGroup {
        block_devices: devices
            .iter()
            .map(|d| BlockDeviceRef {
                block_device_name: d.to_string(),
                dev_link: None,
                capacity_bytes: None,
            })
            .collect(),
    }
}

/// Pool instance in cluster `c1` pinned to `host`
pub fn pool_instance(
    name: &str,
    host: &str,
    raid: RaidType,
    data: &[&[&str]],
    write_cache: &[&[&str]],
) -> PoolInstance {
    let mut node_selector = BTreeMap::new();
    node_selector.insert(HOST_LABEL.to_string(), host.to_string());
    let mut instance = PoolInstance::new(
        name,
        PoolInstanceSpec {
            host_name: host.to_string(),
            node_selector,
            pool_config: PoolConfig {
                data_raid_group_type: raid,
                ..Default::default()
            },
            data_raid_groups: data.iter().map(|g| raid_group(g)).collect(),
            write_cache_raid_groups: write_cache.iter().map(|g| raid_group(g)).collect(),
        },
    );
    instance
        .labels_mut()
        .insert(CLUSTER_LABEL.to_string(), CLUSTER.to_string());
    instance
        .labels_mut()
        .insert(HOST_LABEL.to_string(), host.to_string());
    instance
}

/// Store an Online pool instance of cluster `cluster`
pub async fn seed_pool(stores: &Stores, name: &str, cluster: &str, host: &str) -> PoolInstance {
    let mut instance = pool_instance(name, host, RaidType::Stripe, &[&["sdb"]], &[]);
    instance
        .labels_mut()
        .insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    let mut created = stores.pool_instances.create(&instance).await.unwrap();
    created.status = Some(PoolInstanceStatus {
        phase: PoolPhase::Online,
        ..Default::default()
    });
    stores.pool_instances.update_status(&created).await.unwrap()
}

/// Store a guarded claim for `device`, optionally replacing `predecessor`
pub async fn seed_claim(
    stores: &Stores,
    device: &str,
    cluster: &str,
    predecessor: Option<&str>,
) -> BlockDeviceClaim {
    let mut claim = BlockDeviceClaim::new(
        &claim_name(device),
        BlockDeviceClaimSpec {
            block_device_name: device.to_string(),
            node_name: "node-1".into(),
        },
    );
    claim
        .labels_mut()
        .insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    claim.metadata.finalizers = Some(vec![POOL_PROTECTION_FINALIZER.to_string()]);
    if let Some(predecessor) = predecessor {
        claim
            .annotations_mut()
            .insert(PREDECESSOR_ANNOTATION.to_string(), predecessor.to_string());
    }
    stores.claims.create(&claim).await.unwrap()
}

/// Unstored volume config of cluster `c1` with default policy
pub fn volume_config(name: &str, replicas: u32, capacity_bytes: u64) -> VolumeConfig {
    VolumeConfig::new(
        name,
        VolumeConfigSpec {
            capacity_bytes,
            replica_count: replicas,
            cluster: CLUSTER.to_string(),
            policy: Default::default(),
            publish: Default::default(),
            source: None,
        },
    )
}
