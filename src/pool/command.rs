//! Pool and dataset command lines
//!
//! Every node-side operation is one command line handed to the `Executor`.

use crate::crd::RaidType;

/// Directories scanned for pool labels when the cache file is unusable
pub const IMPORT_SEARCH_DIR: &str = "/dev/disk/by-id";

const ZPOOL: &str = "zpool";
const ZFS: &str = "zfs";

fn push_group(cmd: &mut Vec<String>, raid: RaidType, devices: &[String]) {
    if let Some(keyword) = raid.vdev_keyword() {
        cmd.push(keyword.to_string());
    }
    cmd.extend(devices.iter().cloned());
}

/// `zpool create` with the first data raid group
pub fn create(
    pool: &str,
    cache_file: &str,
    compression: Option<&str>,
    raid: RaidType,
    devices: &[String],
) -> String {
    let mut cmd = vec![
        ZPOOL.to_string(),
        "create".into(),
        "-f".into(),
        "-o".into(),
        format!("cachefile={}", cache_file),
    ];
    if let Some(compression) = compression {
        cmd.push("-O".into());
        cmd.push(format!("compression={}", compression));
    }
    cmd.push(pool.to_string());
    push_group(&mut cmd, raid, devices);
    cmd.join(" ")
}

/// `zpool add` of one data or write-cache raid group
pub fn add(pool: &str, raid: RaidType, devices: &[String], write_cache: bool) -> String {
    let mut cmd = vec![ZPOOL.to_string(), "add".into(), "-f".into(), pool.to_string()];
    if write_cache {
        cmd.push("log".into());
    }
    push_group(&mut cmd, raid, devices);
    cmd.join(" ")
}

/// List pools that could be imported
pub fn list_importable() -> String {
    format!("{} import", ZPOOL)
}

fn import_names(name: &str, rename_to: Option<&str>) -> String {
    match rename_to {
        Some(new_name) if new_name != name => format!("{} {}", name, new_name),
        _ => name.to_string(),
    }
}

/// Import using the pool cache file
pub fn import_from_cache(cache_file: &str, name: &str, rename_to: Option<&str>) -> String {
    format!(
        "{} import -c {} -o cachefile={} {}",
        ZPOOL,
        cache_file,
        cache_file,
        import_names(name, rename_to)
    )
}

/// Import by scanning device directories for pool labels
pub fn import_from_scan(cache_file: &str, name: &str, rename_to: Option<&str>) -> String {
    format!(
        "{} import -d {} -o cachefile={} {}",
        ZPOOL,
        IMPORT_SEARCH_DIR,
        cache_file,
        import_names(name, rename_to)
    )
}

/// Cheap probe that succeeds only when the pool's root dataset exists
pub fn exists_probe(pool: &str) -> String {
    format!("{} get -H -o name name {}", ZFS, pool)
}

pub fn replace(pool: &str, old: &str, new: &str) -> String {
    format!("{} replace -f {} {} {}", ZPOOL, pool, old, new)
}

/// JSON dump of the pool's vdev tree and scan state
pub fn dump(pool: &str) -> String {
    format!("{} dump {}", ZPOOL, pool)
}

/// One tab-separated `health size alloc free` line in bytes
pub fn list_capacity(pool: &str) -> String {
    format!("{} list -Hp -o health,size,alloc,free {}", ZPOOL, pool)
}

pub fn get_dataset_property(pool: &str, property: &str) -> String {
    format!("{} get -Hp -o value {} {}", ZFS, property, pool)
}

pub fn set_dataset_property(pool: &str, property: &str, value: &str) -> String {
    format!("{} set {}={} {}", ZFS, property, value, pool)
}

pub fn get_pool_property(pool: &str, property: &str) -> String {
    format!("{} get -Hp -o value {} {}", ZPOOL, property, pool)
}

pub fn set_pool_property(pool: &str, property: &str, value: &str) -> String {
    format!("{} set {}={} {}", ZPOOL, property, value, pool)
}

pub fn destroy(pool: &str) -> String {
    format!("{} destroy -f {}", ZPOOL, pool)
}

pub fn labelclear(device: &str) -> String {
    format!("{} labelclear -f {}", ZPOOL, device)
}
