//! Pool topology as reported by `zpool dump`
//!
//! The dump is a JSON document holding the vdev tree and the state of the
//! last scan (scrub or resilver).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Intermediate vdev created while a device is being swapped in
pub const VDEV_REPLACING: &str = "replacing";
/// Intermediate vdev created while a hot spare is in use
pub const VDEV_SPARE: &str = "spare";

/// Leaf states that make a device unusable
pub const UNUSABLE_STATES: [&str; 4] = ["UNAVAIL", "FAULTED", "REMOVED", "OFFLINE"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    #[serde(default)]
    pub state: String,
    pub vdev_tree: Vdev,
    #[serde(default)]
    pub scan_stats: Option<ScanStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vdev {
    #[serde(rename = "type")]
    pub vdev_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_log: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Vdev>,
}

/// State of the last scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    /// none, scrub or resilver
    pub function: String,
    /// none, scanning, finished or canceled
    pub state: String,
}

impl ScanStats {
    pub fn resilver_finished(&self) -> bool {
        self.function == "resilver" && self.state == "finished"
    }
}

impl Vdev {
    pub fn leaf(path: impl Into<String>) -> Self {
        Self {
            vdev_type: "disk".into(),
            path: Some(path.into()),
            state: Some("ONLINE".into()),
            is_log: false,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether this vdev is the given device
    ///
    /// Whole disks handed to the pool get a partition suffix on their path.
    pub fn is_device(&self, device: &str) -> bool {
        match self.path.as_deref() {
            Some(path) => path == device || path.strip_suffix("-part1") == Some(device),
            None => false,
        }
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Vdev>) {
        if self.is_leaf() {
            if self.path.is_some() {
                out.push(self);
            }
            return;
        }
        for child in &self.children {
            child.collect_leaves(out);
        }
    }

    fn locate<'a>(&'a self, parent: Option<&'a Vdev>, device: &str) -> Option<DeviceLocation<'a>> {
        if self.is_device(device) {
            return Some(DeviceLocation { vdev: self, parent });
        }
        self.children
            .iter()
            .find_map(|child| child.locate(Some(self), device))
    }
}

/// A vdev found in the tree together with its parent
#[derive(Debug, Clone, Copy)]
pub struct DeviceLocation<'a> {
    pub vdev: &'a Vdev,
    pub parent: Option<&'a Vdev>,
}

impl DeviceLocation<'_> {
    /// Whether the device sits under a replacing or spare vdev
    pub fn is_intermediate(&self) -> bool {
        self.parent
            .map(|p| p.vdev_type == VDEV_REPLACING || p.vdev_type == VDEV_SPARE)
            .unwrap_or(false)
    }
}

impl Topology {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Parse(format!("pool dump: {}", e)))
    }

    /// Every leaf device in the tree
    pub fn leaves(&self) -> Vec<&Vdev> {
        let mut out = Vec::new();
        self.vdev_tree.collect_leaves(&mut out);
        out
    }

    pub fn find(&self, device: &str) -> Option<DeviceLocation<'_>> {
        self.vdev_tree.locate(None, device)
    }

    /// Whether the device is already part of the pool
    pub fn contains(&self, device: &str) -> bool {
        self.find(device).is_some()
    }

    /// Whether any device of a raid group is already part of the pool
    pub fn contains_any(&self, devices: &[String]) -> bool {
        devices.iter().any(|d| self.contains(d))
    }

    /// A device has finished resilvering once it is a plain leaf (no longer
    /// under a replacing vdev) and the last scan was a finished resilver.
    pub fn is_resilver_complete(&self, device: &str) -> bool {
        let Some(location) = self.find(device) else {
            return false;
        };
        location.vdev.is_leaf()
            && !location.is_intermediate()
            && self
                .scan_stats
                .as_ref()
                .map(ScanStats::resilver_finished)
                .unwrap_or(false)
    }

    /// Leaf devices in a state that makes them unusable
    pub fn unavailable_devices(&self) -> Vec<String> {
        self.leaves()
            .into_iter()
            .filter(|v| {
                v.state
                    .as_deref()
                    .map(|s| UNUSABLE_STATES.contains(&s))
                    .unwrap_or(false)
            })
            .filter_map(|v| v.path.clone())
            .collect()
    }
}
