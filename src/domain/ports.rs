//! Domain Ports - Core trait definitions for the storage operator
//!
//! These traits define the boundaries between the reconciliation core and
//! external systems: the declarative object store, the node-local pool
//! command line, and the event sink. Adapters implement these traits; the
//! core receives them injected and never reaches for a global client.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Label Selection
// =============================================================================

/// Equality-based label selector; an empty selector matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(key.into(), value.into());
        Self(labels)
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Whether a label set satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as a `k=v,k2=v2` selector string
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_query())
    }
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Repository for one kind of object in the declarative store
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Get an object by name; `None` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// List objects matching the selector
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>>;

    /// Create an object; fails with `ResourceExists` on a name clash
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec; status is left untouched
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace status only
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Apply the two-way merge patch that turns `old` into `new`
    async fn patch(&self, old: &K, new: &K) -> Result<K>;

    /// Delete by name; objects with finalizers are only marked for deletion
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Shared handle to a repository
pub type ObjectStoreRef<K> = Arc<dyn ObjectStore<K>>;

// =============================================================================
// Command Executor Port
// =============================================================================

/// Runs one pool/volume management command line on the local node
///
/// Calls are synchronous: the caller blocks for the duration of the command.
pub trait Executor: Send + Sync {
    /// Execute a command line and return its standard output
    fn execute(&self, command: &str) -> Result<Vec<u8>>;
}

pub type ExecutorRef = Arc<dyn Executor>;

// =============================================================================
// Event Recorder Port
// =============================================================================

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Normal => write!(f, "Normal"),
            EventKind::Warning => write!(f, "Warning"),
        }
    }
}

/// Sink for user-visible events on objects
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Publish an event; failures are logged, never propagated
    async fn publish(
        &self,
        reference: ObjectReference,
        kind: EventKind,
        reason: &str,
        message: String,
    );
}

pub type EventRecorderRef = Arc<dyn EventRecorder>;
