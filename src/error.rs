//! Error types for the Storage Topology Operator
//!
//! Provides structured error types for the pool topology engine, the replica
//! placement engine, the object repositories and the controller runtime.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflict updating {kind}/{name}: object has been modified")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Block device {device} is already claimed by {owner}")]
    DeviceClaimedByOther { device: String, owner: String },

    // =========================================================================
    // Placement Errors
    // =========================================================================
    #[error("Not enough pools to provision volume {volume}: required {required}, usable {usable}")]
    InsufficientPools {
        volume: String,
        required: usize,
        usable: usize,
    },

    #[error("Disruption budget conflict: {0}")]
    BudgetConflict(String),

    #[error("Scale down of volume {volume} is still in progress")]
    ScaleDownInProgress { volume: String },

    // =========================================================================
    // Pool Errors
    // =========================================================================
    #[error("Command failed: {command} - {reason}")]
    Command { command: String, reason: String },

    #[error("Pool {pool}: {reason}")]
    Pool { pool: String, reason: String },

    #[error("Pool {pool} is importable from disk, refusing to create")]
    PoolImportable { pool: String },

    #[error("Failed to import pool {pool}: {reason}")]
    Import { pool: String, reason: String },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("{operation} failed: {}", join_errors(.errors))]
    Aggregate {
        operation: String,
        errors: Vec<Error>,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

/// Delay used for insufficient-resource errors; matches the default resync
pub const INSUFFICIENT_RESOURCES_REQUEUE: Duration = Duration::from_secs(60);

/// Delay used while a long running operation is observed to be in flight
pub const IN_PROGRESS_REQUEUE: Duration = Duration::from_secs(10);

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::Command { .. }
            | Error::Pool { .. }
            | Error::Import { .. }
            | Error::Aggregate { .. }
            | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // In-progress operations - wait
            Error::ScaleDownInProgress { .. } => ErrorAction::RequeueAfter(IN_PROGRESS_REQUEUE),

            // Resource issues - left for the operator, normal resync only
            Error::InsufficientPools { .. }
            | Error::BudgetConflict(_)
            | Error::PoolImportable { .. } => {
                ErrorAction::RequeueAfter(INSUFFICIENT_RESOURCES_REQUEUE)
            }

            // Configuration/validation errors - don't retry until the spec changes
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::DeviceClaimedByOther { .. }
            | Error::Parse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Errors that are reported on the object as a warning event
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::DeviceClaimedByOther { .. }
                | Error::InsufficientPools { .. }
                | Error::BudgetConflict(_)
                | Error::PoolImportable { .. }
        )
    }

    /// Short CamelCase reason used for events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::DeviceClaimedByOther { .. } => "ValidationFailed",
            Error::InsufficientPools { .. } => "NotEnoughPools",
            Error::BudgetConflict(_) => "DisruptionBudgetConflict",
            Error::PoolImportable { .. } => "PoolImportable",
            Error::Import { .. } => "ImportFailed",
            Error::Command { .. } | Error::Pool { .. } => "PoolCommandFailed",
            _ => "ReconcileFailed",
        }
    }

    /// Check if this error is a not-found error from the object store
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Build an aggregate error, or `Ok(())` when nothing failed
    pub fn aggregate(operation: impl Into<String>, errors: Vec<Error>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate {
                operation: operation.into(),
                errors,
            })
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
