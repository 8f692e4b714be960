//! Error types for rivven-changefeed
//!
//! Two layers: [`StoreError`] is what a document store reports for a single
//! request, [`ChangeFeedError`] is what the coordination engine acts on.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for the change feed engine
pub type Result<T> = std::result::Result<T, ChangeFeedError>;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Why the store reported a feed range as gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoneReason {
    /// The partition key range no longer exists (split or merge completed)
    PartitionKeyRangeGone,
    /// A split is in progress
    CompletingSplit,
    /// A partition migration is in progress
    CompletingPartitionMigration,
}

impl std::fmt::Display for GoneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GoneReason::PartitionKeyRangeGone => write!(f, "partition key range gone"),
            GoneReason::CompletingSplit => write!(f, "completing split"),
            GoneReason::CompletingPartitionMigration => write!(f, "completing partition migration"),
        }
    }
}

/// Errors reported by a lease or monitored container
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// An item with the same id already exists
    #[error("conflict: item '{0}' already exists")]
    Conflict(String),

    /// Item or partition does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Conditional write lost against a newer version
    #[error("precondition failed for '{0}'")]
    PreconditionFailed(String),

    /// Request rate too large
    #[error("request rate too large (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    /// The requested feed range no longer maps to a single partition
    #[error("feed range gone: {reason}")]
    Gone { reason: GoneReason },

    /// The page size cannot be served
    #[error("max item count {0} too large")]
    MaxItemCountTooLarge(u32),

    /// Store temporarily unavailable
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Anything else the store reports
    #[error("store error ({status}): {message}")]
    Other { status: u16, message: String },
}

impl StoreError {
    /// HTTP-style status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::Conflict(_) => 409,
            StoreError::NotFound(_) => 404,
            StoreError::PreconditionFailed(_) => 412,
            StoreError::Throttled { .. } => 429,
            StoreError::Gone { .. } => 410,
            StoreError::MaxItemCountTooLarge(_) => 400,
            StoreError::Unavailable(_) => 503,
            StoreError::Other { status, .. } => *status,
        }
    }
}

/// Errors raised by the change feed engine
#[derive(Debug, Error)]
pub enum ChangeFeedError {
    /// Ownership of a lease moved to another host, or the lease vanished
    #[error("lease '{lease_token}' lost (owner: {})", .owner.as_deref().unwrap_or("<none>"))]
    LeaseLost {
        lease_token: String,
        owner: Option<String>,
    },

    /// Conditional update lost against a concurrent writer
    #[error("lease '{lease_token}' changed concurrently")]
    LeaseConflict { lease_token: String },

    /// The partition behind a lease no longer exists
    #[error("partition for lease '{lease_token}' not found")]
    PartitionNotFound { lease_token: String },

    /// The feed range behind a lease was split or merged
    #[error("feed range for lease '{lease_token}' is gone")]
    PartitionSplit {
        lease_token: String,
        continuation: Option<String>,
    },

    /// Observer failed while processing or in open/close
    #[error("observer error: {0:#}")]
    Observer(anyhow::Error),

    /// Work was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Store failure that has no dedicated classification
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation not allowed in the current mode
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Unrecoverable failure
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ChangeFeedError {
    /// Create a lease-lost error
    pub fn lease_lost(lease_token: impl Into<String>, owner: Option<String>) -> Self {
        Self::LeaseLost {
            lease_token: lease_token.into(),
            owner,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create an invalid-operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Whether this error means the lease no longer belongs to this host
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }

    /// Whether the operation may succeed if retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LeaseConflict { .. } => true,
            Self::Store(e) => matches!(
                e,
                StoreError::Throttled { .. }
                    | StoreError::Unavailable(_)
                    | StoreError::PreconditionFailed(_)
            ),
            _ => false,
        }
    }

    /// Whether this error originated in the document store
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<serde_json::Error> for ChangeFeedError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
