//! Error types for the chunk replicator.
//!
//! This module provides a unified error type [`ReplicatorError`] along with a
//! convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Lookup**: unknown chunk, node, job or medium ids
//! - **Configuration**: invalid settings
//! - **Collaborators**: failures talking to the primary master or committing
//!   a properties update
//! - **Invariants**: logic defects detected at runtime (see [`invariant_violation`])
//!
//! Job creation and status computation never fail with an error; "cannot be
//! satisfied yet" is reported through plain `bool` returns instead.
//!
//! # Example
//!
//! ```rust
//! use chunk_replicator::error::{Result, ReplicatorError};
//!
//! fn fetch_enabled(reachable: bool) -> Result<bool> {
//!     if !reachable {
//!         return Err(ReplicatorError::Unavailable("primary master".into()));
//!     }
//!     Ok(true)
//! }
//!
//! let err = fetch_enabled(false).unwrap_err();
//! assert!(err.is_retryable());
//! ```

use std::io;
use thiserror::Error;
use tracing::error;

/// Main error type for replicator operations.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    // Lookup errors
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Chunk list not found: {0}")]
    ChunkListNotFound(u64),

    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Medium not found: {0}")]
    MediumNotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Collaborator errors
    #[error("Not the leader")]
    NotLeader,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

impl ReplicatorError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicatorError::NotLeader
                | ReplicatorError::Unavailable(_)
                | ReplicatorError::Timeout(_)
                | ReplicatorError::Network(_)
                | ReplicatorError::CommitFailed(_)
        )
    }

    /// Check if this error is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ReplicatorError::ChunkNotFound(_)
                | ReplicatorError::ChunkListNotFound(_)
                | ReplicatorError::NodeNotFound(_)
                | ReplicatorError::JobNotFound(_)
                | ReplicatorError::MediumNotFound(_)
        )
    }
}

impl From<serde_json::Error> for ReplicatorError {
    fn from(err: serde_json::Error) -> Self {
        ReplicatorError::Serialization(err.to_string())
    }
}

/// Report a broken internal invariant and abort the current operation.
///
/// Continuing with corrupted replication state is worse than crashing the
/// control loop, so this logs and panics.
#[track_caller]
pub fn invariant_violation(message: impl Into<String>) -> ! {
    let err = ReplicatorError::InvariantViolation(message.into());
    error!(error = %err, "Replicator invariant violated");
    panic!("{}", err);
}

/// Check an internal invariant, aborting through [`invariant_violation`] if it
/// does not hold.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::invariant_violation(format!($($arg)+));
        }
    };
}
