//! Error types for the mirroring coordinator.

use crate::types::PoolId;
use thiserror::Error;

/// Errors surfaced by the coordinator and its subsystems.
///
/// Caller contract violations (lifecycle re-entry, topology updates while not
/// leader, empty mirror uuid on a removal) are panics, not variants here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    /// The remote peer has no mirroring configured for this namespace.
    ///
    /// Benign during leadership acquisition: the remote pool watcher stays
    /// registered and discovers images once the remote side enables
    /// mirroring.
    #[error("remote peer does not have mirroring configured")]
    NotConfigured,

    /// This process has been fenced from the given pool's cluster.
    #[error("fenced from pool {pool_id}")]
    Fenced {
        /// Pool the fencing was observed on.
        pool_id: PoolId,
    },

    /// Mirror status watcher failure.
    #[error("status watcher error: {msg}")]
    Status {
        /// Error message describing the issue.
        msg: String,
    },

    /// Instance replayer failure.
    #[error("instance replayer error: {msg}")]
    Replay {
        /// Error message describing the issue.
        msg: String,
    },

    /// Pool or instance watcher failure.
    #[error("watcher error: {msg}")]
    Watch {
        /// Error message describing the issue.
        msg: String,
    },

    /// Image map (assignment layer) failure.
    #[error("image map error: {msg}")]
    Assign {
        /// Error message describing the issue.
        msg: String,
    },

    /// Image deleter failure.
    #[error("image deleter error: {msg}")]
    Delete {
        /// Error message describing the issue.
        msg: String,
    },

    /// Cross-instance notification failure.
    #[error("notify error: {msg}")]
    Notify {
        /// Error message describing the issue.
        msg: String,
    },

    /// The coordinator was dropped before the callback arrived.
    #[error("namespace replayer shutting down")]
    ShuttingDown,
}

impl MirrorError {
    /// True for the benign "remote not configured" condition.
    pub fn is_not_configured(&self) -> bool {
        matches!(self, MirrorError::NotConfigured)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MirrorError>;
