//! Error types for forge operations

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for forge operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Classified forge errors
///
/// Every failure a caller can act on gets its own variant; anything
/// else collapses into [`ForgeError::Other`] and aborts the current
/// coordination cycle.
#[derive(Error, Debug, Clone)]
pub enum ForgeError {
    /// Resource does not exist (or is invisible to the token)
    #[error("not found: {0}")]
    NotFound(String),

    /// Token lacks the required scope
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Primary rate limit exhausted; retry after `reset_at`
    #[error("rate limited, resets at {reset_at}")]
    RateLimited {
        /// When the quota window resets
        reset_at: DateTime<Utc>,
    },

    /// Team assignment partially applied
    #[error("team assignment for {team} partially failed: {assigned} assigned, {failed} failed")]
    TeamAssignment {
        /// Team the assignment targeted
        team: String,
        /// Issues successfully assigned
        assigned: usize,
        /// Issues that could not be assigned
        failed: usize,
    },

    /// Unexpected transport or protocol failure
    #[error("forge request failed: {0}")]
    Other(String),
}

impl ForgeError {
    /// Whether the caller should re-schedule the cycle instead of failing it
    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::RateLimited { .. })
    }
}
