//! Error types for the coordination kernel

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::graph::TaskState;

/// Result type for coordination operations
pub type WaveResult<T> = Result<T, WaveError>;

/// Errors raised by the coordination kernel
///
/// Per-task and per-team failures are collected into results, not
/// raised; these variants cover the cycle-level faults. Everything is
/// `Clone` so gate results can be shared across concurrent callers.
#[derive(Error, Debug, Clone)]
pub enum WaveError {
    /// Persistence layout broken: sentinel missing or duplicated
    #[error("wave-state guards missing: {0}")]
    GuardsMissing(String),

    /// Caller referenced a team the wave does not contain
    #[error("team {0} not found in wave state")]
    TeamNotFound(String),

    /// Plan-load or state-machine fault in the dependency graph
    #[error(transparent)]
    Dependency(#[from] DependencyViolation),

    /// Attempted transfer rejected
    #[error(transparent)]
    WorkStealing(#[from] WorkStealingError),

    /// Forge quota exhausted; the cycle should be re-scheduled
    #[error("rate limited, resets at {reset_at}")]
    RateLimited {
        /// When the quota window resets
        reset_at: DateTime<Utc>,
    },

    /// Coordination cycle exceeded its deadline
    #[error("coordination cycle timed out after {seconds}s")]
    Timeout {
        /// Configured deadline that was exceeded
        seconds: u64,
    },

    /// Unexpected forge failure; the cycle is abandoned without writes
    #[error("forge error: {0}")]
    Forge(String),

    /// Wave state could not be serialised or deserialised
    #[error("state persistence error: {0}")]
    StatePersistence(String),

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal invariant broken
    #[error("internal error: {0}")]
    Internal(String),
}

impl WaveError {
    /// Whether the coordinator should re-schedule instead of failing
    pub fn is_transient(&self) -> bool {
        matches!(self, WaveError::RateLimited { .. } | WaveError::Timeout { .. })
    }
}

impl From<waveops_forge::ForgeError> for WaveError {
    fn from(err: waveops_forge::ForgeError) -> Self {
        match err {
            waveops_forge::ForgeError::RateLimited { reset_at } => {
                WaveError::RateLimited { reset_at }
            }
            other => WaveError::Forge(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for WaveError {
    fn from(err: serde_json::Error) -> Self {
        WaveError::StatePersistence(err.to_string())
    }
}

/// Dependency-graph faults
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DependencyViolation {
    /// A task depends on an id the plan does not contain
    #[error("task {task} depends on unknown task {dependency}")]
    Missing {
        /// Dependent task
        task: String,
        /// Unresolved dependency id
        dependency: String,
    },

    /// The declared dependencies contain a cycle
    #[error("dependency cycle: {}", chain.join(" -> "))]
    Cycle {
        /// The offending chain, first id repeated at the end
        chain: Vec<String>,
    },

    /// A node was asked to make a transition the state machine forbids
    #[error("illegal transition for task {task}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Task the transition targeted
        task: String,
        /// State the node was in
        from: TaskState,
        /// State the caller requested
        to: TaskState,
    },
}

/// Work-stealing rejection codes
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkStealingError {
    /// Receiver has no free slot
    #[error("insufficient capacity on team {team}: {active} of {capacity} slots in use")]
    InsufficientCapacity {
        /// Receiving team
        team: String,
        /// Tasks currently active
        active: u32,
        /// Maximum concurrent tasks
        capacity: u32,
    },

    /// Receiver proficiency below the configured threshold
    #[error("skill mismatch for task {task} on team {team}: {score:.2} < {threshold:.2}")]
    SkillMismatch {
        /// Task that would move
        task: String,
        /// Receiving team
        team: String,
        /// Best matching proficiency
        score: f64,
        /// Configured floor
        threshold: f64,
    },

    /// Transfer would violate dependency constraints
    #[error("dependency violation moving task {task}: {reason}")]
    DependencyViolation {
        /// Task that would move
        task: String,
        /// Constraint that failed
        reason: String,
    },

    /// Transfer rejected by policy
    #[error("transfer of task {task} rejected: {reason}")]
    TransferRejected {
        /// Task that would move
        task: String,
        /// Policy that rejected it
        reason: String,
    },

    /// The transfer itself failed mid-flight
    #[error("coordination failure: {0}")]
    CoordinationFailure(String),

    /// Thresholds or limits are not usable
    #[error("invalid work-stealing configuration: {0}")]
    InvalidConfiguration(String),
}

impl WorkStealingError {
    /// Stable machine-readable code for cycle summaries
    pub fn code(&self) -> &'static str {
        match self {
            WorkStealingError::InsufficientCapacity { .. } => "insufficient-capacity",
            WorkStealingError::SkillMismatch { .. } => "skill-mismatch",
            WorkStealingError::DependencyViolation { .. } => "dependency-violation",
            WorkStealingError::TransferRejected { .. } => "transfer-rejected",
            WorkStealingError::CoordinationFailure(_) => "coordination-failure",
            WorkStealingError::InvalidConfiguration(_) => "invalid-configuration",
        }
    }
}
