//! WaveOps coordination kernel
//!
//! Models multi-team delivery as a sequence of waves: barriers in
//! which every participating team must finish its tasks before the
//! next wave opens. The kernel provides:
//! - the task dependency graph with cycle detection and propagation
//! - per-task completion validation against the forge
//! - per-team readiness projected as deployment records
//! - the wave-gate barrier with race-safe, exactly-once announcements
//! - pinned-JSON persistence of wave state in the coordination issue
//! - a work-stealing rebalancer with dependency-aware transfer checks
//!
//! The forge itself is consumed through `waveops_forge::ForgeClient`;
//! live and in-memory implementations are interchangeable.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod deploy;
pub mod error;
pub mod gate;
pub mod graph;
pub mod pinned;
pub mod state;
pub mod stealing;
pub mod validator;

pub use clock::{Clock, MonotoneClock, SysClock};
pub use config::{CoordinatorConfig, PlanDocument, PlanTask, TaskRef, TeamPlan, WaveConfig};
pub use coordinator::{CommentNotifier, Coordinator, CycleOutcome, ForgeEvent};
pub use deploy::{DeploymentGate, TeamReadinessResult, WaveGateStatus};
pub use error::{DependencyViolation, WaveError, WaveResult, WorkStealingError};
pub use gate::{should_trigger, CheckConfig, WaveGate, WaveGateResult};
pub use graph::{DependencyGraph, DependencyNode, GraphAnalysis, Task, TaskState};
pub use state::{TeamState, TeamStatus, WaveState};
pub use stealing::{
    RebalanceSummary, SilentNotifier, StealingConfig, TeamCapacity, TeamUtilization,
    TransferCandidate, TransferNotifier, TransferRecord, WorkStealingEngine,
};
pub use validator::{TaskValidationResult, TaskValidator, ValidationFailure, ValidationSummary};
