//! Typed forge client for WaveOps
//!
//! This crate exposes the narrow set of forge operations the
//! coordination kernel consumes:
//! - Issue, pull-request, check, and deployment reads and writes
//! - Transparent pagination for list endpoints
//! - Read caching with bounded TTLs and LRU eviction
//! - Client-side rate limiting with pre-emptive backoff
//!
//! Implementations are swappable behind the [`ForgeClient`] trait: the
//! REST client talks to a live forge, the in-memory forge backs tests
//! and offline runs.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cache;
pub mod client;
pub mod error;
pub mod memory;
pub mod rest;
pub mod types;

pub use cache::{CacheStats, ForgeCache};
pub use client::{CheckRunRequest, ForgeClient};
pub use error::{ForgeError, ForgeResult};
pub use memory::InMemoryForge;
pub use rest::{RestForgeClient, RestForgeConfig};
pub use types::{
    CheckConclusion, CheckRun, CheckRunStatus, CheckState, CommitChecks, Deployment,
    DeploymentState, Issue, IssueComment, IssueState, PullRequest, RateLimit, Repository,
    TeamMember,
};
