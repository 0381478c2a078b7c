//! Typed forge objects
//!
//! Thin serde-backed records for the subset of forge data the
//! coordinator reads and writes. Fields the kernel never looks at are
//! deliberately absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    /// Issue is open
    Open,
    /// Issue is closed
    Closed,
}

/// A forge issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Issue number within the repository
    pub number: u64,
    /// Issue title
    pub title: String,
    /// Issue body (markdown)
    #[serde(default)]
    pub body: String,
    /// Open or closed
    pub state: IssueState,
    /// Label names attached to the issue
    #[serde(default)]
    pub labels: Vec<String>,
    /// Browser URL
    pub html_url: String,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// A comment on an issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueComment {
    /// Comment id
    pub id: u64,
    /// Comment body (markdown)
    pub body: String,
    /// Author login
    pub author: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// A pull request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    /// Pull request number
    pub number: u64,
    /// Pull request title
    pub title: String,
    /// Whether the pull request has been merged
    pub merged: bool,
    /// Merge commit SHA, present once merged
    pub merge_commit_sha: Option<String>,
    /// Browser URL
    pub html_url: String,
}

/// Aggregate state over all checks and statuses for one commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    /// At least one check still running
    Pending,
    /// Every check succeeded
    Success,
    /// At least one check failed
    Failure,
}

/// Combined check/status aggregate for a commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitChecks {
    /// Commit SHA the checks ran against
    pub sha: String,
    /// Aggregate verdict
    pub state: CheckState,
    /// Total number of checks and statuses observed
    pub total: u32,
    /// Number of failing checks
    pub failing: u32,
}

/// Deployment record state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Record created, verdict pending
    Pending,
    /// Team validated clean
    Success,
    /// Validation found blocked tasks
    Failure,
    /// Validation itself failed
    Error,
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Success => "success",
            DeploymentState::Failure => "failure",
            DeploymentState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A deployment record used as a durable readiness marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Record id
    pub id: u64,
    /// Target environment, e.g. `wave-2-ready`
    pub environment: String,
    /// Human-readable description
    pub description: String,
    /// Current state
    pub state: DeploymentState,
    /// Structured payload `{team, wave, status, timestamp}`
    pub payload: serde_json::Value,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Check run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunStatus {
    /// Queued but not started
    Queued,
    /// Currently running
    InProgress,
    /// Finished; see conclusion
    Completed,
}

/// Check run conclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckConclusion {
    /// Check passed
    Success,
    /// Check failed
    Failure,
    /// Check finished without a verdict
    Neutral,
}

/// A check run attached to a commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    /// Check run id
    pub id: u64,
    /// Check run name, e.g. `Wave Gate: release-2`
    pub name: String,
    /// Head SHA the run is attached to
    pub head_sha: String,
    /// Run status
    pub status: CheckRunStatus,
    /// Conclusion, present once completed
    pub conclusion: Option<CheckConclusion>,
    /// Output title
    pub title: String,
    /// Output summary (markdown)
    pub summary: String,
}

/// A team member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    /// Forge login
    pub login: String,
}

/// A repository visible to a team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// Short name
    pub name: String,
    /// `owner/name` slug
    pub full_name: String,
}

/// Remaining API quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    /// Quota ceiling for the window
    pub limit: u32,
    /// Requests remaining in the window
    pub remaining: u32,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_state_display_matches_wire_format() {
        assert_eq!(DeploymentState::Pending.to_string(), "pending");
        assert_eq!(DeploymentState::Success.to_string(), "success");
        assert_eq!(DeploymentState::Failure.to_string(), "failure");
        assert_eq!(DeploymentState::Error.to_string(), "error");
    }

    #[test]
    fn issue_state_round_trips() {
        let json = serde_json::to_string(&IssueState::Closed).unwrap();
        assert_eq!(json, "\"closed\"");
        let back: IssueState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, IssueState::Closed);
    }
}
