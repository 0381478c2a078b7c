//! Forge client contract
//!
//! The coordination kernel consumes the forge exclusively through this
//! trait. Implementations must paginate transparently and classify
//! failures as [`ForgeError`] variants; callers never see raw HTTP.

use async_trait::async_trait;

use crate::error::ForgeResult;
use crate::types::{
    CheckConclusion, CheckRun, CheckRunStatus, CommitChecks, Deployment, DeploymentState, Issue,
    IssueComment, PullRequest, RateLimit, Repository, TeamMember,
};

/// Parameters for creating a check run
#[derive(Debug, Clone)]
pub struct CheckRunRequest {
    /// Check run name
    pub name: String,
    /// Head SHA (or the default branch head)
    pub head_sha: String,
    /// Run status
    pub status: CheckRunStatus,
    /// Conclusion, required when status is completed
    pub conclusion: Option<CheckConclusion>,
    /// Output title
    pub title: String,
    /// Output summary (markdown)
    pub summary: String,
}

/// Narrow, typed forge surface consumed by the coordinator
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Fetch a single issue
    async fn get_issue(&self, number: u64) -> ForgeResult<Issue>;

    /// Replace an issue body
    async fn update_issue(&self, number: u64, body: &str) -> ForgeResult<Issue>;

    /// List all comments on an issue
    async fn get_issue_comments(&self, number: u64) -> ForgeResult<Vec<IssueComment>>;

    /// Add a comment to an issue
    async fn add_issue_comment(&self, number: u64, body: &str) -> ForgeResult<IssueComment>;

    /// Search issues with a forge query string
    async fn search_issues(&self, query: &str) -> ForgeResult<Vec<Issue>>;

    /// Fetch a single pull request
    async fn get_pull_request(&self, number: u64) -> ForgeResult<PullRequest>;

    /// Resolve the pull request that closed an issue, if any
    async fn get_closing_pull_request(&self, issue: u64) -> ForgeResult<Option<PullRequest>>;

    /// Fetch the combined check/status aggregate for a commit
    async fn get_commit_checks(&self, sha: &str) -> ForgeResult<CommitChecks>;

    /// Create a deployment record in an environment
    async fn create_deployment(
        &self,
        environment: &str,
        description: &str,
        payload: serde_json::Value,
    ) -> ForgeResult<Deployment>;

    /// Move a deployment record to a new state
    async fn update_deployment_status(
        &self,
        deployment_id: u64,
        state: DeploymentState,
        description: &str,
    ) -> ForgeResult<()>;

    /// Create a check run
    async fn create_check_run(&self, request: CheckRunRequest) -> ForgeResult<CheckRun>;

    /// List members of a team
    async fn get_team_members(&self, team: &str) -> ForgeResult<Vec<TeamMember>>;

    /// List repository issues carrying all given labels
    async fn get_repository_issues(&self, labels: &[String]) -> ForgeResult<Vec<Issue>>;

    /// List repositories a team can see
    async fn get_team_repositories(&self, team: &str) -> ForgeResult<Vec<Repository>>;

    /// Assign a set of issues to a team
    ///
    /// Partial failure surfaces as [`crate::ForgeError::TeamAssignment`]
    /// after every issue has been attempted.
    async fn create_team_assignment(&self, team: &str, issues: &[u64]) -> ForgeResult<()>;

    /// Read the remaining API quota
    async fn get_rate_limit(&self) -> ForgeResult<RateLimit>;
}
