//! In-memory forge
//!
//! A complete in-process implementation of [`ForgeClient`] backed by
//! plain maps. Tests seed it with issues, pull requests, and check
//! results, then assert on the deployments, check runs, and comments
//! the kernel wrote. Also serves as the offline mode for dry runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::client::{CheckRunRequest, ForgeClient};
use crate::error::{ForgeError, ForgeResult};
use crate::types::{
    CheckRun, CheckState, CommitChecks, Deployment, DeploymentState, Issue, IssueComment,
    IssueState, PullRequest, RateLimit, Repository, TeamMember,
};

#[derive(Default)]
struct Inner {
    issues: HashMap<u64, Issue>,
    comments: HashMap<u64, Vec<IssueComment>>,
    pulls: HashMap<u64, PullRequest>,
    closing: HashMap<u64, u64>,
    checks: HashMap<String, CommitChecks>,
    deployments: Vec<Deployment>,
    check_runs: Vec<CheckRun>,
    team_members: HashMap<String, Vec<TeamMember>>,
    team_repos: HashMap<String, Vec<Repository>>,
    assignments: HashMap<String, Vec<u64>>,
    failing_assignments: Vec<u64>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process forge fake
#[derive(Clone, Default)]
pub struct InMemoryForge {
    inner: Arc<Mutex<Inner>>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryForge {
    /// Empty forge
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate network latency on every operation
    ///
    /// Gives concurrency tests a real suspension point.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    async fn pause(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Seed an issue
    pub fn add_issue(&self, number: u64, title: &str, body: &str, closed: bool) {
        let issue = Issue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            state: if closed {
                IssueState::Closed
            } else {
                IssueState::Open
            },
            labels: Vec::new(),
            html_url: format!("https://forge.test/issues/{}", number),
            updated_at: Utc::now(),
        };
        self.inner.lock().issues.insert(number, issue);
    }

    /// Mark a seeded issue closed
    pub fn close_issue(&self, number: u64) {
        if let Some(issue) = self.inner.lock().issues.get_mut(&number) {
            issue.state = IssueState::Closed;
        }
    }

    /// Seed a pull request
    pub fn add_pull(&self, number: u64, merged: bool, merge_commit_sha: Option<&str>) {
        let pull = PullRequest {
            number,
            title: format!("pr {}", number),
            merged,
            merge_commit_sha: merge_commit_sha.map(|s| s.to_string()),
            html_url: format!("https://forge.test/pulls/{}", number),
        };
        self.inner.lock().pulls.insert(number, pull);
    }

    /// Record that a pull request closed an issue
    pub fn link_closing_pull(&self, issue: u64, pull: u64) {
        self.inner.lock().closing.insert(issue, pull);
    }

    /// Seed the check aggregate for a commit
    pub fn set_commit_checks(&self, sha: &str, state: CheckState, total: u32, failing: u32) {
        self.inner.lock().checks.insert(
            sha.to_string(),
            CommitChecks {
                sha: sha.to_string(),
                state,
                total,
                failing,
            },
        );
    }

    /// Seed team membership
    pub fn set_team_members(&self, team: &str, logins: &[&str]) {
        let members = logins
            .iter()
            .map(|l| TeamMember {
                login: l.to_string(),
            })
            .collect();
        self.inner.lock().team_members.insert(team.to_string(), members);
    }

    /// Seed team repositories
    pub fn set_team_repositories(&self, team: &str, names: &[&str]) {
        let repos = names
            .iter()
            .map(|n| Repository {
                name: n.to_string(),
                full_name: format!("acme/{}", n),
            })
            .collect();
        self.inner.lock().team_repos.insert(team.to_string(), repos);
    }

    /// Make future assignment attempts fail for an issue
    pub fn fail_assignment_for(&self, issue: u64) {
        self.inner.lock().failing_assignments.push(issue);
    }

    /// Deployments recorded so far
    pub fn deployments(&self) -> Vec<Deployment> {
        self.inner.lock().deployments.clone()
    }

    /// Check runs recorded so far
    pub fn check_runs(&self) -> Vec<CheckRun> {
        self.inner.lock().check_runs.clone()
    }

    /// Comments recorded on an issue
    pub fn comments(&self, issue: u64) -> Vec<IssueComment> {
        self.inner
            .lock()
            .comments
            .get(&issue)
            .cloned()
            .unwrap_or_default()
    }

    /// Issues assigned to a team so far
    pub fn assignments(&self, team: &str) -> Vec<u64> {
        self.inner
            .lock()
            .assignments
            .get(team)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ForgeClient for InMemoryForge {
    async fn get_issue(&self, number: u64) -> ForgeResult<Issue> {
        self.pause().await;
        self.inner
            .lock()
            .issues
            .get(&number)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("issue {}", number)))
    }

    async fn update_issue(&self, number: u64, body: &str) -> ForgeResult<Issue> {
        self.pause().await;
        let mut inner = self.inner.lock();
        let issue = inner
            .issues
            .get_mut(&number)
            .ok_or_else(|| ForgeError::NotFound(format!("issue {}", number)))?;
        issue.body = body.to_string();
        issue.updated_at = Utc::now();
        Ok(issue.clone())
    }

    async fn get_issue_comments(&self, number: u64) -> ForgeResult<Vec<IssueComment>> {
        self.pause().await;
        Ok(self
            .inner
            .lock()
            .comments
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_issue_comment(&self, number: u64, body: &str) -> ForgeResult<IssueComment> {
        self.pause().await;
        let mut inner = self.inner.lock();
        if !inner.issues.contains_key(&number) {
            return Err(ForgeError::NotFound(format!("issue {}", number)));
        }
        let id = inner.next_id();
        let comment = IssueComment {
            id,
            body: body.to_string(),
            author: "waveops".to_string(),
            created_at: Utc::now(),
        };
        inner.comments.entry(number).or_default().push(comment.clone());
        Ok(comment)
    }

    async fn search_issues(&self, query: &str) -> ForgeResult<Vec<Issue>> {
        self.pause().await;
        let needle = query.to_lowercase();
        Ok(self
            .inner
            .lock()
            .issues
            .values()
            .filter(|i| {
                i.title.to_lowercase().contains(&needle) || i.body.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect())
    }

    async fn get_pull_request(&self, number: u64) -> ForgeResult<PullRequest> {
        self.pause().await;
        self.inner
            .lock()
            .pulls
            .get(&number)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("pull {}", number)))
    }

    async fn get_closing_pull_request(&self, issue: u64) -> ForgeResult<Option<PullRequest>> {
        self.pause().await;
        let inner = self.inner.lock();
        Ok(inner
            .closing
            .get(&issue)
            .and_then(|pr| inner.pulls.get(pr))
            .cloned())
    }

    async fn get_commit_checks(&self, sha: &str) -> ForgeResult<CommitChecks> {
        self.pause().await;
        self.inner
            .lock()
            .checks
            .get(sha)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("checks for {}", sha)))
    }

    async fn create_deployment(
        &self,
        environment: &str,
        description: &str,
        payload: serde_json::Value,
    ) -> ForgeResult<Deployment> {
        self.pause().await;
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        let deployment = Deployment {
            id,
            environment: environment.to_string(),
            description: description.to_string(),
            state: DeploymentState::Pending,
            payload,
            created_at: Utc::now(),
        };
        inner.deployments.push(deployment.clone());
        Ok(deployment)
    }

    async fn update_deployment_status(
        &self,
        deployment_id: u64,
        state: DeploymentState,
        description: &str,
    ) -> ForgeResult<()> {
        self.pause().await;
        let mut inner = self.inner.lock();
        let deployment = inner
            .deployments
            .iter_mut()
            .find(|d| d.id == deployment_id)
            .ok_or_else(|| ForgeError::NotFound(format!("deployment {}", deployment_id)))?;
        deployment.state = state;
        deployment.description = description.to_string();
        Ok(())
    }

    async fn create_check_run(&self, request: CheckRunRequest) -> ForgeResult<CheckRun> {
        self.pause().await;
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        let run = CheckRun {
            id,
            name: request.name,
            head_sha: request.head_sha,
            status: request.status,
            conclusion: request.conclusion,
            title: request.title,
            summary: request.summary,
        };
        inner.check_runs.push(run.clone());
        Ok(run)
    }

    async fn get_team_members(&self, team: &str) -> ForgeResult<Vec<TeamMember>> {
        self.pause().await;
        Ok(self
            .inner
            .lock()
            .team_members
            .get(team)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_repository_issues(&self, labels: &[String]) -> ForgeResult<Vec<Issue>> {
        self.pause().await;
        Ok(self
            .inner
            .lock()
            .issues
            .values()
            .filter(|i| labels.iter().all(|l| i.labels.contains(l)))
            .cloned()
            .collect())
    }

    async fn get_team_repositories(&self, team: &str) -> ForgeResult<Vec<Repository>> {
        self.pause().await;
        Ok(self
            .inner
            .lock()
            .team_repos
            .get(team)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_team_assignment(&self, team: &str, issues: &[u64]) -> ForgeResult<()> {
        self.pause().await;
        let mut inner = self.inner.lock();
        let mut assigned = 0usize;
        let mut failed = 0usize;
        for &issue in issues {
            if inner.failing_assignments.contains(&issue) || !inner.issues.contains_key(&issue) {
                failed += 1;
                continue;
            }
            inner.assignments.entry(team.to_string()).or_default().push(issue);
            assigned += 1;
        }
        if failed > 0 {
            return Err(ForgeError::TeamAssignment {
                team: team.to_string(),
                assigned,
                failed,
            });
        }
        Ok(())
    }

    async fn get_rate_limit(&self) -> ForgeResult<RateLimit> {
        self.pause().await;
        Ok(RateLimit {
            limit: 5000,
            remaining: 5000,
            reset_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_lifecycle() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "task A", "", false);

        let issue = forge.get_issue(1).await.unwrap();
        assert_eq!(issue.state, IssueState::Open);

        forge.close_issue(1);
        let issue = forge.get_issue(1).await.unwrap();
        assert_eq!(issue.state, IssueState::Closed);

        assert!(matches!(
            forge.get_issue(99).await,
            Err(ForgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn closing_pull_resolution() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "task A", "", true);
        forge.add_pull(10, true, Some("abc123"));
        forge.link_closing_pull(1, 10);

        let pr = forge.get_closing_pull_request(1).await.unwrap();
        assert_eq!(pr.map(|p| p.number), Some(10));
        assert!(forge.get_closing_pull_request(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deployment_status_progression() {
        let forge = InMemoryForge::new();
        let d = forge
            .create_deployment("wave-1-ready", "alpha team readiness for Wave 1:", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(d.state, DeploymentState::Pending);

        forge
            .update_deployment_status(d.id, DeploymentState::Success, "ready")
            .await
            .unwrap();
        assert_eq!(forge.deployments()[0].state, DeploymentState::Success);
    }

    #[tokio::test]
    async fn partial_assignment_is_reported() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "a", "", false);
        forge.add_issue(2, "b", "", false);
        forge.fail_assignment_for(2);

        let err = forge
            .create_team_assignment("alpha", &[1, 2])
            .await
            .unwrap_err();
        match err {
            ForgeError::TeamAssignment {
                assigned, failed, ..
            } => {
                assert_eq!(assigned, 1);
                assert_eq!(failed, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(forge.assignments("alpha"), vec![1]);
    }
}
