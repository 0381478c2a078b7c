//! REST implementation of the forge client
//!
//! Talks to a GitHub-compatible REST API with:
//! - bearer-token auth and a pinned API version header
//! - transparent pagination on list endpoints
//! - client-side pacing via a direct rate limiter, plus pre-emptive
//!   delay when the server reports the quota near zero
//! - read-through caching for issues, team membership, and team
//!   repositories; writes invalidate the touched issue

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::ForgeCache;
use crate::client::{CheckRunRequest, ForgeClient};
use crate::error::{ForgeError, ForgeResult};
use crate::types::{
    CheckConclusion, CheckRun, CheckRunStatus, CheckState, CommitChecks, Deployment,
    DeploymentState, Issue, IssueComment, IssueState, PullRequest, RateLimit, Repository,
    TeamMember,
};

/// Page size for list endpoints
const PAGE_SIZE: usize = 100;
/// Hard cap on transparently fetched pages
const MAX_PAGES: usize = 20;

/// Configuration for the REST client
#[derive(Debug, Clone)]
pub struct RestForgeConfig {
    /// API token
    pub token: String,
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// API base URL
    pub api_base: String,
    /// Client-side request pacing, requests per second
    pub requests_per_second: u32,
    /// Remaining-quota floor below which calls wait for the reset
    pub low_quota_threshold: u32,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl RestForgeConfig {
    /// Config for `owner/repo` against the public API
    pub fn new(token: impl Into<String>, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
            api_base: "https://api.github.com".to_string(),
            requests_per_second: 8,
            low_quota_threshold: 4,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QuotaSnapshot {
    remaining: u32,
    reset_at: DateTime<Utc>,
}

/// Rate-limited, cached REST forge client
pub struct RestForgeClient {
    http: reqwest::Client,
    config: RestForgeConfig,
    cache: ForgeCache,
    limiter: Arc<DefaultDirectRateLimiter>,
    quota: Mutex<Option<QuotaSnapshot>>,
}

impl RestForgeClient {
    /// Build a client; fails if the HTTP stack cannot be constructed
    pub fn new(config: RestForgeConfig) -> ForgeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent("waveops-coordinator")
            .build()
            .map_err(|e| ForgeError::Other(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.requests_per_second.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            http,
            config,
            cache: ForgeCache::new(),
            limiter,
            quota: Mutex::new(None),
        })
    }

    /// Cache counters, for cycle summaries
    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.config.api_base, self.config.owner, self.config.repo, path
        )
    }

    fn org_url(&self, path: &str) -> String {
        format!("{}/orgs/{}/{}", self.config.api_base, self.config.owner, path)
    }

    /// Wait out client-side pacing and any server-reported quota squeeze
    async fn pace(&self) {
        self.limiter.until_ready().await;

        let squeeze = {
            let quota = self.quota.lock();
            match *quota {
                Some(q) if q.remaining <= self.config.low_quota_threshold => Some(q),
                _ => None,
            }
        };
        if let Some(q) = squeeze {
            let wait = (q.reset_at - Utc::now()).num_seconds();
            if wait > 0 {
                warn!(
                    remaining = q.remaining,
                    wait_secs = wait,
                    "forge quota near zero, delaying until reset"
                );
                tokio::time::sleep(Duration::from_secs(wait as u64)).await;
            }
        }
    }

    fn record_quota(&self, response: &reqwest::Response) {
        let remaining = header_u64(response, "x-ratelimit-remaining");
        let reset = header_u64(response, "x-ratelimit-reset");
        if let (Some(remaining), Some(reset)) = (remaining, reset) {
            if let Some(reset_at) = Utc.timestamp_opt(reset as i64, 0).single() {
                *self.quota.lock() = Some(QuotaSnapshot {
                    remaining: remaining as u32,
                    reset_at,
                });
            }
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ForgeResult<reqwest::Response> {
        self.pace().await;

        let response = request
            .bearer_auth(&self.config.token)
            .header("accept", "application/vnd.github+json")
            .header("x-github-api-version", "2022-11-28")
            .send()
            .await
            .map_err(|e| ForgeError::Other(format!("request failed: {}", e)))?;

        self.record_quota(&response);
        self.classify(response)
    }

    fn classify(&self, response: reqwest::Response) -> ForgeResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        match status {
            StatusCode::NOT_FOUND => Err(ForgeError::NotFound(url)),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                let exhausted = header_u64(&response, "x-ratelimit-remaining") == Some(0);
                if exhausted || status == StatusCode::TOO_MANY_REQUESTS {
                    let reset_at = header_u64(&response, "x-ratelimit-reset")
                        .and_then(|s| Utc.timestamp_opt(s as i64, 0).single())
                        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
                    Err(ForgeError::RateLimited { reset_at })
                } else {
                    Err(ForgeError::PermissionDenied(url))
                }
            }
            StatusCode::UNAUTHORIZED => Err(ForgeError::PermissionDenied(url)),
            _ => Err(ForgeError::Other(format!("{} returned {}", url, status))),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> ForgeResult<T> {
        let response = self.send(self.http.get(url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ForgeError::Other(format!("malformed response from {}: {}", url, e)))
    }

    /// Fetch every page of a list endpoint
    async fn get_paged<T: DeserializeOwned>(
        &self,
        url: &str,
        extra: &[(&str, String)],
    ) -> ForgeResult<Vec<T>> {
        let mut all = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut request = self
                .http
                .get(url)
                .query(&[("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())]);
            for (k, v) in extra {
                request = request.query(&[(*k, v.as_str())]);
            }
            let response = self.send(request).await?;
            let batch: Vec<T> = response
                .json()
                .await
                .map_err(|e| ForgeError::Other(format!("malformed page from {}: {}", url, e)))?;
            let last = batch.len() < PAGE_SIZE;
            all.extend(batch);
            if last {
                break;
            }
        }
        Ok(all)
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

// Wire representations. Only the fields the kernel consumes are mapped.

#[derive(Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    html_url: String,
    updated_at: DateTime<Utc>,
}

impl From<ApiIssue> for Issue {
    fn from(api: ApiIssue) -> Self {
        Issue {
            number: api.number,
            title: api.title,
            body: api.body.unwrap_or_default(),
            state: if api.state == "closed" {
                IssueState::Closed
            } else {
                IssueState::Open
            },
            labels: api.labels.into_iter().map(|l| l.name).collect(),
            html_url: api.html_url,
            updated_at: api.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Deserialize)]
struct ApiComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: ApiUser,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ApiPull {
    number: u64,
    title: String,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    merge_commit_sha: Option<String>,
    html_url: String,
}

impl From<ApiPull> for PullRequest {
    fn from(api: ApiPull) -> Self {
        PullRequest {
            number: api.number,
            title: api.title,
            merged: api.merged,
            merge_commit_sha: api.merge_commit_sha,
            html_url: api.html_url,
        }
    }
}

#[derive(Deserialize)]
struct ApiTimelineEvent {
    event: String,
    #[serde(default)]
    commit_id: Option<String>,
}

#[derive(Deserialize)]
struct ApiCombinedStatus {
    state: String,
    total_count: u32,
    #[serde(default)]
    statuses: Vec<ApiStatus>,
}

#[derive(Deserialize)]
struct ApiStatus {
    state: String,
}

#[derive(Deserialize)]
struct ApiCheckRunList {
    #[serde(default)]
    check_runs: Vec<ApiCheckRun>,
}

#[derive(Deserialize)]
struct ApiCheckRun {
    id: u64,
    name: String,
    head_sha: String,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
}

#[derive(Deserialize)]
struct ApiDeployment {
    id: u64,
    environment: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ApiSearchResult {
    items: Vec<ApiIssue>,
}

#[derive(Deserialize)]
struct ApiRepository {
    name: String,
    full_name: String,
}

#[derive(Deserialize)]
struct ApiRateLimitEnvelope {
    resources: ApiRateLimitResources,
}

#[derive(Deserialize)]
struct ApiRateLimitResources {
    core: ApiRateLimitCore,
}

#[derive(Deserialize)]
struct ApiRateLimitCore {
    limit: u32,
    remaining: u32,
    reset: i64,
}

#[async_trait]
impl ForgeClient for RestForgeClient {
    async fn get_issue(&self, number: u64) -> ForgeResult<Issue> {
        if let Some(issue) = self.cache.get_issue(number) {
            return Ok(issue);
        }
        let api: ApiIssue = self.get_json(&self.repo_url(&format!("issues/{}", number))).await?;
        let issue: Issue = api.into();
        self.cache.put_issue(issue.clone());
        Ok(issue)
    }

    async fn update_issue(&self, number: u64, body: &str) -> ForgeResult<Issue> {
        let url = self.repo_url(&format!("issues/{}", number));
        let response = self
            .send(self.http.patch(&url).json(&serde_json::json!({ "body": body })))
            .await?;
        let api: ApiIssue = response
            .json()
            .await
            .map_err(|e| ForgeError::Other(format!("malformed response from {}: {}", url, e)))?;
        self.cache.invalidate_issue(number);
        Ok(api.into())
    }

    async fn get_issue_comments(&self, number: u64) -> ForgeResult<Vec<IssueComment>> {
        let url = self.repo_url(&format!("issues/{}/comments", number));
        let comments: Vec<ApiComment> = self.get_paged(&url, &[]).await?;
        Ok(comments
            .into_iter()
            .map(|c| IssueComment {
                id: c.id,
                body: c.body.unwrap_or_default(),
                author: c.user.login,
                created_at: c.created_at,
            })
            .collect())
    }

    async fn add_issue_comment(&self, number: u64, body: &str) -> ForgeResult<IssueComment> {
        let url = self.repo_url(&format!("issues/{}/comments", number));
        let response = self
            .send(self.http.post(&url).json(&serde_json::json!({ "body": body })))
            .await?;
        let api: ApiComment = response
            .json()
            .await
            .map_err(|e| ForgeError::Other(format!("malformed response from {}: {}", url, e)))?;
        self.cache.invalidate_issue(number);
        Ok(IssueComment {
            id: api.id,
            body: api.body.unwrap_or_default(),
            author: api.user.login,
            created_at: api.created_at,
        })
    }

    async fn search_issues(&self, query: &str) -> ForgeResult<Vec<Issue>> {
        let url = format!("{}/search/issues", self.config.api_base);
        let scoped = format!("repo:{}/{} {}", self.config.owner, self.config.repo, query);
        let response = self
            .send(self.http.get(&url).query(&[("q", scoped.as_str())]))
            .await?;
        let result: ApiSearchResult = response
            .json()
            .await
            .map_err(|e| ForgeError::Other(format!("malformed search response: {}", e)))?;
        Ok(result.items.into_iter().map(Into::into).collect())
    }

    async fn get_pull_request(&self, number: u64) -> ForgeResult<PullRequest> {
        let api: ApiPull = self.get_json(&self.repo_url(&format!("pulls/{}", number))).await?;
        Ok(api.into())
    }

    async fn get_closing_pull_request(&self, issue: u64) -> ForgeResult<Option<PullRequest>> {
        // The timeline records the closing commit; the commit maps back
        // to the pull request that introduced it.
        let url = self.repo_url(&format!("issues/{}/timeline", issue));
        let events: Vec<ApiTimelineEvent> = self.get_paged(&url, &[]).await?;
        let commit_id = events
            .into_iter()
            .rev()
            .find(|e| e.event == "closed" && e.commit_id.is_some())
            .and_then(|e| e.commit_id);

        let Some(sha) = commit_id else {
            return Ok(None);
        };

        let url = self.repo_url(&format!("commits/{}/pulls", sha));
        let pulls: Vec<ApiPull> = self.get_paged(&url, &[]).await?;
        debug!(issue, sha = %sha, candidates = pulls.len(), "resolved closing commit");
        Ok(pulls.into_iter().next().map(Into::into))
    }

    async fn get_commit_checks(&self, sha: &str) -> ForgeResult<CommitChecks> {
        let combined: ApiCombinedStatus = self
            .get_json(&self.repo_url(&format!("commits/{}/status", sha)))
            .await?;
        let runs: ApiCheckRunList = self
            .get_json(&self.repo_url(&format!("commits/{}/check-runs", sha)))
            .await?;

        let mut total = combined.total_count;
        let mut failing = combined
            .statuses
            .iter()
            .filter(|s| s.state == "failure" || s.state == "error")
            .count() as u32;
        let mut pending = combined.state == "pending" && combined.total_count > 0;

        for run in &runs.check_runs {
            total += 1;
            match (run.status.as_str(), run.conclusion.as_deref()) {
                ("completed", Some("success")) | ("completed", Some("neutral"))
                | ("completed", Some("skipped")) => {}
                ("completed", _) => failing += 1,
                _ => pending = true,
            }
        }

        let state = if failing > 0 {
            CheckState::Failure
        } else if pending {
            CheckState::Pending
        } else {
            CheckState::Success
        };

        Ok(CommitChecks {
            sha: sha.to_string(),
            state,
            total,
            failing,
        })
    }

    async fn create_deployment(
        &self,
        environment: &str,
        description: &str,
        payload: serde_json::Value,
    ) -> ForgeResult<Deployment> {
        let url = self.repo_url("deployments");
        let body = serde_json::json!({
            "ref": "main",
            "environment": environment,
            "description": description,
            "payload": payload,
            "auto_merge": false,
            "required_contexts": [],
        });
        let response = self.send(self.http.post(&url).json(&body)).await?;
        let api: ApiDeployment = response
            .json()
            .await
            .map_err(|e| ForgeError::Other(format!("malformed deployment response: {}", e)))?;
        Ok(Deployment {
            id: api.id,
            environment: api.environment,
            description: api.description.unwrap_or_default(),
            state: DeploymentState::Pending,
            payload: api.payload,
            created_at: api.created_at,
        })
    }

    async fn update_deployment_status(
        &self,
        deployment_id: u64,
        state: DeploymentState,
        description: &str,
    ) -> ForgeResult<()> {
        let url = self.repo_url(&format!("deployments/{}/statuses", deployment_id));
        let body = serde_json::json!({
            "state": state.to_string(),
            "description": description,
        });
        self.send(self.http.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn create_check_run(&self, request: CheckRunRequest) -> ForgeResult<CheckRun> {
        let url = self.repo_url("check-runs");
        let status = match request.status {
            CheckRunStatus::Queued => "queued",
            CheckRunStatus::InProgress => "in_progress",
            CheckRunStatus::Completed => "completed",
        };
        let mut body = serde_json::json!({
            "name": request.name,
            "head_sha": request.head_sha,
            "status": status,
            "output": { "title": request.title, "summary": request.summary },
        });
        if let Some(conclusion) = request.conclusion {
            let conclusion = match conclusion {
                CheckConclusion::Success => "success",
                CheckConclusion::Failure => "failure",
                CheckConclusion::Neutral => "neutral",
            };
            body["conclusion"] = serde_json::Value::String(conclusion.to_string());
        }
        let response = self.send(self.http.post(&url).json(&body)).await?;
        let api: ApiCheckRun = response
            .json()
            .await
            .map_err(|e| ForgeError::Other(format!("malformed check-run response: {}", e)))?;
        Ok(CheckRun {
            id: api.id,
            name: api.name,
            head_sha: api.head_sha,
            status: request.status,
            conclusion: request.conclusion,
            title: request.title,
            summary: request.summary,
        })
    }

    async fn get_team_members(&self, team: &str) -> ForgeResult<Vec<TeamMember>> {
        if let Some(members) = self.cache.get_team_members(team) {
            return Ok(members);
        }
        let url = self.org_url(&format!("teams/{}/members", team));
        let users: Vec<ApiUser> = self.get_paged(&url, &[]).await?;
        let members: Vec<TeamMember> = users
            .into_iter()
            .map(|u| TeamMember { login: u.login })
            .collect();
        self.cache.put_team_members(team, members.clone());
        Ok(members)
    }

    async fn get_repository_issues(&self, labels: &[String]) -> ForgeResult<Vec<Issue>> {
        let url = self.repo_url("issues");
        let extra = [
            ("labels", labels.join(",")),
            ("state", "all".to_string()),
        ];
        let issues: Vec<ApiIssue> = self.get_paged(&url, &extra).await?;
        Ok(issues.into_iter().map(Into::into).collect())
    }

    async fn get_team_repositories(&self, team: &str) -> ForgeResult<Vec<Repository>> {
        if let Some(repos) = self.cache.get_team_repositories(team) {
            return Ok(repos);
        }
        let url = self.org_url(&format!("teams/{}/repos", team));
        let api: Vec<ApiRepository> = self.get_paged(&url, &[]).await?;
        let repos: Vec<Repository> = api
            .into_iter()
            .map(|r| Repository {
                name: r.name,
                full_name: r.full_name,
            })
            .collect();
        self.cache.put_team_repositories(team, repos.clone());
        Ok(repos)
    }

    async fn create_team_assignment(&self, team: &str, issues: &[u64]) -> ForgeResult<()> {
        let label = format!("team:{}", team);
        let mut assigned = 0usize;
        let mut failed = 0usize;

        for &number in issues {
            let url = self.repo_url(&format!("issues/{}/labels", number));
            let body = serde_json::json!({ "labels": [label.as_str()] });
            match self.send(self.http.post(&url).json(&body)).await {
                Ok(_) => {
                    self.cache.invalidate_issue(number);
                    assigned += 1;
                }
                Err(ForgeError::RateLimited { reset_at }) => {
                    return Err(ForgeError::RateLimited { reset_at });
                }
                Err(e) => {
                    warn!(issue = number, error = %e, "team assignment failed for issue");
                    failed += 1;
                }
            }
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
        let url = format!("{}/rate_limit", self.config.api_base);
        let envelope: ApiRateLimitEnvelope = self.get_json(&url).await?;
        let core = envelope.resources.core;
        let reset_at = Utc
            .timestamp_opt(core.reset, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(RateLimit {
            limit: core.limit,
            remaining: core.remaining,
            reset_at,
        })
    }
}
