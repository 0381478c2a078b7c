//! Per-task completion validation
//!
//! A task counts as done when its issue is closed by a merged pull
//! request whose merge commit has green checks. Each step keeps its
//! evidence so downstream summaries can point users at the exact
//! failing object without consulting logs.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::debug;

use waveops_forge::{CheckState, CommitChecks, ForgeClient, IssueState, PullRequest};

use crate::error::{WaveError, WaveResult};

/// Why a task failed validation
///
/// Every message carries the task id, a forge URL, and the triggering
/// condition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationFailure {
    /// The tracking issue is still open
    #[error("task {task}: issue not closed ({url})")]
    IssueNotClosed {
        /// Task id
        task: String,
        /// Issue URL
        url: String,
    },

    /// The issue closed without a linked pull request
    #[error("task {task}: no closing pull request found ({url})")]
    NoClosingPr {
        /// Task id
        task: String,
        /// Issue URL
        url: String,
    },

    /// The closing pull request was never merged
    #[error("task {task}: closing pull request not merged ({url})")]
    PrNotMerged {
        /// Task id
        task: String,
        /// Pull request URL
        url: String,
    },

    /// The merge commit has red checks
    #[error("task {task}: {failing} CI check(s) failing ({url})")]
    CiChecksFailed {
        /// Task id
        task: String,
        /// Pull request URL
        url: String,
        /// Number of failing checks
        failing: u32,
    },

    /// The forge could not answer for this task
    #[error("task {task}: forge error during validation: {message}")]
    ForgeUnavailable {
        /// Task id
        task: String,
        /// Underlying error
        message: String,
    },
}

/// Outcome of validating one task, evidence retained
#[derive(Debug, Clone)]
pub struct TaskValidationResult {
    /// Task id
    pub task_id: String,
    /// Tracking issue number
    pub issue: u64,
    /// Whether the task passed every check
    pub valid: bool,
    /// The closing pull request, when one was found
    pub closing_pr: Option<PullRequest>,
    /// The check aggregate for the merge commit, when fetched
    pub checks: Option<CommitChecks>,
    /// The failing condition, when invalid
    pub failure: Option<ValidationFailure>,
}

impl TaskValidationResult {
    fn invalid(
        task_id: String,
        issue: u64,
        closing_pr: Option<PullRequest>,
        checks: Option<CommitChecks>,
        failure: ValidationFailure,
    ) -> Self {
        Self {
            task_id,
            issue,
            valid: false,
            closing_pr,
            checks,
            failure: Some(failure),
        }
    }
}

/// Flat per-team rollup of a validation batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationSummary {
    /// Tasks that validated clean
    pub valid: Vec<String>,
    /// Tasks that did not
    pub invalid: Vec<String>,
    /// One message per invalid task
    pub errors: Vec<String>,
}

impl ValidationSummary {
    /// Roll a batch of results up into id lists and messages
    pub fn from_results(results: &[TaskValidationResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            if result.valid {
                summary.valid.push(result.task_id.clone());
            } else {
                summary.invalid.push(result.task_id.clone());
                if let Some(failure) = &result.failure {
                    summary.errors.push(failure.to_string());
                }
            }
        }
        summary
    }

    /// True when every task validated clean
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Validates tasks against the forge with bounded parallelism
pub struct TaskValidator<C: ForgeClient> {
    forge: Arc<C>,
    max_parallel: usize,
}

impl<C: ForgeClient> TaskValidator<C> {
    /// Build a validator; `max_parallel` bounds the fan-out
    pub fn new(forge: Arc<C>, max_parallel: usize) -> Self {
        Self {
            forge,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Validate a single task
    ///
    /// Validation verdicts come back as a result with `valid = false`;
    /// only infrastructure failures (rate limits, transport) surface
    /// as `Err`.
    pub async fn validate_task(
        &self,
        task_id: &str,
        issue_number: u64,
    ) -> WaveResult<TaskValidationResult> {
        let task = task_id.to_string();

        let issue = self.forge.get_issue(issue_number).await?;
        if issue.state != IssueState::Closed {
            return Ok(TaskValidationResult::invalid(
                task,
                issue_number,
                None,
                None,
                ValidationFailure::IssueNotClosed {
                    task: task_id.to_string(),
                    url: issue.html_url,
                },
            ));
        }

        let Some(pr) = self.forge.get_closing_pull_request(issue_number).await? else {
            return Ok(TaskValidationResult::invalid(
                task,
                issue_number,
                None,
                None,
                ValidationFailure::NoClosingPr {
                    task: task_id.to_string(),
                    url: issue.html_url,
                },
            ));
        };

        if !pr.merged {
            let url = pr.html_url.clone();
            return Ok(TaskValidationResult::invalid(
                task,
                issue_number,
                Some(pr),
                None,
                ValidationFailure::PrNotMerged {
                    task: task_id.to_string(),
                    url,
                },
            ));
        }

        let Some(sha) = pr.merge_commit_sha.clone() else {
            let url = pr.html_url.clone();
            return Ok(TaskValidationResult::invalid(
                task,
                issue_number,
                Some(pr),
                None,
                ValidationFailure::ForgeUnavailable {
                    task: task_id.to_string(),
                    message: format!("merged pull request has no merge commit ({})", url),
                },
            ));
        };

        let checks = self.forge.get_commit_checks(&sha).await?;
        if checks.state != CheckState::Success {
            let url = pr.html_url.clone();
            let failing = checks.failing;
            return Ok(TaskValidationResult::invalid(
                task,
                issue_number,
                Some(pr),
                Some(checks),
                ValidationFailure::CiChecksFailed {
                    task: task_id.to_string(),
                    url,
                    failing,
                },
            ));
        }

        debug!(task = %task_id, issue = issue_number, "task validated clean");
        Ok(TaskValidationResult {
            task_id: task,
            issue: issue_number,
            valid: true,
            closing_pr: Some(pr),
            checks: Some(checks),
            failure: None,
        })
    }

    /// Validate a batch with bounded fan-out
    ///
    /// Per-task failures never abort the batch; results come back in
    /// input order. Rate limiting is an infrastructure fault and
    /// aborts so the coordinator can re-schedule the cycle.
    pub async fn validate_tasks(
        &self,
        tasks: &[(String, u64)],
    ) -> WaveResult<Vec<TaskValidationResult>> {
        let mut indexed: Vec<(usize, WaveResult<TaskValidationResult>, String, u64)> =
            stream::iter(tasks.iter().cloned().enumerate())
                .map(|(idx, (task, issue))| async move {
                    let result = self.validate_task(&task, issue).await;
                    (idx, result, task, issue)
                })
                .buffer_unordered(self.max_parallel)
                .collect()
                .await;
        indexed.sort_by_key(|(idx, _, _, _)| *idx);

        let mut results = Vec::with_capacity(indexed.len());
        for (_, result, task, issue) in indexed {
            match result {
                Ok(r) => results.push(r),
                Err(WaveError::RateLimited { reset_at }) => {
                    return Err(WaveError::RateLimited { reset_at })
                }
                Err(e) => results.push(TaskValidationResult::invalid(
                    task.clone(),
                    issue,
                    None,
                    None,
                    ValidationFailure::ForgeUnavailable {
                        task,
                        message: e.to_string(),
                    },
                )),
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveops_forge::InMemoryForge;

    fn validator(forge: &InMemoryForge) -> TaskValidator<InMemoryForge> {
        TaskValidator::new(Arc::new(forge.clone()), 4)
    }

    #[tokio::test]
    async fn clean_task_keeps_evidence() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "task a", "", true);
        forge.add_pull(10, true, Some("sha-a"));
        forge.link_closing_pull(1, 10);
        forge.set_commit_checks("sha-a", CheckState::Success, 3, 0);

        let result = validator(&forge).validate_task("a", 1).await.unwrap();
        assert!(result.valid);
        assert_eq!(result.closing_pr.as_ref().map(|p| p.number), Some(10));
        assert_eq!(result.checks.as_ref().map(|c| c.total), Some(3));
    }

    #[tokio::test]
    async fn open_issue_fails_with_url() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "task a", "", false);

        let result = validator(&forge).validate_task("a", 1).await.unwrap();
        assert!(!result.valid);
        let message = result.failure.unwrap().to_string();
        assert!(message.contains("task a:") || message.contains("task a"));
        assert!(message.contains("issue not closed"));
        assert!(message.contains("https://forge.test/issues/1"));
    }

    #[tokio::test]
    async fn missing_closing_pr_is_reported() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "task a", "", true);

        let result = validator(&forge).validate_task("a", 1).await.unwrap();
        assert!(matches!(
            result.failure,
            Some(ValidationFailure::NoClosingPr { .. })
        ));
    }

    #[tokio::test]
    async fn unmerged_pr_is_reported() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "task a", "", true);
        forge.add_pull(10, false, None);
        forge.link_closing_pull(1, 10);

        let result = validator(&forge).validate_task("a", 1).await.unwrap();
        assert!(matches!(
            result.failure,
            Some(ValidationFailure::PrNotMerged { .. })
        ));
        assert!(result.closing_pr.is_some());
    }

    #[tokio::test]
    async fn red_checks_carry_failing_count() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "task a", "", true);
        forge.add_pull(10, true, Some("sha-a"));
        forge.link_closing_pull(1, 10);
        forge.set_commit_checks("sha-a", CheckState::Failure, 5, 2);

        let result = validator(&forge).validate_task("a", 1).await.unwrap();
        match result.failure {
            Some(ValidationFailure::CiChecksFailed { failing, .. }) => assert_eq!(failing, 2),
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[tokio::test]
    async fn batch_collects_mixed_results_in_order() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "task a", "", true);
        forge.add_pull(10, true, Some("sha-a"));
        forge.link_closing_pull(1, 10);
        forge.set_commit_checks("sha-a", CheckState::Success, 1, 0);
        forge.add_issue(2, "task b", "", false);
        // Issue 3 does not exist at all; the batch must still finish.

        let batch = vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3),
        ];
        let results = validator(&forge).validate_tasks(&batch).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].task_id, "a");
        assert!(results[0].valid);
        assert!(!results[1].valid);
        assert!(matches!(
            results[2].failure,
            Some(ValidationFailure::ForgeUnavailable { .. })
        ));

        let summary = ValidationSummary::from_results(&results);
        assert_eq!(summary.valid, vec!["a"]);
        assert_eq!(summary.invalid, vec!["b", "c"]);
        assert_eq!(summary.errors.len(), 2);
        assert!(!summary.is_clean());
    }
}
