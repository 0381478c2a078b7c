//! Deployment gate
//!
//! Projects per-team readiness onto the forge as deployment records in
//! the `wave-<N>-ready` environment. Records are write-only: each
//! evaluation creates a fresh record that moves pending →
//! success/failure/error; the gate never silently downgrades an
//! earlier verdict.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{info, warn};

use waveops_forge::{DeploymentState, ForgeClient};

use crate::clock::Clock;
use crate::config::WaveConfig;
use crate::error::{WaveError, WaveResult};
use crate::validator::{TaskValidator, ValidationSummary};

/// Readiness verdict for one team in one wave
#[derive(Debug, Clone)]
pub struct TeamReadinessResult {
    /// Team id
    pub team: String,
    /// True when every task validated clean
    pub ready: bool,
    /// Valid/invalid task ids and error messages
    pub summary: ValidationSummary,
    /// Deployment record backing this verdict, when one was written
    pub deployment_id: Option<u64>,
    /// When the verdict was computed
    pub at: DateTime<Utc>,
}

/// Aggregate readiness across every team in the wave
#[derive(Debug, Clone)]
pub struct WaveGateStatus {
    /// Wave number
    pub wave: u32,
    /// Conjunction of per-team readiness
    pub all_teams_ready: bool,
    /// Per-team verdicts in team-id order
    pub results: Vec<TeamReadinessResult>,
    /// Teams ready to proceed
    pub ready_teams: BTreeSet<String>,
    /// Teams holding the gate
    pub blocked_teams: BTreeSet<String>,
    /// When the aggregate was computed
    pub at: DateTime<Utc>,
}

/// Environment name for a wave's readiness records
pub fn environment_for_wave(wave: u32) -> String {
    format!("wave-{}-ready", wave)
}

/// Per-team readiness projection
pub struct DeploymentGate<C: ForgeClient> {
    forge: Arc<C>,
    validator: TaskValidator<C>,
    clock: Arc<dyn Clock>,
}

impl<C: ForgeClient> DeploymentGate<C> {
    /// Build a gate over a forge client
    pub fn new(forge: Arc<C>, validator: TaskValidator<C>, clock: Arc<dyn Clock>) -> Self {
        Self {
            forge,
            validator,
            clock,
        }
    }

    /// Validate one team and project the verdict as a deployment record
    ///
    /// The record starts pending and is moved to success, failure (with
    /// the blocked task ids in the description), or error when the
    /// validator itself failed. Rate limiting propagates so the cycle
    /// can be re-scheduled.
    pub async fn validate_and_update(
        &self,
        team: &str,
        wave: u32,
        tasks: &[(String, u64)],
    ) -> WaveResult<TeamReadinessResult> {
        let prefix = format!("{} team readiness for Wave {}:", team, wave);

        let (summary, state, description) = match self.validator.validate_tasks(tasks).await {
            Ok(results) => {
                let summary = ValidationSummary::from_results(&results);
                if summary.is_clean() {
                    let description =
                        format!("{} all {} task(s) complete", prefix, summary.valid.len());
                    (summary, DeploymentState::Success, description)
                } else {
                    let description =
                        format!("{} blocked on {}", prefix, summary.invalid.join(", "));
                    (summary, DeploymentState::Failure, description)
                }
            }
            Err(WaveError::RateLimited { reset_at }) => {
                return Err(WaveError::RateLimited { reset_at })
            }
            Err(e) => {
                warn!(team, wave, error = %e, "validator failed; recording error state");
                let summary = ValidationSummary {
                    valid: Vec::new(),
                    invalid: Vec::new(),
                    errors: vec![e.to_string()],
                };
                let description = format!("{} validation error: {}", prefix, e);
                (summary, DeploymentState::Error, description)
            }
        };

        let now = self.clock.now();
        let payload = serde_json::json!({
            "team": team,
            "wave": wave,
            "status": state.to_string(),
            "timestamp": now.to_rfc3339(),
        });
        let deployment = self
            .forge
            .create_deployment(&environment_for_wave(wave), &description, payload)
            .await?;
        self.forge
            .update_deployment_status(deployment.id, state, &description)
            .await?;

        info!(
            team,
            wave,
            deployment = deployment.id,
            state = %state,
            "team readiness recorded"
        );
        Ok(TeamReadinessResult {
            team: team.to_string(),
            ready: state == DeploymentState::Success,
            summary,
            deployment_id: Some(deployment.id),
            at: now,
        })
    }

    /// Evaluate every team in parallel and aggregate
    ///
    /// One team's failure never prevents the others from being
    /// evaluated; a failed team simply comes back not ready with the
    /// error message in its summary.
    pub async fn check_wave_gate_status(&self, config: &WaveConfig) -> WaveResult<WaveGateStatus> {
        let evaluations = config.teams.iter().map(|(team, plan)| {
            let pairs = plan.task_pairs();
            async move {
                let outcome = self.validate_and_update(team, config.wave, &pairs).await;
                (team.clone(), outcome)
            }
        });
        let outcomes = join_all(evaluations).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (team, outcome) in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(WaveError::RateLimited { reset_at }) => {
                    return Err(WaveError::RateLimited { reset_at })
                }
                Err(e) => {
                    warn!(team = %team, error = %e, "team evaluation failed");
                    results.push(TeamReadinessResult {
                        team,
                        ready: false,
                        summary: ValidationSummary {
                            valid: Vec::new(),
                            invalid: Vec::new(),
                            errors: vec![e.to_string()],
                        },
                        deployment_id: None,
                        at: self.clock.now(),
                    });
                }
            }
        }

        let ready_teams: BTreeSet<String> = results
            .iter()
            .filter(|r| r.ready)
            .map(|r| r.team.clone())
            .collect();
        let blocked_teams: BTreeSet<String> = results
            .iter()
            .filter(|r| !r.ready)
            .map(|r| r.team.clone())
            .collect();
        let all_teams_ready = !results.is_empty() && blocked_teams.is_empty();

        Ok(WaveGateStatus {
            wave: config.wave,
            all_teams_ready,
            results,
            ready_teams,
            blocked_teams,
            at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SysClock;
    use crate::config::{TaskRef, TeamPlan, WaveConfig};
    use std::collections::BTreeMap;
    use waveops_forge::{CheckState, InMemoryForge};

    fn gate(forge: &InMemoryForge) -> DeploymentGate<InMemoryForge> {
        let forge = Arc::new(forge.clone());
        let validator = TaskValidator::new(forge.clone(), 4);
        DeploymentGate::new(forge, validator, Arc::new(SysClock))
    }

    fn seed_clean_task(forge: &InMemoryForge, issue: u64, pr: u64, sha: &str) {
        forge.add_issue(issue, &format!("issue {}", issue), "", true);
        forge.add_pull(pr, true, Some(sha));
        forge.link_closing_pull(issue, pr);
        forge.set_commit_checks(sha, CheckState::Success, 2, 0);
    }

    #[tokio::test]
    async fn clean_team_gets_success_record() {
        let forge = InMemoryForge::new();
        seed_clean_task(&forge, 1, 10, "sha-1");

        let result = gate(&forge)
            .validate_and_update("alpha", 2, &[("a1".to_string(), 1)])
            .await
            .unwrap();
        assert!(result.ready);

        let records = forge.deployments();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].environment, "wave-2-ready");
        assert_eq!(records[0].state, DeploymentState::Success);
        assert!(records[0]
            .description
            .starts_with("alpha team readiness for Wave 2:"));
        assert_eq!(records[0].payload["team"], "alpha");
        assert_eq!(records[0].payload["wave"], 2);
        assert_eq!(records[0].payload["status"], "success");
    }

    #[tokio::test]
    async fn blocked_team_gets_failure_record_with_task_ids() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "issue 1", "", true);
        forge.add_pull(10, true, Some("sha-1"));
        forge.link_closing_pull(1, 10);
        forge.set_commit_checks("sha-1", CheckState::Failure, 4, 1);

        let result = gate(&forge)
            .validate_and_update("beta", 2, &[("b7".to_string(), 1)])
            .await
            .unwrap();
        assert!(!result.ready);
        assert_eq!(result.summary.invalid, vec!["b7"]);

        let records = forge.deployments();
        assert_eq!(records[0].state, DeploymentState::Failure);
        assert!(records[0].description.contains("b7"));
        assert_eq!(records[0].payload["status"], "failure");
    }

    #[tokio::test]
    async fn wave_status_aggregates_independent_teams() {
        let forge = InMemoryForge::new();
        seed_clean_task(&forge, 1, 10, "sha-1");
        forge.add_issue(2, "issue 2", "", false);

        let mut teams = BTreeMap::new();
        teams.insert(
            "alpha".to_string(),
            TeamPlan {
                tasks: vec![TaskRef {
                    task: "a1".to_string(),
                    issue: 1,
                }],
            },
        );
        teams.insert(
            "beta".to_string(),
            TeamPlan {
                tasks: vec![TaskRef {
                    task: "b1".to_string(),
                    issue: 2,
                }],
            },
        );
        let config = WaveConfig {
            plan: "q3".to_string(),
            wave: 1,
            tz: "UTC".to_string(),
            teams,
        };

        let status = gate(&forge).check_wave_gate_status(&config).await.unwrap();
        assert!(!status.all_teams_ready);
        assert_eq!(status.ready_teams, BTreeSet::from(["alpha".to_string()]));
        assert_eq!(status.blocked_teams, BTreeSet::from(["beta".to_string()]));
        assert_eq!(status.results.len(), 2);
        // Both teams still produced deployment records.
        assert_eq!(forge.deployments().len(), 2);
    }
}
