//! Wave gate
//!
//! The barrier over all teams in a wave. Each evaluation computes the
//! aggregate readiness, projects it as a check run, derives the next
//! wave state, and — exactly once per false→true flip — produces the
//! completion announcement.
//!
//! At most one evaluation runs per `(plan, wave)` key: concurrent
//! callers join the in-flight shared future and observe the identical
//! result, which is what keeps announcements exactly-once under
//! duplicate event delivery. The active-check map is owned by the gate
//! instance, so tests construct isolated gates.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;

use futures::future::{Future, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info};

use waveops_forge::{CheckConclusion, CheckRun, CheckRunRequest, CheckRunStatus, ForgeClient};

use crate::clock::Clock;
use crate::config::WaveConfig;
use crate::deploy::{DeploymentGate, WaveGateStatus};
use crate::error::WaveResult;
use crate::state::{TeamState, TeamStatus, WaveState};

/// Check-run naming and target commit
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Suffix for the check-run name (`Wave Gate: <name>`)
    pub name: String,
    /// Commit the run attaches to
    pub head_sha: String,
}

impl CheckConfig {
    /// Attach to the default branch head
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            head_sha: "main".to_string(),
        }
    }
}

/// Everything one gate evaluation produced
#[derive(Debug, Clone)]
pub struct WaveGateResult {
    /// Aggregate readiness the evaluation observed
    pub status: WaveGateStatus,
    /// Derived wave state to persist
    pub state: WaveState,
    /// The check run that was created
    pub check_run: CheckRun,
    /// Completion announcement, present only on the false→true flip
    pub announcement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GateKey {
    plan: String,
    wave: u32,
}

type SharedGate = Shared<Pin<Box<dyn Future<Output = WaveResult<WaveGateResult>> + Send>>>;

/// The wave barrier
pub struct WaveGate<C: ForgeClient> {
    deploy: Arc<DeploymentGate<C>>,
    forge: Arc<C>,
    clock: Arc<dyn Clock>,
    active: Arc<Mutex<HashMap<GateKey, SharedGate>>>,
}

impl<C: ForgeClient> Clone for WaveGate<C> {
    fn clone(&self) -> Self {
        Self {
            deploy: Arc::clone(&self.deploy),
            forge: Arc::clone(&self.forge),
            clock: Arc::clone(&self.clock),
            active: Arc::clone(&self.active),
        }
    }
}

/// Trigger rule for callers: check the gate when there is no previous
/// state, or when a team's readiness just flipped false→true. Already
/// ready teams never re-trigger, which keeps announcements
/// exactly-once under repeated event delivery.
pub fn should_trigger(previous: Option<&WaveState>, current: &WaveState) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let before = previous.ready_teams();
    current
        .ready_teams()
        .iter()
        .any(|team| !before.contains(team))
}

impl<C: ForgeClient + 'static> WaveGate<C> {
    /// Build a gate
    pub fn new(deploy: Arc<DeploymentGate<C>>, forge: Arc<C>, clock: Arc<dyn Clock>) -> Self {
        Self {
            deploy,
            forge,
            clock,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Evaluate the wave barrier
    ///
    /// Concurrent calls for the same `(plan, wave)` join the in-flight
    /// evaluation and receive the same result. The announcement is
    /// produced iff `all_teams_ready` is newly true relative to
    /// `previous`.
    pub async fn check_wave_gate(
        &self,
        check: &CheckConfig,
        config: &WaveConfig,
        previous: Option<WaveState>,
    ) -> WaveResult<WaveGateResult> {
        let key = GateKey {
            plan: config.plan.clone(),
            wave: config.wave,
        };

        let (future, created) = {
            let mut active = self.active.lock().await;
            match active.get(&key) {
                Some(inflight) => {
                    debug!(plan = %key.plan, wave = key.wave, "joining in-flight gate check");
                    (inflight.clone(), false)
                }
                None => {
                    let gate = self.clone();
                    let check = check.clone();
                    let config = config.clone();
                    let fut: Pin<Box<dyn Future<Output = WaveResult<WaveGateResult>> + Send>> =
                        Box::pin(async move { gate.run_gate(check, config, previous).await });
                    let shared = fut.shared();
                    active.insert(key.clone(), shared.clone());
                    (shared, true)
                }
            }
        };

        let result = future.await;
        if created {
            self.active.lock().await.remove(&key);
        }
        result
    }

    async fn run_gate(
        self,
        check: CheckConfig,
        config: WaveConfig,
        previous: Option<WaveState>,
    ) -> WaveResult<WaveGateResult> {
        let status = self.deploy.check_wave_gate_status(&config).await?;
        let state = self.derive_state(&config, &status, previous.as_ref());

        let check_run = self
            .forge
            .create_check_run(self.render_check(&check, &config, &status))
            .await?;

        let newly_complete =
            status.all_teams_ready && previous.as_ref().map(|p| !p.all_ready).unwrap_or(true);
        let announcement = newly_complete.then(|| render_announcement(&config, &status));
        if newly_complete {
            info!(plan = %config.plan, wave = config.wave, "wave complete");
        }

        Ok(WaveGateResult {
            status,
            state,
            check_run,
            announcement,
        })
    }

    /// Derive the wave document from the aggregate, preserving `tz`
    /// from the previous state when present
    fn derive_state(
        &self,
        config: &WaveConfig,
        status: &WaveGateStatus,
        previous: Option<&WaveState>,
    ) -> WaveState {
        let now = self.clock.now();
        let tz = previous
            .map(|p| p.tz.clone())
            .unwrap_or_else(|| config.tz.clone());

        let mut teams = BTreeMap::new();
        for (team, plan) in &config.teams {
            let tasks = plan.tasks.iter().map(|t| t.task.clone()).collect();
            let result = status.results.iter().find(|r| r.team == *team);
            let (team_status, reason) = match result {
                Some(r) if r.ready => (TeamStatus::Ready, None),
                Some(r) => {
                    let mut parts = r.summary.invalid.clone();
                    parts.extend(r.summary.errors.iter().cloned());
                    let reason = if parts.is_empty() {
                        "validation incomplete".to_string()
                    } else {
                        parts.join("; ")
                    };
                    (TeamStatus::Blocked, Some(reason))
                }
                None => (TeamStatus::InProgress, None),
            };
            teams.insert(
                team.clone(),
                TeamState::new(team_status, now, reason, tasks),
            );
        }
        WaveState::new(config.plan.clone(), config.wave, tz, teams, now)
    }

    fn render_check(
        &self,
        check: &CheckConfig,
        config: &WaveConfig,
        status: &WaveGateStatus,
    ) -> CheckRunRequest {
        let name = format!("Wave Gate: {}", check.name);
        if status.all_teams_ready {
            let mut summary = format!("All teams ready for Wave {}.\n", config.wave);
            for (team, plan) in &config.teams {
                let tasks: Vec<&str> = plan.tasks.iter().map(|t| t.task.as_str()).collect();
                summary.push_str(&format!("- **{}**: {}\n", team, tasks.join(", ")));
            }
            CheckRunRequest {
                name,
                head_sha: check.head_sha.clone(),
                status: CheckRunStatus::Completed,
                conclusion: Some(CheckConclusion::Success),
                title: format!("🎉 Wave {} Complete!", config.wave),
                summary,
            }
        } else {
            let mut summary = String::new();
            summary.push_str("### Ready\n");
            for team in &status.ready_teams {
                summary.push_str(&format!("- {}\n", team));
            }
            summary.push_str("\n### Blocked\n");
            for result in status.results.iter().filter(|r| !r.ready) {
                if result.summary.invalid.is_empty() {
                    summary.push_str(&format!("- {}\n", result.team));
                } else {
                    summary.push_str(&format!(
                        "- {}: {}\n",
                        result.team,
                        result.summary.invalid.join(", ")
                    ));
                }
            }
            CheckRunRequest {
                name,
                head_sha: check.head_sha.clone(),
                status: CheckRunStatus::InProgress,
                conclusion: None,
                title: format!("🔄 Wave {} In Progress", config.wave),
                summary,
            }
        }
    }
}

fn render_announcement(config: &WaveConfig, status: &WaveGateStatus) -> String {
    let teams: Vec<&str> = status.ready_teams.iter().map(|t| t.as_str()).collect();
    format!(
        "**WAVE {} COMPLETE!**\n\nReady teams: {}\n\nWave {} is now open.",
        config.wave,
        teams.join(", "),
        config.wave + 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SysClock;
    use crate::config::{TaskRef, TeamPlan};
    use crate::validator::TaskValidator;
    use std::collections::BTreeSet;
    use waveops_forge::{CheckState, InMemoryForge};

    fn wave_gate(forge: &InMemoryForge) -> WaveGate<InMemoryForge> {
        let forge = Arc::new(forge.clone());
        let clock: Arc<dyn Clock> = Arc::new(SysClock);
        let validator = TaskValidator::new(forge.clone(), 4);
        let deploy = Arc::new(DeploymentGate::new(forge.clone(), validator, clock.clone()));
        WaveGate::new(deploy, forge, clock)
    }

    fn seed_clean_task(forge: &InMemoryForge, issue: u64, pr: u64, sha: &str) {
        forge.add_issue(issue, &format!("issue {}", issue), "", true);
        forge.add_pull(pr, true, Some(sha));
        forge.link_closing_pull(issue, pr);
        forge.set_commit_checks(sha, CheckState::Success, 1, 0);
    }

    fn one_team_config() -> WaveConfig {
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
        WaveConfig {
            plan: "q3".to_string(),
            wave: 1,
            tz: "UTC".to_string(),
            teams,
        }
    }

    #[tokio::test]
    async fn complete_wave_produces_success_check_and_announcement() {
        let forge = InMemoryForge::new();
        seed_clean_task(&forge, 1, 10, "sha-1");

        let gate = wave_gate(&forge);
        let result = gate
            .check_wave_gate(&CheckConfig::new("q3"), &one_team_config(), None)
            .await
            .unwrap();

        assert!(result.status.all_teams_ready);
        assert!(result.state.all_ready);
        assert_eq!(result.check_run.name, "Wave Gate: q3");
        assert_eq!(result.check_run.status, CheckRunStatus::Completed);
        assert_eq!(result.check_run.conclusion, Some(CheckConclusion::Success));
        assert_eq!(result.check_run.title, "🎉 Wave 1 Complete!");
        let announcement = result.announcement.unwrap();
        assert!(announcement.starts_with("**WAVE 1 COMPLETE!**"));
        assert!(announcement.contains("alpha"));
    }

    #[tokio::test]
    async fn incomplete_wave_produces_in_progress_check() {
        let forge = InMemoryForge::new();
        forge.add_issue(1, "issue 1", "", false);

        let gate = wave_gate(&forge);
        let result = gate
            .check_wave_gate(&CheckConfig::new("q3"), &one_team_config(), None)
            .await
            .unwrap();

        assert!(!result.status.all_teams_ready);
        assert_eq!(result.check_run.status, CheckRunStatus::InProgress);
        assert_eq!(result.check_run.title, "🔄 Wave 1 In Progress");
        assert!(result.check_run.summary.contains("a1"));
        assert!(result.announcement.is_none());
        assert_eq!(
            result.state.teams["alpha"].status,
            TeamStatus::Blocked
        );
        assert!(result.state.teams["alpha"].reason.is_some());
    }

    #[tokio::test]
    async fn announcement_omitted_when_already_complete() {
        let forge = InMemoryForge::new();
        seed_clean_task(&forge, 1, 10, "sha-1");
        let gate = wave_gate(&forge);
        let config = one_team_config();

        let first = gate
            .check_wave_gate(&CheckConfig::new("q3"), &config, None)
            .await
            .unwrap();
        assert!(first.announcement.is_some());

        let second = gate
            .check_wave_gate(&CheckConfig::new("q3"), &config, Some(first.state.clone()))
            .await
            .unwrap();
        assert!(second.announcement.is_none());
    }

    #[tokio::test]
    async fn tz_is_preserved_from_previous_state() {
        let forge = InMemoryForge::new();
        seed_clean_task(&forge, 1, 10, "sha-1");
        let gate = wave_gate(&forge);
        let config = one_team_config();

        let first = gate
            .check_wave_gate(&CheckConfig::new("q3"), &config, None)
            .await
            .unwrap();
        let mut previous = first.state;
        previous.tz = "America/New_York".to_string();

        let second = gate
            .check_wave_gate(&CheckConfig::new("q3"), &config, Some(previous))
            .await
            .unwrap();
        assert_eq!(second.state.tz, "America/New_York");
    }

    #[test]
    fn trigger_rule_fires_on_fresh_state_and_new_readiness() {
        let forge_now = chrono::Utc::now();
        let mut teams = BTreeMap::new();
        teams.insert(
            "alpha".to_string(),
            TeamState::new(TeamStatus::InProgress, forge_now, None, BTreeSet::new()),
        );
        let before = WaveState::new("q3", 1, "UTC", teams.clone(), forge_now);

        let after = before
            .update_team_status("alpha", TeamStatus::Ready, None, forge_now)
            .unwrap();

        assert!(should_trigger(None, &before));
        assert!(should_trigger(Some(&before), &after));
        // Already-ready teams do not re-trigger.
        assert!(!should_trigger(Some(&after), &after));
        assert!(!should_trigger(Some(&before), &before));
    }
}
