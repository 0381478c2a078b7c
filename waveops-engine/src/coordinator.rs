//! Event coordinator
//!
//! Wires forge events to the kernel: validation, deployment-gate
//! writes, the wave-gate check, state persistence, and the completion
//! announcement, in that order. Each event produces at most one wave
//! state write. A failed cycle posts a user-visible comment on the
//! coordination issue and leaves no partial state behind; deployment
//! records written before the failure are unreferenced and idempotent
//! under re-run.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use waveops_forge::ForgeClient;

use crate::clock::Clock;
use crate::config::{CoordinatorConfig, PlanDocument, TaskRef, TeamPlan, WaveConfig};
use crate::deploy::DeploymentGate;
use crate::error::{WaveError, WaveResult};
use crate::gate::{CheckConfig, WaveGate, WaveGateResult};
use crate::graph::{DependencyGraph, TaskState};
use crate::pinned;
use crate::state::WaveState;
use crate::stealing::{
    RebalanceSummary, TeamUtilization, TransferNotifier, TransferRecord, WorkStealingEngine,
};
use crate::validator::TaskValidator;

/// A forge event routed into the kernel
#[derive(Debug, Clone)]
pub enum ForgeEvent {
    /// An issue was opened
    IssueOpened {
        /// Issue number
        number: u64,
    },
    /// An issue body or title was edited
    IssueEdited {
        /// Issue number
        number: u64,
    },
    /// An issue was closed
    IssueClosed {
        /// Issue number
        number: u64,
    },
    /// A comment was added to an issue
    IssueComment {
        /// Issue number
        number: u64,
        /// Comment body
        comment: String,
    },
    /// A pull request was merged
    PullRequestMerged {
        /// Pull request number
        number: u64,
    },
    /// A push landed on a ref
    Push {
        /// Ref name, e.g. `main`
        ref_name: String,
    },
    /// An explicit operator trigger
    Manual {
        /// Command text
        command: String,
    },
}

impl ForgeEvent {
    fn label(&self) -> String {
        match self {
            ForgeEvent::IssueOpened { number } => format!("issue-opened #{}", number),
            ForgeEvent::IssueEdited { number } => format!("issue-edited #{}", number),
            ForgeEvent::IssueClosed { number } => format!("issue-closed #{}", number),
            ForgeEvent::IssueComment { number, .. } => format!("issue-comment #{}", number),
            ForgeEvent::PullRequestMerged { number } => format!("pr-merged #{}", number),
            ForgeEvent::Push { ref_name } => format!("push {}", ref_name),
            ForgeEvent::Manual { command } => format!("manual {:?}", command),
        }
    }
}

/// What one dispatched event did
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// Event that drove the cycle
    pub event: String,
    /// Whether the wave state was written to the coordination issue
    pub state_written: bool,
    /// Gate evaluation, when one ran
    pub gate: Option<WaveGateResult>,
    /// Rebalancing summary, when one ran
    pub rebalance: Option<RebalanceSummary>,
}

impl CycleOutcome {
    fn noop(event: String) -> Self {
        Self {
            event,
            state_written: false,
            gate: None,
            rebalance: None,
        }
    }
}

/// Notifier that announces transfers as coordination-issue comments
pub struct CommentNotifier<C: ForgeClient> {
    forge: Arc<C>,
    issue: u64,
}

impl<C: ForgeClient> CommentNotifier<C> {
    /// Notify through comments on the given issue
    pub fn new(forge: Arc<C>, issue: u64) -> Self {
        Self { forge, issue }
    }
}

#[async_trait]
impl<C: ForgeClient> TransferNotifier for CommentNotifier<C> {
    async fn notify_transfer(&self, record: &TransferRecord) -> WaveResult<()> {
        let mut mentions: Vec<String> = Vec::new();
        for team in [&record.from, &record.to] {
            for member in self.forge.get_team_members(team).await.unwrap_or_default() {
                mentions.push(format!("@{}", member.login));
            }
        }
        let cc = if mentions.is_empty() {
            String::new()
        } else {
            format!("\n\ncc {}", mentions.join(" "))
        };
        let body = format!(
            "🔁 Task `{}` transferred from **{}** to **{}**.{}",
            record.task, record.from, record.to, cc
        );
        self.forge.add_issue_comment(self.issue, &body).await?;
        Ok(())
    }
}

/// The event dispatcher
pub struct Coordinator<C: ForgeClient + 'static> {
    forge: Arc<C>,
    gate: WaveGate<C>,
    stealing: WorkStealingEngine,
    notifier: Arc<dyn TransferNotifier>,
    graph: tokio::sync::Mutex<DependencyGraph>,
    /// Waves whose completion has already been announced by this
    /// process; the persisted `all_ready` edge covers restarts
    announced: tokio::sync::Mutex<std::collections::HashSet<(String, u32)>>,
    plan: PlanDocument,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
}

impl<C: ForgeClient + 'static> Coordinator<C> {
    /// Wire the kernel together over a forge client and a plan
    pub fn new(
        forge: Arc<C>,
        plan: PlanDocument,
        config: CoordinatorConfig,
        clock: Arc<dyn Clock>,
    ) -> WaveResult<Self> {
        let graph = plan.graph()?;
        let validator = TaskValidator::new(forge.clone(), config.validator_parallelism);
        let deploy = Arc::new(DeploymentGate::new(forge.clone(), validator, clock.clone()));
        let gate = WaveGate::new(deploy, forge.clone(), clock.clone());
        let stealing = WorkStealingEngine::new(config.stealing.clone())?;
        let notifier: Arc<dyn TransferNotifier> = Arc::new(CommentNotifier::new(
            forge.clone(),
            config.coordination_issue,
        ));

        Ok(Self {
            forge,
            gate,
            stealing,
            notifier,
            graph: tokio::sync::Mutex::new(graph),
            announced: tokio::sync::Mutex::new(std::collections::HashSet::new()),
            plan,
            config,
            clock,
        })
    }

    /// Dispatch one forge event under the cycle deadline
    ///
    /// On any failure the coordinator posts a user-visible comment on
    /// the coordination issue and surfaces the error; the next event
    /// re-drives the cycle.
    pub async fn dispatch(&self, event: ForgeEvent) -> WaveResult<CycleOutcome> {
        let label = event.label();
        debug!(event = %label, "dispatching forge event");

        let deadline = self.config.cycle_deadline;
        let outcome = match tokio::time::timeout(deadline, self.handle(event)).await {
            Ok(result) => result,
            Err(_) => Err(WaveError::Timeout {
                seconds: deadline.as_secs(),
            }),
        };

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.report_error(&label, &e).await;
                Err(e)
            }
        }
    }

    async fn handle(&self, event: ForgeEvent) -> WaveResult<CycleOutcome> {
        let label = event.label();
        match event {
            ForgeEvent::IssueOpened { number }
            | ForgeEvent::IssueEdited { number }
            | ForgeEvent::IssueClosed { number } => {
                if number == self.config.coordination_issue {
                    return self.run_cycle(label).await;
                }
                if !self.plan.tasks_for_issue(number).is_empty() {
                    // A tracked task issue moved; readiness may have changed.
                    return self.run_cycle(label).await;
                }
                debug!(issue = number, "event for untracked issue, ignoring");
                Ok(CycleOutcome::noop(label))
            }
            ForgeEvent::IssueComment { number, comment } => {
                if number == self.config.coordination_issue && comment.trim_start().starts_with('/')
                {
                    // Slash commands are parsed by the surrounding
                    // tooling, not the kernel.
                    debug!(issue = number, "slash command comment observed");
                }
                Ok(CycleOutcome::noop(label))
            }
            ForgeEvent::PullRequestMerged { .. } => self.run_cycle(label).await,
            ForgeEvent::Push { ref_name } => {
                if ref_name == "main" || ref_name.ends_with("/main") {
                    self.run_cycle(label).await
                } else {
                    debug!(ref_name = %ref_name, "push to non-default ref, ignoring");
                    Ok(CycleOutcome::noop(label))
                }
            }
            ForgeEvent::Manual { command } => {
                if command.contains("rebalance") {
                    let summary = self.rebalance().await?;
                    let mut outcome = self.run_cycle(label).await?;
                    outcome.rebalance = Some(summary);
                    Ok(outcome)
                } else {
                    self.run_cycle(label).await
                }
            }
        }
    }

    /// One coordination cycle: validate → deployment records → wave
    /// gate → persist → announcement
    async fn run_cycle(&self, event: String) -> WaveResult<CycleOutcome> {
        let issue = self.forge.get_issue(self.config.coordination_issue).await?;
        let has_sentinels = issue.body.contains(pinned::GUARD_START)
            || issue.body.contains(pinned::GUARD_END);
        if has_sentinels && !pinned::validate(&issue.body) {
            return Err(WaveError::GuardsMissing(
                "coordination issue has malformed wave-state sentinels".to_string(),
            ));
        }
        let previous = match pinned::extract(&issue.body) {
            Some(json) if !json.trim().is_empty() => Some(WaveState::from_json(&json)?),
            _ => None,
        };

        let wave_config = self.current_wave_config().await;
        let check = CheckConfig::new(self.plan.plan.clone());
        let result = self
            .gate
            .check_wave_gate(&check, &wave_config, previous.clone())
            .await?;

        self.refresh_graph(&result).await?;

        let state_written = self
            .persist_state(&issue.body, &result.state, previous.as_ref())
            .await?;

        if let Some(announcement) = &result.announcement {
            self.announce_once(announcement).await?;
        }

        Ok(CycleOutcome {
            event,
            state_written,
            gate: Some(result),
            rebalance: None,
        })
    }

    /// The wave config as the graph currently sees it
    ///
    /// Ownership comes from the graph rather than the plan document so
    /// work-stealing transfers are reflected in subsequent gate
    /// evaluations.
    async fn current_wave_config(&self) -> WaveConfig {
        let graph = self.graph.lock().await;
        let mut teams: std::collections::BTreeMap<String, TeamPlan> =
            std::collections::BTreeMap::new();
        for node in graph.nodes() {
            if node.task.wave != self.config.wave {
                continue;
            }
            let Some(issue) = self.plan.issue_for(&node.task.id) else {
                continue;
            };
            teams
                .entry(node.task.team.clone())
                .or_default()
                .tasks
                .push(TaskRef {
                    task: node.task.id.clone(),
                    issue,
                });
        }
        WaveConfig {
            plan: self.plan.plan.clone(),
            wave: self.config.wave,
            tz: self.plan.tz.clone(),
            teams,
        }
    }

    /// Fold gate evidence back into the dependency graph
    ///
    /// Validated tasks advance to completed; children whose parents
    /// are all complete are explicitly scheduled to ready.
    async fn refresh_graph(&self, result: &WaveGateResult) -> WaveResult<()> {
        let mut graph = self.graph.lock().await;
        for team_result in &result.status.results {
            for task in &team_result.summary.valid {
                if graph.state_of(task) == Some(TaskState::Completed) {
                    continue;
                }
                let eligible = graph.advance_to_completed(task)?;
                for child in eligible {
                    graph.transition(&child, TaskState::Ready)?;
                    debug!(task = %child, "task now eligible and scheduled");
                }
            }
        }
        Ok(())
    }

    /// Post the completion announcement at most once per (plan, wave)
    ///
    /// Concurrent cycles joining the same gate evaluation all receive
    /// the announcement string; only the first one past this set gets
    /// to post it. A failed post releases the slot so the next event
    /// can retry.
    async fn announce_once(&self, announcement: &str) -> WaveResult<()> {
        let key = (self.plan.plan.clone(), self.config.wave);
        let mut announced = self.announced.lock().await;
        if !announced.insert(key.clone()) {
            debug!(wave = self.config.wave, "announcement already posted, skipping");
            return Ok(());
        }
        drop(announced);

        match self
            .forge
            .add_issue_comment(self.config.coordination_issue, announcement)
            .await
        {
            Ok(_) => {
                info!(wave = self.config.wave, "wave completion announced");
                Ok(())
            }
            Err(e) => {
                self.announced.lock().await.remove(&key);
                Err(e.into())
            }
        }
    }

    /// Write the wave state into the pinned block, once, if it changed
    async fn persist_state(
        &self,
        body: &str,
        state: &WaveState,
        previous: Option<&WaveState>,
    ) -> WaveResult<bool> {
        let json = state.to_canonical_json()?;

        // Deterministic serialisation makes the no-change case a pure
        // string comparison, keeping issue edits idempotent.
        if let Some(previous) = previous {
            if previous.to_canonical_json()? == json {
                debug!("wave state unchanged, skipping issue edit");
                return Ok(false);
            }
        }

        let updated = pinned::replace(body, &json)?;
        self.forge
            .update_issue(self.config.coordination_issue, &updated)
            .await?;
        Ok(true)
    }

    /// Run the work-stealing engine over the current graph snapshot
    pub async fn rebalance(&self) -> WaveResult<RebalanceSummary> {
        let mut summary = {
            let mut graph = self.graph.lock().await;
            graph.analyze();
            let utilizations = TeamUtilization::from_graph(&graph, &self.plan.capacities);
            self.stealing
                .rebalance(
                    &mut graph,
                    &utilizations,
                    &self.plan.capacities,
                    self.notifier.as_ref(),
                    self.clock.now(),
                )
                .await
        };

        // Mirror each committed transfer onto the forge as a team
        // assignment. Assignment failures never unwind a transfer.
        for transfer in &summary.transfers {
            let Some(issue) = self.plan.issue_for(&transfer.task) else {
                continue;
            };
            if let Err(e) = self
                .forge
                .create_team_assignment(&transfer.to, &[issue])
                .await
            {
                warn!(task = %transfer.task, error = %e, "forge team assignment failed");
                summary.recommendations.push(format!(
                    "forge assignment of task {} to {} failed: {}",
                    transfer.task, transfer.to, e
                ));
            }
        }

        info!(
            transfers = summary.transfers.len(),
            improvement = summary.utilization_improvement,
            "rebalancing pass finished"
        );
        Ok(summary)
    }

    /// Read-only snapshot of the dependency graph
    pub async fn graph_snapshot(&self) -> DependencyGraph {
        self.graph.lock().await.clone()
    }

    async fn report_error(&self, event: &str, error: &WaveError) {
        warn!(event, error = %error, "coordination cycle failed");
        let body = format!(
            "⚠️ WaveOps coordination failed while handling `{}`:\n\n> {}\n\n\
             The cycle was abandoned without writing state; the next event will retry.",
            event, error
        );
        if let Err(e) = self
            .forge
            .add_issue_comment(self.config.coordination_issue, &body)
            .await
        {
            warn!(error = %e, "could not post the error comment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SysClock;
    use crate::state::TeamStatus;
    use std::time::Duration;
    use waveops_forge::{CheckState, InMemoryForge};

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            token: "tok".to_string(),
            owner: "acme".to_string(),
            repo: "delivery".to_string(),
            coordination_issue: 100,
            wave: 1,
            cycle_deadline: Duration::from_secs(10),
            validator_parallelism: 4,
            stealing: Default::default(),
        }
    }

    fn plan() -> PlanDocument {
        PlanDocument::from_json(
            r#"{
                "plan": "q3",
                "tasks": [
                    {"id": "a1", "title": "API", "wave": 1, "team": "alpha", "issue": 1},
                    {"id": "b1", "title": "Infra", "wave": 1, "team": "beta", "issue": 2}
                ]
            }"#,
        )
        .unwrap()
    }

    fn coordinator(forge: &InMemoryForge) -> Coordinator<InMemoryForge> {
        Coordinator::new(
            Arc::new(forge.clone()),
            plan(),
            config(),
            Arc::new(SysClock),
        )
        .unwrap()
    }

    fn seed_coordination_issue(forge: &InMemoryForge) {
        forge.add_issue(
            100,
            "Wave coordination",
            &format!("# Plan\n\n{}\n", pinned::render("")),
            false,
        );
    }

    fn seed_clean_task(forge: &InMemoryForge, issue: u64, pr: u64, sha: &str) {
        forge.add_issue(issue, &format!("issue {}", issue), "", true);
        forge.add_pull(pr, true, Some(sha));
        forge.link_closing_pull(issue, pr);
        forge.set_commit_checks(sha, CheckState::Success, 1, 0);
    }

    #[tokio::test]
    async fn merged_pr_drives_a_full_cycle() {
        let forge = InMemoryForge::new();
        seed_coordination_issue(&forge);
        seed_clean_task(&forge, 1, 10, "sha-1");
        forge.add_issue(2, "issue 2", "", false);

        let coordinator = coordinator(&forge);
        let outcome = coordinator
            .dispatch(ForgeEvent::PullRequestMerged { number: 10 })
            .await
            .unwrap();

        assert!(outcome.state_written);
        let gate = outcome.gate.unwrap();
        assert!(!gate.status.all_teams_ready);
        assert_eq!(gate.state.teams["alpha"].status, TeamStatus::Ready);

        // The persisted body round-trips back to the same state.
        let body = forge.get_issue(100).await.unwrap().body;
        let persisted = WaveState::from_json(&pinned::extract(&body).unwrap()).unwrap();
        assert_eq!(persisted, gate.state);

        // Graph absorbed the completion.
        let graph = coordinator.graph_snapshot().await;
        assert_eq!(graph.state_of("a1"), Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn corrupt_guards_post_a_comment_and_write_nothing() {
        let forge = InMemoryForge::new();
        // Two end sentinels.
        forge.add_issue(
            100,
            "Wave coordination",
            &format!("{}\n{}\n", pinned::render("{}"), pinned::GUARD_END),
            false,
        );
        seed_clean_task(&forge, 1, 10, "sha-1");
        seed_clean_task(&forge, 2, 11, "sha-2");

        let coordinator = coordinator(&forge);
        let err = coordinator
            .dispatch(ForgeEvent::Manual {
                command: "check".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WaveError::GuardsMissing(_)));

        let comments = forge.comments(100);
        assert!(comments
            .iter()
            .any(|c| c.body.contains("coordination failed")));
        // Body untouched.
        let body = forge.get_issue(100).await.unwrap().body;
        assert!(body.contains(&format!("{}\n", pinned::GUARD_END)));
    }

    #[tokio::test]
    async fn untracked_issue_events_are_noops() {
        let forge = InMemoryForge::new();
        seed_coordination_issue(&forge);

        let coordinator = coordinator(&forge);
        let outcome = coordinator
            .dispatch(ForgeEvent::IssueClosed { number: 999 })
            .await
            .unwrap();
        assert!(!outcome.state_written);
        assert!(outcome.gate.is_none());
        assert!(forge.check_runs().is_empty());
    }

    #[tokio::test]
    async fn push_to_feature_branch_is_a_noop() {
        let forge = InMemoryForge::new();
        seed_coordination_issue(&forge);

        let coordinator = coordinator(&forge);
        let outcome = coordinator
            .dispatch(ForgeEvent::Push {
                ref_name: "refs/heads/feature-x".to_string(),
            })
            .await
            .unwrap();
        assert!(outcome.gate.is_none());
    }

    #[tokio::test]
    async fn slash_comments_are_observed_but_not_executed() {
        let forge = InMemoryForge::new();
        seed_coordination_issue(&forge);

        let coordinator = coordinator(&forge);
        let outcome = coordinator
            .dispatch(ForgeEvent::IssueComment {
                number: 100,
                comment: "/wave status".to_string(),
            })
            .await
            .unwrap();
        assert!(outcome.gate.is_none());
        assert!(!outcome.state_written);
    }
}
