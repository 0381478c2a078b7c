//! Work-stealing engine
//!
//! Rebalances not-yet-started work from overloaded teams onto
//! under-utilised teams with adequate skills. Candidate selection is
//! CPU-bound and runs on in-memory snapshots; only transfer execution
//! touches collaborators. Transfers are independent: a failed one is
//! recorded and never rolls back the ones before it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{WaveResult, WorkStealingError};
use crate::graph::{DependencyGraph, TaskState};

/// Flat cost charged to every transfer on top of coordination overhead
const BASE_TRANSFER_COST: f64 = 0.05;

fn default_velocity() -> f64 {
    1.0
}

/// A team's capacity and skill vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamCapacity {
    /// Team id
    pub team: String,
    /// Maximum concurrent tasks
    pub max_concurrent: u32,
    /// Throughput multiplier
    #[serde(default = "default_velocity")]
    pub velocity: f64,
    /// Skill → proficiency in [0, 1]
    #[serde(default)]
    pub skills: BTreeMap<String, f64>,
}

/// A team's load snapshot, refreshed each coordination cycle
#[derive(Debug, Clone, PartialEq)]
pub struct TeamUtilization {
    /// Team id
    pub team: String,
    /// Unfinished tasks currently assigned
    pub active: u32,
    /// Maximum concurrent tasks
    pub capacity: u32,
    /// Throughput multiplier
    pub velocity: f64,
}

impl TeamUtilization {
    /// Load relative to capacity; can exceed 1.0
    pub fn utilization(&self) -> f64 {
        f64::from(self.active) / f64::from(self.capacity.max(1))
    }

    /// Snapshot every team's load from the graph
    pub fn from_graph(graph: &DependencyGraph, capacities: &[TeamCapacity]) -> Vec<Self> {
        capacities
            .iter()
            .map(|cap| {
                let active = graph
                    .tasks_for_team(&cap.team)
                    .iter()
                    .filter(|n| {
                        !matches!(n.state, TaskState::Completed | TaskState::Failed)
                    })
                    .count() as u32;
                Self {
                    team: cap.team.clone(),
                    active,
                    capacity: cap.max_concurrent,
                    velocity: cap.velocity,
                }
            })
            .collect()
    }
}

/// Thresholds governing the rebalancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StealingConfig {
    /// Load above which a team becomes a sender, below which a receiver
    pub utilization_threshold: f64,
    /// Minimum receiver proficiency on the task's best skill
    pub skill_match_threshold: f64,
    /// Floor on `expected_benefit - transfer_cost`
    pub minimum_transfer_benefit: f64,
    /// Cost weight for cross-team coordination
    pub coordination_overhead: f64,
    /// Cap on executed transfers per wave
    pub max_transfers_per_wave: u32,
    /// Emergency mode: critical-path tasks become transferable
    pub emergency: bool,
}

impl Default for StealingConfig {
    fn default() -> Self {
        Self {
            utilization_threshold: 0.8,
            skill_match_threshold: 0.6,
            minimum_transfer_benefit: 0.1,
            coordination_overhead: 0.1,
            max_transfers_per_wave: 3,
            emergency: false,
        }
    }
}

impl StealingConfig {
    /// Reject unusable threshold combinations
    pub fn validate(&self) -> Result<(), WorkStealingError> {
        if !(0.0..=2.0).contains(&self.utilization_threshold) {
            return Err(WorkStealingError::InvalidConfiguration(format!(
                "utilization_threshold {} out of range",
                self.utilization_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.skill_match_threshold) {
            return Err(WorkStealingError::InvalidConfiguration(format!(
                "skill_match_threshold {} out of range",
                self.skill_match_threshold
            )));
        }
        if self.max_transfers_per_wave == 0 {
            return Err(WorkStealingError::InvalidConfiguration(
                "max_transfers_per_wave must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A scored (task, receiver) proposal
#[derive(Debug, Clone, PartialEq)]
pub struct TransferCandidate {
    /// Task that would move
    pub task: String,
    /// Sending team
    pub from: String,
    /// Receiving team
    pub to: String,
    /// Best receiver proficiency among the task's required skills
    pub skill_match: f64,
    /// Flat cost plus coordination overhead
    pub transfer_cost: f64,
    /// Criticality and blocking weight in [0, 1]
    pub dependency_risk: f64,
    /// Sender delay reduction minus receiver delay increase,
    /// discounted by dependency risk
    pub expected_benefit: f64,
}

/// An executed transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Moved task
    pub task: String,
    /// Sending team
    pub from: String,
    /// Receiving team
    pub to: String,
    /// When the transfer committed
    pub at: DateTime<Utc>,
}

/// Outcome of one rebalancing pass
#[derive(Debug, Clone, Default)]
pub struct RebalanceSummary {
    /// Transfers executed, in commit order
    pub transfers: Vec<TransferRecord>,
    /// Reduction in utilisation spread (max - min) across teams
    pub utilization_improvement: f64,
    /// Textual notes for transfers considered but not taken
    pub recommendations: Vec<String>,
}

/// Sink for transfer notifications to both teams
#[async_trait]
pub trait TransferNotifier: Send + Sync {
    /// Tell sender and receiver a task moved
    async fn notify_transfer(&self, record: &TransferRecord) -> WaveResult<()>;
}

/// Notifier that drops everything; used in tests and dry runs
pub struct SilentNotifier;

#[async_trait]
impl TransferNotifier for SilentNotifier {
    async fn notify_transfer(&self, _record: &TransferRecord) -> WaveResult<()> {
        Ok(())
    }
}

/// The rebalancer
#[derive(Debug)]
pub struct WorkStealingEngine {
    config: StealingConfig,
}

impl WorkStealingEngine {
    /// Build an engine; the config is validated once here
    pub fn new(config: StealingConfig) -> Result<Self, WorkStealingError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Enumerate and score transfer candidates
    ///
    /// Returns accepted candidates ordered by net benefit descending
    /// (at most one per task, capped at `max_transfers_per_wave`) and
    /// a recommendation line for every pair considered but rejected.
    pub fn propose(
        &self,
        graph: &DependencyGraph,
        utilizations: &[TeamUtilization],
        capacities: &[TeamCapacity],
    ) -> (Vec<TransferCandidate>, Vec<String>) {
        let caps: BTreeMap<&str, &TeamCapacity> =
            capacities.iter().map(|c| (c.team.as_str(), c)).collect();

        let senders: Vec<&TeamUtilization> = utilizations
            .iter()
            .filter(|u| u.utilization() > self.config.utilization_threshold)
            .collect();
        let receivers: Vec<&TeamUtilization> = utilizations
            .iter()
            .filter(|u| u.utilization() < self.config.utilization_threshold)
            .collect();

        let mut candidates = Vec::new();
        let mut recommendations = Vec::new();

        for sender in &senders {
            let movable: Vec<&crate::graph::DependencyNode> = graph
                .tasks_for_team(&sender.team)
                .into_iter()
                .filter(|n| matches!(n.state, TaskState::Waiting | TaskState::Ready))
                .collect();

            for node in movable {
                if let Err(e) = self.transfer_constraints(graph, &node.task.id) {
                    recommendations.push(format!("task {} not transferable: {}", node.task.id, e));
                    continue;
                }

                for receiver in &receivers {
                    if receiver.team == sender.team {
                        continue;
                    }
                    if receiver.active >= receiver.capacity {
                        recommendations.push(format!(
                            "transfer {} {}->{} rejected: insufficient capacity",
                            node.task.id, sender.team, receiver.team
                        ));
                        continue;
                    }

                    let skill_match = skill_match(&node.task.skills, caps.get(receiver.team.as_str()));
                    let transfer_cost = BASE_TRANSFER_COST + self.config.coordination_overhead;
                    let dependency_risk = dependency_risk(node);
                    let expected_benefit =
                        expected_benefit(node.task.effort, sender, receiver, dependency_risk);

                    if skill_match < self.config.skill_match_threshold {
                        recommendations.push(format!(
                            "transfer {} {}->{} rejected: skill match {:.2} below threshold {:.2}",
                            node.task.id,
                            sender.team,
                            receiver.team,
                            skill_match,
                            self.config.skill_match_threshold
                        ));
                        continue;
                    }
                    if expected_benefit - transfer_cost < self.config.minimum_transfer_benefit {
                        recommendations.push(format!(
                            "transfer {} {}->{} rejected: net benefit {:.2} below minimum {:.2}",
                            node.task.id,
                            sender.team,
                            receiver.team,
                            expected_benefit - transfer_cost,
                            self.config.minimum_transfer_benefit
                        ));
                        continue;
                    }

                    candidates.push(TransferCandidate {
                        task: node.task.id.clone(),
                        from: sender.team.clone(),
                        to: receiver.team.clone(),
                        skill_match,
                        transfer_cost,
                        dependency_risk,
                        expected_benefit,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            let net_a = a.expected_benefit - a.transfer_cost;
            let net_b = b.expected_benefit - b.transfer_cost;
            net_b.total_cmp(&net_a).then(a.task.cmp(&b.task))
        });

        // Best receiver per task, receiver headroom, then the per-wave cap.
        let mut headroom: BTreeMap<String, u32> = receivers
            .iter()
            .map(|r| (r.team.clone(), r.capacity.saturating_sub(r.active)))
            .collect();
        let mut seen = std::collections::BTreeSet::new();
        let mut accepted = Vec::new();
        for candidate in candidates {
            if seen.contains(&candidate.task) {
                continue;
            }
            if accepted.len() as u32 >= self.config.max_transfers_per_wave {
                recommendations.push(format!(
                    "transfer {} {}->{} deferred: per-wave transfer cap reached",
                    candidate.task, candidate.from, candidate.to
                ));
                continue;
            }
            match headroom.get_mut(&candidate.to) {
                Some(slots) if *slots > 0 => {
                    *slots -= 1;
                    seen.insert(candidate.task.clone());
                    accepted.push(candidate);
                }
                _ => {
                    recommendations.push(format!(
                        "transfer {} {}->{} rejected: insufficient capacity",
                        candidate.task, candidate.from, candidate.to
                    ));
                }
            }
        }

        (accepted, recommendations)
    }

    /// Execute a rebalancing pass
    pub async fn rebalance(
        &self,
        graph: &mut DependencyGraph,
        utilizations: &[TeamUtilization],
        capacities: &[TeamCapacity],
        notifier: &dyn TransferNotifier,
        now: DateTime<Utc>,
    ) -> RebalanceSummary {
        let (candidates, mut recommendations) = self.propose(graph, utilizations, capacities);
        let spread_before = utilization_spread(utilizations);

        let mut adjusted: BTreeMap<String, TeamUtilization> = utilizations
            .iter()
            .map(|u| (u.team.clone(), u.clone()))
            .collect();
        let mut transfers = Vec::new();

        for candidate in candidates {
            match graph.reassign(&candidate.task, &candidate.to) {
                Ok(()) => {
                    let record = TransferRecord {
                        task: candidate.task.clone(),
                        from: candidate.from.clone(),
                        to: candidate.to.clone(),
                        at: now,
                    };
                    if let Err(e) = notifier.notify_transfer(&record).await {
                        warn!(task = %record.task, error = %e, "transfer notification failed");
                        recommendations
                            .push(format!("notification for task {} failed: {}", record.task, e));
                    }
                    if let Some(u) = adjusted.get_mut(&candidate.from) {
                        u.active = u.active.saturating_sub(1);
                    }
                    if let Some(u) = adjusted.get_mut(&candidate.to) {
                        u.active += 1;
                    }
                    info!(
                        task = %record.task,
                        from = %record.from,
                        to = %record.to,
                        "task transferred"
                    );
                    transfers.push(record);
                }
                Err(e) => {
                    // Independent transfers: record and keep going.
                    recommendations.push(format!(
                        "transfer {} {}->{} failed: {}",
                        candidate.task, candidate.from, candidate.to, e
                    ));
                }
            }
        }

        let spread_after =
            utilization_spread(&adjusted.values().cloned().collect::<Vec<_>>());
        RebalanceSummary {
            transfers,
            utilization_improvement: spread_before - spread_after,
            recommendations,
        }
    }

    /// Manually claim a task for a team
    pub fn claim_task(
        &self,
        graph: &mut DependencyGraph,
        task: &str,
        team: &str,
        utilizations: &[TeamUtilization],
        capacities: &[TeamCapacity],
    ) -> Result<(), WorkStealingError> {
        self.transfer_constraints(graph, task)?;

        let node = graph
            .get(task)
            .ok_or_else(|| WorkStealingError::TransferRejected {
                task: task.to_string(),
                reason: "unknown task".to_string(),
            })?;

        if let Some(util) = utilizations.iter().find(|u| u.team == team) {
            if util.active >= util.capacity {
                return Err(WorkStealingError::InsufficientCapacity {
                    team: team.to_string(),
                    active: util.active,
                    capacity: util.capacity,
                });
            }
        }

        let capacity = capacities.iter().find(|c| c.team == team);
        let score = skill_match(&node.task.skills, capacity.as_ref());
        if score < self.config.skill_match_threshold {
            return Err(WorkStealingError::SkillMismatch {
                task: task.to_string(),
                team: team.to_string(),
                score,
                threshold: self.config.skill_match_threshold,
            });
        }

        graph
            .reassign(task, team)
            .map_err(|e| WorkStealingError::CoordinationFailure(e.to_string()))?;
        info!(task, team, "task claimed");
        Ok(())
    }

    /// Manually release a not-yet-started task back to the pool
    ///
    /// The task stays with its team but drops back to waiting, making
    /// it visible to the next rebalancing pass.
    pub fn release_task(
        &self,
        graph: &mut DependencyGraph,
        task: &str,
        team: &str,
    ) -> Result<(), WorkStealingError> {
        let node = graph
            .get(task)
            .ok_or_else(|| WorkStealingError::TransferRejected {
                task: task.to_string(),
                reason: "unknown task".to_string(),
            })?;
        if node.task.team != team {
            return Err(WorkStealingError::TransferRejected {
                task: task.to_string(),
                reason: format!("owned by {}, not {}", node.task.team, team),
            });
        }
        match node.state {
            TaskState::Waiting => Ok(()),
            TaskState::Ready => graph
                .transition(task, TaskState::Waiting)
                .map_err(|e| WorkStealingError::CoordinationFailure(e.to_string())),
            other => Err(WorkStealingError::TransferRejected {
                task: task.to_string(),
                reason: format!("cannot release task in state {:?}", other),
            }),
        }
    }

    fn transfer_constraints(
        &self,
        graph: &DependencyGraph,
        task: &str,
    ) -> Result<(), WorkStealingError> {
        let node = graph
            .get(task)
            .ok_or_else(|| WorkStealingError::TransferRejected {
                task: task.to_string(),
                reason: "unknown task".to_string(),
            })?;

        if !matches!(node.state, TaskState::Waiting | TaskState::Ready) {
            return Err(WorkStealingError::TransferRejected {
                task: task.to_string(),
                reason: format!("already started ({:?})", node.state),
            });
        }

        let pending: Vec<&str> = node
            .depends_on
            .iter()
            .filter(|dep| {
                !matches!(
                    graph.state_of(dep),
                    Some(TaskState::Completed) | Some(TaskState::InProgress)
                )
            })
            .map(|d| d.as_str())
            .collect();
        if !pending.is_empty() {
            return Err(WorkStealingError::DependencyViolation {
                task: task.to_string(),
                reason: format!("dependencies not startable: {}", pending.join(", ")),
            });
        }

        if (node.task.critical || node.critical_path) && !self.config.emergency {
            return Err(WorkStealingError::TransferRejected {
                task: task.to_string(),
                reason: "critical-path task; transferable only in emergency mode".to_string(),
            });
        }
        Ok(())
    }
}

fn skill_match(required: &[String], capacity: Option<&&TeamCapacity>) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let Some(capacity) = capacity else {
        return 0.0;
    };
    required
        .iter()
        .filter_map(|skill| capacity.skills.get(skill))
        .fold(0.0, |best: f64, p| best.max(*p))
}

fn dependency_risk(node: &crate::graph::DependencyNode) -> f64 {
    let critical = if node.task.critical || node.critical_path {
        0.5
    } else {
        0.0
    };
    let blocking = (node.blocking_factor as f64 * 0.05).min(0.5);
    critical + blocking
}

fn expected_benefit(
    effort: f64,
    sender: &TeamUtilization,
    receiver: &TeamUtilization,
    risk: f64,
) -> f64 {
    let sender_relief =
        effort * sender.utilization() / (f64::from(sender.capacity.max(1)) * sender.velocity.max(0.1));
    let receiver_drag = effort * receiver.utilization()
        / (f64::from(receiver.capacity.max(1)) * receiver.velocity.max(0.1));
    (sender_relief - receiver_drag) * (1.0 - risk)
}

fn utilization_spread(utilizations: &[TeamUtilization]) -> f64 {
    let mut max = f64::MIN;
    let mut min = f64::MAX;
    for u in utilizations {
        let load = u.utilization();
        max = max.max(load);
        min = min.min(load);
    }
    if utilizations.is_empty() {
        0.0
    } else {
        max - min
    }
}
