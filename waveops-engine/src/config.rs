//! Configuration loading and wave plans
//!
//! Loading hierarchy: explicit value > environment > default. The
//! forge token and repository slug have no default; their absence is
//! fatal at startup.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WaveError, WaveResult};
use crate::graph::{DependencyGraph, Task};
use crate::stealing::{StealingConfig, TeamCapacity};

/// A task reference inside a wave config: plan task id + tracking issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    /// Task id
    pub task: String,
    /// Tracking issue number
    pub issue: u64,
}

/// One team's slice of a wave
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamPlan {
    /// Tasks the team owns in this wave
    pub tasks: Vec<TaskRef>,
}

impl TeamPlan {
    /// (task id, issue) pairs for the validator
    pub fn task_pairs(&self) -> Vec<(String, u64)> {
        self.tasks
            .iter()
            .map(|t| (t.task.clone(), t.issue))
            .collect()
    }
}

/// Everything the gates need to evaluate one wave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveConfig {
    /// Plan name
    pub plan: String,
    /// Wave number
    pub wave: u32,
    /// Timezone tag for rendering
    pub tz: String,
    /// Team id → owned tasks
    pub teams: BTreeMap<String, TeamPlan>,
}

fn default_tz() -> String {
    "UTC".to_string()
}

/// A plan task: the graph task plus its tracking issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    /// Graph-level task definition
    #[serde(flatten)]
    pub task: Task,
    /// Tracking issue number
    pub issue: u64,
}

/// The on-disk plan document
///
/// Serde enforces shape; schema validation beyond that is out of
/// scope for the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    /// Plan name
    pub plan: String,
    /// Timezone tag
    #[serde(default = "default_tz")]
    pub tz: String,
    /// Every task across all waves
    pub tasks: Vec<PlanTask>,
    /// Team capacities for the work-stealing engine
    #[serde(default)]
    pub capacities: Vec<TeamCapacity>,
}

impl PlanDocument {
    /// Parse a plan from JSON
    pub fn from_json(json: &str) -> WaveResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| WaveError::Configuration(format!("invalid plan document: {}", e)))
    }

    /// Load a plan from disk
    pub fn load(path: &Path) -> WaveResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WaveError::Configuration(format!("cannot read plan {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Build the dependency graph over every task in the plan
    pub fn graph(&self) -> WaveResult<DependencyGraph> {
        DependencyGraph::build(self.tasks.iter().map(|t| t.task.clone()).collect())
    }

    /// The per-team wave config for one wave
    ///
    /// Teams with no tasks in the wave do not participate in its gate.
    pub fn wave_config(&self, wave: u32) -> WaveConfig {
        let mut teams: BTreeMap<String, TeamPlan> = BTreeMap::new();
        for plan_task in self.tasks.iter().filter(|t| t.task.wave == wave) {
            teams
                .entry(plan_task.task.team.clone())
                .or_default()
                .tasks
                .push(TaskRef {
                    task: plan_task.task.id.clone(),
                    issue: plan_task.issue,
                });
        }
        WaveConfig {
            plan: self.plan.clone(),
            wave,
            tz: self.tz.clone(),
            teams,
        }
    }

    /// Tracking issue for a task, if the plan knows it
    pub fn issue_for(&self, task_id: &str) -> Option<u64> {
        self.tasks
            .iter()
            .find(|t| t.task.id == task_id)
            .map(|t| t.issue)
    }

    /// Task ids whose tracking issue matches
    pub fn tasks_for_issue(&self, issue: u64) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.issue == issue)
            .map(|t| t.task.id.clone())
            .collect()
    }
}

/// Coordinator runtime configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Forge auth token
    pub token: String,
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Issue whose body carries the pinned wave state
    pub coordination_issue: u64,
    /// Current wave number
    pub wave: u32,
    /// End-to-end deadline for one coordination cycle
    pub cycle_deadline: Duration,
    /// Fan-out bound for the validator
    pub validator_parallelism: usize,
    /// Work-stealing thresholds
    pub stealing: StealingConfig,
}

impl CoordinatorConfig {
    /// Assemble configuration from the environment
    ///
    /// `WAVEOPS_TOKEN` (falling back to `GITHUB_TOKEN`) and
    /// `WAVEOPS_REPO` (`owner/repo`) are required; everything else has
    /// a default overridable via `WAVEOPS_*` variables.
    pub fn from_env() -> WaveResult<Self> {
        let token = std::env::var("WAVEOPS_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .map_err(|_| {
                WaveError::Configuration(
                    "forge token missing: set WAVEOPS_TOKEN or GITHUB_TOKEN".to_string(),
                )
            })?;
        let slug = std::env::var("WAVEOPS_REPO").map_err(|_| {
            WaveError::Configuration("repository missing: set WAVEOPS_REPO=owner/repo".to_string())
        })?;
        let (owner, repo) = parse_slug(&slug)?;

        let coordination_issue = env_parse("WAVEOPS_ISSUE", 0u64)?;
        let wave = env_parse("WAVEOPS_WAVE", 1u32)?;
        let deadline_secs = env_parse("WAVEOPS_DEADLINE_SECS", 600u64)?;
        let validator_parallelism = env_parse("WAVEOPS_PARALLELISM", 8usize)?;

        Ok(Self {
            token,
            owner,
            repo,
            coordination_issue,
            wave,
            cycle_deadline: Duration::from_secs(deadline_secs),
            validator_parallelism,
            stealing: StealingConfig::default(),
        })
    }
}

fn parse_slug(slug: &str) -> WaveResult<(String, String)> {
    match slug.split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(WaveError::Configuration(format!(
            "invalid repository slug {:?}, expected owner/repo",
            slug
        ))),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> WaveResult<T> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| {
            WaveError::Configuration(format!("invalid value for {}: {:?}", name, value))
        }),
        Err(_) => Ok(default),
    }
}
