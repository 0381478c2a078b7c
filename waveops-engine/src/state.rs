//! Wave state
//!
//! The in-memory wave document persisted into the pinned block of the
//! coordination issue. Serialisation is deterministic: struct field
//! order fixes the root and team key order (plan, wave, tz, teams,
//! all_ready, updated_at; status, at, reason, tasks), and ordered
//! collections fix everything else, so two equal states always produce
//! byte-identical JSON. Idempotent issue edits depend on this.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WaveError, WaveResult};

/// Team readiness status within a wave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    /// Every task validated clean
    Ready,
    /// Work still moving
    InProgress,
    /// Stuck; `reason` explains why
    Blocked,
}

/// Per-team slice of the wave document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    /// Readiness status
    pub status: TeamStatus,
    /// When the status last changed
    pub at: DateTime<Utc>,
    /// Human-readable blocking reason, present iff blocked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Task ids owned by the team in this wave
    pub tasks: BTreeSet<String>,
}

impl TeamState {
    /// Build a team entry; `reason` is retained only when blocked
    pub fn new(
        status: TeamStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
        tasks: BTreeSet<String>,
    ) -> Self {
        Self {
            status,
            at,
            reason: reason.filter(|_| status == TeamStatus::Blocked),
            tasks,
        }
    }
}

/// The wave document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveState {
    /// Plan name
    pub plan: String,
    /// Wave number, 1-based
    pub wave: u32,
    /// Timezone tag for human-facing rendering
    pub tz: String,
    /// Per-team state, keyed by team id
    pub teams: BTreeMap<String, TeamState>,
    /// Conjunction of per-team `status == ready`
    pub all_ready: bool,
    /// When the document last changed
    pub updated_at: DateTime<Utc>,
}

impl WaveState {
    /// Build a wave document; `all_ready` is derived, never trusted
    pub fn new(
        plan: impl Into<String>,
        wave: u32,
        tz: impl Into<String>,
        teams: BTreeMap<String, TeamState>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let all_ready = Self::compute_all_ready(&teams);
        Self {
            plan: plan.into(),
            wave,
            tz: tz.into(),
            teams,
            all_ready,
            updated_at,
        }
    }

    fn compute_all_ready(teams: &BTreeMap<String, TeamState>) -> bool {
        !teams.is_empty() && teams.values().all(|t| t.status == TeamStatus::Ready)
    }

    /// Fresh snapshot with one team's status changed
    ///
    /// The team timestamp and `updated_at` are refreshed to `now`,
    /// `reason` is retained iff the new status is blocked, and
    /// `all_ready` is recomputed. Unknown team is a programmer error
    /// and raises [`WaveError::TeamNotFound`].
    pub fn update_team_status(
        &self,
        team: &str,
        status: TeamStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> WaveResult<WaveState> {
        let mut next = self.clone();
        let entry = next
            .teams
            .get_mut(team)
            .ok_or_else(|| WaveError::TeamNotFound(team.to_string()))?;
        entry.status = status;
        entry.at = now;
        entry.reason = reason.filter(|_| status == TeamStatus::Blocked);
        next.all_ready = Self::compute_all_ready(&next.teams);
        next.updated_at = now;
        Ok(next)
    }

    /// Teams currently ready
    pub fn ready_teams(&self) -> BTreeSet<String> {
        self.teams
            .iter()
            .filter(|(_, t)| t.status == TeamStatus::Ready)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Teams currently blocked
    pub fn blocked_teams(&self) -> BTreeSet<String> {
        self.teams
            .iter()
            .filter(|(_, t)| t.status == TeamStatus::Blocked)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Deterministic JSON for the pinned block
    pub fn to_canonical_json(&self) -> WaveResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a wave document from pinned JSON
    pub fn from_json(json: &str) -> WaveResult<WaveState> {
        Ok(serde_json::from_str(json)?)
    }
}
