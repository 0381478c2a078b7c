//! Shared fixtures for coordination scenarios

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use waveops_engine::clock::SysClock;
use waveops_engine::config::{CoordinatorConfig, PlanDocument};
use waveops_engine::coordinator::Coordinator;
use waveops_engine::pinned;
use waveops_forge::{CheckState, InMemoryForge};

/// Coordination issue number used by every scenario
pub const COORDINATION_ISSUE: u64 = 100;

/// Coordinator config pointed at the fixture issue
pub fn config(wave: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        token: "tok".to_string(),
        owner: "acme".to_string(),
        repo: "delivery".to_string(),
        coordination_issue: COORDINATION_ISSUE,
        wave,
        cycle_deadline: Duration::from_secs(30),
        validator_parallelism: 4,
        stealing: Default::default(),
    }
}

/// Build a coordinator over the fake forge
pub fn coordinator(
    forge: &InMemoryForge,
    plan: PlanDocument,
    wave: u32,
) -> Coordinator<InMemoryForge> {
    Coordinator::new(
        Arc::new(forge.clone()),
        plan,
        config(wave),
        Arc::new(SysClock),
    )
    .unwrap()
}

/// Seed the coordination issue with an empty pinned block
pub fn seed_coordination_issue(forge: &InMemoryForge) {
    forge.add_issue(
        COORDINATION_ISSUE,
        "Wave coordination",
        &format!("# Release plan\n\n{}\n\nNotes live here.\n", pinned::render("")),
        false,
    );
}

/// Seed a task whose issue is closed by a merged, green pull request
pub fn seed_clean_task(forge: &InMemoryForge, issue: u64, pr: u64, sha: &str) {
    forge.add_issue(issue, &format!("issue {}", issue), "", true);
    forge.add_pull(pr, true, Some(sha));
    forge.link_closing_pull(issue, pr);
    forge.set_commit_checks(sha, CheckState::Success, 2, 0);
}

/// Seed a task whose merge commit has red checks
pub fn seed_failing_ci_task(forge: &InMemoryForge, issue: u64, pr: u64, sha: &str) {
    forge.add_issue(issue, &format!("issue {}", issue), "", true);
    forge.add_pull(pr, true, Some(sha));
    forge.link_closing_pull(issue, pr);
    forge.set_commit_checks(sha, CheckState::Failure, 3, 1);
}

/// Count announcement comments on the coordination issue
pub fn announcement_count(forge: &InMemoryForge) -> usize {
    forge
        .comments(COORDINATION_ISSUE)
        .iter()
        .filter(|c| c.body.starts_with("**WAVE"))
        .count()
}
