//! End-to-end coordination scenarios
//!
//! Each module drives the full kernel (validator → deployment gate →
//! wave gate → persistence → announcement) against the in-memory
//! forge and asserts on the forge objects the kernel wrote.

mod common;

use common::*;
use waveops_engine::config::PlanDocument;
use waveops_engine::coordinator::ForgeEvent;
use waveops_engine::pinned;
use waveops_engine::state::{TeamStatus, WaveState};
use waveops_forge::{CheckRunStatus, DeploymentState, ForgeClient, InMemoryForge};

mod linear_chain {
    use super::*;
    use waveops_engine::graph::TaskState;

    fn plan() -> PlanDocument {
        PlanDocument::from_json(
            r#"{
                "plan": "chain",
                "tasks": [
                    {"id": "a", "title": "A", "wave": 1, "team": "team-a", "issue": 1},
                    {"id": "b", "title": "B", "wave": 1, "team": "team-b", "depends_on": ["a"], "issue": 2},
                    {"id": "c", "title": "C", "wave": 1, "team": "team-c", "depends_on": ["b"], "issue": 3}
                ]
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn merging_the_first_pr_unlocks_only_the_next_task() {
        let forge = InMemoryForge::new();
        seed_coordination_issue(&forge);
        seed_clean_task(&forge, 1, 10, "sha-a");
        forge.add_issue(2, "issue 2", "", false);
        forge.add_issue(3, "issue 3", "", false);

        let coordinator = coordinator(&forge, plan(), 1);
        let outcome = coordinator
            .dispatch(ForgeEvent::PullRequestMerged { number: 10 })
            .await
            .unwrap();

        // A completed, B newly eligible and scheduled, C untouched.
        let graph = coordinator.graph_snapshot().await;
        assert_eq!(graph.state_of("a"), Some(TaskState::Completed));
        assert_eq!(graph.state_of("b"), Some(TaskState::Ready));
        assert_eq!(graph.state_of("c"), Some(TaskState::Waiting));

        // The wave stays open with an in-progress check run.
        let gate = outcome.gate.unwrap();
        assert!(!gate.status.all_teams_ready);
        assert!(!gate.state.all_ready);
        assert_eq!(gate.state.teams["team-a"].status, TeamStatus::Ready);
        let last_run = forge.check_runs().pop().unwrap();
        assert_eq!(last_run.status, CheckRunStatus::InProgress);
        assert_eq!(announcement_count(&forge), 0);
    }
}

mod diamond {
    use super::*;
    use waveops_engine::graph::TaskState;

    #[tokio::test]
    async fn join_node_waits_for_both_arms() {
        let plan = PlanDocument::from_json(
            r#"{
                "plan": "diamond",
                "tasks": [
                    {"id": "a", "title": "A", "wave": 1, "team": "alpha", "issue": 1},
                    {"id": "b", "title": "B", "wave": 1, "team": "alpha", "depends_on": ["a"], "issue": 2},
                    {"id": "c", "title": "C", "wave": 1, "team": "beta", "depends_on": ["a"], "issue": 3},
                    {"id": "d", "title": "D", "wave": 1, "team": "beta", "depends_on": ["b", "c"], "issue": 4}
                ]
            }"#,
        )
        .unwrap();
        let mut graph = plan.graph().unwrap();

        let eligible = graph.advance_to_completed("a").unwrap();
        assert_eq!(eligible, vec!["b".to_string(), "c".to_string()]);

        // Only one arm finished: the join stays ineligible.
        let eligible = graph.advance_to_completed("b").unwrap();
        assert!(eligible.is_empty());
        assert_eq!(graph.state_of("d"), Some(TaskState::Waiting));

        let eligible = graph.advance_to_completed("c").unwrap();
        assert_eq!(eligible, vec!["d".to_string()]);
    }
}

mod blocked_team {
    use super::*;

    fn plan() -> PlanDocument {
        PlanDocument::from_json(
            r#"{
                "plan": "two-teams",
                "tasks": [
                    {"id": "a1", "title": "API", "wave": 2, "team": "alpha", "issue": 1},
                    {"id": "b7", "title": "Infra", "wave": 2, "team": "beta", "issue": 2}
                ]
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failing_ci_shows_up_in_the_deployment_record() {
        let forge = InMemoryForge::new();
        seed_coordination_issue(&forge);
        seed_clean_task(&forge, 1, 10, "sha-a");
        seed_failing_ci_task(&forge, 2, 11, "sha-b");

        let coordinator = coordinator(&forge, plan(), 2);
        let outcome = coordinator
            .dispatch(ForgeEvent::Manual {
                command: "check".to_string(),
            })
            .await
            .unwrap();

        let beta_record = forge
            .deployments()
            .into_iter()
            .find(|d| d.payload["team"] == "beta")
            .unwrap();
        assert_eq!(beta_record.environment, "wave-2-ready");
        assert_eq!(beta_record.state, DeploymentState::Failure);
        assert!(beta_record.description.contains("b7"));

        let last_run = forge.check_runs().pop().unwrap();
        assert_eq!(last_run.status, CheckRunStatus::InProgress);
        assert!(last_run.summary.contains("beta: b7"));

        let gate = outcome.gate.unwrap();
        assert_eq!(gate.state.teams["beta"].status, TeamStatus::Blocked);
        assert!(gate.state.teams["beta"]
            .reason
            .as_deref()
            .unwrap()
            .contains("b7"));
    }
}

mod flip_to_complete {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use waveops_engine::clock::{Clock, SysClock};
    use waveops_engine::config::{TaskRef, TeamPlan, WaveConfig};
    use waveops_engine::deploy::DeploymentGate;
    use waveops_engine::gate::{CheckConfig, WaveGate};
    use waveops_engine::validator::TaskValidator;

    fn plan() -> PlanDocument {
        PlanDocument::from_json(
            r#"{
                "plan": "finale",
                "tasks": [
                    {"id": "a1", "title": "API", "wave": 1, "team": "alpha", "issue": 1},
                    {"id": "b1", "title": "Infra", "wave": 1, "team": "beta", "issue": 2}
                ]
            }"#,
        )
        .unwrap()
    }

    fn seed_ready_wave(forge: &InMemoryForge) {
        seed_coordination_issue(forge);
        seed_clean_task(forge, 1, 10, "sha-a");
        seed_clean_task(forge, 2, 11, "sha-b");
    }

    #[tokio::test]
    async fn three_parallel_dispatches_announce_once() {
        let forge = InMemoryForge::new();
        seed_ready_wave(&forge);
        forge.set_latency(Duration::from_millis(2));

        let coordinator = coordinator(&forge, plan(), 1);
        let event = || ForgeEvent::Manual {
            command: "check".to_string(),
        };
        let (r1, r2, r3) = tokio::join!(
            coordinator.dispatch(event()),
            coordinator.dispatch(event()),
            coordinator.dispatch(event()),
        );
        r1.unwrap();
        r2.unwrap();
        r3.unwrap();

        assert_eq!(announcement_count(&forge), 1);

        // A later event sees the persisted all-ready state and stays quiet.
        coordinator.dispatch(event()).await.unwrap();
        assert_eq!(announcement_count(&forge), 1);

        let body = forge.get_issue(COORDINATION_ISSUE).await.unwrap().body;
        let state = WaveState::from_json(&pinned::extract(&body).unwrap()).unwrap();
        assert!(state.all_ready);
    }

    #[tokio::test]
    async fn parallel_gate_calls_share_one_evaluation() {
        let forge = InMemoryForge::new();
        seed_ready_wave(&forge);
        forge.set_latency(Duration::from_millis(2));

        let forge_arc = Arc::new(forge.clone());
        let clock: Arc<dyn Clock> = Arc::new(SysClock);
        let deploy = Arc::new(DeploymentGate::new(
            forge_arc.clone(),
            TaskValidator::new(forge_arc.clone(), 4),
            clock.clone(),
        ));
        let gate = WaveGate::new(deploy, forge_arc, clock);

        let mut teams = std::collections::BTreeMap::new();
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
            plan: "finale".to_string(),
            wave: 1,
            tz: "UTC".to_string(),
            teams,
        };
        let check = CheckConfig::new("finale");

        let (r1, r2, r3) = tokio::join!(
            gate.check_wave_gate(&check, &config, None),
            gate.check_wave_gate(&check, &config, None),
            gate.check_wave_gate(&check, &config, None),
        );
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();
        let r3 = r3.unwrap();

        // One shared evaluation: one check run, identical results.
        assert_eq!(forge.check_runs().len(), 1);
        assert_eq!(r1.check_run.id, r2.check_run.id);
        assert_eq!(r2.check_run.id, r3.check_run.id);
        assert_eq!(r1.announcement, r2.announcement);
        assert!(r1.announcement.is_some());
    }
}

mod corrupted_block {
    use super::*;
    use waveops_engine::error::WaveError;

    #[tokio::test]
    async fn duplicated_sentinel_aborts_before_any_write() {
        let forge = InMemoryForge::new();
        forge.add_issue(
            COORDINATION_ISSUE,
            "Wave coordination",
            &format!("{}\n{}\n", pinned::render("{}"), pinned::GUARD_END),
            false,
        );
        seed_clean_task(&forge, 1, 10, "sha-a");

        let plan = PlanDocument::from_json(
            r#"{
                "plan": "corrupt",
                "tasks": [
                    {"id": "a1", "title": "API", "wave": 1, "team": "alpha", "issue": 1}
                ]
            }"#,
        )
        .unwrap();
        let coordinator = coordinator(&forge, plan, 1);

        let err = coordinator
            .dispatch(ForgeEvent::Manual {
                command: "check".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WaveError::GuardsMissing(_)));

        // Nothing was projected to the forge, and the user was told.
        assert!(forge.deployments().is_empty());
        assert!(forge.check_runs().is_empty());
        assert!(forge
            .comments(COORDINATION_ISSUE)
            .iter()
            .any(|c| c.body.contains("coordination failed")));
    }
}
