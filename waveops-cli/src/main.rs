//! WaveOps CLI
//!
//! Thin wrapper over the coordinator's event-dispatch interface: one
//! invocation dispatches exactly one forge event and exits non-zero
//! when the coordination cycle fails.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing::info;

use waveops_engine::clock::{Clock, MonotoneClock};
use waveops_engine::config::{CoordinatorConfig, PlanDocument};
use waveops_engine::coordinator::{Coordinator, ForgeEvent};
use waveops_forge::{ForgeClient, RestForgeClient, RestForgeConfig};

/// Forge event classes the dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventKind {
    /// Coordination or task issue changed
    Issue,
    /// Comment added to an issue
    Comment,
    /// Pull request merged
    Pr,
    /// Pull request review submitted
    PrReview,
    /// Push landed on a ref
    Push,
    /// Explicit operator trigger
    Manual,
}

#[derive(Parser)]
#[command(name = "waveops")]
#[command(about = "Wave-based multi-team delivery coordination")]
#[command(version)]
struct Cli {
    /// Event class to dispatch
    #[arg(long, value_enum)]
    event: EventKind,

    /// Issue number, for issue and comment events
    #[arg(long)]
    issue: Option<u64>,

    /// Pull request number, for pr events
    #[arg(long)]
    pr: Option<u64>,

    /// Ref name, for push events
    #[arg(long = "ref")]
    ref_name: Option<String>,

    /// Command text, for comment and manual events
    #[arg(long)]
    command: Option<String>,

    /// Plan document path
    #[arg(long, default_value = "waveops-plan.json")]
    plan: PathBuf,

    /// Wave number override (defaults to WAVEOPS_WAVE)
    #[arg(long)]
    wave: Option<u32>,
}

impl Cli {
    fn to_event(&self) -> anyhow::Result<ForgeEvent> {
        match self.event {
            EventKind::Issue => {
                let number = self.issue.context("--issue is required for issue events")?;
                Ok(ForgeEvent::IssueEdited { number })
            }
            EventKind::Comment => {
                let number = self
                    .issue
                    .context("--issue is required for comment events")?;
                Ok(ForgeEvent::IssueComment {
                    number,
                    comment: self.command.clone().unwrap_or_default(),
                })
            }
            EventKind::Pr | EventKind::PrReview => {
                let number = self.pr.context("--pr is required for pr events")?;
                Ok(ForgeEvent::PullRequestMerged { number })
            }
            EventKind::Push => Ok(ForgeEvent::Push {
                ref_name: self.ref_name.clone().unwrap_or_else(|| "main".to_string()),
            }),
            EventKind::Manual => Ok(ForgeEvent::Manual {
                command: self.command.clone().unwrap_or_else(|| "check".to_string()),
            }),
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = CoordinatorConfig::from_env().context("configuration")?;
    if let Some(wave) = cli.wave {
        config.wave = wave;
    }
    if config.coordination_issue == 0 {
        bail!("coordination issue missing: set WAVEOPS_ISSUE");
    }

    let plan = PlanDocument::load(&cli.plan).context("plan document")?;
    let event = cli.to_event()?;

    let forge = Arc::new(
        RestForgeClient::new(RestForgeConfig::new(
            config.token.clone(),
            config.owner.clone(),
            config.repo.clone(),
        ))
        .context("forge client")?,
    );
    match forge.get_rate_limit().await {
        Ok(quota) => info!(
            remaining = quota.remaining,
            limit = quota.limit,
            "forge quota"
        ),
        Err(e) => tracing::debug!(error = %e, "could not read forge quota"),
    }

    let clock: Arc<dyn Clock> = Arc::new(MonotoneClock::system());
    let coordinator =
        Coordinator::new(forge, plan, config, clock).context("coordinator setup")?;

    let outcome = coordinator.dispatch(event).await?;

    info!(
        event = %outcome.event,
        state_written = outcome.state_written,
        "cycle finished"
    );
    if let Some(gate) = &outcome.gate {
        info!(
            all_teams_ready = gate.status.all_teams_ready,
            ready = gate.status.ready_teams.len(),
            blocked = gate.status.blocked_teams.len(),
            "wave gate evaluated"
        );
        if let Some(announcement) = &gate.announcement {
            println!("{}", announcement);
        }
    }
    if let Some(rebalance) = &outcome.rebalance {
        info!(
            transfers = rebalance.transfers.len(),
            improvement = rebalance.utilization_improvement,
            "rebalancing summary"
        );
        for recommendation in &rebalance.recommendations {
            println!("recommendation: {}", recommendation);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        eprintln!("waveops: {:#}", e);
        std::process::exit(1);
    }
}
