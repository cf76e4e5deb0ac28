//! Monitoring simulator
//!
//! Replays one of the reference supervisor scenarios against the loopback
//! call platform and prints the resulting audit trail:
//!
//! - `contention`: two supervisors race to listen; the loser takes over after
//!   the owner ignores the request
//! - `transfer`: a listening session survives an assisted transfer
//! - `new-call`: a session ends with its call and does not follow the agent
//!   to the next one

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing::info;

use rvoip_call_monitor::logging::parse_log_level;
use rvoip_call_monitor::prelude::*;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Concurrent start, then takeover by timeout
    Contention,
    /// Listen session across an assisted transfer
    Transfer,
    /// Call ends, agent takes a new call
    NewCall,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervisor call-monitoring simulator", long_about = None)]
struct Args {
    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "contention")]
    scenario: Scenario,

    /// Configuration file (toml, yaml or json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the takeover grace period in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the audit trail as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(LoggingConfig::new(parse_log_level(&args.log_level)?, "monitor-sim"))?;

    let mut config = MonitorConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(grace_ms) = args.grace_ms {
        config = config.with_takeover_grace_period(Duration::from_millis(grace_ms));
    }
    config.validate()?;

    let registry = AgentCallRegistry::new();
    let platform = LoopbackCallPlatform::new(registry.clone(), vec![AgentId::from("agent-a")], "support");
    let coordinator = MonitoringCoordinator::new(config, registry)?;
    let mut events = coordinator.subscribe();

    info!("Running scenario {:?}", args.scenario);
    match args.scenario {
        Scenario::Contention => contention(&coordinator, &platform).await?,
        Scenario::Transfer => transfer(&coordinator, &platform).await?,
        Scenario::NewCall => new_call(&coordinator, &platform).await?,
    }

    println!("\n=== Audit trail ===");
    for event in events.drain() {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            println!("{}", describe(&event));
        }
    }
    Ok(())
}

async fn talking_call(platform: &LoopbackCallPlatform) -> anyhow::Result<CallId> {
    let call_id = platform.create_call("+15550100").await?;
    platform.answer_call(&call_id).await?;
    Ok(call_id)
}

async fn contention(coordinator: &MonitoringCoordinator, platform: &LoopbackCallPlatform) -> anyhow::Result<()> {
    let call_id = talking_call(platform).await?;

    let (first, second) = tokio::join!(
        coordinator.start_session(SupervisorId::from("sup-1"), &call_id, MonitorMode::Listen),
        coordinator.start_session(SupervisorId::from("sup-2"), &call_id, MonitorMode::Listen),
    );
    let loser = match (first?, second?) {
        (StartOutcome::Started(_), StartOutcome::TakeoverRequired { .. }) => SupervisorId::from("sup-2"),
        (StartOutcome::TakeoverRequired { .. }, StartOutcome::Started(_)) => SupervisorId::from("sup-1"),
        other => bail!("expected exactly one winner, got {:?}", other),
    };

    let ticket = match coordinator.request_takeover(loser.clone(), &call_id, MonitorMode::Listen).await? {
        TakeoverStart::Requested(ticket) => ticket,
        TakeoverStart::Granted(session) => bail!("call unexpectedly free, got {}", session.session_id),
    };
    println!(
        "{} asked {} for call {}; waiting up to {:?} without an answer",
        loser,
        ticket.owner.supervisor_id,
        call_id,
        coordinator.config().takeover_grace_period()
    );

    let session = coordinator.await_takeover(&ticket.request_id).await?;
    let displaced = coordinator
        .get_session(&ticket.owner.session_id)
        .context("displaced session missing")?;
    println!(
        "{} now {} on call {}; {} is {} ({})",
        session.supervisor_id,
        session.status,
        call_id,
        displaced.supervisor_id,
        displaced.status,
        displaced.revoked_reason.map(|r| r.to_string()).unwrap_or_default()
    );
    Ok(())
}

async fn transfer(coordinator: &MonitoringCoordinator, platform: &LoopbackCallPlatform) -> anyhow::Result<()> {
    let call_id = talking_call(platform).await?;
    let session = match coordinator
        .start_session(SupervisorId::from("sup-1"), &call_id, MonitorMode::Listen)
        .await?
    {
        StartOutcome::Started(session) => session,
        other => bail!("unexpected outcome {:?}", other),
    };

    platform.transfer_call(&call_id, "sip:tier2@callcenter.local").await?;
    platform.complete_transfer(&call_id).await?;

    let after = coordinator
        .get_session(&session.session_id)
        .context("session missing")?;
    println!(
        "After transfer: call {} is {}, session {} is {} in {} mode",
        call_id,
        coordinator.registry().current(&call_id)?.state,
        after.session_id,
        after.status,
        after.mode
    );
    coordinator.end_session(&session.session_id).await?;
    Ok(())
}

async fn new_call(coordinator: &MonitoringCoordinator, platform: &LoopbackCallPlatform) -> anyhow::Result<()> {
    let first_call = talking_call(platform).await?;
    let session = match coordinator
        .start_session(SupervisorId::from("sup-1"), &first_call, MonitorMode::Listen)
        .await?
    {
        StartOutcome::Started(session) => session,
        other => bail!("unexpected outcome {:?}", other),
    };
    platform.drop_call(&first_call).await?;

    let second_call = talking_call(platform).await?;
    println!(
        "Session {} is {} after call {} ended; call {} has active session: {}",
        session.session_id,
        coordinator
            .get_session(&session.session_id)
            .map(|s| s.status.to_string())
            .unwrap_or_default(),
        first_call,
        second_call,
        coordinator.get_active_session(&second_call).is_some()
    );

    if let StartOutcome::Started(fresh) = coordinator
        .start_session(SupervisorId::from("sup-1"), &second_call, MonitorMode::Listen)
        .await?
    {
        println!("Fresh session {} started on call {}", fresh.session_id, second_call);
        coordinator.end_session(&fresh.session_id).await?;
    }
    Ok(())
}

fn describe(event: &MonitorEvent) -> String {
    match event {
        MonitorEvent::SessionStateChanged(change) => format!(
            "[{}] {} {} on {}: {} -> {} ({} -> {}) {:?}",
            change.at.format("%H:%M:%S%.3f"),
            change.session.supervisor_id,
            change.session.session_id,
            change.session.call_id,
            change
                .previous_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "new".to_string()),
            change.session.status,
            change.previous_mode,
            change.session.mode,
            change.cause
        ),
        MonitorEvent::TakeoverRequested {
            request_id,
            call_id,
            owner,
            challenger,
            mode,
            deadline,
        } => format!(
            "takeover {} on {}: {} asks {} for {} (deadline {})",
            request_id,
            call_id,
            challenger,
            owner,
            mode,
            deadline.format("%H:%M:%S%.3f")
        ),
        MonitorEvent::TakeoverResolved { request_id, call_id, state } => {
            format!("takeover {} on {} resolved: {:?}", request_id, call_id, state)
        }
    }
}
