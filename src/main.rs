use std::path::PathBuf;
use std::sync::Arc;

use spiral_core::claims::ClaimCoordinator;
use spiral_core::config::Config;
use spiral_core::constants::{
    DEFAULT_AGENT_BINARY, DEFAULT_FLEET_5H_LIMIT, DEFAULT_FLEET_DAILY_LIMIT,
    DEFAULT_FLEET_WEEKLY_LIMIT, DEFAULT_WEEKLY_RESET_WEEKDAY, RATE_LIMIT_STATE_RELATIVE,
};
use spiral_core::context_tracker::{ContextTracker, ThresholdConfig};
use spiral_core::monitoring::{MonitoringConfig, SystemMonitor};
use spiral_core::orchestrator::Orchestrator;
use spiral_core::rate_limit::RateLimitTracker;
use spiral_core::session::SessionRegistry;
use spiral_core::tasks::TaskStore;
use spiral_core::{EventBus, Result};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting spiral-orchestrator");

    let config = Config::load()?;
    let project_root = config.orchestrator.project_path.clone();

    let events = EventBus::new();
    let tasks = Arc::new(TaskStore::open(&project_root, events.clone())?);
    let sessions = Arc::new(SessionRegistry::new(events.clone()));
    let claims = Arc::new(ClaimCoordinator::open(&project_root, events.clone())?);

    let tracker = match transcripts_dir() {
        Some(dir) => {
            let threshold_config = ThresholdConfig {
                warning: config.context_alerts.warning,
                critical: config.context_alerts.critical,
                emergency: config.context_alerts.emergency,
                ..ThresholdConfig::default()
            };
            match ContextTracker::start(&dir, threshold_config, events.clone()) {
                Ok(tracker) => Some(Arc::new(tracker)),
                Err(e) => {
                    tracing::warn!(error = %e, "context tracker disabled: failed to start watcher");
                    None
                }
            }
        }
        None => {
            tracing::warn!("context tracker disabled: no transcripts directory found");
            None
        }
    };

    let rate_limit = Arc::new(RateLimitTracker::new(
        project_root.join(RATE_LIMIT_STATE_RELATIVE),
        env_u64("FLEET_5H_LIMIT", DEFAULT_FLEET_5H_LIMIT),
        env_u64("FLEET_DAILY_LIMIT", DEFAULT_FLEET_DAILY_LIMIT),
        env_u64("FLEET_WEEKLY_LIMIT", DEFAULT_FLEET_WEEKLY_LIMIT),
        env_u32("FLEET_WEEKLY_RESET_WEEKDAY", DEFAULT_WEEKLY_RESET_WEEKDAY),
        events.clone(),
    ));

    let agent_binary = std::env::var("AGENT_BINARY").unwrap_or_else(|_| DEFAULT_AGENT_BINARY.to_string());
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        tasks.clone(),
        sessions.clone(),
        claims.clone(),
        tracker.clone(),
        rate_limit.clone(),
        events.clone(),
        agent_binary,
    ));

    let monitor = Arc::new(SystemMonitor::new(MonitoringConfig::default()));
    monitor.start_monitoring().await?;

    let api_server = spiral_core::api::ApiServer::new(
        config.clone(),
        tasks,
        sessions,
        claims,
        tracker,
        rate_limit,
        events,
    )
    .with_execution_state(orchestrator.execution_state())
    .with_monitor(monitor);

    tokio::select! {
        result = orchestrator.clone().run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "orchestrator loop exited with an error");
            }
        }
        () = orchestrator.clone().run_claim_sweeps() => {}
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "control plane exited with an error");
            }
        }
    }

    Ok(())
}

fn transcripts_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("CLAUDE_TRANSCRIPTS_DIR") {
        return Some(PathBuf::from(dir));
    }
    std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".claude").join("projects"))
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
