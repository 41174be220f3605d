use crate::models::Phase;
use crate::{AppError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_CONTEXT_THRESHOLD, DEFAULT_CRITICAL_THRESHOLD, DEFAULT_EMERGENCY_THRESHOLD,
    DEFAULT_MAX_ITERATIONS_PER_PHASE, DEFAULT_PORT, DEFAULT_SESSION_DELAY_MS,
    DEFAULT_WARNING_THRESHOLD,
};

/// Command-line flags on the orchestrator binary (§6).
#[derive(Debug, Parser, Clone)]
#[command(name = "spiral-orchestrator", about = "Autonomous development orchestrator")]
pub struct CliArgs {
    /// Starting phase (research|design|implement|test)
    #[arg(long)]
    pub phase: Option<String>,

    /// Context-threshold percent at which a session is preempted
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Maximum total sessions before the loop stops (0 = unlimited)
    #[arg(long = "max-sessions")]
    pub max_sessions: Option<u32>,

    /// Maximum iterations per phase before a forced advance
    #[arg(long = "max-iterations")]
    pub max_iterations: Option<u32>,

    /// Fallback task description, used when tasks.json is absent
    #[arg(long)]
    pub task: Option<String>,

    /// Delay between sessions, in milliseconds
    #[arg(long)]
    pub delay: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub starting_phase: Phase,
    pub context_threshold: f64,
    pub session_delay_ms: u64,
    pub max_sessions: u32,
    pub max_iterations_per_phase: u32,
    pub project_path: PathBuf,
    pub fallback_task: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAlertConfig {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub enable_auth: bool,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub context_alerts: ContextAlertConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Loads configuration from the environment (via `.env` + `std::env`),
    /// then applies CLI-flag overrides on top. Fails fast on malformed values.
    pub fn load() -> Result<Self> {
        Self::load_with_args(CliArgs::parse())
    }

    pub fn load_with_args(args: CliArgs) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let starting_phase = match args.phase.or_else(|| env::var("PHASE").ok()) {
            Some(raw) => raw.parse::<Phase>()?,
            None => Phase::Research,
        };

        let context_threshold = args
            .threshold
            .or_else(|| env::var("CONTEXT_THRESHOLD").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_CONTEXT_THRESHOLD);

        let session_delay_ms = args
            .delay
            .or_else(|| env::var("SESSION_DELAY").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_SESSION_DELAY_MS);

        let max_sessions = args
            .max_sessions
            .or_else(|| env::var("MAX_SESSIONS").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(0);

        let max_iterations_per_phase = args
            .max_iterations
            .or_else(|| {
                env::var("MAX_ITERATIONS_PER_PHASE")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(DEFAULT_MAX_ITERATIONS_PER_PHASE);

        let project_path = PathBuf::from(
            env::var("PROJECT_PATH").unwrap_or_else(|_| ".".to_string()),
        );

        let fallback_task = args.task.clone();

        let orchestrator = OrchestratorConfig {
            starting_phase,
            context_threshold,
            session_delay_ms,
            max_sessions,
            max_iterations_per_phase,
            project_path,
            fallback_task,
        };

        let context_alerts = ContextAlertConfig {
            warning: env_f64("CONTEXT_ALERT_THRESHOLD_WARNING", DEFAULT_WARNING_THRESHOLD),
            critical: env_f64("CONTEXT_ALERT_THRESHOLD_CRITICAL", DEFAULT_CRITICAL_THRESHOLD),
            emergency: env_f64("CONTEXT_ALERT_THRESHOLD_EMERGENCY", DEFAULT_EMERGENCY_THRESHOLD),
        };

        let api_key = env::var("API_KEY").ok();
        match &api_key {
            Some(key) if key.trim().is_empty() => {
                return Err(AppError::ConfigurationError(
                    "API_KEY is set but blank".to_string(),
                ));
            }
            Some(key) if key.len() < 32 => {
                return Err(AppError::ConfigurationError(
                    "API_KEY must be at least 32 characters; generate one with `openssl rand -hex 32`"
                        .to_string(),
                ));
            }
            Some(_) => tracing::info!("control-plane authentication configured"),
            None => tracing::warn!(
                "API_KEY not set; control-plane authentication is disabled for this run"
            ),
        }

        let allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            enable_auth: api_key.is_some(),
            api_key,
            allowed_origins,
        };

        Ok(Config { orchestrator, context_alerts, api })
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_env_defaults() {
        let args = CliArgs {
            phase: Some("implementation".to_string()),
            threshold: Some(70.0),
            max_sessions: Some(5),
            max_iterations: Some(3),
            task: Some("fallback".to_string()),
            delay: Some(1000),
        };
        let config = Config::load_with_args(args).expect("config loads");
        assert_eq!(config.orchestrator.starting_phase, Phase::Implement);
        assert_eq!(config.orchestrator.context_threshold, 70.0);
        assert_eq!(config.orchestrator.max_sessions, 5);
        assert_eq!(config.orchestrator.max_iterations_per_phase, 3);
        assert_eq!(config.orchestrator.session_delay_ms, 1000);
    }
}
