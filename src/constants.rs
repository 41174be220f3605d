//! System-wide configuration values that are not meant to vary per deployment.

/// Default context window, in tokens, used when a model-specific limit is unknown.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 200_000;

/// Default context-threshold percent at which the orchestrator preempts a running session.
pub const DEFAULT_CONTEXT_THRESHOLD: f64 = 65.0;

/// Default alert boundaries for the context tracker (percent of context window).
pub const DEFAULT_WARNING_THRESHOLD: f64 = 50.0;
pub const DEFAULT_CRITICAL_THRESHOLD: f64 = 65.0;
pub const DEFAULT_EMERGENCY_THRESHOLD: f64 = 75.0;

/// Delay between orchestrator sessions, in milliseconds.
pub const DEFAULT_SESSION_DELAY_MS: u64 = 5_000;

/// Per-phase iteration safety valve.
pub const DEFAULT_MAX_ITERATIONS_PER_PHASE: u32 = 10;

/// Default control-plane bind port.
pub const DEFAULT_PORT: u16 = 3033;

/// Grace period between graceful termination and force-kill of a subprocess.
pub const SUBPROCESS_GRACE_PERIOD_SECS: u64 = 5;

/// Claim coordinator sweep intervals.
pub const CLAIM_EXPIRED_SWEEP_INTERVAL_SECS: u64 = 60;
pub const CLAIM_ORPHAN_SWEEP_INTERVAL_SECS: u64 = 300;

/// Default claim TTL (`ttlMs` fallback on claim/heartbeat), in seconds.
pub const DEFAULT_CLAIM_TTL_SECS: i64 = 30 * 60;

/// A claim held by a session that's gone from the live registry is orphaned
/// once its heartbeat is older than twice the default TTL.
pub const CLAIM_ORPHAN_STALE_AFTER_SECS: i64 = 2 * DEFAULT_CLAIM_TTL_SECS;

/// Session registry idle horizon before a session is forcibly ended.
pub const SESSION_IDLE_HORIZON_SECS: i64 = 1_800;

/// How often the idle-session reaping sweep runs.
pub const SESSION_IDLE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Window used by the session-dedup "stale cli session" upgrade rule.
pub const SESSION_DEDUP_UPGRADE_WINDOW_SECS: i64 = 300;

/// Rate-limit window sizes.
pub const RATE_LIMIT_5H_SECS: i64 = 5 * 3600;
pub const RATE_LIMIT_HISTORY_CAP: usize = 1000;
pub const RATE_LIMIT_PERSIST_INTERVAL_SECS: u64 = 10;
pub const RATE_LIMIT_ALERT_FRACTION: f64 = 0.9;

/// SSE keep-alive / drift-correction tick.
pub const SSE_TICK_INTERVAL_SECS: u64 = 3;

/// WebSocket fleet ping cadence.
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Completion-ring retention in the session registry.
pub const COMPLETION_RING_CAPACITY: usize = 100;

/// Filesystem layout, relative to a project root.
pub const TASKS_JSON_RELATIVE: &str = ".claude/dev-docs/tasks.json";
pub const TASK_COMPLETION_RELATIVE: &str = ".claude/dev-docs/task-completion.json";
pub const QUALITY_SCORES_RELATIVE: &str = ".claude/dev-docs/quality-scores.json";
pub const CLAIMS_DB_RELATIVE: &str = ".claude/dev-docs/.coordination/claims.db";
pub const LOG_DIR_RELATIVE: &str = ".claude/logs";
pub const RATE_LIMIT_STATE_RELATIVE: &str = ".claude/dev-docs/.coordination/rate-limit-state.json";

/// Fleet message-rate defaults, overridable via env (§4.6).
pub const DEFAULT_FLEET_5H_LIMIT: u64 = 250;
pub const DEFAULT_FLEET_DAILY_LIMIT: u64 = 1_000;
pub const DEFAULT_FLEET_WEEKLY_LIMIT: u64 = 5_000;
/// ISO weekday (1 = Monday) on which the weekly window resets.
pub const DEFAULT_WEEKLY_RESET_WEEKDAY: u32 = 1;

/// Coding-agent CLI binary invoked for each session, unless overridden.
pub const DEFAULT_AGENT_BINARY: &str = "claude";
