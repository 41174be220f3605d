//! C8: control-plane service. Embeds C2-C6 and C12, and exposes them over
//! HTTP, SSE and WebSocket, built the way `ApiServer::build_router()` laid
//! out its routes: `ROUTE_*` string constants, a `ServiceBuilder` layering
//! rate-limit then auth then tracing then CORS, and a shared `State<ApiServer>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::middleware;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, create_auth_state};
use crate::claims::ClaimCoordinator;
use crate::config::{ApiConfig, Config};
use crate::constants::{CLAIM_ORPHAN_STALE_AFTER_SECS, DEFAULT_CLAIM_TTL_SECS, SSE_TICK_INTERVAL_SECS, WS_PING_INTERVAL_SECS};
use crate::context_tracker::{sanitize_project_path, ContextTracker, TranscriptSession};
use crate::events::Event;
use crate::http_rate_limit::{rate_limit_middleware, RateLimitConfig};
use crate::models::{BacklogTier, ClaimMetadata, Phase, SessionStatus, TaskStatus};
use crate::monitoring::SystemMonitor;
use crate::orchestrator::{ExecutionSnapshot, LoopState};
use crate::rate_limit::RateLimitTracker;
use crate::session::SessionRegistry;
use crate::tasks::TaskStore;
use crate::{AppError, EventBus, Result};

const ROUTE_PROJECTS: &str = "/api/projects";
const ROUTE_ACCOUNT: &str = "/api/account";
const ROUTE_ALERTS: &str = "/api/alerts";
const ROUTE_HEALTH: &str = "/api/health";
const ROUTE_TASKS: &str = "/api/tasks";
const ROUTE_TASK_STATUS: &str = "/api/tasks/{id}/status";
const ROUTE_TASK_CLAIM: &str = "/api/tasks/{id}/claim";
const ROUTE_TASK_RELEASE: &str = "/api/tasks/{id}/release";
const ROUTE_TASK_CLAIM_HEARTBEAT: &str = "/api/tasks/{id}/claim/heartbeat";
const ROUTE_TASKS_IN_FLIGHT: &str = "/api/tasks/in-flight";
const ROUTE_TASKS_CLAIMS_CLEANUP: &str = "/api/tasks/claims/cleanup";
const ROUTE_SESSIONS_REGISTER: &str = "/api/sessions/register";
const ROUTE_SESSION_UPDATE: &str = "/api/sessions/{id}/update";
const ROUTE_SESSION_PAUSE: &str = "/api/sessions/{id}/pause";
const ROUTE_SESSION_RESUME: &str = "/api/sessions/{id}/resume";
const ROUTE_SESSION_END: &str = "/api/sessions/{id}/end";
const ROUTE_SESSION_END_BY_CLAUDE_ID: &str = "/api/sessions/end-by-claude-id";
const ROUTE_SESSIONS_SUMMARY: &str = "/api/sessions/summary";
const ROUTE_SESSION_BY_ID: &str = "/api/sessions/{id}";
const ROUTE_SESSION_HIERARCHY: &str = "/api/sessions/{id}/hierarchy";
const ROUTE_USAGE_LIMITS: &str = "/api/usage/limits";
const ROUTE_USAGE_RECORD: &str = "/api/usage/record";
const ROUTE_USAGE_RESET: &str = "/api/usage/reset";
const ROUTE_EXECUTION: &str = "/api/execution";
const ROUTE_EXECUTION_PHASE: &str = "/api/execution/phase";
const ROUTE_EXECUTION_TASK_PHASES: &str = "/api/execution/taskPhases";
const ROUTE_EVENTS: &str = "/api/events";
const ROUTE_WS_FLEET: &str = "/ws/fleet";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    /// Needed to key the context tracker's per-project usage map the same
    /// way `orchestrator::subprocess` matches transcript events against a
    /// project (see `sanitize_project_path`).
    project_path: std::path::PathBuf,
    tasks: Arc<TaskStore>,
    sessions: Arc<SessionRegistry>,
    claims: Arc<ClaimCoordinator>,
    tracker: Option<Arc<ContextTracker>>,
    rate_limit: Arc<RateLimitTracker>,
    events: EventBus,
    /// Shared with the [`crate::orchestrator::Orchestrator`] running
    /// alongside this server, so `/api/execution*` reflects and can steer
    /// the live loop state. `None` when the control plane runs standalone.
    execution: Option<Arc<tokio::sync::Mutex<LoopState>>>,
    monitor: Option<Arc<SystemMonitor>>,
}

fn wire_error(err: AppError) -> axum::response::Response {
    err.into_response()
}

impl ApiServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        tasks: Arc<TaskStore>,
        sessions: Arc<SessionRegistry>,
        claims: Arc<ClaimCoordinator>,
        tracker: Option<Arc<ContextTracker>>,
        rate_limit: Arc<RateLimitTracker>,
        events: EventBus,
    ) -> Self {
        let project_path = config.orchestrator.project_path.clone();
        Self {
            config: config.api,
            project_path,
            tasks,
            sessions,
            claims,
            tracker,
            rate_limit,
            events,
            execution: None,
            monitor: None,
        }
    }

    /// Attaches the orchestrator's shared loop state so the control plane's
    /// execution endpoints become live instead of returning empty state.
    pub fn with_execution_state(mut self, state: Arc<tokio::sync::Mutex<LoopState>>) -> Self {
        self.execution = Some(state);
        self
    }

    /// Attaches a running [`SystemMonitor`] so `/api/health` reports real
    /// resource metrics instead of just task-store liveness.
    pub fn with_monitor(mut self, monitor: Arc<SystemMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
            .await
            .map_err(AppError::Io)?;

        tracing::info!(host = %self.config.host, port = self.config.port, "control plane listening");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(AppError::Io)?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());
        let rate_limit_state = Arc::new(RateLimitConfig::new());
        let cors_layer = CorsLayer::new()
            .allow_origin(self.config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect::<Vec<_>>())
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ])
            .max_age(Duration::from_secs(3600));

        Router::new()
            .route(ROUTE_PROJECTS, get(get_projects))
            .route(ROUTE_ACCOUNT, get(get_account))
            .route(ROUTE_ALERTS, get(get_alerts))
            .route(ROUTE_HEALTH, get(get_health))
            .route(ROUTE_TASKS, get(get_tasks))
            .route(ROUTE_TASK_STATUS, post(post_task_status))
            .route(ROUTE_TASK_CLAIM, post(post_task_claim))
            .route(ROUTE_TASK_RELEASE, post(post_task_release))
            .route(ROUTE_TASK_CLAIM_HEARTBEAT, post(post_task_claim_heartbeat))
            .route(ROUTE_TASKS_IN_FLIGHT, get(get_tasks_in_flight))
            .route(ROUTE_TASKS_CLAIMS_CLEANUP, post(post_claims_cleanup))
            .route(ROUTE_SESSIONS_REGISTER, post(post_sessions_register))
            .route(ROUTE_SESSION_UPDATE, post(post_session_update))
            .route(ROUTE_SESSION_PAUSE, post(post_session_pause))
            .route(ROUTE_SESSION_RESUME, post(post_session_resume))
            .route(ROUTE_SESSION_END, post(post_session_end))
            .route(ROUTE_SESSION_END_BY_CLAUDE_ID, post(post_session_end_by_claude_id))
            .route(ROUTE_SESSIONS_SUMMARY, get(get_sessions_summary))
            .route(ROUTE_SESSION_BY_ID, get(get_session_by_id))
            .route(ROUTE_SESSION_HIERARCHY, get(get_session_hierarchy))
            .route(ROUTE_USAGE_LIMITS, get(get_usage_limits).post(post_usage_limits))
            .route(ROUTE_USAGE_RECORD, post(post_usage_record))
            .route(ROUTE_USAGE_RESET, post(post_usage_reset))
            .route(ROUTE_EXECUTION, get(get_execution))
            .route(ROUTE_EXECUTION_PHASE, post(post_execution_phase))
            .route(ROUTE_EXECUTION_TASK_PHASES, get(get_execution_task_phases).post(post_execution_task_phases))
            .route(ROUTE_EVENTS, get(get_events_sse))
            .route(ROUTE_WS_FLEET, get(get_ws_fleet))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(rate_limit_state, rate_limit_middleware))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(Arc::new(self.clone()))
    }
}

type St = State<Arc<ApiServer>>;

async fn get_projects(State(state): St) -> impl IntoResponse {
    let stats = state.tasks.get_stats();
    let project = sanitize_project_path(&state.project_path);
    match &state.tracker {
        Some(tracker) => {
            let (usage, status) = tracker.project_status(&project).await;
            Json(json!({ "projects": [{ "taskStats": stats, "usage": usage, "status": status }] }))
        }
        None => Json(json!({ "projects": [{ "taskStats": stats }] })),
    }
}

async fn get_account(State(state): St) -> impl IntoResponse {
    let snapshot = state.rate_limit.snapshot().await;
    Json(json!({ "usage": snapshot }))
}

async fn get_alerts(State(state): St) -> impl IntoResponse {
    let alerts = state.rate_limit.get_alerts().await;
    Json(json!({ "alerts": alerts.into_iter().map(|(w, f)| json!({"window": w, "usedFraction": f})).collect::<Vec<_>>() }))
}

async fn get_health(State(state): St) -> impl IntoResponse {
    let stats = state.tasks.get_stats();
    match &state.monitor {
        Some(monitor) => {
            let metrics = monitor.get_current_metrics().await;
            Json(json!({ "status": "ok", "tasks": stats.total, "system": metrics }))
        }
        None => Json(json!({ "status": "ok", "tasks": stats.total })),
    }
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    #[serde(rename = "projectPath")]
    #[allow(dead_code)]
    project_path: Option<String>,
    phase: Option<String>,
    backlog: Option<String>,
}

async fn get_tasks(State(state): St, Query(query): Query<TaskQuery>) -> impl IntoResponse {
    let phase = query.phase.as_deref().and_then(|p| p.parse::<Phase>().ok());
    let tier = query.backlog.as_deref().and_then(parse_tier);
    let tasks = state.tasks.get_ready_tasks(phase, tier, None, None);
    Json(json!({ "tasks": tasks }))
}

fn parse_tier(raw: &str) -> Option<BacklogTier> {
    match raw.to_ascii_lowercase().as_str() {
        "now" => Some(BacklogTier::Now),
        "next" => Some(BacklogTier::Next),
        "later" => Some(BacklogTier::Later),
        "someday" => Some(BacklogTier::Someday),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

async fn post_task_status(State(state): St, Path(id): Path<String>, Json(body): Json<StatusBody>) -> axum::response::Response {
    let status = match body.status.as_str() {
        "ready" => TaskStatus::Ready,
        "in_progress" => TaskStatus::InProgress,
        "blocked" => TaskStatus::Blocked,
        "completed" => TaskStatus::Completed,
        "abandoned" => TaskStatus::Abandoned,
        other => return wire_error(AppError::Validation(format!("unknown status {other}"))),
    };
    match state.tasks.update_status(&id, status, None) {
        Ok(task) => Json(json!({ "task": task })).into_response(),
        Err(e) => wire_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ClaimBody {
    #[serde(rename = "sessionId")]
    session_id: i64,
    #[serde(rename = "ttlMs", default = "default_ttl_ms")]
    ttl_ms: i64,
    pattern: Option<String>,
    #[serde(rename = "subtaskCount")]
    subtask_count: Option<u32>,
    #[serde(rename = "agentType")]
    agent_type: Option<String>,
}

fn default_ttl_ms() -> i64 {
    DEFAULT_CLAIM_TTL_SECS * 1000
}

async fn post_task_claim(State(state): St, Path(id): Path<String>, Json(body): Json<ClaimBody>) -> axum::response::Response {
    let metadata = ClaimMetadata { pattern: body.pattern, subtask_count: body.subtask_count, agent_type: body.agent_type };
    match state.claims.claim(&id, body.session_id, chrono::Duration::milliseconds(body.ttl_ms), metadata).await {
        Ok(claim) => Json(json!({ "claimed": true, "claim": claim })).into_response(),
        Err(e) => wire_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct SessionIdBody {
    #[serde(rename = "sessionId")]
    session_id: i64,
    reason: Option<String>,
}

async fn post_task_release(State(state): St, Path(id): Path<String>, Json(body): Json<SessionIdBody>) -> axum::response::Response {
    match state.claims.release(&id, body.session_id, body.reason.as_deref().unwrap_or("")).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => wire_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    #[serde(rename = "sessionId")]
    session_id: i64,
    #[serde(rename = "ttlMs", default = "default_ttl_ms")]
    ttl_ms: i64,
}

async fn post_task_claim_heartbeat(State(state): St, Path(id): Path<String>, Json(body): Json<HeartbeatBody>) -> axum::response::Response {
    match state.claims.refresh(&id, body.session_id, chrono::Duration::milliseconds(body.ttl_ms)).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn get_tasks_in_flight(State(state): St) -> axum::response::Response {
    match state.claims.get_active_claims().await {
        Ok(claims) => Json(json!({ "claims": claims })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn post_claims_cleanup(State(state): St) -> axum::response::Response {
    let expired = state.claims.cleanup_expired().await;
    let live_ids: Vec<i64> = state
        .sessions
        .get_summary_with_hierarchy()
        .await
        .into_iter()
        .filter(|s| !matches!(s.session.status, SessionStatus::Ended))
        .map(|s| s.session.id)
        .collect();
    let orphaned = state.claims.cleanup_orphaned(&live_ids, chrono::Duration::seconds(CLAIM_ORPHAN_STALE_AFTER_SECS)).await;
    match (expired, orphaned) {
        (Ok(e), Ok(o)) => Json(json!({ "expiredRemoved": e, "orphanedRemoved": o })).into_response(),
        (Err(e), _) | (_, Err(e)) => wire_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    #[serde(rename = "projectName")]
    project_name: String,
    #[serde(rename = "projectPath")]
    project_path: String,
    #[serde(rename = "sessionType")]
    session_type: String,
    #[serde(rename = "orchestratorId")]
    orchestrator_id: Option<String>,
    #[serde(rename = "agentSessionId")]
    agent_session_id: Option<String>,
    #[serde(rename = "parentSessionId")]
    parent_session_id: Option<i64>,
    #[serde(rename = "currentTaskId")]
    current_task_id: Option<String>,
}

async fn post_sessions_register(State(state): St, Json(body): Json<RegisterBody>) -> axum::response::Response {
    let session_type = match body.session_type.as_str() {
        "cli" => crate::models::SessionType::Cli,
        _ => crate::models::SessionType::Autonomous,
    };
    let registration = crate::models::SessionRegistration {
        project_name: body.project_name,
        project_path: body.project_path,
        session_type,
        orchestrator_id: body.orchestrator_id,
        agent_session_id: body.agent_session_id,
        parent_session_id: body.parent_session_id,
        current_task_id: body.current_task_id,
    };
    match state.sessions.register(registration).await {
        Ok(id) => Json(json!({ "sessionId": id })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn post_session_update(State(state): St, Path(id): Path<i64>, Json(body): Json<Value>) -> axum::response::Response {
    let task_id = body.get("currentTaskId").and_then(|v| v.as_str()).map(|s| s.to_string());
    match state.sessions.update(id, |s| s.current_task_id = task_id).await {
        Ok(session) => Json(json!({ "session": session })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn post_session_pause(State(state): St, Path(id): Path<i64>) -> axum::response::Response {
    match state.sessions.set_status(id, SessionStatus::Paused).await {
        Ok(session) => Json(json!({ "session": session })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn post_session_resume(State(state): St, Path(id): Path<i64>) -> axum::response::Response {
    match state.sessions.set_status(id, SessionStatus::Active).await {
        Ok(session) => Json(json!({ "session": session })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn post_session_end(State(state): St, Path(id): Path<i64>) -> axum::response::Response {
    match state.sessions.end(id).await {
        Ok(session) => Json(json!({ "session": session })).into_response(),
        Err(e) => wire_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct EndByClaudeIdBody {
    #[serde(rename = "claudeSessionId")]
    claude_session_id: String,
}

async fn post_session_end_by_claude_id(State(state): St, Json(body): Json<EndByClaudeIdBody>) -> axum::response::Response {
    match state.sessions.end_by_agent_session_id(&body.claude_session_id).await {
        Ok(session) => Json(json!({ "session": session })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn get_sessions_summary(State(state): St) -> impl IntoResponse {
    let mut summary = state.sessions.get_summary_with_hierarchy().await;
    if let Some(tracker) = &state.tracker {
        let context_limit = tracker.context_limit();
        for entry in &mut summary {
            let Some(agent_session_id) = entry.session.agent_session_id.clone() else { continue };
            let key = TranscriptSession {
                project: sanitize_project_path(std::path::Path::new(&entry.session.project_path)),
                session_id: agent_session_id,
            };
            if let Some(usage) = tracker.session_usage(&key).await {
                let metrics = &mut entry.session.metrics;
                metrics.input_tokens = usage.input_tokens;
                metrics.output_tokens = usage.output_tokens;
                metrics.total_tokens =
                    usage.input_tokens + usage.output_tokens + usage.cache_creation_tokens + usage.cache_read_tokens;
                metrics.context_percent = usage.context_percent(context_limit);
                metrics.messages = usage.message_count;
            }
        }
    }
    let recent_completions = state.sessions.recent_completions().await;
    Json(json!({ "sessions": summary, "recentCompletions": recent_completions }))
}

async fn get_session_by_id(State(state): St, Path(id): Path<i64>) -> axum::response::Response {
    match state.sessions.get(id).await {
        Ok(session) => Json(json!({ "session": session })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn get_session_hierarchy(State(state): St, Path(id): Path<i64>) -> axum::response::Response {
    let summary = state.sessions.get_summary_with_hierarchy().await;
    match summary.into_iter().find(|s| s.session.id == id) {
        Some(entry) => Json(json!({ "hierarchy": entry })).into_response(),
        None => wire_error(AppError::SessionNotFound(id)),
    }
}

async fn get_usage_limits(State(state): St) -> impl IntoResponse {
    Json(json!({ "limits": state.rate_limit.snapshot().await }))
}

async fn post_usage_record(State(state): St) -> axum::response::Response {
    match state.rate_limit.record_message().await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => wire_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UsageLimitsBody {
    #[serde(rename = "fiveHour")]
    five_hour: Option<u64>,
    daily: Option<u64>,
    weekly: Option<u64>,
}

async fn post_usage_limits(State(state): St, Json(body): Json<UsageLimitsBody>) -> impl IntoResponse {
    state.rate_limit.set_limits(body.five_hour, body.daily, body.weekly).await;
    Json(json!({ "limits": state.rate_limit.snapshot().await }))
}

async fn post_usage_reset(State(state): St) -> axum::response::Response {
    match state.rate_limit.reset().await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => wire_error(e),
    }
}

async fn get_execution(State(state): St) -> axum::response::Response {
    match &state.execution {
        Some(exec) => {
            let guard = exec.lock().await;
            Json(json!({ "execution": ExecutionSnapshot::from(&*guard) })).into_response()
        }
        None => Json(json!({ "execution": Value::Null })).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ExecutionPhaseBody {
    phase: String,
}

async fn post_execution_phase(State(state): St, Json(body): Json<ExecutionPhaseBody>) -> axum::response::Response {
    let Some(exec) = &state.execution else {
        return wire_error(AppError::Validation("orchestrator execution state is not attached to this control plane".to_string()));
    };
    let phase = match body.phase.parse::<Phase>() {
        Ok(p) => p,
        Err(e) => return wire_error(e),
    };
    let mut guard = exec.lock().await;
    guard.override_phase(phase);
    Json(json!({ "execution": ExecutionSnapshot::from(&*guard) })).into_response()
}

async fn get_execution_task_phases(State(state): St) -> axum::response::Response {
    match &state.execution {
        Some(exec) => {
            let guard = exec.lock().await;
            Json(json!({ "taskPhases": guard.task_iterations() })).into_response()
        }
        None => Json(json!({ "taskPhases": {} })).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TaskPhasesBody {
    #[serde(rename = "taskId")]
    task_id: String,
    iterations: u32,
}

async fn post_execution_task_phases(State(state): St, Json(body): Json<TaskPhasesBody>) -> axum::response::Response {
    let Some(exec) = &state.execution else {
        return wire_error(AppError::Validation("orchestrator execution state is not attached to this control plane".to_string()));
    };
    let mut guard = exec.lock().await;
    guard.set_task_iterations(body.task_id, body.iterations);
    Json(json!({ "taskPhases": guard.task_iterations() })).into_response()
}

/// Full state snapshot, emitted on SSE connect and on every 3s keep-alive.
fn snapshot(state: &ApiServer) -> Value {
    json!({
        "tasks": state.tasks.get_stats(),
    })
}

async fn get_events_sse(
    State(state): St,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, std::convert::Infallible>>> {
    let initial = SseEvent::default().data(snapshot(&state).to_string());
    let event_rx = state.events.subscribe();
    let delta_stream = tokio_stream::wrappers::BroadcastStream::new(event_rx)
        .filter_map(|res| res.ok())
        .map(|event| SseEvent::default().data(serde_json::to_string(&event).unwrap_or_default()));

    let tick_state = state.clone();
    let ticks = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(Duration::from_secs(SSE_TICK_INTERVAL_SECS)))
        .map(move |_| SseEvent::default().data(snapshot(&tick_state).to_string()));

    let stream = tokio_stream::once(initial).chain(delta_stream.merge(ticks)).map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn get_ws_fleet(State(state): St, ws: WebSocketUpgrade) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_ws_fleet(socket, state))
}

/// Mirrors a curated subset of events; pings every 30s, terminating clients
/// whose pong is late on the next cycle (§4.8).
async fn handle_ws_fleet(mut socket: WebSocket, state: Arc<ApiServer>) {
    if socket
        .send(Message::Text(json!({ "type": "init" }).to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut rx = state.events.subscribe();
    let mut ping_interval = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong {
                    tracing::info!("fleet websocket client missed pong; terminating");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) if is_curated(&event) => {
                        if socket.send(Message::Text(serde_json::to_string(&event).unwrap_or_default().into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn is_curated(event: &Event) -> bool {
    matches!(
        event,
        Event::Session(_) | Event::Task(crate::events::TaskEvent::Completed { .. }) | Event::RateLimit(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tier_accepts_known_values() {
        assert_eq!(parse_tier("now"), Some(BacklogTier::Now));
        assert_eq!(parse_tier("bogus"), None);
    }

    #[test]
    fn curated_filters_out_claim_events() {
        let event = Event::Claim(crate::events::ClaimEvent::Claimed { task_id: "t".into(), session_id: 1 });
        assert!(!is_curated(&event));
    }
}
