//! C7: the orchestrator loop.
//!
//! A single-threaded outer loop, one iteration per agent session, racing
//! the loop, the claim sweeps and the control plane through `tokio::select!`
//! in `main.rs`, owning the whole phase-gated cycle end to end.

pub mod prompt;
pub mod subprocess;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::claims::ClaimCoordinator;
use crate::config::Config;
use crate::constants::{
    CLAIM_EXPIRED_SWEEP_INTERVAL_SECS, CLAIM_ORPHAN_STALE_AFTER_SECS, CLAIM_ORPHAN_SWEEP_INTERVAL_SECS,
    SESSION_IDLE_SWEEP_INTERVAL_SECS, TASK_COMPLETION_RELATIVE, QUALITY_SCORES_RELATIVE, LOG_DIR_RELATIVE,
};
use crate::context_tracker::ContextTracker;
use crate::events::EventBus;
use crate::models::{CompletionStatus, Phase, SessionRegistration, SessionType, Task, TaskCompletionRecord, TaskStatus};
use crate::quality_gate::evaluate_phase;
use crate::rate_limit::RateLimitTracker;
use crate::session::SessionRegistry;
use crate::tasks::{CompletionUpdate, TaskStore};
use crate::Result;

use prompt::{build_prompt, PreviousEvaluation};
use subprocess::{ExitReason, SubprocessSupervisor};

/// `{currentPhase, phaseIteration, totalSessions, currentTask, taskIterations, continueWithCurrentTask, phaseScores}`.
#[derive(Debug, Clone)]
pub struct LoopState {
    current_phase: Option<Phase>,
    phase_iteration: u32,
    total_sessions: u32,
    current_task: Option<Task>,
    task_iterations: HashMap<String, u32>,
    continue_with_current_task: bool,
    phase_scores: HashMap<Phase, u32>,
}

impl LoopState {
    fn new(starting_phase: Phase) -> Self {
        Self {
            current_phase: Some(starting_phase),
            phase_iteration: 0,
            total_sessions: 0,
            current_task: None,
            task_iterations: HashMap::new(),
            continue_with_current_task: false,
            phase_scores: HashMap::new(),
        }
    }
}

/// Read-only view of [`LoopState`] for the control plane's `/api/execution` surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionSnapshot {
    pub current_phase: Option<Phase>,
    pub phase_iteration: u32,
    pub total_sessions: u32,
    pub current_task_id: Option<String>,
    pub task_iterations: HashMap<String, u32>,
    pub phase_scores: HashMap<Phase, u32>,
}

impl LoopState {
    /// Operator override: forces the loop onto `phase` and resets its
    /// iteration counter, the way the iteration-cap path in `run()` does
    /// when it forces an advance.
    pub fn override_phase(&mut self, phase: Phase) {
        self.current_phase = Some(phase);
        self.phase_iteration = 0;
        self.continue_with_current_task = false;
    }

    pub fn task_iterations(&self) -> &HashMap<String, u32> {
        &self.task_iterations
    }

    pub fn set_task_iterations(&mut self, task_id: String, iterations: u32) {
        self.task_iterations.insert(task_id, iterations);
    }
}

impl From<&LoopState> for ExecutionSnapshot {
    fn from(state: &LoopState) -> Self {
        Self {
            current_phase: state.current_phase,
            phase_iteration: state.phase_iteration,
            total_sessions: state.total_sessions,
            current_task_id: state.current_task.as_ref().map(|t| t.id.clone()),
            task_iterations: state.task_iterations.clone(),
            phase_scores: state.phase_scores.clone(),
        }
    }
}

pub struct Orchestrator {
    config: Config,
    tasks: Arc<TaskStore>,
    sessions: Arc<SessionRegistry>,
    claims: Arc<ClaimCoordinator>,
    tracker: Option<Arc<ContextTracker>>,
    rate_limit: Arc<RateLimitTracker>,
    events: EventBus,
    supervisor: SubprocessSupervisor,
    state: Arc<Mutex<LoopState>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        tasks: Arc<TaskStore>,
        sessions: Arc<SessionRegistry>,
        claims: Arc<ClaimCoordinator>,
        tracker: Option<Arc<ContextTracker>>,
        rate_limit: Arc<RateLimitTracker>,
        events: EventBus,
        agent_binary: impl Into<String>,
    ) -> Self {
        let starting_phase = config.orchestrator.starting_phase;
        let threshold = config.orchestrator.context_threshold;
        Self {
            config,
            tasks,
            sessions,
            claims,
            tracker,
            rate_limit,
            events,
            supervisor: SubprocessSupervisor::new(agent_binary, threshold),
            state: Arc::new(Mutex::new(LoopState::new(starting_phase))),
        }
    }

    /// Shared handle onto the loop state, for the control plane's
    /// `/api/execution` endpoints (§6). The orchestrator and the API server
    /// read and write the same `LoopState` through this `Arc<Mutex<_>>`.
    pub fn execution_state(&self) -> Arc<Mutex<LoopState>> {
        self.state.clone()
    }

    /// Background sweeps for the claim coordinator and the session registry,
    /// run alongside the loop.
    pub async fn run_claim_sweeps(self: Arc<Self>) {
        let expired_interval = std::time::Duration::from_secs(CLAIM_EXPIRED_SWEEP_INTERVAL_SECS);
        let orphan_interval = std::time::Duration::from_secs(CLAIM_ORPHAN_SWEEP_INTERVAL_SECS);
        let idle_interval = std::time::Duration::from_secs(SESSION_IDLE_SWEEP_INTERVAL_SECS);
        let mut expired_ticker = tokio::time::interval(expired_interval);
        let mut orphan_ticker = tokio::time::interval(orphan_interval);
        let mut idle_ticker = tokio::time::interval(idle_interval);

        loop {
            tokio::select! {
                _ = expired_ticker.tick() => {
                    if let Err(e) = self.claims.cleanup_expired().await {
                        tracing::warn!(error = %e, "expired-claim sweep failed");
                    }
                }
                _ = orphan_ticker.tick() => {
                    let live_ids: Vec<i64> = self.sessions.get_summary_with_hierarchy().await
                        .into_iter()
                        .filter(|s| !matches!(s.session.status, crate::models::SessionStatus::Ended))
                        .map(|s| s.session.id)
                        .collect();
                    if let Err(e) = self.claims.cleanup_orphaned(&live_ids, chrono::Duration::seconds(CLAIM_ORPHAN_STALE_AFTER_SECS)).await {
                        tracing::warn!(error = %e, "orphaned-claim sweep failed");
                    }
                }
                _ = idle_ticker.tick() => {
                    let ended = self.sessions.reap_idle().await;
                    if !ended.is_empty() {
                        tracing::info!(count = ended.len(), "idle-session sweep ended stale sessions");
                    }
                }
            }
        }
    }

    /// The outer loop (§4.7.1).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let mut state = self.state.lock().await;
            let Some(current_phase) = state.current_phase else {
                tracing::info!("orchestrator loop complete: all phases exhausted");
                break;
            };

            if self.config.orchestrator.max_sessions != 0 && state.total_sessions >= self.config.orchestrator.max_sessions {
                tracing::info!("orchestrator stopping: max_sessions reached");
                break;
            }
            state.total_sessions += 1;

            if state.phase_iteration >= self.config.orchestrator.max_iterations_per_phase {
                tracing::warn!(phase = current_phase.as_str(), "iteration cap reached, forcing phase advance");
                if let Some(task) = &state.current_task {
                    let _ = self.tasks.update_status(&task.id, TaskStatus::Blocked, None);
                }
                self.advance_phase(&mut state);
                continue;
            }

            // 1. Task selection.
            let task = if state.continue_with_current_task && state.current_task.is_some() {
                state.continue_with_current_task = false;
                state.current_task.clone().expect("checked above")
            } else {
                match self.tasks.get_next_task(Some(current_phase))? {
                    Some(task) => {
                        self.tasks.update_status(&task.id, TaskStatus::InProgress, None)?;
                        state.current_task = Some(task.clone());
                        task
                    }
                    None => {
                        let blocked = self.tasks.get_blocked_tasks();
                        if !blocked.is_empty() {
                            tracing::info!(phase = current_phase.as_str(), blocked = blocked.len(), "no ready tasks, blocked tasks exist; advancing anyway");
                        } else {
                            tracing::info!(phase = current_phase.as_str(), "no ready tasks; advancing phase");
                        }
                        self.advance_phase(&mut state);
                        continue;
                    }
                }
            };

            let task_iteration = *state.task_iterations.get(&task.id).unwrap_or(&0);
            drop(state);

            // 2. Pre-flight.
            let prev_eval = self.read_last_quality_score(&task, current_phase);
            let phase_prompt = build_prompt(current_phase, task_iteration, &prev_eval, &task);

            // 3. Spawn subprocess, supervise.
            let registration = SessionRegistration {
                project_name: project_name(&self.config.orchestrator.project_path),
                project_path: self.config.orchestrator.project_path.to_string_lossy().to_string(),
                session_type: SessionType::Autonomous,
                orchestrator_id: None,
                agent_session_id: None,
                parent_session_id: None,
                current_task_id: Some(task.id.clone()),
            };
            let session_id = self.sessions.register(registration).await?;

            let avg_phase_duration_ms = self.average_phase_duration_ms(current_phase);
            let claim = self
                .claims
                .claim(
                    &task.id,
                    session_id,
                    chrono::Duration::milliseconds((2 * avg_phase_duration_ms) as i64),
                    Default::default(),
                )
                .await;

            if let Err(e) = &claim {
                tracing::warn!(task_id = %task.id, error = %e, "claim failed; proceeding without exclusivity");
            }

            self.rate_limit.record_message().await?;

            let log_dir = self.config.orchestrator.project_path.join(LOG_DIR_RELATIVE);
            fs::create_dir_all(&log_dir)?;
            let log_path = log_dir.join(format!("session-{session_id}.log"));
            // Persisted alongside the log for reproducibility (§6 filesystem layout);
            // the supervisor separately delivers the same text to the child via stdin.
            fs::write(log_dir.join(format!("prompt-{session_id}.txt")), &phase_prompt)?;

            let output = self
                .supervisor
                .run_session(&phase_prompt, &self.config.orchestrator.project_path, &log_path, &self.events)
                .await;

            // 4. Interpret result. Claim release and session teardown happen
            // on every exit path, including a supervisor error, so a failed
            // spawn never leaves a stale claim or a dangling session.
            let mut state = self.state.lock().await;
            let handle_result = match &output {
                Ok(output) => match &output.exit_reason {
                    ExitReason::Complete => self.handle_completion(&mut state, &task, current_phase).await,
                    ExitReason::Threshold => {
                        tracing::info!(task_id = %task.id, "session preempted by context threshold; retrying next session");
                        Ok(())
                    }
                    ExitReason::Error(reason) => {
                        tracing::warn!(task_id = %task.id, reason = %reason, "session exited with an error");
                        *state.task_iterations.entry(task.id.clone()).or_insert(0) += 1;
                        Ok(())
                    }
                },
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "supervisor failed to run session");
                    *state.task_iterations.entry(task.id.clone()).or_insert(0) += 1;
                    Ok(())
                }
            };

            if claim.is_ok() {
                let _ = self.claims.release(&task.id, session_id, "session complete").await;
            }
            let _ = self.sessions.end(session_id).await;
            drop(state);
            handle_result?;

            tokio::time::sleep(std::time::Duration::from_millis(self.config.orchestrator.session_delay_ms)).await;
        }
        Ok(())
    }

    async fn handle_completion(&self, state: &mut LoopState, task: &Task, current_phase: Phase) -> Result<()> {
        let completion = read_task_completion(&self.config.orchestrator.project_path, &task.id);
        let reported_scores = read_quality_scores(&self.config.orchestrator.project_path);
        let phase_eval = evaluate_phase(current_phase, &reported_scores, resolve_recommendation(&completion));

        let task_complete = matches!(&completion, Some(c) if is_genuinely_complete(c, task));

        if task_complete && phase_eval.passed {
            state.phase_scores.insert(current_phase, phase_eval.score);
            clear_completion_artifacts(&self.config.orchestrator.project_path, &task.id);

            match current_phase.next() {
                Some(next_phase) => {
                    state.current_phase = Some(next_phase);
                    state.phase_iteration = 0;
                    state.continue_with_current_task = true;
                    self.events.publish_phase_advanced(&task.id, next_phase);
                }
                None => {
                    let completion_meta = completion.expect("task_complete implies completion artifact present");
                    self.tasks.update_status(
                        &task.id,
                        TaskStatus::Completed,
                        Some(CompletionUpdate {
                            deliverables: completion_meta.deliverables,
                            notes: completion_meta.notes,
                            actual_duration_minutes: None,
                            quality_score: Some(phase_eval.score),
                        }),
                    )?;
                    self.sessions
                        .record_completion(
                            project_name(&self.config.orchestrator.project_path),
                            task.id.clone(),
                            Some(phase_eval.score),
                            0.0,
                        )
                        .await;
                    state.current_task = None;
                    state.current_phase = Some(current_phase);
                }
            }
        } else {
            state.phase_iteration += 1;
            let iterations = state.task_iterations.entry(task.id.clone()).or_insert(0);
            *iterations += 1;
            if *iterations >= self.config.orchestrator.max_iterations_per_phase {
                self.tasks.update_status(&task.id, TaskStatus::Blocked, None)?;
                state.current_task = None;
            }
        }
        Ok(())
    }

    fn advance_phase(&self, state: &mut LoopState) {
        let next = state.current_phase.and_then(Phase::next);
        state.current_phase = next;
        state.phase_iteration = 0;
        state.current_task = None;
        state.continue_with_current_task = false;
    }

    fn read_last_quality_score(&self, _task: &Task, phase: Phase) -> PreviousEvaluation {
        let reported = read_quality_scores(&self.config.orchestrator.project_path);
        if reported.is_empty() {
            return PreviousEvaluation::default();
        }
        let eval = evaluate_phase(phase, &reported, crate::models::Recommendation::Iterate);
        PreviousEvaluation { score: eval.score, passed: eval.passed, improvements: eval.improvements }
    }

    fn average_phase_duration_ms(&self, phase: Phase) -> u64 {
        let stats = self.tasks.get_stats();
        stats
            .avg_duration_by_phase
            .get(phase.as_str())
            .map(|minutes| (*minutes * 60_000.0) as u64)
            .unwrap_or(30 * 60_000)
    }
}

fn project_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "project".to_string())
}

fn resolve_recommendation(completion: &Option<TaskCompletionRecord>) -> crate::models::Recommendation {
    match completion {
        Some(c) if c.status == CompletionStatus::Completed => crate::models::Recommendation::Proceed,
        _ => crate::models::Recommendation::Iterate,
    }
}

/// Reads `task-completion.json`, tolerating an absent file (§4.7.4).
fn read_task_completion(project_root: &Path, _task_id: &str) -> Option<TaskCompletionRecord> {
    let path = project_root.join(TASK_COMPLETION_RELATIVE);
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn read_quality_scores(project_root: &Path) -> HashMap<String, u32> {
    let path = project_root.join(QUALITY_SCORES_RELATIVE);
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn clear_completion_artifacts(project_root: &Path, _task_id: &str) {
    let _ = fs::remove_file(project_root.join(TASK_COMPLETION_RELATIVE));
    let _ = fs::remove_file(project_root.join(QUALITY_SCORES_RELATIVE));
}

/// P7: a completion is only genuine when `acceptanceMet` is present and its
/// length matches the task's acceptance-criteria list. A missing or
/// mis-sized array is never treated as "all true".
fn is_genuinely_complete(completion: &TaskCompletionRecord, task: &Task) -> bool {
    if completion.status != CompletionStatus::Completed {
        return false;
    }
    match &completion.acceptance_met {
        Some(flags) if flags.len() == task.acceptance_criteria.len() => flags.iter().all(|&met| met),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    fn sample_task(acceptance_len: usize) -> Task {
        let mut task = Task::new("t", "d", Phase::Implement, Priority::Medium, "2h");
        task.acceptance_criteria = (0..acceptance_len).map(|i| format!("criterion {i}")).collect();
        task
    }

    #[test]
    fn p7_missing_acceptance_met_is_not_complete() {
        let task = sample_task(2);
        let completion = TaskCompletionRecord {
            task_id: task.id.clone(),
            status: CompletionStatus::Completed,
            acceptance_met: None,
            deliverables: vec![],
            notes: String::new(),
            completed_at: chrono::Utc::now(),
        };
        assert!(!is_genuinely_complete(&completion, &task));
    }

    #[test]
    fn p7_mis_sized_acceptance_met_is_not_complete() {
        let task = sample_task(3);
        let completion = TaskCompletionRecord {
            task_id: task.id.clone(),
            status: CompletionStatus::Completed,
            acceptance_met: Some(vec![true, true]),
            deliverables: vec![],
            notes: String::new(),
            completed_at: chrono::Utc::now(),
        };
        assert!(!is_genuinely_complete(&completion, &task));
    }

    #[test]
    fn p7_all_true_correct_length_is_complete() {
        let task = sample_task(2);
        let completion = TaskCompletionRecord {
            task_id: task.id.clone(),
            status: CompletionStatus::Completed,
            acceptance_met: Some(vec![true, true]),
            deliverables: vec![],
            notes: String::new(),
            completed_at: chrono::Utc::now(),
        };
        assert!(is_genuinely_complete(&completion, &task));
    }

    #[test]
    fn p7_one_false_criterion_is_not_complete() {
        let task = sample_task(2);
        let completion = TaskCompletionRecord {
            task_id: task.id.clone(),
            status: CompletionStatus::Completed,
            acceptance_met: Some(vec![true, false]),
            deliverables: vec![],
            notes: String::new(),
            completed_at: chrono::Utc::now(),
        };
        assert!(!is_genuinely_complete(&completion, &task));
    }

    #[test]
    fn override_phase_resets_iteration_and_continue_flag() {
        let mut state = LoopState::new(Phase::Research);
        state.phase_iteration = 4;
        state.continue_with_current_task = true;

        state.override_phase(Phase::Test);

        assert_eq!(state.current_phase, Some(Phase::Test));
        assert_eq!(state.phase_iteration, 0);
        assert!(!state.continue_with_current_task);
    }

    #[test]
    fn set_task_iterations_is_visible_through_the_accessor() {
        let mut state = LoopState::new(Phase::Research);
        state.set_task_iterations("task-1".to_string(), 3);
        assert_eq!(state.task_iterations().get("task-1"), Some(&3));
    }

    #[test]
    fn execution_snapshot_reflects_current_task_id() {
        let mut state = LoopState::new(Phase::Design);
        state.current_task = Some(Task::new("t", "d", Phase::Design, Priority::Medium, "1h"));
        let snapshot = ExecutionSnapshot::from(&state);
        assert_eq!(snapshot.current_phase, Some(Phase::Design));
        assert_eq!(snapshot.current_task_id, state.current_task.as_ref().map(|t| t.id.clone()));
    }
}
