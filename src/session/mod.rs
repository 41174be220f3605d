//! C3: session registry.
//!
//! In-memory registry of live agent sessions, indexed by numeric id plus two
//! secondary indices (external agent-session-id, and project-path +
//! session-type). Guarded by `Arc<RwLock<_>>`, the way the teacher's old
//! session store wrapped its `HashMap` — but keyed on an incrementing `i64`
//! rather than a `Uuid`, since sessions here are referenced constantly from
//! HTTP path parameters and a short id is friendlier there.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::constants::{COMPLETION_RING_CAPACITY, SESSION_DEDUP_UPGRADE_WINDOW_SECS, SESSION_IDLE_HORIZON_SECS};
use crate::events::{Event, EventBus, SessionEvent};
use crate::models::{Delegation, DelegationStatus, Session, SessionRegistration, SessionStatus, SessionType};
use crate::{AppError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub project: String,
    pub task_id: String,
    pub quality_score: Option<u32>,
    pub cost: f64,
    pub recorded_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchySummary {
    pub session: Session,
    pub active_delegation_count: usize,
    pub max_delegation_depth: u32,
}

struct Inner {
    sessions: HashMap<i64, Session>,
    /// Secondary index: external agent-session-id -> our numeric id.
    by_agent_session_id: HashMap<String, i64>,
    /// Secondary index: (project_path, session_type) -> ids registered under it.
    by_project: HashMap<(String, SessionType), Vec<i64>>,
    /// Reverse index for hierarchy lookups: parent id -> child ids.
    children: HashMap<i64, Vec<i64>>,
    completions: VecDeque<CompletionRecord>,
}

/// Numeric-id-keyed registry of live sessions (C3).
pub struct SessionRegistry {
    next_id: AtomicI64,
    inner: Arc<RwLock<Inner>>,
    events: EventBus,
}

impl SessionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            inner: Arc::new(RwLock::new(Inner {
                sessions: HashMap::new(),
                by_agent_session_id: HashMap::new(),
                by_project: HashMap::new(),
                children: HashMap::new(),
                completions: VecDeque::new(),
            })),
            events,
        }
    }

    /// Registers a session, applying the three-step dedup contract (§4.3).
    pub async fn register(&self, req: SessionRegistration) -> Result<i64> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        // Step 1: known agent-session-id merges into the existing row.
        if let Some(agent_id) = &req.agent_session_id {
            if let Some(&existing_id) = inner.by_agent_session_id.get(agent_id) {
                let session = inner.sessions.get_mut(&existing_id).expect("indexed session exists");
                if matches!(session.session_type, SessionType::Cli) && matches!(req.session_type, SessionType::Autonomous) {
                    session.session_type = SessionType::Autonomous;
                }
                session.last_update = now;
                if req.current_task_id.is_some() {
                    session.current_task_id = req.current_task_id;
                }
                return Ok(existing_id);
            }
        }

        // Step 2: autonomous session without an agent-session-id ends stale
        // autonomous sessions left behind by a crashed orchestrator.
        if req.agent_session_id.is_none() && matches!(req.session_type, SessionType::Autonomous) {
            let key = (req.project_path.clone(), SessionType::Autonomous);
            if let Some(ids) = inner.by_project.get(&key).cloned() {
                for id in ids {
                    if let Some(s) = inner.sessions.get_mut(&id) {
                        if !matches!(s.status, SessionStatus::Ended) {
                            s.status = SessionStatus::Ended;
                            s.last_update = now;
                            self.events.publish(Event::Session(SessionEvent::Completed { session_id: id }));
                        }
                    }
                }
            }
        }

        // Step 3: an existing recent cli session on the same project path
        // is upgraded in place rather than creating a new row.
        if req.agent_session_id.is_none() && matches!(req.session_type, SessionType::Autonomous) {
            let key = (req.project_path.clone(), SessionType::Cli);
            if let Some(ids) = inner.by_project.get(&key).cloned() {
                for id in ids {
                    let upgrade = inner.sessions.get(&id).map(|s| {
                        !matches!(s.status, SessionStatus::Ended)
                            && (now - s.start_time).num_seconds() <= SESSION_DEDUP_UPGRADE_WINDOW_SECS
                    });
                    if upgrade == Some(true) {
                        let old_key = (req.project_path.clone(), SessionType::Cli);
                        if let Some(v) = inner.by_project.get_mut(&old_key) {
                            v.retain(|&x| x != id);
                        }
                        let new_key = (req.project_path.clone(), SessionType::Autonomous);
                        inner.by_project.entry(new_key).or_default().push(id);

                        let session = inner.sessions.get_mut(&id).expect("indexed session exists");
                        session.session_type = SessionType::Autonomous;
                        session.last_update = now;
                        if req.current_task_id.is_some() {
                            session.current_task_id = req.current_task_id;
                        }
                        return Ok(id);
                    }
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Session {
            id,
            project_name: req.project_name,
            project_path: req.project_path.clone(),
            status: SessionStatus::Active,
            session_type: req.session_type,
            orchestrator_id: req.orchestrator_id,
            agent_session_id: req.agent_session_id.clone(),
            parent_session_id: req.parent_session_id,
            start_time: now,
            last_update: now,
            metrics: Default::default(),
            current_task_id: req.current_task_id,
            queued_task_ids: Vec::new(),
            skipped_task_ids: Vec::new(),
            delegations: Vec::new(),
        };

        if let Some(agent_id) = &req.agent_session_id {
            inner.by_agent_session_id.insert(agent_id.clone(), id);
        }
        inner.by_project.entry((req.project_path.clone(), req.session_type)).or_default().push(id);
        if let Some(parent) = req.parent_session_id {
            inner.children.entry(parent).or_default().push(id);
        }
        inner.sessions.insert(id, session);

        self.events.publish(Event::Session(SessionEvent::Started { session_id: id, project: req.project_path }));
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Session> {
        let inner = self.inner.read().await;
        inner.sessions.get(&id).cloned().ok_or(AppError::SessionNotFound(id))
    }

    pub async fn update(&self, id: i64, f: impl FnOnce(&mut Session)) -> Result<Session> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(&id).ok_or(AppError::SessionNotFound(id))?;
        f(session);
        session.last_update = Utc::now();
        let updated = session.clone();
        self.events.publish(Event::Session(SessionEvent::Updated { session_id: id, status: updated.status }));
        Ok(updated)
    }

    pub async fn set_status(&self, id: i64, status: SessionStatus) -> Result<Session> {
        self.update(id, |s| s.status = status).await
    }

    pub async fn end(&self, id: i64) -> Result<Session> {
        let session = self.update(id, |s| s.status = SessionStatus::Ended).await?;
        self.events.publish(Event::Session(SessionEvent::Completed { session_id: id }));
        Ok(session)
    }

    /// Ends the session registered under the given external agent-session-id
    /// (`POST /api/sessions/end-by-claude-id`), for callers that only know
    /// the agent CLI's own session identifier.
    pub async fn end_by_agent_session_id(&self, agent_session_id: &str) -> Result<Session> {
        let id = {
            let inner = self.inner.read().await;
            *inner
                .by_agent_session_id
                .get(agent_session_id)
                .ok_or_else(|| AppError::Validation(format!("no session registered for agent session id {agent_session_id}")))?
        };
        self.end(id).await
    }

    pub async fn start_delegation(&self, id: i64, delegation: Delegation) -> Result<()> {
        let delegation_id = delegation.delegation_id.clone();
        self.update(id, |s| s.delegations.push(delegation)).await?;
        self.events.publish(Event::Session(SessionEvent::DelegationStarted { session_id: id, delegation_id }));
        Ok(())
    }

    pub async fn complete_delegation(&self, id: i64, delegation_id: &str, result: Option<String>, failed: bool) -> Result<()> {
        self.update(id, |s| {
            if let Some(d) = s.delegations.iter_mut().find(|d| d.delegation_id == delegation_id) {
                d.status = if failed { DelegationStatus::Failed } else { DelegationStatus::Completed };
                d.completed_at = Some(Utc::now());
                d.result = result;
            }
        })
        .await?;
        let event = if failed {
            SessionEvent::DelegationFailed { session_id: id, delegation_id: delegation_id.to_string() }
        } else {
            SessionEvent::DelegationCompleted { session_id: id, delegation_id: delegation_id.to_string() }
        };
        self.events.publish(Event::Session(event));
        Ok(())
    }

    /// `getSummaryWithHierarchy()` — every session plus derived delegation stats.
    pub async fn get_summary_with_hierarchy(&self) -> Vec<HierarchySummary> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .map(|session| {
                let active_delegation_count =
                    session.delegations.iter().filter(|d| matches!(d.status, DelegationStatus::Active)).count();
                let max_delegation_depth = max_depth(&inner.children, session.id, 0);
                HierarchySummary { session: session.clone(), active_delegation_count, max_delegation_depth }
            })
            .collect()
    }

    /// `recordCompletion(project, task, score, cost)`.
    pub async fn record_completion(&self, project: String, task_id: String, quality_score: Option<u32>, cost: f64) {
        let mut inner = self.inner.write().await;
        inner.completions.push_back(CompletionRecord {
            project,
            task_id,
            quality_score,
            cost,
            recorded_at: Utc::now(),
        });
        while inner.completions.len() > COMPLETION_RING_CAPACITY {
            inner.completions.pop_front();
        }
    }

    pub async fn recent_completions(&self) -> Vec<CompletionRecord> {
        self.inner.read().await.completions.iter().cloned().collect()
    }

    /// Periodic sweep: ends any session whose `last_update` is older than
    /// the configured idle horizon. Intended to run on a `tokio::time::interval`.
    pub async fn reap_idle(&self) -> Vec<i64> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let stale: Vec<i64> = inner
            .sessions
            .values()
            .filter(|s| !matches!(s.status, SessionStatus::Ended))
            .filter(|s| (now - s.last_update).num_seconds() > SESSION_IDLE_HORIZON_SECS)
            .map(|s| s.id)
            .collect();

        for id in &stale {
            if let Some(s) = inner.sessions.get_mut(id) {
                s.status = SessionStatus::Ended;
                s.last_update = now;
            }
        }
        drop(inner);

        for id in &stale {
            self.events.publish(Event::Session(SessionEvent::Completed { session_id: *id }));
        }
        stale
    }
}

fn max_depth(children: &HashMap<i64, Vec<i64>>, id: i64, depth: u32) -> u32 {
    match children.get(&id) {
        Some(kids) if !kids.is_empty() => kids.iter().map(|&k| max_depth(children, k, depth + 1)).max().unwrap_or(depth),
        _ => depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(project_path: &str, session_type: SessionType, agent_session_id: Option<&str>) -> SessionRegistration {
        SessionRegistration {
            project_name: "demo".to_string(),
            project_path: project_path.to_string(),
            session_type,
            orchestrator_id: None,
            agent_session_id: agent_session_id.map(|s| s.to_string()),
            parent_session_id: None,
            current_task_id: None,
        }
    }

    #[tokio::test]
    async fn dedup_step1_merges_on_known_agent_session_id() {
        let registry = SessionRegistry::new(EventBus::new());
        let first = registry.register(registration("/repo", SessionType::Cli, Some("agent-1"))).await.unwrap();
        let second = registry.register(registration("/repo", SessionType::Autonomous, Some("agent-1"))).await.unwrap();
        assert_eq!(first, second);
        let session = registry.get(first).await.unwrap();
        assert_eq!(session.session_type, SessionType::Autonomous);
    }

    #[tokio::test]
    async fn dedup_step2_ends_stale_autonomous_sessions() {
        let registry = SessionRegistry::new(EventBus::new());
        let stale = registry.register(registration("/repo", SessionType::Autonomous, None)).await.unwrap();
        registry.register(registration("/repo", SessionType::Autonomous, None)).await.unwrap();
        let stale_session = registry.get(stale).await.unwrap();
        assert_eq!(stale_session.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn dedup_step3_upgrades_recent_cli_session() {
        let registry = SessionRegistry::new(EventBus::new());
        let cli_id = registry.register(registration("/repo", SessionType::Cli, None)).await.unwrap();
        let upgraded_id = registry.register(registration("/repo", SessionType::Autonomous, None)).await.unwrap();
        assert_eq!(cli_id, upgraded_id);
        let session = registry.get(cli_id).await.unwrap();
        assert_eq!(session.session_type, SessionType::Autonomous);
    }

    #[tokio::test]
    async fn hierarchy_depth_reflects_delegation_chain() {
        let registry = SessionRegistry::new(EventBus::new());
        let root = registry
            .register(SessionRegistration { parent_session_id: None, ..registration("/a", SessionType::Autonomous, Some("root")) })
            .await
            .unwrap();
        registry
            .register(SessionRegistration { parent_session_id: Some(root), ..registration("/a", SessionType::Autonomous, Some("child")) })
            .await
            .unwrap();

        let summary = registry.get_summary_with_hierarchy().await;
        let root_summary = summary.iter().find(|s| s.session.id == root).unwrap();
        assert_eq!(root_summary.max_delegation_depth, 1);
    }

    #[tokio::test]
    async fn end_by_agent_session_id_ends_the_matching_session() {
        let registry = SessionRegistry::new(EventBus::new());
        let id = registry.register(registration("/repo", SessionType::Cli, Some("agent-9"))).await.unwrap();

        let ended = registry.end_by_agent_session_id("agent-9").await.unwrap();
        assert_eq!(ended.id, id);
        assert_eq!(ended.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn end_by_agent_session_id_rejects_unknown_id() {
        let registry = SessionRegistry::new(EventBus::new());
        let result = registry.end_by_agent_session_id("no-such-agent-session").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn record_completion_is_visible_through_recent_completions() {
        let registry = SessionRegistry::new(EventBus::new());
        registry.record_completion("proj".to_string(), "task-1".to_string(), Some(90), 0.0).await;
        registry.record_completion("proj".to_string(), "task-2".to_string(), None, 0.0).await;

        let completions = registry.recent_completions().await;
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].task_id, "task-1");
        assert_eq!(completions[1].quality_score, None);
    }

    #[tokio::test]
    async fn record_completion_caps_the_ring_at_its_capacity() {
        let registry = SessionRegistry::new(EventBus::new());
        for i in 0..(COMPLETION_RING_CAPACITY + 10) {
            registry.record_completion("proj".to_string(), format!("task-{i}"), None, 0.0).await;
        }
        let completions = registry.recent_completions().await;
        assert_eq!(completions.len(), COMPLETION_RING_CAPACITY);
        assert_eq!(completions[0].task_id, "task-10");
    }

    #[tokio::test]
    async fn reap_idle_ends_sessions_past_the_idle_horizon_and_leaves_fresh_ones() {
        let registry = SessionRegistry::new(EventBus::new());
        let stale = registry.register(registration("/repo", SessionType::Autonomous, Some("stale"))).await.unwrap();
        let fresh = registry.register(registration("/repo", SessionType::Autonomous, Some("fresh"))).await.unwrap();

        {
            let mut inner = registry.inner.write().await;
            let session = inner.sessions.get_mut(&stale).unwrap();
            session.last_update = Utc::now() - chrono::Duration::seconds(SESSION_IDLE_HORIZON_SECS + 1);
        }

        let ended = registry.reap_idle().await;
        assert_eq!(ended, vec![stale]);

        let stale_session = registry.get(stale).await.unwrap();
        assert_eq!(stale_session.status, SessionStatus::Ended);
        let fresh_session = registry.get(fresh).await.unwrap();
        assert_ne!(fresh_session.status, SessionStatus::Ended);
    }
}
