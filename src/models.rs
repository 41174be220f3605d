use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

/// One of the four fixed engineering phases, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Research,
    Design,
    Implement,
    Test,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [Phase::Research, Phase::Design, Phase::Implement, Phase::Test];

    /// The phase that follows this one, or `None` if this is the last phase.
    pub fn next(self) -> Option<Phase> {
        let idx = Self::ORDER.iter().position(|p| *p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Design => "design",
            Phase::Implement => "implement",
            Phase::Test => "test",
        }
    }
}

impl FromStr for Phase {
    type Err = crate::AppError;

    /// Accepts canonical phase names as well as the alias table from the
    /// quality-gate evaluator (planning/implementation/validation/testing).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "research" | "planning" => Ok(Phase::Research),
            "design" => Ok(Phase::Design),
            "implement" | "implementation" => Ok(Phase::Implement),
            "test" | "testing" | "validation" => Ok(Phase::Test),
            other => Err(crate::AppError::Validation(format!(
                "unknown phase: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn points(self) -> f64 {
        match self {
            Priority::Critical => 100.0,
            Priority::High => 75.0,
            Priority::Medium => 50.0,
            Priority::Low => 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BacklogTier {
    Now,
    Next,
    Later,
    Someday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ready,
    InProgress,
    Blocked,
    Completed,
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Abandoned)
    }
}

/// The three dependency relations a task may declare against other tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub blocks: HashSet<String>,
    #[serde(default)]
    pub requires: HashSet<String>,
    #[serde(default)]
    pub related: HashSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTimestamps {
    pub created: chrono::DateTime<chrono::Utc>,
    pub updated: chrono::DateTime<chrono::Utc>,
    pub started: Option<chrono::DateTime<chrono::Utc>>,
    pub completed: Option<chrono::DateTime<chrono::Utc>>,
}

/// Metadata attached to a task when it reaches `completed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionMetadata {
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub notes: String,
    pub actual_duration_minutes: Option<u64>,
    pub quality_score: Option<u32>,
}

/// Unit of work tracked by the task store (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub phase: Phase,
    pub priority: Priority,
    /// Effort estimate, e.g. "2h", "1d". See [`Task::effort_hours`].
    pub effort: String,
    #[serde(default)]
    pub tags: HashSet<String>,
    pub tier: BacklogTier,
    pub status: TaskStatus,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Dependencies,
    pub timestamps: TaskTimestamps,
    #[serde(default)]
    pub completion: Option<CompletionMetadata>,
}

impl Task {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        phase: Phase,
        priority: Priority,
        effort: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            phase,
            priority,
            effort: effort.into(),
            tags: HashSet::new(),
            tier: BacklogTier::Now,
            status: TaskStatus::Ready,
            acceptance_criteria: Vec::new(),
            dependencies: Dependencies::default(),
            timestamps: TaskTimestamps {
                created: now,
                updated: now,
                started: None,
                completed: None,
            },
            completion: None,
        }
    }

    /// Parses `effort` ("2h", "1d", "30m") into hours for the scoring formula.
    /// Unparseable effort falls back to 8h (the "> 8h" bucket's floor), matching
    /// the teacher's fallback style of degrading gracefully rather than panicking.
    pub fn effort_hours(&self) -> f64 {
        let trimmed = self.effort.trim();
        let (number, unit) = trimmed.split_at(
            trimmed
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .unwrap_or(trimmed.len()),
        );
        let value: f64 = number.parse().unwrap_or(8.0);
        match unit.trim().to_ascii_lowercase().as_str() {
            "m" | "min" | "minutes" => value / 60.0,
            "d" | "day" | "days" => value * 8.0,
            _ => value,
        }
    }
}

/// Quality score record produced by [`crate::quality_gate::evaluate_phase`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScoreRecord {
    pub phase: Phase,
    pub task_id: String,
    pub scores: HashMap<String, u32>,
    pub recommendation: Recommendation,
    pub improvements: Vec<String>,
    pub evaluated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Proceed,
    Iterate,
}

/// The agent-authored artifact read from `task-completion.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskCompletionRecord {
    pub task_id: String,
    pub status: CompletionStatus,
    /// Per-criterion confirmation; length must equal the task's acceptance
    /// list. Absent or mis-sized ⇒ treated as incomplete (P7).
    pub acceptance_met: Option<Vec<bool>>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub notes: String,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// Session type, as tracked by the session registry (C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Cli,
    Autonomous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Paused,
    Error,
    Ended,
}

/// Rolling, incrementally-updated metrics for a live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub context_percent: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub messages: u64,
    pub iteration: u32,
    pub quality_score: Option<u32>,
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub delegation_id: String,
    pub target_agent_id: String,
    pub task_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub status: DelegationStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Active,
    Completed,
    Failed,
}

/// A live agent process, as held by the session registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub project_name: String,
    pub project_path: String,
    pub status: SessionStatus,
    pub session_type: SessionType,
    pub orchestrator_id: Option<String>,
    pub agent_session_id: Option<String>,
    pub parent_session_id: Option<i64>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub last_update: chrono::DateTime<chrono::Utc>,
    pub metrics: SessionMetrics,
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub queued_task_ids: Vec<String>,
    #[serde(default)]
    pub skipped_task_ids: Vec<String>,
    #[serde(default)]
    pub delegations: Vec<Delegation>,
}

/// Registration request for the session registry.
#[derive(Debug, Clone)]
pub struct SessionRegistration {
    pub project_name: String,
    pub project_path: String,
    pub session_type: SessionType,
    pub orchestrator_id: Option<String>,
    pub agent_session_id: Option<String>,
    pub parent_session_id: Option<i64>,
    pub current_task_id: Option<String>,
}

/// A durable TTL claim linking a session to a task (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub task_id: String,
    pub session_id: i64,
    pub claimed_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub pattern: Option<String>,
    pub subtask_count: Option<u32>,
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimMetadata {
    pub pattern: Option<String>,
    pub subtask_count: Option<u32>,
    pub agent_type: Option<String>,
}
