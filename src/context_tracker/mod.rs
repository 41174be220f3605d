//! C5: context & usage tracker.
//!
//! Watches the directory tree the agent CLI writes JSONL transcripts into,
//! using `notify` the way `fboiero-Agentor`'s CLI crates and
//! `iridite-tandem`'s `src-tauri` watch their own working directories. The
//! `notify` callback runs on its own std thread; it is bridged into a
//! `tokio::sync::mpsc` channel and consumed from a `tokio::select!` loop,
//! mirroring the shutdown-signal bridge in `monitoring/mod.rs`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::constants::DEFAULT_CONTEXT_LIMIT;
use crate::events::{AlertLevel, Event, EventBus, TrackerEvent};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyStatus {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub message_count: u64,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
    /// Highest threshold boundary already crossed upward, to make crossings hysteretic.
    last_crossed: Option<u8>,
}

impl SessionUsage {
    pub fn context_percent(&self, context_limit: u64) -> f64 {
        (self.input_tokens + self.output_tokens) as f64 / context_limit as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
    pub context_limit: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            warning: crate::constants::DEFAULT_WARNING_THRESHOLD,
            critical: crate::constants::DEFAULT_CRITICAL_THRESHOLD,
            emergency: crate::constants::DEFAULT_EMERGENCY_THRESHOLD,
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsageLine {
    message: Option<UsageMessage>,
}

#[derive(Debug, Deserialize)]
struct UsageMessage {
    usage: Option<UsageRecord>,
}

#[derive(Debug, Deserialize)]
struct UsageRecord {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

struct FileCursor {
    offset: u64,
}

/// A session key derived from a transcript file's path: its parent directory
/// name is the project, the file stem is the session id.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TranscriptSession {
    pub project: String,
    pub session_id: String,
}

pub struct ContextTracker {
    usage: Arc<RwLock<HashMap<TranscriptSession, SessionUsage>>>,
    cursors: Arc<RwLock<HashMap<PathBuf, FileCursor>>>,
    config: ThresholdConfig,
    events: EventBus,
    _watcher: RecommendedWatcher,
}

impl ContextTracker {
    /// Starts watching `root` (typically `~/.claude/projects` or similar),
    /// seeding the cursor map from files that already exist.
    pub fn start(root: &Path, config: ThresholdConfig, events: EventBus) -> Result<Self> {
        let usage = Arc::new(RwLock::new(HashMap::new()));

        let mut seeded = HashMap::new();
        if root.exists() {
            for entry in walk_jsonl(root) {
                let len = file_len(&entry);
                seeded.insert(entry, FileCursor { offset: len });
            }
        }
        let cursors = Arc::new(RwLock::new(seeded));

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let task_usage = Arc::clone(&usage);
        let task_cursors = Arc::clone(&cursors);
        let task_config = config.clone();
        let task_events = events.clone();
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                if let Err(e) =
                    process_change(&path, &task_usage, &task_cursors, &task_config, &task_events).await
                {
                    tracing::warn!(error = %e, path = %path.display(), "failed processing transcript change");
                }
            }
        });

        Ok(Self { usage, cursors, config, events, _watcher: watcher })
    }

    pub async fn session_usage(&self, session: &TranscriptSession) -> Option<SessionUsage> {
        self.usage.read().await.get(session).cloned()
    }

    pub fn context_limit(&self) -> u64 {
        self.config.context_limit
    }

    /// Per-project aggregation plus a derived {OK, WARNING, CRITICAL} status.
    pub async fn project_status(&self, project: &str) -> (SessionUsage, SafetyStatus) {
        let usage = self.usage.read().await;
        let mut total = SessionUsage::default();
        let mut worst_percent = 0.0;

        for (key, session) in usage.iter().filter(|(k, _)| k.project == project) {
            let _ = key;
            total.input_tokens += session.input_tokens;
            total.output_tokens += session.output_tokens;
            total.cache_creation_tokens += session.cache_creation_tokens;
            total.cache_read_tokens += session.cache_read_tokens;
            total.message_count += session.message_count;
            let percent = session.context_percent(self.config.context_limit);
            if percent > worst_percent {
                worst_percent = percent;
            }
        }

        let status = if worst_percent >= self.config.emergency || worst_percent >= self.config.critical {
            SafetyStatus::Critical
        } else if worst_percent >= self.config.warning {
            SafetyStatus::Warning
        } else {
            SafetyStatus::Ok
        };

        (total, status)
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn walk_jsonl(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                out.push(path);
            }
        }
    }
    out
}

/// Encodes an absolute project path into the directory-name convention the
/// agent CLI uses under its transcript root (path separators become `-`),
/// so a project's full path can be matched against the directory name a
/// transcript file was discovered under.
pub fn sanitize_project_path(path: &Path) -> String {
    path.to_string_lossy().replace(['/', '\\'], "-")
}

fn session_from_path(root_relative: &Path) -> TranscriptSession {
    let session_id = root_relative
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let project = root_relative
        .parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    TranscriptSession { project, session_id }
}

/// Handles one filesystem-change notification: re-stats the file, reads the
/// newly appended suffix, and credits every well-formed usage line found.
/// Malformed lines are skipped; a shrunk file resets its cursor to 0;
/// a missing file drops its cursor entirely.
async fn process_change(
    path: &Path,
    usage: &Arc<RwLock<HashMap<TranscriptSession, SessionUsage>>>,
    cursors: &Arc<RwLock<HashMap<PathBuf, FileCursor>>>,
    config: &ThresholdConfig,
    events: &EventBus,
) -> Result<()> {
    if !path.exists() {
        cursors.write().await.remove(path);
        return Ok(());
    }

    let current_len = file_len(path);
    let previous_offset = {
        let guard = cursors.read().await;
        guard.get(path).map(|c| c.offset)
    };

    let start_offset = match previous_offset {
        Some(offset) if offset <= current_len => offset,
        _ => 0,
    };

    if current_len <= start_offset {
        return Ok(());
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start_offset))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;

    let session_key = session_from_path(path);
    let mut consumed: u64 = start_offset;

    for line in buf.split('\n') {
        consumed += line.len() as u64 + 1;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<UsageLine>(line) else { continue };
        let Some(usage_record) = parsed.message.and_then(|m| m.usage) else { continue };
        credit(usage, &session_key, &usage_record, config, events).await;
    }

    // The trailing partial line (no terminating newline yet) must not be
    // counted as consumed, so the next read re-parses it once complete.
    let held_back = if buf.ends_with('\n') { 0 } else { buf.rsplit('\n').next().map(|s| s.len() as u64).unwrap_or(0) };
    let new_offset = start_offset + buf.len() as u64 - held_back;

    cursors.write().await.insert(path.to_path_buf(), FileCursor { offset: new_offset });
    Ok(())
}

async fn credit(
    usage: &Arc<RwLock<HashMap<TranscriptSession, SessionUsage>>>,
    session: &TranscriptSession,
    record: &UsageRecord,
    config: &ThresholdConfig,
    events: &EventBus,
) {
    let mut guard = usage.write().await;
    let entry = guard.entry(session.clone()).or_default();
    entry.input_tokens += record.input_tokens;
    entry.output_tokens += record.output_tokens;
    entry.cache_creation_tokens += record.cache_creation_input_tokens;
    entry.cache_read_tokens += record.cache_read_input_tokens;
    entry.message_count += 1;
    entry.last_activity = Some(chrono::Utc::now());

    let percent = entry.context_percent(config.context_limit);
    let crossed = threshold_crossed(percent, config, entry.last_crossed);
    if let Some(level) = crossed {
        entry.last_crossed = Some(level_rank(level));
        events.publish(Event::Tracker(TrackerEvent::Threshold {
            level,
            project: session.project.clone(),
            project_path: session.project.clone(),
            session_id: None,
            utilization: percent,
        }));
    } else if percent < config.warning {
        entry.last_crossed = None;
    }
}

fn level_rank(level: AlertLevel) -> u8 {
    match level {
        AlertLevel::Warning => 1,
        AlertLevel::Critical => 2,
        AlertLevel::Emergency => 3,
    }
}

/// Only fires on an upward crossing past a boundary not already crossed.
fn threshold_crossed(percent: f64, config: &ThresholdConfig, last_crossed: Option<u8>) -> Option<AlertLevel> {
    let rank = if percent >= config.emergency {
        3
    } else if percent >= config.critical {
        2
    } else if percent >= config.warning {
        1
    } else {
        0
    };
    if rank == 0 || Some(rank) == last_crossed {
        return None;
    }
    if let Some(last) = last_crossed {
        if rank <= last {
            return None;
        }
    }
    match rank {
        1 => Some(AlertLevel::Warning),
        2 => Some(AlertLevel::Critical),
        _ => Some(AlertLevel::Emergency),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn credits_usage_records_and_fires_threshold_once() {
        let usage = Arc::new(RwLock::new(HashMap::new()));
        let cursors = Arc::new(RwLock::new(HashMap::new()));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let config = ThresholdConfig { warning: 1.0, critical: 50.0, emergency: 90.0, context_limit: 100 };

        let dir = tempdir().unwrap();
        let project_dir = dir.path().join("demo-project");
        std::fs::create_dir_all(&project_dir).unwrap();
        let file_path = project_dir.join("session-a.jsonl");

        let mut file = File::create(&file_path).unwrap();
        writeln!(file, r#"{{"message":{{"usage":{{"input_tokens":10,"output_tokens":0}}}}}}"#).unwrap();
        drop(file);

        process_change(&file_path, &usage, &cursors, &config, &events).await.unwrap();

        let key = session_from_path(&file_path);
        let recorded = usage.read().await.get(&key).cloned().unwrap();
        assert_eq!(recorded.input_tokens, 10);

        let event = rx.try_recv().expect("threshold event fired");
        assert!(matches!(event, Event::Tracker(TrackerEvent::Threshold { level: AlertLevel::Warning, .. })));
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_without_stopping_others() {
        let usage = Arc::new(RwLock::new(HashMap::new()));
        let cursors = Arc::new(RwLock::new(HashMap::new()));
        let events = EventBus::new();
        let config = ThresholdConfig::default();

        let dir = tempdir().unwrap();
        let project_dir = dir.path().join("demo-project");
        std::fs::create_dir_all(&project_dir).unwrap();
        let file_path = project_dir.join("session-b.jsonl");

        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not json at all").unwrap();
        writeln!(file, r#"{{"message":{{"usage":{{"input_tokens":5,"output_tokens":5}}}}}}"#).unwrap();
        drop(file);

        process_change(&file_path, &usage, &cursors, &config, &events).await.unwrap();
        let key = session_from_path(&file_path);
        let recorded = usage.read().await.get(&key).cloned().unwrap();
        assert_eq!(recorded.input_tokens, 5);
    }

    #[tokio::test]
    async fn shrunk_file_resets_cursor_to_zero() {
        let cursors = Arc::new(RwLock::new(HashMap::new()));
        let usage = Arc::new(RwLock::new(HashMap::new()));
        let events = EventBus::new();
        let config = ThresholdConfig::default();

        let dir = tempdir().unwrap();
        let project_dir = dir.path().join("demo-project");
        std::fs::create_dir_all(&project_dir).unwrap();
        let file_path = project_dir.join("session-c.jsonl");
        std::fs::write(&file_path, r#"{"message":{"usage":{"input_tokens":1,"output_tokens":1}}}
"#).unwrap();

        cursors.write().await.insert(file_path.clone(), FileCursor { offset: 10_000 });
        process_change(&file_path, &usage, &cursors, &config, &events).await.unwrap();

        let key = session_from_path(&file_path);
        let recorded = usage.read().await.get(&key).cloned().unwrap();
        assert_eq!(recorded.input_tokens, 1);
    }
}
