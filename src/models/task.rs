//! Task records and the operator-facing views derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use super::{ConsistencyReport, ExportManifest, TaskDefaults};

/// Lifecycle state of an audit task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, worker not started yet
    Pending,
    /// A worker owns the task
    Running,
    /// Stopped by the operator at a row boundary
    Paused,
    /// All rows processed, artifacts written
    Completed,
    /// Stopped by a fatal error, resumable
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }

    /// States a `resume` may leave from.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Pending | Self::Paused | Self::Error | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Pacing and retry parameters of a task. Adjustable on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    pub min_interval_sec: f64,
    pub max_retries: u32,
    pub backoff_base_sec: f64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_sec: f64,
}

fn default_backoff_cap() -> f64 {
    60.0
}

fn default_checkpoint_every() -> usize {
    10
}

/// Operator-supplied parameters for a new task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub model_name: String,
    pub max_evidence_items: usize,
    pub max_rows: usize,
    pub checkpoint_every: usize,
    pub rate: RateConfig,
    /// Overrides the configured amount column candidates
    pub amount_field: Option<String>,
    /// Overrides the configured evidence column candidates
    pub evidence_field: Option<String>,
}

impl TaskOptions {
    pub fn from_defaults(defaults: &TaskDefaults) -> Self {
        Self {
            model_name: defaults.model_name.clone(),
            max_evidence_items: defaults.max_evidence_items_per_row,
            max_rows: defaults.max_rows,
            checkpoint_every: defaults.checkpoint_every,
            rate: RateConfig {
                min_interval_sec: defaults.min_interval_sec,
                max_retries: defaults.max_retries,
                backoff_base_sec: defaults.backoff_base_sec,
                backoff_cap_sec: defaults.backoff_cap_sec,
            },
            amount_field: None,
            evidence_field: None,
        }
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::from_defaults(&TaskDefaults::default())
    }
}

/// A single audit run as persisted by the checkpoint store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    /// Name of the submitted row source
    pub source_name: String,
    #[serde(default)]
    pub operator: String,
    /// Rows in the submitted dataset
    pub input_rows: usize,
    /// Rows this task processes
    pub total: usize,
    /// Index of the next unprocessed row
    pub next_idx: usize,
    pub amount_field: String,
    pub evidence_field: String,
    pub model_name: String,
    pub max_evidence_items: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    pub rate: RateConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ExportManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Generate a fresh task id: `audit_<YYYYmmdd_HHMMSS>_<6 hex>`.
    pub fn new_id() -> String {
        format!(
            "audit_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            short_hex()
        )
    }

    /// Rows not reached yet.
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.next_idx)
    }

    /// Fraction of rows processed, rounded to two decimals.
    pub fn progress_ratio(&self) -> f64 {
        if self.total == 0 {
            return if self.status == TaskStatus::Completed { 1.0 } else { 0.0 };
        }
        let ratio = self.next_idx.min(self.total) as f64 / self.total as f64;
        (ratio * 100.0).round() / 100.0
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Six lowercase hex characters from a v4 uuid.
pub fn short_hex() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Status view returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub source_name: String,
    pub total: usize,
    pub processed: usize,
    pub pending: usize,
    pub ok_rows: usize,
    pub bad_rows: usize,
    pub progress_ratio: f64,
    pub error_message: Option<String>,
    pub artifacts: Option<ExportManifest>,
    pub consistency: Option<ConsistencyReport>,
    pub rate: RateConfig,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: PathBuf,
}

/// Kinds of entries in the operation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    TaskCreated,
    TaskStarted,
    TaskPaused,
    TaskResumed,
    TaskCompleted,
    TaskFailed,
    ConsistencyChecked,
    SnapshotExported,
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TaskCreated => "task_created",
            Self::TaskStarted => "task_started",
            Self::TaskPaused => "task_paused",
            Self::TaskResumed => "task_resumed",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::ConsistencyChecked => "consistency_checked",
            Self::SnapshotExported => "snapshot_exported",
        };
        f.write_str(name)
    }
}

/// One line of `history.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub action: HistoryAction,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub input_rows: usize,
    #[serde(default)]
    pub output_rows: usize,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl HistoryEvent {
    pub fn new(task: &Task, action: HistoryAction) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: task.task_id.clone(),
            action,
            operator: task.operator.clone(),
            input_rows: task.input_rows,
            output_rows: task.next_idx,
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A task record with defaults, for store and worker tests.
    pub fn task(task_id: &str, total: usize) -> Task {
        let options = TaskOptions::default();
        let now = Utc::now();
        Task {
            task_id: task_id.to_string(),
            status: TaskStatus::Pending,
            source_name: "claims.json".to_string(),
            operator: "tester".to_string(),
            input_rows: total,
            total,
            next_idx: 0,
            amount_field: "amount".to_string(),
            evidence_field: "evidence".to_string(),
            model_name: options.model_name,
            max_evidence_items: options.max_evidence_items,
            checkpoint_every: options.checkpoint_every,
            rate: options.rate,
            error_message: None,
            artifacts: None,
            consistency: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_shape() {
        let id = Task::new_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "audit");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 6);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_progress_ratio_rounds() {
        let mut task = fixtures::task("t", 3);
        task.next_idx = 1;
        assert_eq!(task.progress_ratio(), 0.33);
        assert_eq!(task.pending(), 2);
        task.next_idx = 3;
        assert_eq!(task.progress_ratio(), 1.0);
    }

    #[test]
    fn test_status_round_trips_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        assert_eq!(TaskStatus::Error.to_string(), "error");
        assert!(!TaskStatus::Completed.is_resumable());
    }
}
