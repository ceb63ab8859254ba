//! The per-task worker loop.
//!
//! A worker owns one task's working rows in memory. It advances row by row,
//! re-reading the persisted status before each row so an operator pause takes
//! effect at the next row boundary. Progress is persisted as rows first, then
//! `next_idx`, so the checkpoint never points past saved results.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::client::{ClassifyRequest, Credentials, EvidenceClassifier, RetryPolicy, RetryingClient};
use crate::models::{
    evidence_for_row, parse_money, ArtifactKind, AuditError, ColumnConfig, HistoryAction, HistoryEvent,
    MatchVerdict, Record, Result, RowResult, Task, TaskStatus, WorkingSet,
};
use crate::pipeline::{compare, Exporter};

pub const REASON_BAD_AMOUNT: &str = "claim amount is not a number";
pub const REASON_NO_EVIDENCE: &str = "no evidence reference found";

/// How a worker run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every row processed, artifacts written
    Completed,
    /// Status changed under the worker (paused by the operator)
    Stopped(TaskStatus),
}

/// Processes the rows of one task.
pub struct Worker {
    task_id: String,
    store: Arc<CheckpointStore>,
    client: RetryingClient,
    credentials: Credentials,
    exporter: Arc<Exporter>,
    columns: ColumnConfig,
}

impl Worker {
    pub fn new(
        task_id: &str,
        store: Arc<CheckpointStore>,
        classifier: Arc<dyn EvidenceClassifier>,
        credentials: Credentials,
        exporter: Arc<Exporter>,
        columns: ColumnConfig,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            store,
            client: RetryingClient::new(classifier),
            credentials,
            exporter,
            columns,
        }
    }

    /// Run to completion, pause, or failure. Failures are recorded on the
    /// task, never returned.
    pub async fn run(self) {
        match self.process().await {
            Ok(WorkerExit::Completed) => {
                let stats = self.client.rate_limiter().stats();
                info!(
                    task_id = %self.task_id,
                    calls = stats.slots_granted,
                    waited_secs = stats.total_wait_secs,
                    "Task completed"
                );
            }
            Ok(WorkerExit::Stopped(status)) => {
                info!(task_id = %self.task_id, %status, "Worker stopped");
            }
            Err(e) => self.fail(e),
        }
    }

    async fn process(&self) -> Result<WorkerExit> {
        let task = self.store.load(&self.task_id)?;
        if task.status != TaskStatus::Running {
            // Queued behind a worker that finished or was paused again.
            debug!(task_id = %self.task_id, status = %task.status, "Task not running, nothing to do");
            return Ok(WorkerExit::Stopped(task.status));
        }
        let mut rows = self.store.load_rows(&self.task_id)?;
        if rows.len() < task.total {
            return Err(AuditError::CorruptCheckpoint {
                path: self.store.rows_path(&self.task_id),
                message: format!("holds {} rows, task expects {}", rows.len(), task.total),
            });
        }

        let mut idx = task.next_idx;
        let mut unsaved = 0usize;
        self.log(&format!("worker started at row {} of {}", idx, task.total));

        while idx < task.total {
            let current = self.store.load(&self.task_id)?;
            if current.status != TaskStatus::Running {
                if unsaved > 0 {
                    self.checkpoint(&rows, idx)?;
                }
                self.log(&format!("worker stopped at row {idx}: task is {}", current.status));
                return Ok(WorkerExit::Stopped(current.status));
            }

            let result = self.evaluate(&current, &rows.rows[idx].fields).await;
            debug!(
                task_id = %self.task_id,
                row = idx,
                verdict = %result.verdict,
                attempts = result.attempts,
                "Row processed"
            );
            if !result.verdict.is_matched() {
                self.log(&format!("row {}: {} ({})", idx + 1, result.verdict, result.note));
            }
            rows.rows[idx].result = Some(result);
            idx += 1;
            unsaved += 1;

            if unsaved >= current.checkpoint_every.max(1) || idx >= task.total {
                self.checkpoint(&rows, idx)?;
                unsaved = 0;
            }
        }

        self.complete(&task, &rows)?;
        Ok(WorkerExit::Completed)
    }

    /// Verify one row. Never fails; problems become the row's outcome.
    async fn evaluate(&self, task: &Task, fields: &Record) -> RowResult {
        let expected = fields.get(&task.amount_field).and_then(parse_money);
        let Some(expected_amount) = expected else {
            return RowResult {
                extracted_amount: None,
                verdict: MatchVerdict::Mismatched,
                note: REASON_BAD_AMOUNT.to_string(),
                attempts: 0,
            };
        };

        let evidence = evidence_for_row(fields, &task.evidence_field, task.max_evidence_items);
        if evidence.is_empty() {
            return RowResult {
                extracted_amount: None,
                verdict: MatchVerdict::Unknown,
                note: REASON_NO_EVIDENCE.to_string(),
                attempts: 0,
            };
        }

        let request = ClassifyRequest {
            model: task.model_name.clone(),
            evidence,
            expected_amount,
        };
        let policy = RetryPolicy::from_rate(&task.rate);
        let outcome = self.client.call(&request, &self.credentials, &policy).await;

        RowResult {
            extracted_amount: outcome.extracted_amount,
            note: if outcome.verdict.is_matched() {
                String::new()
            } else {
                outcome.reason
            },
            verdict: outcome.verdict,
            attempts: outcome.attempts,
        }
    }

    /// Persist rows, then advance the stored checkpoint to `idx`.
    fn checkpoint(&self, rows: &WorkingSet, idx: usize) -> Result<()> {
        self.store.save_rows(&self.task_id, rows)?;
        self.store.update(&self.task_id, |t| {
            t.next_idx = t.next_idx.max(idx);
            Ok(())
        })?;
        debug!(task_id = %self.task_id, next_idx = idx, "Checkpoint saved");
        Ok(())
    }

    /// Consistency check, export, then one update marking the task completed.
    fn complete(&self, task: &Task, rows: &WorkingSet) -> Result<()> {
        let source = self.store.load_source(&self.task_id)?;
        let report = compare(&source.head(task.total), rows, &self.columns);
        if !report.ok {
            warn!(task_id = %self.task_id, message = %report.message, "Consistency check failed");
        }

        let mut snapshot = task.clone();
        snapshot.next_idx = task.total;
        let manifest = self.exporter.export(&snapshot, rows, &source)?;

        let completed = self.store.update(&self.task_id, |t| {
            t.status = TaskStatus::Completed;
            t.next_idx = t.next_idx.max(t.total);
            t.error_message = None;
            t.finished_at = Some(Utc::now());
            t.artifacts = Some(manifest.clone());
            t.consistency = Some(report.clone());
            Ok(())
        })?;

        self.history(
            HistoryEvent::new(&completed, HistoryAction::TaskCompleted).with_detail(json!({
                "ok_rows": manifest.rows(ArtifactKind::Ok),
                "bad_rows": manifest.rows(ArtifactKind::Bad),
                "pending_rows": manifest.rows(ArtifactKind::Pending),
                "consistent": report.ok,
            })),
        );
        self.log(&format!(
            "completed: {} rows, consistency: {}",
            task.total, report.message
        ));
        Ok(())
    }

    /// Record a fatal error on the task.
    fn fail(&self, err: AuditError) {
        error!(task_id = %self.task_id, error = %err, "Worker failed");
        let message = err.to_string();

        match self.store.update(&self.task_id, |t| {
            t.status = TaskStatus::Error;
            t.error_message = Some(message.clone());
            t.finished_at = Some(Utc::now());
            Ok(())
        }) {
            Ok(task) => {
                self.history(
                    HistoryEvent::new(&task, HistoryAction::TaskFailed)
                        .with_detail(json!({ "error": message })),
                );
            }
            Err(e) => error!(task_id = %self.task_id, error = %e, "Could not record task failure"),
        }
        self.log(&format!("error: {message}"));
    }

    fn history(&self, event: HistoryEvent) {
        if let Err(e) = self.store.append_history(&event) {
            warn!(task_id = %self.task_id, error = %e, "Failed to append history");
        }
    }

    fn log(&self, message: &str) {
        if let Err(e) = self.store.append_log(&self.task_id, message) {
            warn!(task_id = %self.task_id, error = %e, "Failed to write runtime log");
        }
    }
}
