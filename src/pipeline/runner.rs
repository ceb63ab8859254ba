//! Task runner - the operator-facing state machine.
//!
//! ```text
//! pending → running → { paused, error, completed }
//! paused  → running          (resume)
//! error   → running          (resume)
//! ```
//!
//! The persisted `status` is the only coordination point between the runner
//! and a worker: the runner writes it, the worker polls it at every row
//! boundary. At most one worker per task processes rows at any time.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::client::{Credentials, EvidenceClassifier};
use crate::models::{
    find_column, AuditError, Config, ConsistencyReport, Dataset, ExportManifest, HistoryAction,
    HistoryEvent, Result, RowPage, RowScope, Task, TaskOptions, TaskSnapshot, TaskStatus,
    WorkingSet,
};
use crate::pool::{Worker, WorkerRegistry};

use super::{compare, Exporter};

/// Creates, drives and inspects audit tasks.
pub struct TaskRunner {
    config: Config,
    store: Arc<CheckpointStore>,
    exporter: Arc<Exporter>,
    classifier: Arc<dyn EvidenceClassifier>,
    registry: WorkerRegistry,
}

impl TaskRunner {
    /// Open the task and artifact directories named by `config`.
    pub fn new(config: Config, classifier: Arc<dyn EvidenceClassifier>) -> Result<Self> {
        let store = Arc::new(CheckpointStore::new(&config.storage.task_dir())?);
        let exporter = Arc::new(Exporter::new(&config.storage.artifact_dir())?);
        Ok(Self {
            config,
            store,
            exporter,
            classifier,
            registry: WorkerRegistry::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<CheckpointStore> {
        self.store.clone()
    }

    /// Persist a new `pending` task over `dataset`.
    pub fn create_task(
        &self,
        dataset: &Dataset,
        source_name: &str,
        operator: &str,
        options: &TaskOptions,
    ) -> Result<Task> {
        if dataset.is_empty() {
            return Err(AuditError::InvalidInput("dataset has no rows".into()));
        }
        validate_options(options)?;

        let amount_field = self.resolve_field(
            dataset,
            options.amount_field.as_deref(),
            &self.config.columns.amount,
            "amount",
        )?;
        let evidence_field = self.resolve_field(
            dataset,
            options.evidence_field.as_deref(),
            &self.config.columns.evidence,
            "evidence",
        )?;

        let total = dataset.len().min(options.max_rows);
        let now = chrono::Utc::now();
        let task = Task {
            task_id: Task::new_id(),
            status: TaskStatus::Pending,
            source_name: source_name.to_string(),
            operator: operator.to_string(),
            input_rows: dataset.len(),
            total,
            next_idx: 0,
            amount_field,
            evidence_field,
            model_name: options.model_name.trim().to_string(),
            max_evidence_items: options.max_evidence_items,
            checkpoint_every: options.checkpoint_every,
            rate: options.rate.clone(),
            error_message: None,
            artifacts: None,
            consistency: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let working = WorkingSet::from_source(dataset, total);
        self.store.create(&task, dataset, &working)?;

        self.record(HistoryEvent::new(&task, HistoryAction::TaskCreated).with_detail(json!({
            "total": total,
            "amount_field": task.amount_field,
            "evidence_field": task.evidence_field,
            "model_name": task.model_name,
        })));
        self.log(&task.task_id, &format!(
            "created from {} ({} rows, processing {})",
            source_name, task.input_rows, total
        ));
        info!(
            task_id = %task.task_id,
            input_rows = task.input_rows,
            total,
            "Task created"
        );
        Ok(task)
    }

    /// Create and start in one step. Credentials are checked before anything
    /// is written.
    pub fn submit(
        &self,
        dataset: &Dataset,
        source_name: &str,
        operator: &str,
        options: &TaskOptions,
        api_key: &str,
    ) -> Result<TaskSnapshot> {
        Credentials::new(api_key)?;
        let task = self.create_task(dataset, source_name, operator, options)?;
        self.start(&task.task_id, api_key)
    }

    /// Move a `pending` task to `running` and spawn its worker.
    ///
    /// No-op while a worker is alive. A `running` task without a worker (left
    /// over from a stopped process) gets a fresh one.
    pub fn start(&self, task_id: &str, api_key: &str) -> Result<TaskSnapshot> {
        let credentials = Credentials::new(api_key)?;
        if self.registry.is_alive(task_id) {
            debug!(task_id, "Start ignored, worker alive");
            return self.status(task_id);
        }

        let task = self.store.update(task_id, |t| match t.status {
            TaskStatus::Pending => {
                t.status = TaskStatus::Running;
                Ok(())
            }
            TaskStatus::Running => Ok(()),
            status => Err(AuditError::InvalidTransition {
                task_id: t.task_id.clone(),
                status,
                action: "start",
            }),
        })?;

        self.record(HistoryEvent::new(&task, HistoryAction::TaskStarted));
        self.log(task_id, &format!("started at row {}", task.next_idx));
        let worker = self.worker(task_id, credentials);
        self.registry.spawn_if_idle(task_id, worker.run());
        self.status(task_id)
    }

    /// Ask the worker of a `running` task to stop at the next row boundary.
    pub fn pause(&self, task_id: &str) -> Result<TaskSnapshot> {
        let task = self.store.update(task_id, |t| {
            if t.status != TaskStatus::Running {
                return Err(AuditError::InvalidTransition {
                    task_id: t.task_id.clone(),
                    status: t.status,
                    action: "pause",
                });
            }
            t.status = TaskStatus::Paused;
            Ok(())
        })?;

        self.record(HistoryEvent::new(&task, HistoryAction::TaskPaused));
        self.log(task_id, &format!("pause requested at row {}", task.next_idx));
        info!(task_id, next_idx = task.next_idx, "Pause requested");
        self.status(task_id)
    }

    /// Continue a paused, failed or interrupted task from its checkpoint,
    /// optionally with a new minimum call interval.
    ///
    /// The task is set `running` even while an old worker is still finishing
    /// a row: that worker then carries on, and a successor is queued behind
    /// it in case it had already decided to stop.
    pub fn resume(
        &self,
        task_id: &str,
        api_key: &str,
        min_interval_sec: Option<f64>,
    ) -> Result<TaskSnapshot> {
        if let Some(interval) = min_interval_sec {
            if !interval.is_finite() || interval < 0.0 {
                return Err(AuditError::InvalidInput(format!(
                    "min interval must be >= 0, got {interval}"
                )));
            }
        }
        let credentials = Credentials::new(api_key)?;

        let mut from = TaskStatus::Running;
        let task = self.store.update(task_id, |t| {
            if !t.status.is_resumable() {
                return Err(AuditError::InvalidTransition {
                    task_id: t.task_id.clone(),
                    status: t.status,
                    action: "resume",
                });
            }
            from = t.status;
            if let Some(interval) = min_interval_sec {
                t.rate.min_interval_sec = interval;
            }
            t.status = TaskStatus::Running;
            t.error_message = None;
            t.finished_at = None;
            Ok(())
        })?;

        self.record(
            HistoryEvent::new(&task, HistoryAction::TaskResumed).with_detail(json!({
                "from": from,
                "min_interval_sec": task.rate.min_interval_sec,
            })),
        );
        self.log(task_id, &format!(
            "resumed from {} at row {}, min interval {}s",
            from, task.next_idx, task.rate.min_interval_sec
        ));

        let worker = self.worker(task_id, credentials);
        if !self.registry.spawn_or_queue(task_id, worker.run()) {
            debug!(task_id, "Resume found a worker alive and one queued");
        }
        self.status(task_id)
    }

    fn worker(&self, task_id: &str, credentials: Credentials) -> Worker {
        Worker::new(
            task_id,
            self.store.clone(),
            self.classifier.clone(),
            credentials,
            self.exporter.clone(),
            self.config.columns.clone(),
        )
    }

    /// Current status view, with outcome counts taken from the row set.
    pub fn status(&self, task_id: &str) -> Result<TaskSnapshot> {
        let task = self.store.load(task_id)?;
        let (ok_rows, bad_rows) = match self.store.load_rows(task_id) {
            Ok(rows) => (rows.ok_count(), rows.bad_count()),
            Err(e) => {
                warn!(task_id, error = %e, "Row set unreadable, counts unavailable");
                (0, 0)
            }
        };

        Ok(TaskSnapshot {
            processed: task.next_idx.min(task.total),
            pending: task.pending(),
            progress_ratio: task.progress_ratio(),
            ok_rows,
            bad_rows,
            log_path: self.store.log_path(task_id),
            task_id: task.task_id,
            status: task.status,
            source_name: task.source_name,
            total: task.total,
            error_message: task.error_message,
            artifacts: task.artifacts,
            consistency: task.consistency,
            rate: task.rate,
            model_name: task.model_name,
            created_at: task.created_at,
            updated_at: task.updated_at,
            finished_at: task.finished_at,
        })
    }

    /// One page of the task's working rows.
    pub fn rows(&self, task_id: &str, scope: RowScope, page: usize, page_size: usize) -> Result<RowPage> {
        self.store.load(task_id)?;
        Ok(self.store.load_rows(task_id)?.page(scope, page, page_size))
    }

    /// Compare the working rows against the source snapshot now.
    pub fn check_consistency(&self, task_id: &str) -> Result<ConsistencyReport> {
        let task = self.store.load(task_id)?;
        let source = self.store.load_source(task_id)?;
        let rows = self.store.load_rows(task_id)?;
        let report = compare(&source.head(task.total), &rows, &self.config.columns);

        self.record(
            HistoryEvent::new(&task, HistoryAction::ConsistencyChecked).with_detail(json!({
                "ok": report.ok,
                "missing_rows": report.missing_rows,
                "extra_rows": report.extra_rows,
            })),
        );
        self.log(task_id, &format!("consistency check: {}", report.message));
        Ok(report)
    }

    /// Export processed and unprocessed rows as they stand.
    pub fn export_snapshot(&self, task_id: &str) -> Result<ExportManifest> {
        let task = self.store.load(task_id)?;
        let source = self.store.load_source(task_id)?;
        let rows = self.store.load_rows(task_id)?;
        let manifest = self.exporter.export_snapshot(&task, &rows, &source)?;

        self.record(
            HistoryEvent::new(&task, HistoryAction::SnapshotExported).with_detail(json!({
                "manifest": manifest.manifest_file,
                "files": manifest.files.len(),
            })),
        );
        self.log(task_id, &format!("snapshot exported to {}", manifest.manifest_file.display()));
        Ok(manifest)
    }

    /// Tail of the task's runtime log.
    pub fn logs(&self, task_id: &str, max_lines: usize) -> Result<Vec<String>> {
        self.store.load(task_id)?;
        self.store.read_log(task_id, max_lines)
    }

    fn record(&self, event: HistoryEvent) {
        if let Err(e) = self.store.append_history(&event) {
            warn!(task_id = %event.task_id, error = %e, "Failed to append history");
        }
    }

    pub fn read_history(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<HistoryEvent>> {
        self.store.read_history(task_id, limit)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.store.list_tasks()
    }

    /// Most recent task, optionally of one operator, optionally only among
    /// tasks that can still make progress.
    pub fn latest_task(&self, operator: Option<&str>, active_only: bool) -> Result<Option<Task>> {
        Ok(self.store.list_tasks()?.into_iter().find(|t| {
            operator.is_none_or(|op| t.operator == op)
                && (!active_only || !t.status.is_terminal())
        }))
    }

    pub fn is_worker_alive(&self, task_id: &str) -> bool {
        self.registry.is_alive(task_id)
    }

    /// Wait until the task's worker exits.
    pub async fn wait(&self, task_id: &str) {
        self.registry.wait(task_id).await;
    }

    /// Pause every task with a live worker and wait for the workers to exit.
    pub async fn shutdown(&self) {
        let live = self.registry.live_tasks();
        for task_id in &live {
            match self.pause(task_id) {
                Ok(_) | Err(AuditError::InvalidTransition { .. }) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Could not pause on shutdown"),
            }
        }
        for task_id in &live {
            self.registry.wait(task_id).await;
        }
        info!(workers = live.len(), "Runner shut down");
    }

    fn resolve_field(
        &self,
        dataset: &Dataset,
        explicit: Option<&str>,
        candidates: &[String],
        what: &str,
    ) -> Result<String> {
        if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
            return if dataset.columns.iter().any(|c| c == name) {
                Ok(name.to_string())
            } else {
                Err(AuditError::InvalidInput(format!(
                    "{what} column '{name}' not in dataset"
                )))
            };
        }

        find_column(&dataset.columns, candidates)
            .map(str::to_string)
            .ok_or_else(|| {
                AuditError::InvalidInput(format!(
                    "no {what} column found (tried: {})",
                    candidates.join(", ")
                ))
            })
    }

    fn log(&self, task_id: &str, message: &str) {
        if let Err(e) = self.store.append_log(task_id, message) {
            warn!(task_id, error = %e, "Failed to write runtime log");
        }
    }
}

fn validate_options(options: &TaskOptions) -> Result<()> {
    let invalid = |msg: &str| Err(AuditError::InvalidInput(msg.to_string()));
    let rate = &options.rate;

    if options.model_name.trim().is_empty() {
        return invalid("model name must not be empty");
    }
    if options.max_rows == 0 {
        return invalid("max rows must be at least 1");
    }
    if options.max_evidence_items == 0 {
        return invalid("max evidence items must be at least 1");
    }
    if options.checkpoint_every == 0 {
        return invalid("checkpoint interval must be at least 1");
    }
    if !rate.min_interval_sec.is_finite() || rate.min_interval_sec < 0.0 {
        return invalid("min interval must be >= 0");
    }
    if !rate.backoff_base_sec.is_finite() || rate.backoff_base_sec < 0.0 {
        return invalid("backoff base must be >= 0");
    }
    if !rate.backoff_cap_sec.is_finite() || rate.backoff_cap_sec < 0.0 {
        return invalid("backoff cap must be >= 0");
    }
    Ok(())
}
