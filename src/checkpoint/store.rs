//! Durable task state.
//!
//! Layout under the task directory:
//! - `<id>.task.json`: task record (previous version kept as `<id>.backup.json`)
//! - `<id>.rows.json`: working row set
//! - `<id>.source.json`: source snapshot, written once
//! - `<id>.log`: runtime log lines
//! - `history.jsonl`: operation history of all tasks
//!
//! Every replace goes through a temp file and `fs::rename`, so readers see
//! either the old or the new document. Mutations of one task are serialized by
//! a per-task lock; different tasks never contend.

use crate::models::{AuditError, Dataset, HistoryEvent, Result, Task, WorkingSet};
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// File-backed store for task records, row sets and history.
#[derive(Debug)]
pub struct CheckpointStore {
    /// Directory holding all task files
    dir: PathBuf,
    /// One lock per task id
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Serializes appends to the shared history file
    history_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| AuditError::io("creating task dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: DashMap::new(),
            history_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn task_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.task.json"))
    }

    pub fn backup_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.backup.json"))
    }

    pub fn rows_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.rows.json"))
    }

    pub fn source_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.source.json"))
    }

    pub fn log_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.log"))
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join("history.jsonl")
    }

    fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist a new task with its source snapshot and working rows.
    ///
    /// The task record is written last, so a listed task always has its rows.
    pub fn create(&self, task: &Task, source: &Dataset, working: &WorkingSet) -> Result<()> {
        let lock = self.lock_for(&task.task_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.task_path(&task.task_id).exists() {
            return Err(AuditError::InvalidInput(format!(
                "task {} already exists",
                task.task_id
            )));
        }

        write_atomic(&self.source_path(&task.task_id), source, false)?;
        write_atomic(&self.rows_path(&task.task_id), working, false)?;
        write_atomic(&self.task_path(&task.task_id), task, true)?;

        debug!(task_id = %task.task_id, total = task.total, "Task created");
        Ok(())
    }

    /// Load a task record.
    pub fn load(&self, task_id: &str) -> Result<Task> {
        let path = self.task_path(task_id);
        if !path.exists() {
            return Err(AuditError::TaskNotFound(task_id.to_string()));
        }
        read_json(&path)
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.task_path(task_id).exists()
    }

    /// Replace the task record.
    pub fn save(&self, task: &Task) -> Result<()> {
        let lock = self.lock_for(&task.task_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_task(task)
    }

    /// Read-modify-write a task record under its lock.
    ///
    /// Nothing is written if `f` fails. Returns the stored record.
    pub fn update<F>(&self, task_id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut task = self.load(task_id)?;
        f(&mut task)?;
        task.touch();
        self.write_task(&task)?;
        Ok(task)
    }

    fn write_task(&self, task: &Task) -> Result<()> {
        let path = self.task_path(&task.task_id);

        // Backup existing record
        if path.exists() {
            fs::copy(&path, self.backup_path(&task.task_id))
                .map_err(|e| AuditError::io("backing up task record", e))?;
        }

        write_atomic(&path, task, true)
    }

    /// Load the working row set.
    pub fn load_rows(&self, task_id: &str) -> Result<WorkingSet> {
        read_json(&self.rows_path(task_id))
    }

    /// Replace the working row set.
    pub fn save_rows(&self, task_id: &str, rows: &WorkingSet) -> Result<()> {
        write_atomic(&self.rows_path(task_id), rows, false)?;
        debug!(task_id, rows = rows.len(), "Rows saved");
        Ok(())
    }

    /// Load the source snapshot.
    pub fn load_source(&self, task_id: &str) -> Result<Dataset> {
        read_json(&self.source_path(task_id))
    }

    /// All readable task records, newest first.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let pattern = self.dir.join("*.task.json");
        let pattern_str = pattern.to_string_lossy();

        let paths: Vec<PathBuf> = glob::glob(&pattern_str)
            .map_err(|e| AuditError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        let mut tasks = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json::<Task>(&path) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable task record"),
            }
        }

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    /// Append one event to the history file and sync it.
    pub fn append_history(&self, event: &HistoryEvent) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| AuditError::Internal(format!("Serializing history event: {e}")))?;

        let _guard = self.history_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .map_err(|e| AuditError::io("opening history", e))?;
        writeln!(file, "{line}").map_err(|e| AuditError::io("appending history", e))?;
        file.sync_all()
            .map_err(|e| AuditError::io("syncing history", e))?;
        Ok(())
    }

    /// History events, oldest first, optionally for one task, at most `limit`
    /// of the most recent.
    pub fn read_history(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<HistoryEvent>> {
        let file = match File::open(self.history_path()) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuditError::io("opening history", e)),
        };

        let mut events = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| AuditError::io("reading history", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEvent>(&line) {
                Ok(event) if task_id.is_none_or(|id| event.task_id == id) => events.push(event),
                Ok(_) => {}
                Err(e) => warn!(line = line_num + 1, error = %e, "Skipping bad history line"),
            }
        }

        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }

    /// Append a timestamped line to the task's runtime log.
    pub fn append_log(&self, task_id: &str, message: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(task_id))
            .map_err(|e| AuditError::io("opening runtime log", e))?;
        writeln!(
            file,
            "[{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            message
        )
        .map_err(|e| AuditError::io("writing runtime log", e))?;
        Ok(())
    }

    /// Last `max_lines` lines of the task's runtime log.
    pub fn read_log(&self, task_id: &str, max_lines: usize) -> Result<Vec<String>> {
        let content = match fs::read_to_string(self.log_path(task_id)) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuditError::io("reading runtime log", e)),
        };
        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }
}

/// Write `value` as JSON to a sibling temp file, sync it, then rename over
/// `path`.
pub(crate) fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    replace_atomic(path, |writer| {
        let written = if pretty {
            serde_json::to_writer_pretty(writer, value)
        } else {
            serde_json::to_writer(writer, value)
        };
        written.map_err(|e| AuditError::Internal(format!("Serializing {}: {e}", path.display())))
    })
}

/// Stream `fill` into a sibling temp file, sync it, then rename over `path`.
///
/// On failure the temp file is left behind and `path` is untouched.
pub(crate) fn replace_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let temp_path = path.with_extension("tmp");
    let context = path.display().to_string();

    let file = File::create(&temp_path)
        .map_err(|e| AuditError::io(format!("creating temp file for {context}"), e))?;
    let mut writer = BufWriter::new(file);
    fill(&mut writer)?;

    let file = writer
        .into_inner()
        .map_err(|e| AuditError::io(format!("flushing {context}"), e.into_error()))?;
    file.sync_all()
        .map_err(|e| AuditError::io(format!("syncing {context}"), e))?;

    // Atomic rename
    fs::rename(&temp_path, path).map_err(|e| AuditError::io(format!("renaming {context}"), e))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| AuditError::io(format!("opening {}", path.display()), e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| AuditError::CorruptCheckpoint {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;
    use crate::models::{HistoryAction, MatchVerdict, Record, RowResult, TaskStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn dataset(n: usize) -> Dataset {
        Dataset::from_rows(
            (0..n)
                .map(|i| {
                    json!({"id": i, "amount": "5"})
                        .as_object()
                        .cloned()
                        .unwrap_or_else(Record::new)
                })
                .collect(),
        )
    }

    fn store_with_task(id: &str, n: usize) -> (TempDir, CheckpointStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path()).unwrap();
        let source = dataset(n);
        let working = WorkingSet::from_source(&source, n);
        store
            .create(&fixtures::task(id, n), &source, &working)
            .unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_create_and_load() {
        let (_dir, store) = store_with_task("t1", 3);
        let task = store.load("t1").unwrap();
        assert_eq!(task.total, 3);
        assert_eq!(store.load_rows("t1").unwrap().len(), 3);
        assert_eq!(store.load_source("t1").unwrap().len(), 3);
        assert!(matches!(store.load("nope"), Err(AuditError::TaskNotFound(_))));
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let (_dir, store) = store_with_task("t1", 1);
        let source = dataset(1);
        let working = WorkingSet::from_source(&source, 1);
        assert!(store
            .create(&fixtures::task("t1", 1), &source, &working)
            .is_err());
    }

    #[test]
    fn test_update_keeps_backup_and_leaves_no_temp() {
        let (dir, store) = store_with_task("t1", 2);
        let updated = store
            .update("t1", |t| {
                t.status = TaskStatus::Running;
                t.next_idx = 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Running);
        assert_eq!(store.load("t1").unwrap().next_idx, 1);

        let backup: Task = read_json(&store.backup_path("t1")).unwrap();
        assert_eq!(backup.status, TaskStatus::Pending);

        let temps: Vec<_> = glob::glob(&dir.path().join("*.tmp").to_string_lossy())
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(temps.is_empty());
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let (_dir, store) = store_with_task("t1", 2);
        let result = store.update("t1", |t| {
            t.next_idx = 2;
            Err(AuditError::InvalidInput("refused".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.load("t1").unwrap().next_idx, 0);
    }

    #[test]
    fn test_rows_round_trip_with_results() {
        let (_dir, store) = store_with_task("t1", 2);
        let mut rows = store.load_rows("t1").unwrap();
        rows.rows[0].result = Some(RowResult {
            extracted_amount: Some(5.0),
            verdict: MatchVerdict::Matched,
            note: String::new(),
            attempts: 1,
        });
        store.save_rows("t1", &rows).unwrap();
        let loaded = store.load_rows("t1").unwrap();
        assert!(loaded.rows[0].is_ok());
        assert!(!loaded.rows[1].is_processed());
    }

    #[test]
    fn test_corrupt_rows_file() {
        let (_dir, store) = store_with_task("t1", 2);
        fs::write(store.rows_path("t1"), "{ not json").unwrap();
        let err = store.load_rows("t1").unwrap_err();
        assert!(matches!(err, AuditError::CorruptCheckpoint { .. }));
        assert!(err.is_persistence());
    }

    #[test]
    fn test_list_tasks_skips_corrupt_records() {
        let (_dir, store) = store_with_task("t1", 1);
        let source = dataset(1);
        let working = WorkingSet::from_source(&source, 1);
        store
            .create(&fixtures::task("t2", 1), &source, &working)
            .unwrap();
        fs::write(store.task_path("broken"), "[]").unwrap();

        let tasks = store.list_tasks().unwrap();
        let mut ids: Vec<_> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn test_history_filter_and_limit() {
        let (_dir, store) = store_with_task("t1", 1);
        let task = store.load("t1").unwrap();
        let mut other = task.clone();
        other.task_id = "t2".into();

        store
            .append_history(&HistoryEvent::new(&task, HistoryAction::TaskCreated))
            .unwrap();
        store
            .append_history(&HistoryEvent::new(&other, HistoryAction::TaskCreated))
            .unwrap();
        store
            .append_history(&HistoryEvent::new(&task, HistoryAction::TaskStarted))
            .unwrap();

        assert_eq!(store.read_history(None, 100).unwrap().len(), 3);
        let mine = store.read_history(Some("t1"), 100).unwrap();
        assert_eq!(mine.len(), 2);
        let last = store.read_history(Some("t1"), 1).unwrap();
        assert_eq!(last[0].action, HistoryAction::TaskStarted);
    }

    #[test]
    fn test_runtime_log_tail() {
        let (_dir, store) = store_with_task("t1", 1);
        assert!(store.read_log("t1", 10).unwrap().is_empty());
        for i in 0..5 {
            store.append_log("t1", &format!("line {i}")).unwrap();
        }
        let tail = store.read_log("t1", 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].ends_with("line 4"));
    }
}
