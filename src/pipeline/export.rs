//! Partitioned JSON Lines export of a task's rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::checkpoint::{replace_atomic, write_atomic};
use crate::models::{
    short_hex, ArtifactKind, ArtifactRef, AuditError, AuditRow, Dataset, ExportManifest, Record,
    Result, Task, WorkingSet,
};

/// Result columns appended to exported rows.
pub const COL_EXTRACTED_AMOUNT: &str = "audit_extracted_amount";
pub const COL_VERDICT: &str = "audit_verdict";
pub const COL_NOTE: &str = "audit_note";
pub const COL_ATTEMPTS: &str = "audit_attempts";

/// Manifest document written next to the partitions.
#[derive(Serialize)]
struct ManifestDocument<'a> {
    task_id: &'a str,
    exported_at: DateTime<Utc>,
    snapshot: bool,
    next_idx: usize,
    total: usize,
    files: &'a [ArtifactRef],
}

/// Writes row partitions into the artifact directory.
pub struct Exporter {
    dir: PathBuf,
}

impl Exporter {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| AuditError::io("creating artifact dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Completion export: matched rows, unmatched rows, rows never reached.
    ///
    /// Source rows beyond `task.total` count as never reached.
    pub fn export(&self, task: &Task, working: &WorkingSet, source: &Dataset) -> Result<ExportManifest> {
        let mut ok = Vec::new();
        let mut bad = Vec::new();
        let mut pending = Vec::new();

        for row in &working.rows {
            match &row.result {
                Some(result) if result.verdict.is_matched() => ok.push(export_record(row)),
                Some(_) => bad.push(export_record(row)),
                None => pending.push(export_record(row)),
            }
        }
        pending.extend(source.rows.iter().skip(task.total).cloned());

        self.write_all(
            task,
            false,
            vec![
                (ArtifactKind::Ok, ok),
                (ArtifactKind::Bad, bad),
                (ArtifactKind::Pending, pending),
            ],
        )
    }

    /// Mid-task export: processed and unprocessed rows, with processed rows
    /// also split into ok and bad.
    pub fn export_snapshot(
        &self,
        task: &Task,
        working: &WorkingSet,
        source: &Dataset,
    ) -> Result<ExportManifest> {
        let mut processed = Vec::new();
        let mut unprocessed = Vec::new();
        let mut ok = Vec::new();
        let mut bad = Vec::new();

        for row in &working.rows {
            let record = export_record(row);
            match &row.result {
                Some(result) => {
                    if result.verdict.is_matched() {
                        ok.push(record.clone());
                    } else {
                        bad.push(record.clone());
                    }
                    processed.push(record);
                }
                None => unprocessed.push(record),
            }
        }
        unprocessed.extend(source.rows.iter().skip(task.total).cloned());

        self.write_all(
            task,
            true,
            vec![
                (ArtifactKind::Processed, processed),
                (ArtifactKind::Unprocessed, unprocessed),
                (ArtifactKind::Ok, ok),
                (ArtifactKind::Bad, bad),
            ],
        )
    }

    fn write_all(
        &self,
        task: &Task,
        snapshot: bool,
        partitions: Vec<(ArtifactKind, Vec<Record>)>,
    ) -> Result<ExportManifest> {
        let stamp = Utc::now();
        let prefix = format!("{}_{}", stamp.format("%Y%m%d_%H%M%S"), task.task_id);

        let mut files = Vec::new();
        for (kind, records) in partitions {
            if records.is_empty() {
                continue;
            }
            let path = self.dir.join(format!("{prefix}_{kind}_{}.jsonl", short_hex()));
            write_lines(&path, &records)?;
            files.push(ArtifactRef {
                kind,
                path,
                rows: records.len(),
            });
        }

        let manifest_file = self.dir.join(format!("{prefix}_manifest_{}.json", short_hex()));
        let document = ManifestDocument {
            task_id: &task.task_id,
            exported_at: stamp,
            snapshot,
            next_idx: task.next_idx,
            total: task.total,
            files: &files,
        };
        write_atomic(&manifest_file, &document, true)?;

        info!(
            task_id = %task.task_id,
            files = files.len(),
            snapshot,
            "Artifacts exported"
        );
        Ok(ExportManifest {
            files,
            manifest_file,
        })
    }
}

/// Input fields plus result columns.
fn export_record(row: &AuditRow) -> Record {
    let mut record = row.fields.clone();
    if let Some(result) = &row.result {
        record.insert(
            COL_EXTRACTED_AMOUNT.to_string(),
            result.extracted_amount.map_or(Value::Null, Value::from),
        );
        record.insert(COL_VERDICT.to_string(), Value::from(result.verdict.to_string()));
        record.insert(COL_NOTE.to_string(), Value::from(result.note.clone()));
        record.insert(COL_ATTEMPTS.to_string(), Value::from(result.attempts));
    }
    record
}

fn write_lines(path: &Path, records: &[Record]) -> Result<()> {
    replace_atomic(path, |writer| {
        for record in records {
            serde_json::to_writer(&mut *writer, record)
                .map_err(|e| AuditError::Internal(format!("Serializing row: {e}")))?;
            writer
                .write_all(b"\n")
                .map_err(|e| AuditError::io(format!("writing {}", path.display()), e))?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fixtures, MatchVerdict, RowResult};
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn source(n: usize) -> Dataset {
        Dataset::from_rows(
            (0..n)
                .map(|i| json!({"id": format!("R{i}"), "amount": "5"}).as_object().cloned().unwrap())
                .collect(),
        )
    }

    fn result(verdict: MatchVerdict) -> Option<RowResult> {
        Some(RowResult {
            extracted_amount: Some(5.0),
            verdict,
            note: String::new(),
            attempts: 1,
        })
    }

    fn read_ids(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_partitions_cover_rows_without_overlap() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path()).unwrap();
        let src = source(6);
        let mut task = fixtures::task("t1", 4);
        task.input_rows = 6;
        let mut working = WorkingSet::from_source(&src, 4);
        working.rows[0].result = result(MatchVerdict::Matched);
        working.rows[1].result = result(MatchVerdict::Mismatched);
        working.rows[2].result = result(MatchVerdict::Unknown);

        let manifest = exporter.export(&task, &working, &src).unwrap();
        assert_eq!(manifest.rows(ArtifactKind::Ok), 1);
        assert_eq!(manifest.rows(ArtifactKind::Bad), 2);
        assert_eq!(manifest.rows(ArtifactKind::Pending), 3);

        let mut seen = HashSet::new();
        for file in &manifest.files {
            for id in read_ids(&file.path) {
                assert!(seen.insert(id), "row exported twice");
            }
        }
        assert_eq!(seen.len(), 6);
        assert!(manifest.manifest_file.exists());
    }

    #[test]
    fn test_empty_partitions_are_omitted() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path()).unwrap();
        let src = source(2);
        let task = fixtures::task("t1", 2);
        let mut working = WorkingSet::from_source(&src, 2);
        for row in &mut working.rows {
            row.result = result(MatchVerdict::Matched);
        }

        let manifest = exporter.export(&task, &working, &src).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert!(manifest.ok_file().is_some());
        assert!(manifest.bad_file().is_none());
        assert!(manifest.pending_file().is_none());

        let line = fs::read_to_string(manifest.ok_file().unwrap()).unwrap();
        let first: Value = serde_json::from_str(line.lines().next().unwrap()).unwrap();
        assert_eq!(first[COL_VERDICT], "matched");
        assert_eq!(first[COL_NOTE], "");
    }

    #[test]
    fn test_repeat_export_writes_fresh_files() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path()).unwrap();
        let src = source(1);
        let task = fixtures::task("t1", 1);
        let working = WorkingSet::from_source(&src, 1);

        let first = exporter.export(&task, &working, &src).unwrap();
        let second = exporter.export(&task, &working, &src).unwrap();
        assert_ne!(first.pending_file(), second.pending_file());
        assert_eq!(read_ids(first.pending_file().unwrap()), read_ids(second.pending_file().unwrap()));
    }

    #[test]
    fn test_snapshot_partitions() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path()).unwrap();
        let src = source(3);
        let task = fixtures::task("t1", 3);
        let mut working = WorkingSet::from_source(&src, 3);
        working.rows[0].result = result(MatchVerdict::Matched);

        let manifest = exporter.export_snapshot(&task, &working, &src).unwrap();
        assert_eq!(manifest.rows(ArtifactKind::Processed), 1);
        assert_eq!(manifest.rows(ArtifactKind::Unprocessed), 2);
        assert_eq!(manifest.rows(ArtifactKind::Ok), 1);
        assert!(manifest.file(ArtifactKind::Bad).is_none());
    }

    #[test]
    fn test_export_replaces_files_atomically() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path()).unwrap();
        let src = source(3);
        let task = fixtures::task("t1", 3);
        let mut working = WorkingSet::from_source(&src, 3);
        working.rows[0].result = result(MatchVerdict::Matched);

        let manifest = exporter.export(&task, &working, &src).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");

        let document: Value =
            serde_json::from_str(&fs::read_to_string(&manifest.manifest_file).unwrap()).unwrap();
        assert_eq!(document["task_id"], "t1");
        assert_eq!(document["files"].as_array().unwrap().len(), manifest.files.len());
        assert_eq!(document["snapshot"], false);
    }
}
