//! Identity-key comparison of a source table against a processed table.
//!
//! A processed table is consistent with its source when the multisets of
//! normalized `(id, order_no, logistics_no)` keys are equal: no row lost, no
//! row duplicated or invented.

use std::collections::HashMap;

use crate::models::{
    normalize_identifier, ColumnConfig, ConsistencyReport, IdentityKey, KeyColumns, Table,
};

/// Maximum keys listed per side in a report.
pub const MAX_SAMPLES: usize = 20;

/// Compare the identity keys of `source` and `processed`.
pub fn compare(source: &dyn Table, processed: &dyn Table, columns: &ColumnConfig) -> ConsistencyReport {
    let mut report = ConsistencyReport {
        source_rows: source.row_count(),
        processed_rows: processed.row_count(),
        ..Default::default()
    };

    let src_cols = KeyColumns::resolve(source.columns(), columns);
    let dst_cols = KeyColumns::resolve(processed.columns(), columns);
    report.source_key_columns = src_cols.clone();
    report.processed_key_columns = dst_cols.clone();

    let (src_cols, dst_cols) = match (src_cols, dst_cols) {
        (Some(s), Some(d)) => (s, d),
        (s, d) => {
            let mut sides = Vec::new();
            if s.is_none() {
                sides.push("source");
            }
            if d.is_none() {
                sides.push("processed");
            }
            report.message = format!(
                "cannot compare: id, order number or logistics number column not found in {} rows",
                sides.join(" and ")
            );
            return report;
        }
    };

    let src_keys: Vec<IdentityKey> = source.records().map(|r| src_cols.key_of(r)).collect();
    let dst_keys: Vec<IdentityKey> = processed.records().map(|r| dst_cols.key_of(r)).collect();

    let src_counts = count(&src_keys);
    let dst_counts = count(&dst_keys);

    let (missing_rows, missing_samples) = difference(&src_keys, &src_counts, &dst_counts);
    let (extra_rows, extra_samples) = difference(&dst_keys, &dst_counts, &src_counts);

    report.can_compare = true;
    report.ok = missing_rows == 0 && extra_rows == 0;
    report.missing_rows = missing_rows;
    report.extra_rows = extra_rows;
    report.missing_samples = missing_samples;
    report.extra_samples = extra_samples;
    report.source_duplicate_count = duplicate_logistics(source, &src_cols.logistics_no);
    report.processed_duplicate_count = duplicate_logistics(processed, &dst_cols.logistics_no);
    report.message = if report.ok {
        format!("{} rows, nothing missing or extra", report.source_rows)
    } else {
        format!("{missing_rows} rows missing, {extra_rows} rows extra")
    };
    report
}

fn count(keys: &[IdentityKey]) -> HashMap<&IdentityKey, usize> {
    let mut counts = HashMap::new();
    for key in keys {
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

/// Occurrences in `left` not matched in `right`, with samples in `left`
/// order.
fn difference(
    left: &[IdentityKey],
    left_counts: &HashMap<&IdentityKey, usize>,
    right_counts: &HashMap<&IdentityKey, usize>,
) -> (usize, Vec<IdentityKey>) {
    let mut surplus: HashMap<&IdentityKey, usize> = left_counts
        .iter()
        .filter_map(|(key, n)| {
            let extra = n.saturating_sub(right_counts.get(key).copied().unwrap_or(0));
            (extra > 0).then_some((*key, extra))
        })
        .collect();
    let total = surplus.values().sum();

    let mut samples = Vec::new();
    for key in left {
        if samples.len() >= MAX_SAMPLES {
            break;
        }
        if let Some(n) = surplus.get_mut(key).filter(|n| **n > 0) {
            *n -= 1;
            samples.push(key.clone());
        }
    }
    (total, samples)
}

/// Distinct non-empty logistics numbers occurring more than once.
fn duplicate_logistics(table: &dyn Table, column: &str) -> usize {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in table.records() {
        let value = record.get(column).map(normalize_identifier).unwrap_or_default();
        if !value.is_empty() {
            *counts.entry(value).or_insert(0) += 1;
        }
    }
    counts.values().filter(|n| **n > 1).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dataset, Record, WorkingSet};
    use serde_json::{json, Value};

    fn row(id: &str, order: Value, logistics: Value) -> Record {
        json!({"id": id, "order_no": order, "logistics_no": logistics, "amount": "5"})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn abc() -> Dataset {
        Dataset::from_rows(vec![
            row("A", json!("O1"), json!("SF1")),
            row("B", json!("O2"), json!("SF2")),
            row("C", json!("O3"), json!("SF3")),
        ])
    }

    #[test]
    fn test_identical_tables_are_consistent() {
        let source = abc();
        let report = compare(&source, &source, &ColumnConfig::default());
        assert!(report.can_compare);
        assert!(report.ok);
        assert_eq!(report.missing_rows, 0);
        assert_eq!(report.extra_rows, 0);
    }

    #[test]
    fn test_empty_tables_with_known_columns_are_consistent() {
        let empty = Dataset::with_columns(
            vec!["id".into(), "order_no".into(), "logistics_no".into()],
            Vec::new(),
        );
        let report = compare(&empty, &empty, &ColumnConfig::default());
        assert!(report.can_compare);
        assert!(report.ok);
    }

    #[test]
    fn test_missing_row_is_reported() {
        let source = abc();
        let processed = source.head(2);
        let report = compare(&source, &processed, &ColumnConfig::default());
        assert!(report.can_compare);
        assert!(!report.ok);
        assert_eq!(report.missing_rows, 1);
        assert_eq!(report.extra_rows, 0);
        assert_eq!(report.missing_samples.len(), 1);
        assert_eq!(report.missing_samples[0].id, "C");
    }

    #[test]
    fn test_duplicated_row_is_extra() {
        let source = abc();
        let mut processed = source.clone();
        processed.rows.push(source.rows[0].clone());
        let report = compare(&source, &processed, &ColumnConfig::default());
        assert_eq!(report.extra_rows, 1);
        assert_eq!(report.missing_rows, 0);
        assert_eq!(report.processed_duplicate_count, 1);
        assert_eq!(report.source_duplicate_count, 0);
    }

    #[test]
    fn test_numeric_and_scientific_keys_normalize_equal() {
        let source = Dataset::from_rows(vec![row("A", json!(123456789012_i64), json!("SF9"))]);
        let processed = Dataset::from_rows(vec![row("A", json!("1.23456789012E+11"), json!("SF9"))]);
        let report = compare(&source, &processed, &ColumnConfig::default());
        assert!(report.ok, "{}", report.message);
    }

    #[test]
    fn test_working_set_compares_by_fields() {
        let source = abc();
        let working = WorkingSet::from_source(&source, 3);
        assert!(compare(&source, &working, &ColumnConfig::default()).ok);
    }

    #[test]
    fn test_missing_columns_cannot_compare() {
        let source = abc();
        let processed = Dataset::from_rows(vec![json!({"amount": "5"})
            .as_object()
            .cloned()
            .unwrap()]);
        let report = compare(&source, &processed, &ColumnConfig::default());
        assert!(!report.can_compare);
        assert!(!report.ok);
        assert!(report.message.contains("processed"));
    }
}
