//! Column lookup and identifier normalization.
//!
//! Row sources come from hand-maintained spreadsheets, so header names drift
//! (`*订单号` vs `订单号`) and identifiers arrive as floats or in scientific
//! notation (`1.23457E+11`). Everything that compares identifiers goes through
//! [`normalize_identifier`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use super::{ColumnConfig, Record};

/// First candidate present in `columns`, exact match.
pub fn find_column<'a>(columns: &'a [String], candidates: &[String]) -> Option<&'a str> {
    candidates
        .iter()
        .find_map(|candidate| columns.iter().find(|c| *c == candidate))
        .map(String::as_str)
}

/// Exact candidates first, then the first column whose lowercased name
/// contains any keyword.
pub fn find_column_with_fallback<'a>(
    columns: &'a [String],
    candidates: &[String],
    keywords: &[String],
) -> Option<&'a str> {
    if let Some(found) = find_column(columns, candidates) {
        return Some(found);
    }

    columns
        .iter()
        .find(|column| {
            let name = column.trim().to_lowercase();
            keywords
                .iter()
                .any(|k| !k.is_empty() && name.contains(&k.to_lowercase()))
        })
        .map(String::as_str)
}

/// Columns that make up the identity key of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumns {
    pub id: String,
    pub order_no: String,
    pub logistics_no: String,
}

impl KeyColumns {
    /// Locate all three key columns, or `None` if any is missing.
    pub fn resolve(columns: &[String], config: &ColumnConfig) -> Option<Self> {
        let id = find_column_with_fallback(columns, &config.id, &config.id_keywords)?;
        let order_no =
            find_column_with_fallback(columns, &config.order_no, &config.order_no_keywords)?;
        let logistics_no =
            find_column_with_fallback(columns, &config.logistics_no, &config.logistics_no_keywords)?;
        Some(Self {
            id: id.to_string(),
            order_no: order_no.to_string(),
            logistics_no: logistics_no.to_string(),
        })
    }

    /// Build the normalized identity key of one record.
    pub fn key_of(&self, record: &Record) -> IdentityKey {
        let get = |column: &str| {
            record
                .get(column)
                .map(normalize_identifier)
                .unwrap_or_default()
        };
        IdentityKey {
            id: get(&self.id),
            order_no: get(&self.order_no),
            logistics_no: get(&self.logistics_no),
        }
    }
}

/// Normalized `(id, order_no, logistics_no)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub id: String,
    pub order_no: String,
    pub logistics_no: String,
}

/// Canonical text of an identifier cell.
pub fn normalize_identifier(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map(canonical_float).unwrap_or_default()
            }
        }
        Value::String(s) => normalize_identifier_text(s),
        other => other.to_string(),
    }
}

/// Trim, then expand scientific notation if the text is a bare number in it.
pub fn normalize_identifier_text(text: &str) -> String {
    let text = text.trim();
    expand_scientific(text).unwrap_or_else(|| text.to_string())
}

fn canonical_float(value: f64) -> String {
    if !value.is_finite() {
        return String::new();
    }
    if value.fract() == 0.0 && value.abs() < 1e21 {
        return format!("{value:.0}");
    }
    // Display for f64 never uses an exponent.
    let text = value.to_string();
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

static SCIENTIFIC: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[+-]?(?:\d+\.?\d*|\.\d+)[eE][+-]?\d+$").expect("valid scientific pattern")
});

/// Largest exponent we are willing to expand.
const MAX_EXPONENT: i64 = 64;

/// Rewrite `1.23457E+11` as `123457000000` without going through a float.
fn expand_scientific(text: &str) -> Option<String> {
    if !SCIENTIFIC.is_match(text) {
        return None;
    }

    let (mantissa, exponent) = text.split_once(['e', 'E'])?;
    let exponent: i64 = exponent.parse().ok()?;
    if exponent.abs() > MAX_EXPONENT {
        return None;
    }

    let (negative, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, mantissa.strip_prefix('+').unwrap_or(mantissa)),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits = format!("{int_part}{frac_part}");
    let point = int_part.len() as i64 + exponent;

    let (whole, fraction) = if point <= 0 {
        (String::new(), format!("{}{}", "0".repeat((-point) as usize), digits))
    } else if point as usize >= digits.len() {
        (
            format!("{}{}", digits, "0".repeat(point as usize - digits.len())),
            String::new(),
        )
    } else {
        let (w, f) = digits.split_at(point as usize);
        (w.to_string(), f.to_string())
    };

    let whole = whole.trim_start_matches('0');
    let whole = if whole.is_empty() { "0" } else { whole };
    let fraction = fraction.trim_end_matches('0');
    let body = if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{fraction}")
    };

    if negative && body != "0" {
        Some(format!("-{body}"))
    } else {
        Some(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scientific_notation_is_expanded() {
        assert_eq!(normalize_identifier_text("1.23457E+11"), "123457000000");
        assert_eq!(normalize_identifier_text(" 7.5e-1 "), "0.75");
        assert_eq!(normalize_identifier_text("-2E2"), "-200");
        assert_eq!(normalize_identifier_text("1.50E+1"), "15");
        assert_eq!(normalize_identifier_text("SF1234567890"), "SF1234567890");
        assert_eq!(normalize_identifier_text("1e999"), "1e999");
    }

    #[test]
    fn test_numbers_become_canonical_text() {
        assert_eq!(normalize_identifier(&json!(4200123456789_i64)), "4200123456789");
        assert_eq!(normalize_identifier(&json!(123456.0)), "123456");
        assert_eq!(normalize_identifier(&json!(12.50)), "12.5");
        assert_eq!(normalize_identifier(&Value::Null), "");
    }

    #[test]
    fn test_float_and_text_forms_agree() {
        assert_eq!(
            normalize_identifier(&json!(75187093420.0)),
            normalize_identifier(&json!("7.518709342E+10"))
        );
    }

    #[test]
    fn test_fallback_column_lookup() {
        let columns = cols(&["买家旺旺", "订单号", "退货物流号"]);
        let config = ColumnConfig::default();
        let keys = KeyColumns::resolve(&columns, &config).unwrap();
        assert_eq!(keys.id, "买家旺旺");
        assert_eq!(keys.order_no, "订单号");
        assert_eq!(keys.logistics_no, "退货物流号");
    }

    #[test]
    fn test_exact_candidate_beats_keyword() {
        let columns = cols(&["订单备注", "*订单号"]);
        let found = find_column_with_fallback(
            &columns,
            &cols(&["订单号", "*订单号"]),
            &cols(&["订单"]),
        );
        assert_eq!(found, Some("*订单号"));
    }

    #[test]
    fn test_missing_key_column() {
        let columns = cols(&["amount", "evidence"]);
        assert!(KeyColumns::resolve(&columns, &ColumnConfig::default()).is_none());
    }
}
