//! Prompt construction and reply parsing for shipping-fee verification.

use serde_json::Value;
use std::sync::LazyLock;

use crate::models::{parse_money, MatchVerdict, ServiceError};

/// Amounts within this distance are considered equal.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

/// Instruction sent alongside the evidence images.
pub fn build_prompt(expected_amount: f64) -> String {
    format!(
        "你是电商售后财务审核助手。用户上传了同一条售后记录的一张或多张截图，按顺序排列。\n\
         请在所有图片中找到与\u{201c}运费/快递费/配送费/邮费/寄件费用/实付运费\u{201d}明确对应的金额（单位：元），\
         并与用户填写的金额核对。\n\
         用户填写的退回运费金额 expected_amount = {expected_amount:.2} 元。\n\
         规则：\n\
         1) 只认与运费字样紧邻的金额，不要把商品金额、订单合计、退款金额当作运费。\n\
         2) 免运费、0、0.00 都识别为 0。\n\
         3) 找不到运费字段或看不清时 paid_amount 返回 null，并在 reason 中说明原因。\n\
         4) 允许误差 0.01：相等 is_match=true，不等 false，无法识别为 null。\n\
         5) 不要猜测。\n\
         只输出一个 JSON 对象，不要其他文字：\
         {{\"paid_amount\": 数字或null, \"is_match\": true/false/null, \"reason\": \"简短说明\"}}"
    )
}

/// A reply reduced to the fields the worker stores.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub paid_amount: Option<f64>,
    pub verdict: MatchVerdict,
    pub reason: String,
}

static JSON_OBJECT: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\{[\s\S]*\}").expect("valid object pattern"));

/// Parse the service's reply text.
///
/// The text should be a JSON object, possibly wrapped in prose or a code
/// fence. A reply without such an object, or whose object carries neither
/// `paid_amount` nor `is_match`, is an invalid response and may be retried.
pub fn parse_reply(raw: &str, expected_amount: f64) -> Result<ParsedReply, ServiceError> {
    let object = find_object(raw).ok_or_else(|| {
        ServiceError::InvalidResponse(format!("reply is not JSON: {}", preview(raw)))
    })?;

    if !object.contains_key("paid_amount") && !object.contains_key("is_match") {
        return Err(ServiceError::InvalidResponse(format!(
            "reply lacks paid_amount and is_match: {}",
            preview(raw)
        )));
    }

    let paid_amount = object.get("paid_amount").and_then(parse_money);
    let mut is_match = object.get("is_match").and_then(as_flag);
    if is_match.is_none() {
        is_match = paid_amount.map(|paid| amounts_match(paid, expected_amount));
    }

    let reason = object
        .get("reason")
        .map(|r| match r {
            Value::String(s) => s.trim().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    let reason = if !reason.is_empty() {
        reason
    } else if is_match == Some(true) {
        "consistent".to_string()
    } else if paid_amount.is_none() {
        "amount unreadable in evidence".to_string()
    } else {
        "amount mismatch".to_string()
    };

    Ok(ParsedReply {
        paid_amount,
        verdict: MatchVerdict::from_flag(is_match),
        reason,
    })
}

/// Whether two amounts agree within [`AMOUNT_TOLERANCE`].
///
/// The bound is inclusive. Only representation error is allowed past it, so
/// 10.00 and 10.01 agree while 10.00 and 10.014 do not.
pub fn amounts_match(a: f64, b: f64) -> bool {
    let slack = f64::EPSILON * a.abs().max(b.abs()).max(1.0) * 4.0;
    (a - b).abs() <= AMOUNT_TOLERANCE + slack
}

fn find_object(raw: &str) -> Option<serde_json::Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw.trim()) {
        return Some(map);
    }
    let candidate = JSON_OBJECT.find(raw)?;
    match serde_json::from_str::<Value>(candidate.as_str()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn preview(raw: &str) -> String {
    let flat: String = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 120 {
        format!("{}...", flat.chars().take(120).collect::<String>())
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_expected_amount() {
        let prompt = build_prompt(12.5);
        assert!(prompt.contains("12.50"));
        assert!(prompt.contains("paid_amount"));
    }

    #[test]
    fn test_plain_json_reply() {
        let parsed = parse_reply(
            r#"{"paid_amount": 12.0, "is_match": true, "reason": "运费12元"}"#,
            12.0,
        )
        .unwrap();
        assert_eq!(parsed.paid_amount, Some(12.0));
        assert_eq!(parsed.verdict, MatchVerdict::Matched);
        assert_eq!(parsed.reason, "运费12元");
    }

    #[test]
    fn test_fenced_reply_is_found() {
        let raw = "好的，结果如下：\n```json\n{\"paid_amount\": \"8.00\", \"is_match\": false}\n```";
        let parsed = parse_reply(raw, 10.0).unwrap();
        assert_eq!(parsed.paid_amount, Some(8.0));
        assert_eq!(parsed.verdict, MatchVerdict::Mismatched);
        assert_eq!(parsed.reason, "amount mismatch");
    }

    #[test]
    fn test_missing_verdict_uses_tolerance() {
        let parsed = parse_reply(r#"{"paid_amount": 5.01, "is_match": null}"#, 5.0).unwrap();
        assert_eq!(parsed.verdict, MatchVerdict::Matched);
        assert_eq!(parsed.reason, "consistent");

        let parsed = parse_reply(r#"{"paid_amount": 5.02}"#, 5.0).unwrap();
        assert_eq!(parsed.verdict, MatchVerdict::Mismatched);
    }

    #[test]
    fn test_unreadable_amount_is_unknown() {
        let parsed = parse_reply(r#"{"paid_amount": null, "is_match": null}"#, 5.0).unwrap();
        assert_eq!(parsed.verdict, MatchVerdict::Unknown);
        assert_eq!(parsed.reason, "amount unreadable in evidence");
    }

    #[test]
    fn test_non_json_reply_is_retryable() {
        let err = parse_reply("I cannot see any image.", 5.0).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse(_)));
        assert!(err.is_retryable());

        let err = parse_reply(r#"{"answer": 5}"#, 5.0).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse(_)));
    }

    #[test]
    fn test_amount_tolerance_boundary() {
        assert!(amounts_match(10.0, 10.01));
        assert!(amounts_match(100.01, 100.0));
        assert!(amounts_match(0.1 + 0.2, 0.3));
        assert!(!amounts_match(10.0, 10.02));
        assert!(!amounts_match(10.0, 10.014));
        assert!(!amounts_match(10.014, 10.0));
        assert!(!amounts_match(1.0, 1.011));
    }

    #[test]
    fn test_near_miss_without_verdict_is_mismatch() {
        let parsed = parse_reply(r#"{"paid_amount": 10.014}"#, 10.0).unwrap();
        assert_eq!(parsed.verdict, MatchVerdict::Mismatched);
        assert_eq!(parsed.reason, "amount mismatch");
    }
}
