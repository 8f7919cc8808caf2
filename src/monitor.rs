//! Monitor-stream records emitted by worker processes.
//!
//! Workers periodically print one self-describing JSON object per line on
//! standard output. Each line parses independently of its neighbors; lines
//! that are not JSON objects are plain log output and are kept only in the
//! raw stream capture.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// One parsed monitor record, in arrival order within its task's stream.
#[derive(Debug, Clone)]
pub struct MonitorEntry {
    value: Value,
    received_at: DateTime<Utc>,
}

impl MonitorEntry {
    /// Parse a single output line. Returns `None` for anything that is not
    /// a JSON object — non-monitor output is not an error.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value @ Value::Object(_)) => Some(Self {
                value,
                received_at: Utc::now(),
            }),
            _ => None,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Look up a dotted key path, e.g. `progress.percent`.
    pub fn lookup(&self, key_path: &str) -> Option<&Value> {
        let mut current = &self.value;
        for segment in key_path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

/// Binary comparison operators usable in monitor-entry checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Parse an operator string from configuration.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "==" | "eq" => Some(Self::Eq),
            "!=" | "ne" => Some(Self::Ne),
            "<" | "lt" => Some(Self::Lt),
            "<=" | "le" => Some(Self::Le),
            ">" | "gt" => Some(Self::Gt),
            ">=" | "ge" => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Apply the operator to a monitor value and a reference value.
    ///
    /// Equality works on any JSON value. Ordering requires two numbers or
    /// two strings; anything else compares as `false` rather than erroring,
    /// since monitor content is outside this process's control.
    pub fn apply(&self, lhs: &Value, rhs: &Value) -> bool {
        match self {
            Self::Eq => values_equal(lhs, rhs),
            Self::Ne => !values_equal(lhs, rhs),
            Self::Lt | Self::Le | Self::Gt | Self::Ge => match partial_order(lhs, rhs) {
                Some(ord) => match self {
                    Self::Lt => ord == std::cmp::Ordering::Less,
                    Self::Le => ord != std::cmp::Ordering::Greater,
                    Self::Gt => ord == std::cmp::Ordering::Greater,
                    Self::Ge => ord != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                },
                None => false,
            },
        }
    }
}

/// Numeric equality across integer/float representations (`100 == 100.0`),
/// structural equality otherwise.
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn partial_order(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (lhs.as_str(), rhs.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json_object_line() {
        let entry = MonitorEntry::parse(r#"{"progress": {"percent": 42}}"#).unwrap();
        assert_eq!(entry.lookup("progress.percent"), Some(&json!(42)));
    }

    #[test]
    fn test_parse_rejects_plain_log_lines() {
        assert!(MonitorEntry::parse("step 42 done").is_none());
        assert!(MonitorEntry::parse("[1, 2, 3]").is_none());
        assert!(MonitorEntry::parse("{not json").is_none());
        assert!(MonitorEntry::parse("").is_none());
    }

    #[test]
    fn test_lookup_missing_key() {
        let entry = MonitorEntry::parse(r#"{"progress": {"percent": 42}}"#).unwrap();
        assert!(entry.lookup("progress.step").is_none());
        assert!(entry.lookup("nope").is_none());
        // Descending into a non-object yields nothing, not a panic.
        assert!(entry.lookup("progress.percent.deeper").is_none());
    }

    #[test]
    fn test_compare_op_parse() {
        assert_eq!(CompareOp::parse("=="), Some(CompareOp::Eq));
        assert_eq!(CompareOp::parse(">="), Some(CompareOp::Ge));
        assert_eq!(CompareOp::parse("lt"), Some(CompareOp::Lt));
        assert_eq!(CompareOp::parse("=<"), None);
    }

    #[test]
    fn test_numeric_comparison_across_representations() {
        assert!(CompareOp::Eq.apply(&json!(100), &json!(100.0)));
        assert!(CompareOp::Lt.apply(&json!(99.5), &json!(100)));
        assert!(CompareOp::Ge.apply(&json!(100), &json!(100)));
        assert!(!CompareOp::Gt.apply(&json!(100), &json!(100)));
    }

    #[test]
    fn test_string_ordering() {
        assert!(CompareOp::Lt.apply(&json!("alpha"), &json!("beta")));
        assert!(CompareOp::Ne.apply(&json!("alpha"), &json!("beta")));
    }

    #[test]
    fn test_mixed_types_order_as_false() {
        assert!(!CompareOp::Lt.apply(&json!("alpha"), &json!(3)));
        assert!(!CompareOp::Ge.apply(&json!(true), &json!(1)));
    }
}
