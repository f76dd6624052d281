//! MySQL value escaping
//!
//! Produces literals for the MySQL text protocol: strings are single quoted
//! with backslash escapes, numbers and booleans are bare, lists are comma
//! separated.

use crate::formatter::{date_time_format, NULL_VALUE};
use crate::value::SqlValue;

/// Escape one value into an inline SQL literal
pub fn escape_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => NULL_VALUE.to_string(),
        SqlValue::Bool(b) => b.to_string(),
        SqlValue::Int(n) => n.to_string(),
        SqlValue::UInt(n) => n.to_string(),
        SqlValue::Float(f) if f.is_finite() => f.to_string(),
        SqlValue::Float(_) => NULL_VALUE.to_string(),
        SqlValue::Text(s) => escape_string(s),
        SqlValue::Timestamp(at) => escape_string(&date_time_format(at)),
        SqlValue::List(items) => items
            .iter()
            .map(|item| match item {
                SqlValue::List(_) => format!("({})", escape_value(item)),
                other => escape_value(other),
            })
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Quote a string literal
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\0' => out.push_str("\\0"),
            '\x08' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}
