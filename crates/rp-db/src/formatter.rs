//! SQL template formatter
//!
//! Renders a statement template into executable SQL. Two placeholder forms
//! are recognized:
//!
//! * `table(name)` is replaced verbatim by the value of `name`, normally a
//!   physical table name from the table map. Unknown names stay untouched.
//! * `{key}` is replaced by the escaped value of `key`. Lists expand to
//!   comma separated escaped items, `NULL`/missing values to a bare `NULL`
//!   and timestamps to `YYYY-MM-DD HH:mm:ss` before escaping.
//!
//! ```ignore
//! let sql = format(&escape_value, "SELECT * FROM table(user) WHERE id IN ({ids})", &params);
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::Span;

use crate::value::{Params, SqlValue};

/// The `NULL` literal of a SQL statement
pub const NULL_VALUE: &str = "NULL";

/// Escapes one value into a string that is safe to inline into SQL
pub type EscapeFn = dyn Fn(&SqlValue) -> String + Send + Sync;

static TABLE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"table\(([a-zA-Z]+)?\)").expect("valid table placeholder pattern"));

static VALUE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-zA-Z0-9]+)?\}").expect("valid value placeholder pattern"));

/// Format a timestamp as `YYYY-MM-DD HH:mm:ss`
pub fn date_time_format(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Render `template` with `values`, routing every value through `escape`
pub fn format<E>(escape: &E, template: &str, values: &Params) -> String
where
    E: Fn(&SqlValue) -> String + ?Sized,
{
    let with_tables = TABLE_PLACEHOLDER.replace_all(template, |caps: &Captures| {
        caps.get(1)
            .and_then(|name| values.get(name.as_str()))
            .and_then(SqlValue::as_identifier)
            .map(Cow::into_owned)
            .unwrap_or_else(|| caps[0].to_string())
    });

    VALUE_PLACEHOLDER
        .replace_all(&with_tables, |caps: &Captures| {
            let item = caps.get(1).and_then(|key| values.get(key.as_str()));
            render_value(escape, item)
        })
        .into_owned()
}

fn render_value<E>(escape: &E, item: Option<&SqlValue>) -> String
where
    E: Fn(&SqlValue) -> String + ?Sized,
{
    match item {
        Some(SqlValue::List(items)) => items.iter().map(escape).collect::<Vec<_>>().join(","),
        None | Some(SqlValue::Null) => NULL_VALUE.to_string(),
        Some(SqlValue::Text(text)) if text == NULL_VALUE => NULL_VALUE.to_string(),
        Some(SqlValue::Timestamp(at)) => escape(&SqlValue::Text(date_time_format(at))),
        Some(value) => escape(value),
    }
}

/// The formatting hook every statement passes through before it reaches the
/// driver.
#[derive(Clone)]
pub struct QueryFormatter {
    escape: Arc<EscapeFn>,
    debug: bool,
    span: Span,
}

impl QueryFormatter {
    pub fn new(escape: Arc<EscapeFn>, debug: bool, span: Span) -> Self {
        Self { escape, debug, span }
    }

    pub fn format(&self, template: &str, values: &Params) -> String {
        let sql = format(self.escape.as_ref(), template, values);
        if self.debug {
            tracing::info!(parent: &self.span, sql = %sql, "SQL statement");
        }
        sql
    }

    pub fn escape(&self, value: &SqlValue) -> String {
        (self.escape)(value)
    }
}

impl std::fmt::Debug for QueryFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFormatter")
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}
