//! Statement parameter values
//!
//! `SqlValue` is what a `{key}` placeholder renders from; `Params` is the
//! key/value set handed to every statement.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rp_core::TableMap;
use serde::Serialize;

/// A single parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    /// A point in time, always UTC
    Timestamp(NaiveDateTime),
    /// Expands to a comma separated list, e.g. for `IN (...)`
    List(Vec<SqlValue>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// The value used verbatim by a `table(name)` placeholder
    pub fn as_identifier(&self) -> Option<Cow<'_, str>> {
        match self {
            SqlValue::Text(s) => Some(Cow::Borrowed(s)),
            SqlValue::Int(n) => Some(Cow::Owned(n.to_string())),
            SqlValue::UInt(n) => Some(Cow::Owned(n.to_string())),
            SqlValue::Null
            | SqlValue::Bool(_)
            | SqlValue::Float(_)
            | SqlValue::Timestamp(_)
            | SqlValue::List(_) => None,
        }
    }
}

macro_rules! impl_from_int {
    ($variant:ident => $target:ty: $($source:ty),+) => {
        $(
            impl From<$source> for SqlValue {
                fn from(value: $source) -> Self {
                    SqlValue::$variant(value as $target)
                }
            }
        )+
    };
}

impl_from_int!(Int => i64: i8, i16, i32, i64, isize);
impl_from_int!(UInt => u64: u8, u16, u32, u64, usize);

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<f32> for SqlValue {
    fn from(value: f32) -> Self {
        SqlValue::Float(f64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value.naive_utc())
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(value: NaiveDate) -> Self {
        SqlValue::Timestamp(value.and_hms_opt(0, 0, 0).unwrap_or_default())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl<T: Into<SqlValue>> From<Vec<T>> for SqlValue {
    fn from(values: Vec<T>) -> Self {
        SqlValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    SqlValue::UInt(u)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => SqlValue::Text(s),
            Value::Array(items) => SqlValue::List(items.into_iter().map(SqlValue::from).collect()),
            // nested objects travel as their JSON text
            Value::Object(map) => SqlValue::Text(Value::Object(map).to_string()),
        }
    }
}

/// Named statement parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, SqlValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Params::insert`]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SqlValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&SqlValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build parameters from any entity that serializes to an object.
    ///
    /// Each top level field becomes one key. `None`/unit serializes to no
    /// parameters at all.
    pub fn from_serialize<T: Serialize + ?Sized>(entity: &T) -> Result<Self, serde_json::Error> {
        use serde::ser::Error as _;

        match serde_json::to_value(entity)? {
            serde_json::Value::Object(map) => Ok(map
                .into_iter()
                .map(|(key, value)| (key, SqlValue::from(value)))
                .collect()),
            serde_json::Value::Null => Ok(Self::new()),
            other => Err(serde_json::Error::custom(format!(
                "statement parameters must serialize to an object, got `{}`",
                other
            ))),
        }
    }

    /// The table map with these parameters laid over it. A parameter wins
    /// over a table entry with the same key.
    pub fn merged_over(&self, tables: &TableMap) -> Params {
        let mut merged: BTreeMap<String, SqlValue> = tables
            .iter()
            .map(|(logical, physical)| (logical.clone(), SqlValue::Text(physical.clone())))
            .collect();
        merged.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Params(merged)
    }
}

impl<K: Into<String>, V: Into<SqlValue>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Params(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<SqlValue>, const N: usize> From<[(K, V); N]> for Params {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::new()
    }
}

impl From<&Params> for Params {
    fn from(params: &Params) -> Self {
        params.clone()
    }
}
