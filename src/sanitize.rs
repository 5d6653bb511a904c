//! Row sanitation for bulk loading.
//!
//! Every source value is flattened to a single string or null before it is
//! sent to the warehouse. The destination tables are all-text, so this is the
//! only place type information is (lossily) resolved:
//!
//! | source value          | sanitized form                     |
//! |-----------------------|------------------------------------|
//! | null                  | null                               |
//! | date / timestamp      | ISO-8601, UTC, millisecond, `Z`    |
//! | json / array          | compact JSON text                  |
//! | text                  | capped at [`MAX_TEXT_LENGTH`] chars |
//! | bool / int / float    | display string                     |

use crate::row::{Row, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;

/// Maximum length of a text value, in characters.
pub const MAX_TEXT_LENGTH: usize = 1024;

/// A sanitized value: a single string, or null.
pub type SanitizedValue = Option<String>;

/// A row whose values are all strings or null.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedRow {
    columns: Vec<(String, SanitizedValue)>,
}

impl SanitizedRow {
    /// Column names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Iterate over columns in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    /// Value of a column; `None` when the column is absent or null.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Whether the row has the given column (null or not).
    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Restrict the row to `columns`, in that order.
    ///
    /// Keys not listed are dropped; listed columns missing from the row are null.
    pub fn project(&self, columns: &[String]) -> SanitizedRow {
        SanitizedRow {
            columns: columns
                .iter()
                .map(|c| (c.clone(), self.value(c).map(str::to_string)))
                .collect(),
        }
    }

    /// Render as a JSON object, for diagnostics.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.columns
                .iter()
                .map(|(n, v)| {
                    let v = v.clone().map(JsonValue::String).unwrap_or(JsonValue::Null);
                    (n.clone(), v)
                })
                .collect(),
        )
    }
}

impl From<SanitizedRow> for Row {
    fn from(row: SanitizedRow) -> Self {
        row.columns
            .into_iter()
            .map(|(n, v)| (n, v.map(Value::Text).unwrap_or(Value::Null)))
            .collect()
    }
}

impl<K: Into<String>> FromIterator<(K, SanitizedValue)> for SanitizedRow {
    fn from_iter<I: IntoIterator<Item = (K, SanitizedValue)>>(iter: I) -> Self {
        SanitizedRow {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Sanitize every column of a row, keeping column order.
pub fn sanitize_row(row: &Row) -> SanitizedRow {
    row.iter()
        .map(|(name, value)| (name, sanitize_value(value)))
        .collect()
}

/// Sanitize a single value.
pub fn sanitize_value(value: &Value) -> SanitizedValue {
    match value {
        Value::Null => None,
        Value::Timestamp(ts) => Some(format_timestamp(ts)),
        Value::Json(_) | Value::Array(_) => Some(value.to_json().to_string()),
        Value::Text(s) => Some(truncate(s, MAX_TEXT_LENGTH).to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(format_float(*f)),
    }
}

/// Format a timestamp as ISO-8601 in UTC with millisecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Cut `s` to at most `max` characters.
pub fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn format_float(f: f64) -> String {
    if f.is_infinite() {
        if f.is_sign_positive() {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if f != 0.0 && (f.abs() >= 1e21 || f.abs() < 1e-6) {
        // Exponent form outside [1e-6, 1e21), with an explicit `+`.
        let s = format!("{:e}", f);
        match s.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => s,
        }
    } else {
        f.to_string()
    }
}
