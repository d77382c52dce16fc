//! Database session boundary.
//!
//! The extraction core only needs to open a session, ask whether it is
//! still alive, run one parameterized statement and close it again. Those
//! operations live behind [`Connector`] and [`DatabaseSession`] so tests
//! and other drivers can plug in. The sqlx-backed implementations live in
//! [`crate::postgres`] and [`crate::mysql`].

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::SourceResult;
use crate::query::IncrementalQuery;

/// A single column value in its database-native shape.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

/// One result tuple: column name to value, in projection order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: SqlValue) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: SqlValue) {
        self.columns.push((name.into(), value));
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Exact lookup first, then a case-insensitive match.
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|(column, _)| column.eq_ignore_ascii_case(name))
            })
            .map(|(_, value)| value)
    }

    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.columns.get(index).map(|(_, value)| value)
    }
}

impl FromIterator<(String, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// Opens database sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: DatabaseSession;

    async fn connect(&self) -> SourceResult<Self::Session>;
}

/// An open database session.
#[async_trait]
pub trait DatabaseSession: Send {
    /// Liveness probe. `false` triggers a reconnect before the next query.
    async fn is_connected(&mut self) -> bool;

    /// Run an incremental statement and return every row.
    async fn fetch(&mut self, query: &IncrementalQuery) -> SourceResult<Vec<Row>>;

    async fn close(&mut self) -> SourceResult<()>;
}

/// NUMERIC/DECIMAL value: integral values with scale 0 become integers so
/// they can drive a NUMBER watermark; everything else keeps its exact text.
pub(crate) fn decimal_value(value: Decimal) -> SqlValue {
    if value.scale() == 0 {
        if let Some(integer) = value.to_i64() {
            return SqlValue::Integer(integer);
        }
    }
    SqlValue::Text(value.to_string())
}

/// Current UTC offset of the host zone as `+HH:MM`, for pinning a database
/// session to the same wall clock as DATE watermarks.
pub(crate) fn local_utc_offset() -> String {
    format_utc_offset(Local::now().offset().local_minus_utc())
}

fn format_utc_offset(seconds: i32) -> String {
    let sign = if seconds < 0 { '-' } else { '+' };
    let minutes = seconds.unsigned_abs() / 60;
    format!("{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup() {
        let row = Row::new()
            .with("id", SqlValue::Integer(7))
            .with("UPDATED_AT", SqlValue::Text("x".into()));

        assert_eq!(row.get("id"), Some(&SqlValue::Integer(7)));
        assert_eq!(row.get("ID"), Some(&SqlValue::Integer(7)));
        assert_eq!(row.get("updated_at"), Some(&SqlValue::Text("x".into())));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.get_index(1), Some(&SqlValue::Text("x".into())));
        assert_eq!(row.get_index(2), None);
    }

    #[test]
    fn test_exact_match_wins_over_case_insensitive() {
        let row = Row::new()
            .with("Env", SqlValue::Text("a".into()))
            .with("ENV", SqlValue::Text("b".into()));
        assert_eq!(row.get("ENV"), Some(&SqlValue::Text("b".into())));
    }

    #[test]
    fn test_decimal_values() {
        assert_eq!(decimal_value(Decimal::new(1045, 0)), SqlValue::Integer(1045));
        assert_eq!(decimal_value(Decimal::new(1250, 2)), SqlValue::Text("12.50".into()));
        assert_eq!(
            decimal_value(Decimal::from_i128_with_scale(i128::from(i64::MAX) + 1, 0)),
            SqlValue::Text("9223372036854775808".into())
        );
    }

    #[test]
    fn test_utc_offset_format() {
        assert_eq!(format_utc_offset(0), "+00:00");
        assert_eq!(format_utc_offset(8 * 3600), "+08:00");
        assert_eq!(format_utc_offset(-(3 * 3600 + 1800)), "-03:30");
        assert_eq!(format_utc_offset(5 * 3600 + 45 * 60), "+05:45");
    }
}
