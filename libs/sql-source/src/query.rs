//! Incremental query construction.
//!
//! Every table is polled with the same statement shape:
//!
//! ```text
//! SELECT <columns> FROM <table> WHERE <indicator> > ? ORDER BY <indicator>
//! ```
//!
//! Ascending order is mandatory: the transformer relies on the last row of a
//! batch carrying the batch's maximum indicator value.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::fmt;

use crate::error::{SourceError, SourceResult};
use crate::watermark::{decode_timestamp, IndicatorType, TableSpec, Watermark};

/// Literal layout the database expects for timestamp parameters.
pub const SQL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQL flavour, derived once from the connection URL and passed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// `?` placeholders, `LIMIT n`
    #[default]
    Generic,
    /// `$1` placeholders, `LIMIT n`
    Postgres,
    /// `?` placeholders, `LIMIT n`
    MySql,
}

impl Dialect {
    pub fn from_url(url: &str) -> Self {
        let url = url.to_ascii_lowercase();
        if url.starts_with("postgres") || url.contains("postgresql") {
            Dialect::Postgres
        } else if url.contains("mysql") || url.contains("mariadb") {
            Dialect::MySql
        } else {
            Dialect::Generic
        }
    }

    fn placeholder(&self) -> &'static str {
        match self {
            Dialect::Postgres => "$1",
            _ => "?",
        }
    }
}

/// The single bound parameter of an incremental query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Timestamp(NaiveDateTime),
    Integer(i64),
    Text(String),
}

impl QueryParam {
    /// Parameter rendered as a SQL literal value (without quoting).
    pub fn literal(&self) -> String {
        match self {
            QueryParam::Timestamp(ts) => ts.format(SQL_TIMESTAMP_FORMAT).to_string(),
            QueryParam::Integer(v) => v.to_string(),
            QueryParam::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for QueryParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.literal())
    }
}

/// A ready-to-run incremental statement.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalQuery {
    pub table: String,
    pub sql: String,
    pub param: QueryParam,
    /// Result cap already rendered into `sql`, if any
    pub max_rows: Option<u32>,
    /// Driver fetch-size hint, matches `max_rows`
    pub fetch_size: Option<u32>,
}

/// Builds incremental statements for one source.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    dialect: Dialect,
    max_rows: u32,
}

impl QueryBuilder {
    /// `max_rows == 0` means unbounded.
    pub fn new(dialect: Dialect, max_rows: u32) -> Self {
        Self { dialect, max_rows }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Build the statement for `spec` starting after the watermark's
    /// current position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPosition` when a DATE position is not a valid
    /// `yyyyMMddHHmmss` timestamp. This is not a transient failure.
    pub fn build(&self, spec: &TableSpec, watermark: &mut Watermark) -> SourceResult<IncrementalQuery> {
        let position = watermark.current_position();
        let param = bind_position(spec, position)?;

        let cap = (self.max_rows > 0).then_some(self.max_rows);
        let limit = cap.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();

        let sql = format!(
            "SELECT {} FROM {} WHERE {} > {} ORDER BY {}{}",
            spec.projection(),
            spec.name,
            spec.indicator_column,
            self.dialect.placeholder(),
            spec.indicator_column,
            limit
        );

        Ok(IncrementalQuery {
            table: spec.name.clone(),
            sql,
            param,
            max_rows: cap,
            fetch_size: cap,
        })
    }
}

fn bind_position(spec: &TableSpec, position: i64) -> SourceResult<QueryParam> {
    match spec.indicator_type {
        IndicatorType::Date => {
            let ts = decode_timestamp(position).ok_or_else(|| SourceError::InvalidPosition {
                table: spec.name.clone(),
                position,
                reason: "expected a 14 digit yyyyMMddHHmmss timestamp".to_string(),
            })?;
            let ts = match spec.lookback_seconds {
                Some(seconds) if seconds > 0 => ts - ChronoDuration::seconds(i64::from(seconds)),
                _ => ts,
            };
            Ok(QueryParam::Timestamp(ts))
        }
        IndicatorType::Number => Ok(QueryParam::Integer(position)),
        IndicatorType::String => Ok(QueryParam::Text(position.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableSpec {
        TableSpec::new("orders", "id", IndicatorType::Number)
    }

    #[test]
    fn test_generic_statement_shape() {
        let builder = QueryBuilder::new(Dialect::Generic, 0);
        let spec = orders();
        let mut watermark = spec.initial_watermark();

        let query = builder.build(&spec, &mut watermark).unwrap();
        assert_eq!(query.sql, "SELECT * FROM orders WHERE ID > ? ORDER BY ID");
        assert_eq!(query.param, QueryParam::Integer(-1));
        assert_eq!(query.max_rows, None);
        assert_eq!(query.fetch_size, None);
    }

    #[test]
    fn test_row_cap_per_dialect() {
        let spec = orders().with_select_columns(vec!["id".into(), "total".into()]);

        let mut watermark = spec.initial_watermark();
        let query = QueryBuilder::new(Dialect::Postgres, 500)
            .build(&spec, &mut watermark)
            .unwrap();
        assert_eq!(
            query.sql,
            "SELECT id, total FROM orders WHERE ID > $1 ORDER BY ID LIMIT 500"
        );
        assert_eq!(query.max_rows, Some(500));
        assert_eq!(query.fetch_size, Some(500));

        let query = QueryBuilder::new(Dialect::MySql, 10)
            .build(&spec, &mut watermark)
            .unwrap();
        assert!(query.sql.ends_with("WHERE ID > ? ORDER BY ID LIMIT 10"));
    }

    #[test]
    fn test_date_binding_with_lookback() {
        let spec = TableSpec::new("events", "ts", IndicatorType::Date).with_lookback_seconds(30);
        let mut watermark = spec.initial_watermark().with_position(20210901103000);

        let query = QueryBuilder::default().build(&spec, &mut watermark).unwrap();
        assert_eq!(query.param.literal(), "2021-09-01 10:29:30");
        // Lookback only shifts the bound value, never the stored position.
        assert_eq!(watermark.raw_position(), Some(20210901103000));
    }

    #[test]
    fn test_date_binding_rejects_malformed_position() {
        let spec = TableSpec::new("events", "ts", IndicatorType::Date);
        let mut watermark = spec.initial_watermark().with_position(2021090110);

        let err = QueryBuilder::default().build(&spec, &mut watermark).unwrap_err();
        assert!(matches!(err, SourceError::InvalidPosition { position: 2021090110, .. }));
    }

    #[test]
    fn test_string_binding() {
        let spec = TableSpec::new("codes", "code", IndicatorType::String);
        let mut watermark = spec.initial_watermark().with_position(2021000122);

        let query = QueryBuilder::default().build(&spec, &mut watermark).unwrap();
        assert_eq!(query.param, QueryParam::Text("2021000122".to_string()));
    }

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(Dialect::from_url("postgres://localhost/db"), Dialect::Postgres);
        assert_eq!(Dialect::from_url("jdbc:mysql://localhost:3306/db"), Dialect::MySql);
        assert_eq!(Dialect::from_url("mariadb://localhost/db"), Dialect::MySql);
        assert_eq!(
            Dialect::from_url("jdbc:sqlserver://host;databaseName=db"),
            Dialect::Generic
        );
        assert_eq!(Dialect::from_url("sqlite::memory:"), Dialect::Generic);
    }
}
