//! Row transformation and watermark advance.
//!
//! Each raw [`Row`] becomes a new self-describing [`Record`]:
//! nulls are blanked, date/time values are rendered with the configured
//! output format, and the table's static fields are appended last so they
//! win over same-named columns. While walking the batch the table's
//! watermark is advanced to the largest indicator value seen.

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDateTime;
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::error::{SourceError, SourceResult};
use crate::query::SQL_TIMESTAMP_FORMAT;
use crate::session::{Row, SqlValue};
use crate::watermark::{TableSpec, Watermark};

/// Default output layout for date/time values.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One emitted record: field name to value, in column order.
pub type Record = Map<String, Value>;

/// Output of transforming one table batch.
#[derive(Debug, Default)]
pub struct TransformReport {
    pub records: Vec<Record>,
    /// Rows whose indicator value could not advance the watermark
    pub rejected_indicators: usize,
    /// Rows whose indicator column was missing, null or empty
    pub null_indicators: usize,
}

#[derive(Debug, Clone)]
pub struct RowTransformer {
    date_format: String,
}

impl Default for RowTransformer {
    fn default() -> Self {
        Self {
            date_format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

impl RowTransformer {
    /// `date_format` is a chrono strftime pattern.
    pub fn new(date_format: impl Into<String>) -> SourceResult<Self> {
        let date_format = date_format.into();
        if StrftimeItems::new(&date_format).any(|item| matches!(item, Item::Error)) {
            return Err(SourceError::config(format!(
                "invalid output date format '{}'",
                date_format
            )));
        }
        Ok(Self { date_format })
    }

    /// Transform a batch and advance `watermark` in place.
    ///
    /// A row whose indicator value is malformed is still emitted; it just
    /// does not move the watermark.
    pub fn transform(
        &self,
        spec: &TableSpec,
        watermark: &mut Watermark,
        rows: &[Row],
    ) -> TransformReport {
        let mut report = TransformReport {
            records: Vec::with_capacity(rows.len()),
            rejected_indicators: 0,
            null_indicators: 0,
        };

        for row in rows {
            let mut record: Record = row
                .iter()
                .map(|(name, value)| (name.to_string(), self.render(value)))
                .collect();

            match indicator_value(spec, row) {
                Some(raw) => {
                    if let Err(e) = watermark.advance(&raw) {
                        warn!(table = %spec.name, error = %e, "Skipping watermark advance for row");
                        report.rejected_indicators += 1;
                    }
                }
                None => {
                    warn!(
                        table = %spec.name,
                        column = %spec.indicator_column,
                        "Indicator value is empty or null, row does not advance the watermark"
                    );
                    report.null_indicators += 1;
                }
            }

            for (name, value) in &spec.static_fields {
                record.insert(name.clone(), Value::String(value.clone()));
            }

            report.records.push(record);
        }

        if !rows.is_empty() {
            debug!(
                table = %spec.name,
                rows = rows.len(),
                position = ?watermark.raw_position(),
                "Transformed batch"
            );
        }

        report
    }

    fn render(&self, value: &SqlValue) -> Value {
        match value {
            SqlValue::Null => Value::String(String::new()),
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::Integer(i) => Value::Number((*i).into()),
            SqlValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Date(d) => Value::String(self.format(&d.and_time(Default::default()))),
            SqlValue::Timestamp(ts) => Value::String(self.format(ts)),
        }
    }

    fn format(&self, ts: &NaiveDateTime) -> String {
        ts.format(&self.date_format).to_string()
    }
}

/// Raw indicator string of a row, independent of the output date format.
fn indicator_value(spec: &TableSpec, row: &Row) -> Option<String> {
    let value = row
        .get(&spec.indicator_column)
        .or_else(|| spec.indicator_column_index.and_then(|i| row.get_index(i)))?;

    let raw = match value {
        SqlValue::Null => return None,
        SqlValue::Bool(_) => return None,
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Float(f) => f.to_string(),
        SqlValue::Text(s) => s.clone(),
        SqlValue::Date(d) => d
            .and_time(Default::default())
            .format(SQL_TIMESTAMP_FORMAT)
            .to_string(),
        SqlValue::Timestamp(ts) => ts.format(SQL_TIMESTAMP_FORMAT).to_string(),
    };
    (!raw.is_empty()).then_some(raw)
}
