//! Per-table watermark model.
//!
//! Every indicator type is encoded as a comparable `i64` so advancing and
//! comparing is type-agnostic; only normalization of raw values looks at
//! the type:
//!
//! - `DATE`: `yyyyMMddHHmmss` as a decimal integer (e.g. `20210901103000`)
//! - `NUMBER`: the raw numeric value
//! - `STRING`: the string with `-`, `:` and whitespace removed, parsed as an integer
//!
//! DATE positions are wall-clock times in the host's local zone. Zoned
//! database values are converted to that zone before they reach a watermark.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{SourceError, SourceResult};

/// Compact timestamp layout used for DATE positions.
pub const POSITION_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Number of digits in a DATE position.
const POSITION_TIMESTAMP_DIGITS: usize = 14;

/// Type of the indicator column, governs binding and normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorType {
    Date,
    Number,
    String,
}

impl IndicatorType {
    /// Starting position for a table that has neither a checkpoint nor a
    /// configured start value.
    pub fn default_position(&self) -> i64 {
        match self {
            IndicatorType::Date => encode_timestamp(&Local::now().naive_local()),
            IndicatorType::Number => -1,
            IndicatorType::String => 0,
        }
    }
}

impl FromStr for IndicatorType {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "date" => Ok(IndicatorType::Date),
            "number" => Ok(IndicatorType::Number),
            "string" => Ok(IndicatorType::String),
            other => Err(SourceError::config(format!(
                "unknown indicator type '{}' (expected date, number or string)",
                other
            ))),
        }
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndicatorType::Date => "date",
            IndicatorType::Number => "number",
            IndicatorType::String => "string",
        };
        f.write_str(name)
    }
}

/// Encode a timestamp as a `yyyyMMddHHmmss` integer.
pub fn encode_timestamp(ts: &NaiveDateTime) -> i64 {
    i64::from(ts.year()) * 10_000_000_000
        + i64::from(ts.month()) * 100_000_000
        + i64::from(ts.day()) * 1_000_000
        + i64::from(ts.hour()) * 10_000
        + i64::from(ts.minute()) * 100
        + i64::from(ts.second())
}

/// Decode a `yyyyMMddHHmmss` position. Returns `None` unless the position is
/// exactly 14 digits and names a real calendar instant.
pub fn decode_timestamp(position: i64) -> Option<NaiveDateTime> {
    let digits = position.to_string();
    if digits.len() != POSITION_TIMESTAMP_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(&digits, POSITION_TIMESTAMP_FORMAT).ok()
}

/// Host-local wall-clock time of a zoned instant.
pub fn to_local_wall_time(instant: &DateTime<Utc>) -> NaiveDateTime {
    instant.with_timezone(&Local).naive_local()
}

/// The instant a host-local wall-clock time names. Ambiguous times resolve
/// to the earlier instant; times skipped by a DST jump return `None`.
pub fn local_instant(wall_time: &NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(wall_time).earliest()
}

/// Static configuration of one polled table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    /// Table name, also the checkpoint key
    pub name: String,
    /// Upper-cased indicator column
    pub indicator_column: String,
    pub indicator_type: IndicatorType,
    /// Projection, `None` selects `*`
    pub select_columns: Option<Vec<String>>,
    /// Constant fields appended to every record, in order
    pub static_fields: Vec<(String, String)>,
    /// Position of the indicator column within the projection
    pub indicator_column_index: Option<usize>,
    /// Seconds subtracted from a DATE position before querying
    pub lookback_seconds: Option<u32>,
    /// Configured initial position, overridden by the checkpoint
    pub start_from: Option<i64>,
}

impl TableSpec {
    pub fn new(
        name: impl Into<String>,
        indicator_column: impl AsRef<str>,
        indicator_type: IndicatorType,
    ) -> Self {
        Self {
            name: name.into(),
            indicator_column: indicator_column.as_ref().to_uppercase(),
            indicator_type,
            select_columns: None,
            static_fields: Vec::new(),
            indicator_column_index: None,
            lookback_seconds: None,
            start_from: None,
        }
    }

    pub fn with_select_columns(mut self, columns: Vec<String>) -> Self {
        self.select_columns = Some(columns);
        self
    }

    /// Attach static fields. Names and values must pair up one to one.
    pub fn with_static_fields(
        mut self,
        names: Vec<String>,
        values: Vec<String>,
    ) -> SourceResult<Self> {
        if names.len() != values.len() {
            return Err(SourceError::config(format!(
                "table {}: static_fields length ({}) must match static_values length ({})",
                self.name,
                names.len(),
                values.len()
            )));
        }
        self.static_fields = names.into_iter().zip(values).collect();
        Ok(self)
    }

    pub fn with_indicator_column_index(mut self, index: usize) -> Self {
        self.indicator_column_index = Some(index);
        self
    }

    pub fn with_lookback_seconds(mut self, seconds: u32) -> Self {
        self.lookback_seconds = Some(seconds);
        self
    }

    pub fn with_start_from(mut self, position: i64) -> Self {
        self.start_from = Some(position);
        self
    }

    /// Column list rendered for the SELECT clause.
    pub fn projection(&self) -> String {
        match &self.select_columns {
            Some(columns) if !columns.is_empty() => columns.join(", "),
            _ => "*".to_string(),
        }
    }

    /// Fresh watermark seeded from the configured start value.
    pub fn initial_watermark(&self) -> Watermark {
        let watermark = Watermark::new(&self.name, self.indicator_type);
        match self.start_from {
            Some(position) => watermark.with_position(position),
            None => watermark,
        }
    }
}

/// Current extraction boundary of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    table: String,
    indicator_type: IndicatorType,
    position: Option<i64>,
}

impl Watermark {
    pub fn new(table: impl Into<String>, indicator_type: IndicatorType) -> Self {
        Self {
            table: table.into(),
            indicator_type,
            position: None,
        }
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn indicator_type(&self) -> IndicatorType {
        self.indicator_type
    }

    /// Stored position without applying defaults.
    pub fn raw_position(&self) -> Option<i64> {
        self.position
    }

    /// Current position. An unset position, or a zero DATE position, is
    /// replaced by the type default, which is then pinned.
    pub fn current_position(&mut self) -> i64 {
        let needs_default = match self.position {
            None => true,
            Some(0) => self.indicator_type == IndicatorType::Date,
            Some(_) => false,
        };
        if needs_default {
            let position = self.indicator_type.default_position();
            debug!(table = %self.table, position, "Applying default watermark");
            self.position = Some(position);
        }
        self.position.unwrap_or_default()
    }

    /// Overwrite the position from an external source (checkpoint).
    pub fn restore(&mut self, position: i64) {
        self.position = Some(position);
    }

    /// Advance to `max(current, observed)`.
    ///
    /// Empty input leaves the position untouched.
    pub fn advance(&mut self, observed_raw: &str) -> SourceResult<i64> {
        let current = self.current_position();
        let normalized = normalize(observed_raw, self.indicator_type);
        if normalized.is_empty() {
            return Ok(current);
        }

        let observed: i64 =
            normalized
                .parse()
                .map_err(|_| SourceError::InvalidWatermarkValue {
                    table: self.table.clone(),
                    value: observed_raw.to_string(),
                })?;

        let next = current.max(observed);
        self.position = Some(next);
        Ok(next)
    }
}

fn normalize(raw: &str, indicator_type: IndicatorType) -> String {
    let mut normalized: String = raw
        .chars()
        .filter(|c| *c != '-' && *c != ':' && !c.is_whitespace())
        .collect();
    if indicator_type == IndicatorType::Date && normalized.len() > POSITION_TIMESTAMP_DIGITS {
        // Non-ASCII input never parses anyway; keep truncation on a char boundary.
        let cut = normalized
            .char_indices()
            .nth(POSITION_TIMESTAMP_DIGITS)
            .map(|(i, _)| i)
            .unwrap_or(normalized.len());
        normalized.truncate(cut);
    }
    normalized
}

/// A table's static spec paired with its live watermark.
#[derive(Debug, Clone)]
pub struct TableState {
    pub spec: TableSpec,
    pub watermark: Watermark,
}

impl TableState {
    pub fn new(spec: TableSpec) -> Self {
        let watermark = spec.initial_watermark();
        Self { spec, watermark }
    }
}
