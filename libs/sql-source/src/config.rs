//! Source configuration.
//!
//! Loaded from a TOML/YAML/JSON file and overridden by `SQL_SOURCE__*`
//! environment variables (`__` separates sections, e.g.
//! `SQL_SOURCE__CONNECTION__PASSWORD`).
//!
//! ```toml
//! [connection]
//! url = "postgres://db:5432/shop"
//! user = "reader"
//! password = "secret"
//! read_only = true
//!
//! [checkpoint]
//! path = "/var/lib/sql-source"
//! file_name = "shop.status"
//!
//! [[tables]]
//! name = "orders"
//! indicator_column = "updated_at"
//! indicator_type = "date"
//! static_fields = "env,dc"
//! static_values = "prod,eu"
//! ```

use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

use crate::error::{SourceError, SourceResult};
use crate::query::{Dialect, QueryBuilder};
use crate::sink::{LineEncoder, OutputFormat};
use crate::transform::{RowTransformer, DEFAULT_DATE_FORMAT};
use crate::watermark::{IndicatorType, TableSpec, TableState};

const ENV_PREFIX: &str = "SQL_SOURCE";

/// A comma separated string or a list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldList {
    Csv(String),
    List(Vec<String>),
}

impl FieldList {
    pub fn items(&self) -> Vec<String> {
        let items: Vec<String> = match self {
            FieldList::Csv(s) => s.split(',').map(|v| v.trim().to_string()).collect(),
            FieldList::List(v) => v.iter().map(|v| v.trim().to_string()).collect(),
        };
        items.into_iter().filter(|v| !v.is_empty()).collect()
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SourceConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    #[validate(nested)]
    pub poll: PollConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionConfig {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    /// Open sessions read-only
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding the checkpoint file
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
    pub file_name: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            file_name: None,
        }
    }
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("/var/lib/sql-source")
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PollConfig {
    /// Delay between the end of one cycle and the start of the next
    #[serde(default = "default_interval_ms")]
    #[validate(range(min = 1))]
    pub interval_ms: u64,

    /// Records flushed to the sink at a time
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,

    /// Result cap per query, 0 = unbounded
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,

    /// Retries after a failed query attempt
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 100))]
    pub max_retries: u32,

    #[serde(default)]
    pub retry_backoff_ms: u64,
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_max_rows() -> u32 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            max_rows: default_max_rows(),
            max_retries: default_max_retries(),
            retry_backoff_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// chrono strftime pattern for date/time values
    #[serde(default = "default_date_format")]
    pub date_format: String,

    #[serde(default = "default_line_end")]
    pub line_end: String,

    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    #[serde(default = "default_enclose_by_quotes")]
    pub enclose_by_quotes: bool,
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

fn default_line_end() -> String {
    "\n".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_enclose_by_quotes() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            date_format: default_date_format(),
            line_end: default_line_end(),
            delimiter: default_delimiter(),
            enclose_by_quotes: default_enclose_by_quotes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub indicator_column: Option<String>,
    pub indicator_type: Option<String>,
    pub indicator_column_index: Option<usize>,
    /// Initial position, used until a checkpoint exists
    pub start_from: Option<String>,
    pub select_columns: Option<FieldList>,
    pub static_fields: Option<FieldList>,
    pub static_values: Option<FieldList>,
    pub lookback_seconds: Option<u32>,
}

impl TableConfig {
    pub fn to_spec(&self) -> SourceResult<TableSpec> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SourceError::config("table name must not be empty"));
        }

        let indicator_column = self
            .indicator_column
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SourceError::config(format!("{}.indicator_column property not set", name)))?;

        let indicator_type: IndicatorType = self
            .indicator_type
            .as_deref()
            .ok_or_else(|| SourceError::config(format!("{}.indicator_type property not set", name)))?
            .parse()
            .map_err(|e| SourceError::config(format!("{}: {}", name, e)))?;

        let mut spec = TableSpec::new(name, indicator_column, indicator_type);

        if let Some(columns) = &self.select_columns {
            let columns = columns.items();
            if !(columns.is_empty() || columns == ["*"]) {
                spec = spec.with_select_columns(columns);
            }
        }

        let static_fields = self.static_fields.as_ref().map(FieldList::items).unwrap_or_default();
        let static_values = self.static_values.as_ref().map(FieldList::items).unwrap_or_default();
        spec = spec.with_static_fields(static_fields, static_values)?;

        if let Some(index) = self.indicator_column_index {
            spec = spec.with_indicator_column_index(index);
        }
        if let Some(seconds) = self.lookback_seconds {
            spec = spec.with_lookback_seconds(seconds);
        }
        if let Some(start) = self.start_from.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let position = start.parse::<i64>().map_err(|_| {
                SourceError::config(format!("{}.start_from '{}' is not an integer", name, start))
            })?;
            spec = spec.with_start_from(position);
        }

        Ok(spec)
    }
}

impl SourceConfig {
    /// Load from `path` with environment overrides, then validate.
    pub fn load(path: &Path) -> SourceResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::build(builder)
    }

    /// Parse an in-memory TOML document. Environment overrides are not applied.
    pub fn from_toml_str(content: &str) -> SourceResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml));
        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> SourceResult<Self> {
        let settings = builder
            .build()
            .map_err(|e| SourceError::config(format!("Failed to load configuration: {}", e)))?;
        let config: SourceConfig = settings
            .try_deserialize()
            .map_err(|e| SourceError::config(format!("Failed to deserialize configuration: {}", e)))?;

        config
            .validate()
            .map_err(|e| SourceError::config(format!("Configuration validation failed: {}", e)))?;
        config.check_mandatory()?;
        Ok(config)
    }

    /// Fail on any missing mandatory property or inconsistent table.
    pub fn check_mandatory(&self) -> SourceResult<()> {
        if self.connection.url.is_none() {
            return Err(SourceError::config("connection.url property not set"));
        }
        if self.checkpoint.file_name.is_none() {
            return Err(SourceError::config("checkpoint.file_name property not set"));
        }
        if self.tables.is_empty() {
            return Err(SourceError::config("tables property not set"));
        }
        if self.connection.user.is_none() {
            return Err(SourceError::config("connection.user property not set"));
        }
        if self.connection.password.is_none() {
            return Err(SourceError::config("connection.password property not set"));
        }

        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            table.to_spec()?;
            if !seen.insert(table.name.trim()) {
                return Err(SourceError::config(format!("duplicate table {}", table.name)));
            }
        }
        Ok(())
    }

    pub fn dialect(&self) -> Dialect {
        self.connection
            .url
            .as_deref()
            .map(Dialect::from_url)
            .unwrap_or_default()
    }

    pub fn query_builder(&self) -> QueryBuilder {
        QueryBuilder::new(self.dialect(), self.poll.max_rows)
    }

    pub fn transformer(&self) -> SourceResult<RowTransformer> {
        RowTransformer::new(self.output.date_format.clone())
    }

    pub fn encoder(&self) -> LineEncoder {
        LineEncoder::new(self.output.format, self.output.line_end.clone())
            .with_delimiter(self.output.delimiter.clone(), self.output.enclose_by_quotes)
    }

    pub fn table_states(&self) -> SourceResult<Vec<TableState>> {
        self.tables
            .iter()
            .map(|t| t.to_spec().map(TableState::new))
            .collect()
    }

    pub fn checkpoint_file_name(&self) -> SourceResult<&str> {
        self.checkpoint
            .file_name
            .as_deref()
            .ok_or_else(|| SourceError::config("checkpoint.file_name property not set"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.poll.retry_backoff_ms)
    }
}
