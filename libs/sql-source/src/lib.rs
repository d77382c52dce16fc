//! # Incremental SQL Source
//!
//! Periodically extracts new rows from relational tables and hands them to a
//! downstream sink as self-describing records. Each table tracks a
//! *watermark*: the largest value seen in its indicator column (a number, a
//! timestamp or an integer-like string). Queries only ask for rows strictly
//! past the watermark, and watermarks are checkpointed to a local JSON file
//! so a restart resumes where the previous run stopped.
//!
//! ## Processing cycle
//!
//! For every configured table, in order:
//! 1. Build `SELECT .. FROM t WHERE IND > ? ORDER BY IND` for the dialect
//! 2. Execute it, reopening the session and retrying on failure
//! 3. Transform rows into records and advance a working watermark
//! 4. Emit the records; commit the watermark only if the sink accepted them
//!
//! After all tables the checkpoint file is rewritten atomically once.
//!
//! This gives **at-least-once delivery**: a crash between emit and checkpoint
//! replays rows on restart, so consumers must tolerate duplicates.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use sql_source::{PgConnector, SourceConfig, SqlSource, SourceMetrics, MemorySink};
//! use secrecy::SecretString;
//! use std::path::Path;
//! use tokio::sync::watch;
//!
//! async fn start() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SourceConfig::load(Path::new("/etc/sql-source/shop.toml"))?;
//!     let connector = PgConnector::new(
//!         "postgres://db:5432/shop",
//!         "reader",
//!         &SecretString::from("secret".to_string()),
//!         true,
//!     )?;
//!
//!     let mut source = SqlSource::from_config(&config, connector, MemorySink::new())
//!         .await?
//!         .with_metrics(SourceMetrics::new("shop"));
//!
//!     let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         let _ = shutdown_tx.send(true);
//!     });
//!
//!     source.run(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Indicator positions
//!
//! | Type     | Position encoding                | Default         |
//! |----------|----------------------------------|-----------------|
//! | `number` | the value itself                 | `-1`            |
//! | `date`   | `YYYYMMDDHHMMSS` as an integer   | startup time    |
//! | `string` | the value parsed as an integer   | `0`             |
//!
//! ## Metrics
//!
//! - `sql_source_rows_emitted_total{table}`: records accepted by the sink
//! - `sql_source_retries_exhausted_total{table}`: cycles that gave up on a table
//! - `sql_source_watermark_position{table}`: committed position
//! - `sql_source_checkpoint_write_failures_total`: failed checkpoint writes

pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod mysql;
pub mod poller;
pub mod postgres;
pub mod query;
pub mod session;
pub mod sink;
pub mod transform;
pub mod watermark;

pub use checkpoint::{read_positions_at, CheckpointStore, LoadOutcome};
pub use config::{SourceConfig, TableConfig};
pub use connection::{ConnectionManager, ConnectionState, QueryOutcome};
pub use error::{SourceError, SourceResult};
pub use metrics::SourceMetrics;
pub use mysql::{MySqlConnector, MySqlSession};
pub use poller::{CycleReport, SqlSource};
pub use postgres::{PgConnector, PgSession};
pub use query::{Dialect, IncrementalQuery, QueryBuilder, QueryParam};
pub use session::{Connector, DatabaseSession, Row, SqlValue};
pub use sink::{LineEncoder, LineSink, MemorySink, OutputFormat, RecordSink};
pub use transform::{Record, RowTransformer, TransformReport};
pub use watermark::{IndicatorType, TableSpec, TableState, Watermark};
