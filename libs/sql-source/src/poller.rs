//! Poll loop driving query → transform → emit → checkpoint for every table.
//!
//! # Processing Guarantees
//!
//! - **At-least-once delivery**: a table's watermark is committed only after
//!   the sink accepted its records, and the checkpoint is written after that.
//!   A crash in between replays the same rows on restart.
//! - **No overlap**: the next cycle starts `poll_interval` after the previous
//!   one finished.
//! - **Cooperative stop**: a shutdown signal is honoured between cycles; an
//!   in-flight cycle always completes.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, LoadOutcome};
use crate::config::SourceConfig;
use crate::connection::{ConnectionManager, QueryOutcome};
use crate::error::SourceResult;
use crate::metrics::SourceMetrics;
use crate::session::Connector;
use crate::sink::RecordSink;
use crate::transform::RowTransformer;
use crate::watermark::TableState;

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records accepted by the sink
    pub emitted: usize,
    /// Tables whose retry budget ran out
    pub exhausted: usize,
    /// Tables that failed for a non-retryable reason or whose emit failed
    pub failed: usize,
    /// Rows whose indicator could not advance the watermark
    pub rejected_indicators: usize,
    pub checkpoint_saved: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum TableOutcome {
    Emitted { records: usize, rejected: usize },
    Exhausted,
    Failed,
}

/// Incremental SQL source: owns the tables, their watermarks, the session,
/// the sink and the checkpoint.
pub struct SqlSource<C: Connector, S: RecordSink> {
    tables: Vec<TableState>,
    connection: ConnectionManager<C>,
    transformer: RowTransformer,
    sink: S,
    checkpoint: CheckpointStore,
    max_retries: u32,
    poll_interval: Duration,
    metrics: Option<SourceMetrics>,
}

impl<C: Connector, S: RecordSink> SqlSource<C, S> {
    /// Create a source.
    ///
    /// # Arguments
    ///
    /// * `tables` - Tables to poll, with their starting watermarks
    /// * `connection` - Session owner used for every query
    /// * `transformer` - Row to record conversion
    /// * `sink` - Downstream consumer of records
    /// * `checkpoint` - Durable watermark store
    /// * `max_retries` - Retries per table per cycle
    /// * `poll_interval` - Delay between cycles
    pub fn new(
        tables: Vec<TableState>,
        connection: ConnectionManager<C>,
        transformer: RowTransformer,
        sink: S,
        checkpoint: CheckpointStore,
        max_retries: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tables,
            connection,
            transformer,
            sink,
            checkpoint,
            max_retries,
            poll_interval,
            metrics: None,
        }
    }

    /// Wire a source from configuration and restore watermarks from the
    /// checkpoint.
    pub async fn from_config(config: &SourceConfig, connector: C, sink: S) -> SourceResult<Self> {
        let tables = config.table_states()?;
        let connection = ConnectionManager::new(connector, config.query_builder())
            .with_retry_backoff(config.retry_backoff());
        let checkpoint =
            CheckpointStore::open(&config.checkpoint.path, config.checkpoint_file_name()?).await?;

        let mut source = Self::new(
            tables,
            connection,
            config.transformer()?,
            sink,
            checkpoint,
            config.poll.max_retries,
            config.poll_interval(),
        );
        source.restore().await?;
        Ok(source)
    }

    /// Also update Prometheus metrics each cycle.
    pub fn with_metrics(mut self, metrics: SourceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply checkpointed positions to the tables.
    pub async fn restore(&mut self) -> SourceResult<LoadOutcome> {
        let outcome = self.checkpoint.load(&mut self.tables).await?;
        if let LoadOutcome::Recovered { backup } = &outcome {
            warn!(backup = %backup.display(), "Started from default watermarks after checkpoint recovery");
        }
        Ok(outcome)
    }

    pub fn tables(&self) -> &[TableState] {
        &self.tables
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run the poll loop until `shutdown` carries `true` or its sender is
    /// dropped. The session is closed before returning.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SourceResult<()> {
        info!(
            tables = self.tables.len(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_retries = self.max_retries,
            "SQL source starting"
        );

        while !*shutdown.borrow() {
            let report = self.run_cycle().await;
            if report.emitted > 0 {
                info!(emitted = report.emitted, "Poll cycle emitted records");
            } else {
                debug!("No new rows");
            }

            if stop_requested(&mut shutdown, self.poll_interval).await {
                break;
            }
        }

        info!("SQL source stopping");
        self.connection.close().await;
        Ok(())
    }

    /// One pass over every table followed by a single checkpoint write.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        for index in 0..self.tables.len() {
            match self.poll_table(index).await {
                TableOutcome::Emitted { records, rejected } => {
                    report.emitted += records;
                    report.rejected_indicators += rejected;
                }
                TableOutcome::Exhausted => report.exhausted += 1,
                TableOutcome::Failed => report.failed += 1,
            }
        }

        match self.checkpoint.save(&mut self.tables).await {
            Ok(()) => report.checkpoint_saved = true,
            Err(e) => {
                error!(
                    path = %self.checkpoint.path().display(),
                    error = %e,
                    "Failed to write checkpoint, keeping in-memory watermarks"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.checkpoint_write_failures.inc();
                }
            }
        }

        report
    }

    async fn poll_table(&mut self, index: usize) -> TableOutcome {
        let table = &mut self.tables[index];
        let name = table.spec.name.clone();

        let outcome = match self
            .connection
            .execute(&table.spec, &mut table.watermark, self.max_retries)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(table = %name, error = %e, "Cannot query table this cycle");
                return TableOutcome::Failed;
            }
        };

        let rows = match outcome {
            QueryOutcome::Rows(rows) => rows,
            QueryOutcome::Exhausted { attempts, last_error } => {
                warn!(table = %name, attempts, last_error = %last_error, "Query retries exhausted");
                if let Some(metrics) = &self.metrics {
                    metrics.exhausted_cycles.with_label_values(&[&name]).inc();
                }
                return TableOutcome::Exhausted;
            }
        };

        if rows.is_empty() {
            return TableOutcome::Emitted {
                records: 0,
                rejected: 0,
            };
        }

        let mut working = table.watermark.clone();
        let transformed = self.transformer.transform(&table.spec, &mut working, &rows);

        if let Err(e) = self.sink.emit(&name, &transformed.records).await {
            error!(
                table = %name,
                records = transformed.records.len(),
                error = %e,
                "Sink rejected records, watermark not advanced"
            );
            return TableOutcome::Failed;
        }

        table.watermark = working;
        let position = table.watermark.current_position();
        debug!(table = %name, position, records = transformed.records.len(), "Watermark committed");

        if let Some(metrics) = &self.metrics {
            metrics
                .rows_emitted
                .with_label_values(&[&name])
                .inc_by(transformed.records.len() as u64);
            metrics
                .watermark_position
                .with_label_values(&[&name])
                .set(position);
        }

        TableOutcome::Emitted {
            records: transformed.records.len(),
            rejected: transformed.rejected_indicators,
        }
    }
}

/// Wait out `interval`, returning early with `true` on a stop request.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::query::{Dialect, IncrementalQuery, QueryBuilder, QueryParam};
    use crate::session::{DatabaseSession, Row, SqlValue};
    use crate::sink::MemorySink;
    use crate::transform::Record;
    use crate::watermark::{IndicatorType, TableSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Serves `orders` rows with `id > param`, optionally failing.
    #[derive(Clone, Default)]
    struct OrdersDb {
        ids: Arc<Mutex<Vec<i64>>>,
        down: Arc<AtomicBool>,
    }

    struct OrdersSession {
        db: OrdersDb,
    }

    #[async_trait]
    impl Connector for OrdersDb {
        type Session = OrdersSession;

        async fn connect(&self) -> SourceResult<OrdersSession> {
            Ok(OrdersSession { db: self.clone() })
        }
    }

    #[async_trait]
    impl DatabaseSession for OrdersSession {
        async fn is_connected(&mut self) -> bool {
            true
        }

        async fn fetch(&mut self, query: &IncrementalQuery) -> SourceResult<Vec<Row>> {
            if self.db.down.load(Ordering::SeqCst) {
                return Err(SourceError::NotConnected);
            }
            let after = match query.param {
                QueryParam::Integer(v) => v,
                _ => unreachable!(),
            };
            let mut ids: Vec<i64> = self
                .db
                .ids
                .lock()
                .unwrap()
                .iter()
                .copied()
                .filter(|id| *id > after)
                .collect();
            ids.sort_unstable();
            Ok(ids
                .into_iter()
                .map(|id| Row::new().with("ID", SqlValue::Integer(id)))
                .collect())
        }

        async fn close(&mut self) -> SourceResult<()> {
            Ok(())
        }
    }

    struct RejectingSink;

    #[async_trait]
    impl RecordSink for RejectingSink {
        async fn emit(&mut self, _table: &str, _records: &[Record]) -> SourceResult<()> {
            Err(SourceError::Sink("channel full".to_string()))
        }
    }

    async fn source<S: RecordSink>(
        dir: &TempDir,
        db: OrdersDb,
        sink: S,
    ) -> SqlSource<OrdersDb, S> {
        let tables = vec![TableState::new(TableSpec::new("orders", "id", IndicatorType::Number))];
        let connection = ConnectionManager::new(db, QueryBuilder::new(Dialect::Generic, 0));
        let checkpoint = CheckpointStore::open(dir.path(), "status.json").await.unwrap();
        let mut source = SqlSource::new(
            tables,
            connection,
            RowTransformer::default(),
            sink,
            checkpoint,
            2,
            Duration::from_millis(10),
        );
        source.restore().await.unwrap();
        source
    }

    #[tokio::test]
    async fn test_cycle_emits_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let db = OrdersDb::default();
        *db.ids.lock().unwrap() = vec![1, 2, 3];
        let sink = MemorySink::new();
        let mut source = source(&dir, db.clone(), sink.clone()).await;

        let report = source.run_cycle().await;
        assert_eq!(report.emitted, 3);
        assert!(report.checkpoint_saved);
        assert_eq!(source.tables()[0].watermark.raw_position(), Some(3));

        // Nothing new: nothing emitted, position unchanged.
        let report = source.run_cycle().await;
        assert_eq!(report.emitted, 0);

        db.ids.lock().unwrap().push(4);
        let report = source.run_cycle().await;
        assert_eq!(report.emitted, 1);
        assert_eq!(sink.records().len(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_cycle_keeps_watermark() {
        let dir = TempDir::new().unwrap();
        let db = OrdersDb::default();
        *db.ids.lock().unwrap() = vec![1, 2];
        db.down.store(true, Ordering::SeqCst);
        let mut source = source(&dir, db.clone(), MemorySink::new()).await;

        let report = source.run_cycle().await;
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.emitted, 0);
        assert_eq!(source.tables()[0].watermark.raw_position(), Some(-1));

        db.down.store(false, Ordering::SeqCst);
        let report = source.run_cycle().await;
        assert_eq!(report.emitted, 2);
    }

    #[tokio::test]
    async fn test_rejected_emit_does_not_advance() {
        let dir = TempDir::new().unwrap();
        let db = OrdersDb::default();
        *db.ids.lock().unwrap() = vec![5];
        let mut source = source(&dir, db, RejectingSink).await;

        let report = source.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(source.tables()[0].watermark.raw_position(), Some(-1));
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let dir = TempDir::new().unwrap();
        let db = OrdersDb::default();
        *db.ids.lock().unwrap() = vec![1];
        let sink = MemorySink::new();
        let mut source = source(&dir, db, sink.clone()).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            source.run(rx).await.unwrap();
            source
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let source = handle.await.unwrap();

        assert_eq!(sink.records().len(), 1);
        assert_eq!(source.tables()[0].watermark.raw_position(), Some(1));
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_stopped() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let mut source = source(&dir, OrdersDb::default(), sink.clone()).await;

        let (_tx, rx) = watch::channel(true);
        source.run(rx).await.unwrap();
        assert!(sink.records().is_empty());
    }
}
