//! Session lifecycle with bounded retry and transparent reconnect.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connected -> (ok) Connected
//!                           -> (error) Retrying -> Connected | Failed
//! ```
//!
//! A failed attempt never propagates a database error to the caller. Once the
//! retry budget is spent the caller gets [`QueryOutcome::Exhausted`], which it
//! may treat as "no rows this cycle" while still being able to tell the two
//! cases apart.

use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{SourceError, SourceResult};
use crate::query::{IncrementalQuery, QueryBuilder};
use crate::session::{Connector, DatabaseSession, Row};
use crate::watermark::{TableSpec, Watermark};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Retrying,
    Failed,
}

/// Result of one `execute` call.
#[derive(Debug)]
pub enum QueryOutcome {
    Rows(Vec<Row>),
    /// Every attempt failed; the watermark must not move.
    Exhausted { attempts: u32, last_error: String },
}

impl QueryOutcome {
    /// Rows to process this cycle; exhaustion counts as none.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutcome::Rows(rows) => rows,
            QueryOutcome::Exhausted { .. } => Vec::new(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, QueryOutcome::Exhausted { .. })
    }
}

/// Owns the single database session of a source.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    builder: QueryBuilder,
    session: Option<C::Session>,
    state: ConnectionState,
    retry_backoff: Duration,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, builder: QueryBuilder) -> Self {
        Self {
            connector,
            builder,
            session: None,
            state: ConnectionState::Disconnected,
            retry_backoff: Duration::ZERO,
        }
    }

    /// Pause between a failed attempt and the next one.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    /// Establish a session, replacing any existing one.
    pub async fn open(&mut self) -> SourceResult<()> {
        self.teardown().await;
        let session = self.connector.connect().await?;
        self.session = Some(session);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Query rows of `spec` newer than the watermark.
    ///
    /// Makes at most `retries + 1` attempts. Each attempt starts with a
    /// liveness check and reopens the session when it is gone.
    ///
    /// # Errors
    ///
    /// Only statement construction errors are returned (e.g. a DATE
    /// position that is not a timestamp); those are never retried.
    pub async fn execute(
        &mut self,
        spec: &TableSpec,
        watermark: &mut Watermark,
        retries: u32,
    ) -> SourceResult<QueryOutcome> {
        let query = self.builder.build(spec, watermark)?;

        let mut remaining = retries;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.attempt(&query).await {
                Ok(rows) => {
                    self.state = ConnectionState::Connected;
                    debug!(table = %spec.name, rows = rows.len(), attempts, "Query completed");
                    return Ok(QueryOutcome::Rows(rows));
                }
                Err(e) => {
                    error!(table = %spec.name, attempt = attempts, error = %e, "Query attempt failed");

                    if remaining == 0 {
                        self.state = ConnectionState::Failed;
                        warn!(
                            table = %spec.name,
                            attempts,
                            "Retries exhausted, no rows this cycle"
                        );
                        return Ok(QueryOutcome::Exhausted {
                            attempts,
                            last_error: e.to_string(),
                        });
                    }

                    remaining -= 1;
                    self.state = ConnectionState::Retrying;
                    warn!(table = %spec.name, retries_left = remaining, "Retrying query");
                    if !self.retry_backoff.is_zero() {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
            }
        }
    }

    async fn attempt(&mut self, query: &IncrementalQuery) -> SourceResult<Vec<Row>> {
        let alive = match self.session.as_mut() {
            Some(session) => session.is_connected().await,
            None => false,
        };
        if !alive {
            info!(table = %query.table, "Session not connected, reconnecting");
            self.open().await?;
        }

        match self.session.as_mut() {
            Some(session) => session.fetch(query).await,
            None => Err(SourceError::NotConnected),
        }
    }

    /// Close the session. Never fails.
    pub async fn close(&mut self) {
        self.teardown().await;
        self.state = ConnectionState::Disconnected;
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Error closing database session");
            }
        }
    }
}
