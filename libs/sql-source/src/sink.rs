//! Emission of transformed records to the downstream consumer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{SourceError, SourceResult};
use crate::transform::Record;

/// Receives the records of one table per call.
///
/// An `Err` tells the orchestrator the records were not accepted, so the
/// table's watermark is left where it was.
#[async_trait]
pub trait RecordSink: Send {
    async fn emit(&mut self, table: &str, records: &[Record]) -> SourceResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Field values joined by a delimiter
    Delimited,
}

/// Renders a record as one line, terminator included.
#[derive(Debug, Clone)]
pub struct LineEncoder {
    format: OutputFormat,
    line_end: String,
    delimiter: String,
    enclose_by_quotes: bool,
}

impl Default for LineEncoder {
    fn default() -> Self {
        Self {
            format: OutputFormat::Json,
            line_end: "\n".to_string(),
            delimiter: ",".to_string(),
            enclose_by_quotes: true,
        }
    }
}

impl LineEncoder {
    pub fn new(format: OutputFormat, line_end: impl Into<String>) -> Self {
        Self {
            format,
            line_end: line_end.into(),
            ..Default::default()
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>, enclose_by_quotes: bool) -> Self {
        self.delimiter = delimiter.into();
        self.enclose_by_quotes = enclose_by_quotes;
        self
    }

    pub fn encode(&self, record: &Record) -> SourceResult<String> {
        let mut line = match self.format {
            OutputFormat::Json => serde_json::to_string(record)?,
            OutputFormat::Delimited => record
                .values()
                .map(|value| self.field(value))
                .collect::<Vec<_>>()
                .join(&self.delimiter),
        };
        line.push_str(&self.line_end);
        Ok(line)
    }

    fn field(&self, value: &Value) -> String {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if self.enclose_by_quotes {
            format!("\"{}\"", text.replace('"', "\"\""))
        } else {
            text
        }
    }
}

/// Writes encoded records to an async writer, flushing every `batch_size`
/// records.
pub struct LineSink<W> {
    writer: W,
    encoder: LineEncoder,
    batch_size: usize,
}

impl<W: AsyncWrite + Unpin + Send> LineSink<W> {
    pub fn new(writer: W, encoder: LineEncoder, batch_size: usize) -> Self {
        Self {
            writer,
            encoder,
            batch_size: batch_size.max(1),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordSink for LineSink<W> {
    async fn emit(&mut self, table: &str, records: &[Record]) -> SourceResult<()> {
        for chunk in records.chunks(self.batch_size) {
            let mut buf = String::new();
            for record in chunk {
                buf.push_str(&self.encoder.encode(record)?);
            }
            self.writer
                .write_all(buf.as_bytes())
                .await
                .map_err(|e| SourceError::Sink(format!("write failed for {}: {}", table, e)))?;
            self.writer
                .flush()
                .await
                .map_err(|e| SourceError::Sink(format!("flush failed for {}: {}", table, e)))?;
            debug!(table, count = chunk.len(), "Flushed records");
        }
        Ok(())
    }
}

/// Collects records in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(String, Record)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far, tagged with the table name.
    pub fn records(&self) -> Vec<(String, Record)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn emit(&mut self, table: &str, records: &[Record]) -> SourceResult<()> {
        let mut buffer = self
            .records
            .lock()
            .map_err(|_| SourceError::Sink("memory sink poisoned".to_string()))?;
        buffer.extend(records.iter().map(|r| (table.to_string(), r.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Record {
        match json!({"id": 1, "name": "a \"b\"", "env": "prod"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_json_line() {
        let encoder = LineEncoder::default();
        assert_eq!(
            encoder.encode(&record()).unwrap(),
            "{\"id\":1,\"name\":\"a \\\"b\\\"\",\"env\":\"prod\"}\n"
        );
    }

    #[test]
    fn test_custom_line_end() {
        let encoder = LineEncoder::new(OutputFormat::Json, "\r\n");
        assert!(encoder.encode(&record()).unwrap().ends_with("}\r\n"));
    }

    #[test]
    fn test_delimited_line() {
        let quoted = LineEncoder::new(OutputFormat::Delimited, "\n");
        assert_eq!(
            quoted.encode(&record()).unwrap(),
            "\"1\",\"a \"\"b\"\"\",\"prod\"\n"
        );

        let plain = LineEncoder::new(OutputFormat::Delimited, "\n").with_delimiter("|", false);
        assert_eq!(plain.encode(&record()).unwrap(), "1|a \"b\"|prod\n");
    }

    #[tokio::test]
    async fn test_line_sink_writes_all_chunks() {
        let mut sink = LineSink::new(Vec::new(), LineEncoder::default(), 2);
        let records = vec![record(), record(), record()];

        sink.emit("orders", &records).await.unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(output.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_memory_sink_shares_buffer() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();

        handle.emit("orders", &[record()]).await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "orders");

        sink.clear();
        assert!(sink.records().is_empty());
    }
}
