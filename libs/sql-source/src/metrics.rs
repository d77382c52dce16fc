use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct SourceMetrics {
    pub rows_emitted: IntCounterVec,
    pub exhausted_cycles: IntCounterVec,
    pub watermark_position: IntGaugeVec,
    pub checkpoint_write_failures: IntCounter,
}

impl SourceMetrics {
    pub fn new(source: &str) -> Self {
        let registry = prometheus::default_registry();

        let rows_emitted = IntCounterVec::new(
            Opts::new(
                "sql_source_rows_emitted_total",
                "Total number of records emitted per table",
            )
            .const_label("source", source.to_string()),
            &["table"],
        )
        .expect("valid metric opts for sql_source_rows_emitted_total");

        let exhausted_cycles = IntCounterVec::new(
            Opts::new(
                "sql_source_retries_exhausted_total",
                "Poll cycles in which a table exhausted its retry budget",
            )
            .const_label("source", source.to_string()),
            &["table"],
        )
        .expect("valid metric opts for sql_source_retries_exhausted_total");

        let watermark_position = IntGaugeVec::new(
            Opts::new(
                "sql_source_watermark_position",
                "Current committed watermark position per table",
            )
            .const_label("source", source.to_string()),
            &["table"],
        )
        .expect("valid metric opts for sql_source_watermark_position");

        let checkpoint_write_failures = IntCounter::with_opts(
            Opts::new(
                "sql_source_checkpoint_write_failures_total",
                "Total number of failed checkpoint writes",
            )
            .const_label("source", source.to_string()),
        )
        .expect("valid metric opts for sql_source_checkpoint_write_failures_total");

        for metric in [
            Box::new(rows_emitted.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(exhausted_cycles.clone()),
            Box::new(watermark_position.clone()),
            Box::new(checkpoint_write_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register sql source metric: {}", e);
            }
        }

        Self {
            rows_emitted,
            exhausted_cycles,
            watermark_position,
            checkpoint_write_failures,
        }
    }
}
