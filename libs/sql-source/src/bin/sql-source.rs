//! SQL source runner.
//!
//! Polls the configured tables and writes one record per line to stdout.
//! Logs go to stderr.
//!
//! Environment variables:
//! - RUST_LOG: log filter (default: "sql_source=info")
//! - SQL_SOURCE_LOG_JSON: emit logs as JSON when set
//! - SQL_SOURCE__<SECTION>__<KEY>: override any configuration value

use std::env;
use std::path::Path;

use anyhow::{anyhow, Context};
use secrecy::SecretString;
use sql_source::watermark::decode_timestamp;
use sql_source::{
    read_positions_at, Connector, Dialect, IndicatorType, LineSink, MySqlConnector, PgConnector,
    SourceConfig, SourceMetrics, SqlSource,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sql_source=info"));

    if env::var_os("SQL_SOURCE_LOG_JSON").is_some() {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  sql-source run <config>");
    eprintln!("  sql-source show-checkpoint <config>");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        usage();
    }

    init_tracing();

    let config = SourceConfig::load(Path::new(&args[2]))
        .with_context(|| format!("failed to load {}", args[2]))?;

    match args[1].as_str() {
        "run" => run(config).await,
        "show-checkpoint" => show_checkpoint(config).await,
        _ => usage(),
    }
}

async fn run(config: SourceConfig) -> anyhow::Result<()> {
    let url = config
        .connection
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("connection.url property not set"))?;
    let user = config
        .connection
        .user
        .as_deref()
        .ok_or_else(|| anyhow!("connection.user property not set"))?;
    let password: &SecretString = config
        .connection
        .password
        .as_ref()
        .ok_or_else(|| anyhow!("connection.password property not set"))?;

    let read_only = config.connection.read_only;
    match config.dialect() {
        Dialect::Postgres => {
            let connector = PgConnector::new(url, user, password, read_only)?;
            run_source(&config, connector).await
        }
        Dialect::MySql => {
            let connector = MySqlConnector::new(url, user, password, read_only)?;
            run_source(&config, connector).await
        }
        Dialect::Generic => Err(anyhow!(
            "connection.url {} is not a postgres or mysql url",
            url
        )),
    }
}

async fn run_source<C: Connector>(config: &SourceConfig, connector: C) -> anyhow::Result<()> {
    let sink = LineSink::new(tokio::io::stdout(), config.encoder(), config.poll.batch_size);
    let metrics = SourceMetrics::new(config.checkpoint_file_name()?);

    let mut source = SqlSource::from_config(config, connector, sink)
        .await?
        .with_metrics(metrics);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl+c");
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    source.run(shutdown_rx).await?;
    info!("SQL source stopped");
    Ok(())
}

async fn show_checkpoint(config: SourceConfig) -> anyhow::Result<()> {
    let path = config.checkpoint.path.join(config.checkpoint_file_name()?);
    let positions = read_positions_at(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    for table in config.table_states()? {
        match positions.get(&table.spec.name) {
            Some(&position) if table.spec.indicator_type == IndicatorType::Date => {
                let at = decode_timestamp(position)
                    .map(|ts| ts.to_string())
                    .unwrap_or_else(|| "invalid".to_string());
                println!("{}\t{}\t{}", table.spec.name, position, at);
            }
            Some(position) => println!("{}\t{}", table.spec.name, position),
            None => println!("{}\t-", table.spec.name),
        }
    }
    Ok(())
}
