//! PostgreSQL sessions on a single `sqlx::PgConnection`.
//!
//! Each session pins its `TimeZone` to the host's UTC offset, so naive
//! `TIMESTAMP` columns compare on the same wall clock as DATE watermarks.
//! DATE parameters are bound as zoned instants, so `TIMESTAMPTZ` columns
//! compare by instant whatever the server default zone is.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, Connection, PgConnection, Postgres, Row as _, TypeInfo};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{SourceError, SourceResult};
use crate::query::{IncrementalQuery, QueryParam};
use crate::session::{decimal_value, local_utc_offset, Connector, DatabaseSession, Row, SqlValue};
use crate::watermark::{local_instant, to_local_wall_time};

pub struct PgConnector {
    options: PgConnectOptions,
    read_only: bool,
}

impl PgConnector {
    pub fn new(
        url: &str,
        user: &str,
        password: &SecretString,
        read_only: bool,
    ) -> SourceResult<Self> {
        let options = PgConnectOptions::from_str(url)?
            .username(user)
            .password(password.expose_secret());
        Ok(Self { options, read_only })
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self) -> SourceResult<PgSession> {
        let offset = local_utc_offset();
        info!(read_only = self.read_only, utc_offset = %offset, "Opening database session");

        let mut conn = PgConnection::connect_with(&self.options).await?;
        sqlx::query(&format!("SET TIME ZONE INTERVAL '{}' HOUR TO MINUTE", offset))
            .execute(&mut conn)
            .await?;
        if self.read_only {
            sqlx::query("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                .execute(&mut conn)
                .await?;
        }

        Ok(PgSession { conn: Some(conn) })
    }
}

pub struct PgSession {
    conn: Option<PgConnection>,
}

#[async_trait]
impl DatabaseSession for PgSession {
    async fn is_connected(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn fetch(&mut self, query: &IncrementalQuery) -> SourceResult<Vec<Row>> {
        let conn = self.conn.as_mut().ok_or(SourceError::NotConnected)?;

        debug!(
            table = %query.table,
            sql = %query.sql,
            param = %query.param,
            "Executing incremental query"
        );

        let statement = sqlx::query(&query.sql);
        let statement = match &query.param {
            QueryParam::Timestamp(ts) => match local_instant(ts) {
                Some(instant) => statement.bind(instant),
                // Wall time skipped by a DST jump; the session zone resolves it.
                None => statement.bind(*ts),
            },
            QueryParam::Integer(v) => statement.bind(*v),
            QueryParam::Text(s) => statement.bind(s.clone()),
        };

        let rows = statement.fetch_all(conn).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn close(&mut self) -> SourceResult<()> {
        info!("Closing database session");
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let value = decode_value(row, column.ordinal(), column.type_info().name());
            (column.name().to_string(), value)
        })
        .collect()
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> SqlValue {
    let decoded = match type_name {
        "BOOL" => get::<bool>(row, idx, SqlValue::Bool),
        "INT2" => get::<i16>(row, idx, |v| SqlValue::Integer(i64::from(v))),
        "INT4" => get::<i32>(row, idx, |v| SqlValue::Integer(i64::from(v))),
        "INT8" => get::<i64>(row, idx, SqlValue::Integer),
        "FLOAT4" => get::<f32>(row, idx, |v| SqlValue::Float(f64::from(v))),
        "FLOAT8" => get::<f64>(row, idx, SqlValue::Float),
        "NUMERIC" => get::<Decimal>(row, idx, decimal_value),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => get::<String>(row, idx, SqlValue::Text),
        "UUID" => get::<uuid::Uuid>(row, idx, |v| SqlValue::Text(v.to_string())),
        "JSON" | "JSONB" => get::<serde_json::Value>(row, idx, |v| SqlValue::Text(v.to_string())),
        "DATE" => get::<NaiveDate>(row, idx, SqlValue::Date),
        "TIME" => get::<NaiveTime>(row, idx, |v| SqlValue::Text(v.to_string())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx, SqlValue::Timestamp),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx, |v| {
            SqlValue::Timestamp(to_local_wall_time(&v))
        }),
        other => {
            warn!(column = idx, type_name = other, "Unsupported column type, emitting null");
            Ok(SqlValue::Null)
        }
    };

    decoded.unwrap_or_else(|e| {
        warn!(column = idx, type_name, error = %e, "Failed to decode column, emitting null");
        SqlValue::Null
    })
}

fn get<'r, T>(
    row: &'r PgRow,
    idx: usize,
    wrap: impl FnOnce(T) -> SqlValue,
) -> Result<SqlValue, sqlx::Error>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    Ok(row.try_get::<Option<T>, _>(idx)?.map_or(SqlValue::Null, wrap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_accepts_url() {
        let password = SecretString::from("secret".to_string());
        assert!(PgConnector::new("postgres://localhost:5432/app", "reader", &password, true).is_ok());
        assert!(PgConnector::new("not a url", "reader", &password, true).is_err());
    }
}
