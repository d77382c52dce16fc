//! MySQL / MariaDB sessions on a single `sqlx::MySqlConnection`.
//!
//! The session `time_zone` is set to the host's UTC offset so `TIMESTAMP`
//! columns come back as host-local wall time, the same clock DATE
//! watermarks use.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{Column, Connection, MySql, MySqlConnection, Row as _, TypeInfo};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{SourceError, SourceResult};
use crate::query::{IncrementalQuery, QueryParam};
use crate::session::{decimal_value, local_utc_offset, Connector, DatabaseSession, Row, SqlValue};

pub struct MySqlConnector {
    options: MySqlConnectOptions,
    read_only: bool,
}

impl MySqlConnector {
    pub fn new(
        url: &str,
        user: &str,
        password: &SecretString,
        read_only: bool,
    ) -> SourceResult<Self> {
        let options = MySqlConnectOptions::from_str(url)?
            .username(user)
            .password(password.expose_secret());
        Ok(Self { options, read_only })
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Session = MySqlSession;

    async fn connect(&self) -> SourceResult<MySqlSession> {
        let offset = local_utc_offset();
        info!(read_only = self.read_only, utc_offset = %offset, "Opening database session");

        let options = self.options.clone().timezone(Some(offset));
        let mut conn = MySqlConnection::connect_with(&options).await?;
        if self.read_only {
            sqlx::query("SET SESSION TRANSACTION READ ONLY")
                .execute(&mut conn)
                .await?;
        }

        Ok(MySqlSession { conn: Some(conn) })
    }
}

pub struct MySqlSession {
    conn: Option<MySqlConnection>,
}

#[async_trait]
impl DatabaseSession for MySqlSession {
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
            QueryParam::Timestamp(ts) => statement.bind(*ts),
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

fn decode_row(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let value = decode_value(row, column.ordinal(), column.type_info().name());
            (column.name().to_string(), value)
        })
        .collect()
}

fn decode_value(row: &MySqlRow, idx: usize, type_name: &str) -> SqlValue {
    let decoded = match type_name {
        "BOOLEAN" => get::<bool>(row, idx, SqlValue::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            get::<i64>(row, idx, SqlValue::Integer)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => get::<u64>(row, idx, |v| match i64::try_from(v) {
            Ok(v) => SqlValue::Integer(v),
            Err(_) => SqlValue::Text(v.to_string()),
        }),
        "FLOAT" => get::<f32>(row, idx, |v| SqlValue::Float(f64::from(v))),
        "DOUBLE" => get::<f64>(row, idx, SqlValue::Float),
        "DECIMAL" => get::<Decimal>(row, idx, decimal_value),
        "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => {
            get::<String>(row, idx, SqlValue::Text)
        }
        "JSON" => get::<serde_json::Value>(row, idx, |v| SqlValue::Text(v.to_string())),
        "DATE" => get::<NaiveDate>(row, idx, SqlValue::Date),
        "TIME" => get::<NaiveTime>(row, idx, |v| SqlValue::Text(v.to_string())),
        "DATETIME" | "TIMESTAMP" => get::<NaiveDateTime>(row, idx, SqlValue::Timestamp),
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
    row: &'r MySqlRow,
    idx: usize,
    wrap: impl FnOnce(T) -> SqlValue,
) -> Result<SqlValue, sqlx::Error>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    Ok(row.try_get::<Option<T>, _>(idx)?.map_or(SqlValue::Null, wrap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_accepts_url() {
        let password = SecretString::from("secret".to_string());
        assert!(MySqlConnector::new("mysql://localhost:3306/shop", "reader", &password, true).is_ok());
        assert!(MySqlConnector::new("not a url", "reader", &password, true).is_err());
    }
}
