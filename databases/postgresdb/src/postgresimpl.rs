use std::error::Error as _;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use relaycore::{connection::ConnectionFactory, SignedEnvelope};
use tokio_postgres::error::SqlState;
use tracing::info;

use crate::{messagestore::MessageStore, models::storedrow::StoredRow, postgresclient::PostgresClient};

pub const DEFAULT_TABLE: &str = "udp_messages";

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("row rejected: {0}")]
    Rejected(String),

    #[error("invalid identifier '{0}' (only [A-Za-z_][A-Za-z0-9_]* allowed)")]
    InvalidIdentifier(String),
}

impl DbError {
    /// The session is gone; retrying on it is pointless.
    pub fn is_connectivity(&self) -> bool {
        match self {
            DbError::Unavailable(_) => true,
            DbError::Postgres(e) => {
                e.is_closed()
                    || e.source().is_some_and(|s| s.is::<std::io::Error>())
                    || e.code().is_some_and(|c| {
                        c.code().starts_with("08")
                            || *c == SqlState::ADMIN_SHUTDOWN
                            || *c == SqlState::CRASH_SHUTDOWN
                            || *c == SqlState::CANNOT_CONNECT_NOW
                    })
            }
            DbError::Rejected(_) | DbError::InvalidIdentifier(_) => false,
        }
    }
}

pub(crate) fn validate_ident(s: &str) -> Result<(), DbError> {
    let mut chars = s.chars();
    let first = chars
        .next()
        .ok_or_else(|| DbError::InvalidIdentifier(s.to_string()))?;
    let ok_first = first.is_ascii_alphabetic() || first == '_';
    let ok_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if ok_first && ok_rest {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(s.to_string()))
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id          SERIAL PRIMARY KEY,
            client_id   INT,
            text        TEXT,
            token       TEXT,
            checksum    TEXT,
            received_at TIMESTAMP DEFAULT NOW()
        )
        "#
    )
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (client_id, text, token, checksum) \
         VALUES ($1, $2, $3, $4) RETURNING id, received_at"
    )
}

/// `client_id` lives in an INT column.
pub(crate) fn client_id_column(client_id: i64) -> Result<i32, DbError> {
    i32::try_from(client_id)
        .map_err(|_| DbError::Rejected(format!("client_id {client_id} out of range for INT column")))
}

/// Message table on a live Postgres session.
#[derive(Debug, Clone)]
pub struct PostgresMessageStore {
    client: PostgresClient,
    table: String,
}

impl PostgresMessageStore {
    pub fn new(client: PostgresClient, table: impl Into<String>) -> Result<Self, DbError> {
        let table = table.into();
        validate_ident(&table)?;
        Ok(Self { client, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn ensure_schema(&self) -> Result<(), DbError> {
        self.client.execute(&create_table_sql(&self.table), &[]).await?;
        info!(event = "table_ready", table = %self.table);
        Ok(())
    }

    async fn insert(&self, envelope: &SignedEnvelope) -> Result<StoredRow, DbError> {
        let client_id = client_id_column(envelope.client_id)?;
        let row = self
            .client
            .query_one(
                &insert_sql(&self.table),
                &[&client_id, &envelope.text, &envelope.token, &envelope.checksum],
            )
            .await?;

        let id: i32 = row.try_get("id")?;
        let received_at: NaiveDateTime = row.try_get("received_at")?;
        Ok(StoredRow {
            id,
            client_id,
            text: envelope.text.clone(),
            token: envelope.token.clone(),
            checksum: envelope.checksum.clone(),
            received_at,
        })
    }

    fn is_healthy(&self) -> bool {
        !self.client.is_closed()
    }
}

/// Opens `PostgresMessageStore`s; plugs into `relaycore::Connector`.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: tokio_postgres::Config,
    table: String,
}

impl PostgresConnector {
    pub fn new(config: tokio_postgres::Config, table: impl Into<String>) -> Result<Self, DbError> {
        let table = table.into();
        validate_ident(&table)?;
        Ok(Self { config, table })
    }
}

#[async_trait]
impl ConnectionFactory for PostgresConnector {
    type Conn = PostgresMessageStore;
    type Error = DbError;

    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self) -> Result<PostgresMessageStore, DbError> {
        let client = PostgresClient::connect(&self.config).await?;
        PostgresMessageStore::new(client, self.table.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_ident("udp_messages").is_ok());
        assert!(validate_ident("_t2").is_ok());
        assert!(validate_ident("").is_err());
        assert!(validate_ident("2fast").is_err());
        assert!(validate_ident("msgs; DROP TABLE x").is_err());
        assert!(PostgresConnector::new(tokio_postgres::Config::new(), "bad-name").is_err());
    }

    #[test]
    fn schema_matches_the_message_table() {
        let sql = create_table_sql("udp_messages");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS udp_messages"));
        assert!(sql.contains("id          SERIAL PRIMARY KEY"));
        assert!(sql.contains("received_at TIMESTAMP DEFAULT NOW()"));
        assert!(insert_sql("udp_messages").ends_with("RETURNING id, received_at"));
    }

    #[test]
    fn client_id_outside_int_range_is_rejected() {
        assert_eq!(client_id_column(42).unwrap(), 42);
        let err = client_id_column(i64::from(i32::MAX) + 1).unwrap_err();
        assert!(matches!(err, DbError::Rejected(_)));
        assert!(!err.is_connectivity());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connectivity_error() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut config = tokio_postgres::Config::new();
        config
            .host("127.0.0.1")
            .port(port)
            .user("postgres")
            .dbname("clientdb")
            .connect_timeout(Duration::from_secs(2));
        let connector = PostgresConnector::new(config, DEFAULT_TABLE).unwrap();

        let err = connector.connect().await.unwrap_err();
        assert!(err.is_connectivity(), "{err:?}");
    }
}
