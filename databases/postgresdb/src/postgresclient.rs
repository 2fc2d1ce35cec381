use std::sync::Arc;

use tokio_postgres::{Client, NoTls, Row};
use tracing::error;

use crate::postgresimpl::DbError;

/// Shared handle to one Postgres session.
#[derive(Clone)]
pub struct PostgresClient {
    client: Arc<Client>,
}

impl std::fmt::Debug for PostgresClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresClient")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl PostgresClient {
    pub async fn connect(config: &tokio_postgres::Config) -> Result<Self, DbError> {
        let (client, connection) = config.connect(NoTls).await.map_err(DbError::Postgres)?;

        // Drive the connection in the background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(event = "postgres_connection_error", error = %e);
            }
        });

        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// True once the background connection has terminated.
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<u64, DbError> {
        self.client.execute(sql, params).await.map_err(DbError::Postgres)
    }

    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Row, DbError> {
        self.client.query_one(sql, params).await.map_err(DbError::Postgres)
    }
}
