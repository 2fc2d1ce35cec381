use async_trait::async_trait;
use relaycore::SignedEnvelope;

use crate::{models::storedrow::StoredRow, postgresimpl::DbError};

/// Where the persistence consumer writes envelopes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create the message table if it does not exist yet.
    async fn ensure_schema(&self) -> Result<(), DbError>;

    /// Insert one row; returns it with the store-assigned fields filled in.
    /// Committed when this returns `Ok`.
    async fn insert(&self, envelope: &SignedEnvelope) -> Result<StoredRow, DbError>;

    /// Cheap liveness check of the underlying connection.
    fn is_healthy(&self) -> bool;
}
