use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use relaycore::{connection::ConnectionFactory, SignedEnvelope};

use crate::{
    messagestore::MessageStore,
    models::storedrow::StoredRow,
    postgresimpl::{client_id_column, DbError},
};

#[derive(Debug)]
struct StoreState {
    rows: Vec<StoredRow>,
    next_id: i32,
    schema_ready: bool,
    available: bool,
    /// Bumped on every outage; handles from before it are dead.
    epoch: u64,
    fail_inserts: u32,
    connections: u64,
}

/// Process-local stand-in for the message table.
///
/// Follows the same rules as the Postgres store (serial ids, INT
/// `client_id`), and lets tests take it down or make inserts fail.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
    epoch: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreState {
                rows: Vec::new(),
                next_id: 1,
                schema_ready: false,
                available: true,
                epoch: 0,
                fail_inserts: 0,
                connections: 0,
            })),
            epoch: 0,
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live(&self) -> Result<MutexGuard<'_, StoreState>, DbError> {
        let st = self.state();
        if st.available && st.epoch == self.epoch {
            Ok(st)
        } else {
            Err(DbError::Unavailable("connection closed".into()))
        }
    }

    pub fn set_available(&self, available: bool) {
        let mut st = self.state();
        if st.available && !available {
            st.epoch += 1;
        }
        st.available = available;
    }

    /// The next `n` inserts fail as constraint violations.
    pub fn fail_next_inserts(&self, n: u32) {
        self.state().fail_inserts = n;
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        self.state().rows.clone()
    }

    pub fn schema_ready(&self) -> bool {
        self.state().schema_ready
    }

    pub fn connections(&self) -> u64 {
        self.state().connections
    }

    pub fn connector(&self) -> MemoryStoreConnector {
        MemoryStoreConnector { store: self.clone() }
    }

    fn open(&self) -> Result<MemoryStore, DbError> {
        let mut st = self.state();
        if !st.available {
            return Err(DbError::Unavailable("connection refused".into()));
        }
        st.connections += 1;
        Ok(MemoryStore {
            inner: self.inner.clone(),
            epoch: st.epoch,
        })
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), DbError> {
        self.live()?.schema_ready = true;
        Ok(())
    }

    async fn insert(&self, envelope: &SignedEnvelope) -> Result<StoredRow, DbError> {
        let mut st = self.live()?;
        if !st.schema_ready {
            return Err(DbError::Rejected("relation does not exist".into()));
        }
        if st.fail_inserts > 0 {
            st.fail_inserts -= 1;
            return Err(DbError::Rejected("injected insert failure".into()));
        }
        let client_id = client_id_column(envelope.client_id)?;

        let row = StoredRow {
            id: st.next_id,
            client_id,
            text: envelope.text.clone(),
            token: envelope.token.clone(),
            checksum: envelope.checksum.clone(),
            received_at: Utc::now().naive_utc(),
        };
        st.next_id += 1;
        st.rows.push(row.clone());
        Ok(row)
    }

    fn is_healthy(&self) -> bool {
        self.live().is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStoreConnector {
    store: MemoryStore,
}

#[async_trait]
impl ConnectionFactory for MemoryStoreConnector {
    type Conn = MemoryStore;
    type Error = DbError;

    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self) -> Result<MemoryStore, DbError> {
        self.store.open()
    }
}
