pub mod config;
pub mod memorystore;
pub mod messagestore;
pub mod postgresclient;
pub mod postgresimpl;

pub mod models {
    pub mod storedrow;
}

pub use config::StoreArgs;
pub use memorystore::{MemoryStore, MemoryStoreConnector};
pub use messagestore::MessageStore;
pub use models::storedrow::StoredRow;
pub use postgresclient::PostgresClient;
pub use postgresimpl::{DbError, PostgresConnector, PostgresMessageStore, DEFAULT_TABLE};
