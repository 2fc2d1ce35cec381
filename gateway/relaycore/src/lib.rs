//! Relay core library.
//!
//! Everything the three relay processes (originator, ingress relay,
//! persistence consumer) agree on lives here:
//! - `models`: the message, envelope and claim types that travel on the wire
//! - `checksum` / `token`: integrity and authentication of an envelope
//! - `backoff` / `connection`: retry timing and the reconnect state machine
//! - `upstream`: the durable broker seam (plus an in-memory broker)
//! - `downstream`: the connectionless transport side
pub mod backoff;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod downstream;
pub mod models;
pub mod telemetry;
pub mod token;
pub mod upstream;

pub use backoff::{BackoffPolicy, RetryLimit};
pub use checksum::{ChecksumAlgorithm, ChecksumError};
pub use connection::{ConnectionFactory, ConnectionState, Connector};
pub use downstream::datagram::Datagram;
pub use models::envelope::{Claims, Message, SignedEnvelope};
pub use token::{Algorithm, TokenError, TokenSigner, TokenVerifier};
pub use upstream::ibroker::{BrokerConsumer, BrokerError, BrokerPublisher, Delivery, QueueMessage};
pub use upstream::memory::{MemoryBroker, MemoryChannel, MemoryConnector};
