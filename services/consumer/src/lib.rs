//! Persistence consumer.
//!
//! One delivery in flight at a time: parse, insert, then ack. Anything that
//! fails is nacked back onto the queue, and a message that keeps failing is
//! moved to a dead-letter queue once `RetryLedger` says it has had enough.
pub mod config;
pub mod consumer;
pub mod retryledger;

pub use consumer::{ConsumerStats, Handled, PersistenceConsumer, SessionEnd};
pub use retryledger::{RetryLedger, Verdict};
