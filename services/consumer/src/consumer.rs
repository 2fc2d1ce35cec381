use std::fmt;

use postgresdb::{DbError, MessageStore};
use relaycore::{
    connection::{ConnectionFactory, Connector},
    upstream::ibroker::{BrokerConsumer, BrokerError, BrokerPublisher, Delivery, QueueMessage},
    SignedEnvelope,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::retryledger::{RetryLedger, Verdict};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub inserted: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub parse_errors: u64,
    pub insert_errors: u64,
    pub store_reconnects: u64,
    pub broker_reconnects: u64,
}

/// Why a consume session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    Cancelled,
    /// The subscription yielded nothing more.
    Drained,
    BrokerLost(BrokerError),
    StoreLost(DbError),
}

/// What became of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Inserted { id: i32 },
    Requeued { attempt: u32 },
    DeadLettered { attempts: u32 },
}

#[derive(Debug)]
enum Failure {
    Parse(serde_json::Error),
    Store(DbError),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Parse(e) => write!(f, "unparseable payload: {e}"),
            Failure::Store(e) => write!(f, "{e}"),
        }
    }
}

pub struct PersistenceConsumer<S: ConnectionFactory, B: ConnectionFactory> {
    store: Connector<S>,
    broker: Connector<B>,
    dead_letter_queue: String,
    /// Set once the broker holds the dead-letter queue.
    dead_letter_declared: bool,
    ledger: RetryLedger,
    stats: ConsumerStats,
}

impl<S: ConnectionFactory, B: ConnectionFactory> fmt::Debug for PersistenceConsumer<S, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceConsumer")
            .field("store", &self.store)
            .field("broker", &self.broker)
            .field("dead_letter_queue", &self.dead_letter_queue)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<S, B> PersistenceConsumer<S, B>
where
    S: ConnectionFactory,
    S::Conn: MessageStore,
    B: ConnectionFactory,
    B::Conn: BrokerConsumer + BrokerPublisher,
{
    pub fn new(store: Connector<S>, broker: Connector<B>, dead_letter_queue: impl Into<String>) -> Self {
        Self {
            store,
            broker,
            dead_letter_queue: dead_letter_queue.into(),
            dead_letter_declared: false,
            ledger: RetryLedger::default(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_ledger(mut self, ledger: RetryLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// Block until the store is reachable and the table exists.
    pub async fn connect_store(&mut self) -> S::Conn {
        loop {
            let store = self.store.connect().await;
            match store.ensure_schema().await {
                Ok(()) => return store,
                Err(e) => {
                    let delay = self.store.backoff().delay(1);
                    error!(event = "table_error", error = %e, retry_in_ms = delay.as_millis() as u64);
                    self.store.mark_disconnected();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Block until the broker is reachable. The first session also declares
    /// the dead-letter queue: nobody consumes it, so without a declaration
    /// the broker would confirm dead-lettered messages and keep none.
    pub async fn connect_broker(&mut self) -> B::Conn {
        let mut failures: u32 = 0;
        loop {
            let mut channel = self.broker.connect().await;
            if self.dead_letter_declared {
                return channel;
            }
            match channel.declare_queue(&self.dead_letter_queue).await {
                Ok(()) => {
                    info!(event = "queue_declared", queue = %self.dead_letter_queue);
                    self.dead_letter_declared = true;
                    return channel;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.broker.backoff().delay(failures);
                    error!(
                        event = "queue_declare_failed",
                        queue = %self.dead_letter_queue,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                    );
                    self.broker.mark_disconnected();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Connect store, then broker, then consume; start over on whatever breaks.
    pub async fn run(&mut self, cancel: CancellationToken) -> ConsumerStats {
        'store: loop {
            let store = tokio::select! {
                _ = cancel.cancelled() => break 'store,
                s = self.connect_store() => s,
            };

            loop {
                let mut channel = tokio::select! {
                    _ = cancel.cancelled() => break 'store,
                    c = self.connect_broker() => c,
                };
                info!(event = "consumer_started");

                match self.run_session(&store, &mut channel, &cancel).await {
                    SessionEnd::Cancelled => break 'store,
                    SessionEnd::Drained => {
                        // Subscription closed under us; give the broker a moment.
                        let delay = self.broker.backoff().delay(1);
                        warn!(event = "subscription_ended", retry_in_ms = delay.as_millis() as u64);
                        self.broker.mark_disconnected();
                        self.stats.broker_reconnects += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => break 'store,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    SessionEnd::BrokerLost(e) => {
                        warn!(event = "broker_connection_lost", error = %e);
                        self.broker.mark_disconnected();
                        self.stats.broker_reconnects += 1;
                    }
                    SessionEnd::StoreLost(e) => {
                        warn!(event = "postgres_connection_lost", error = %e);
                        self.store.mark_disconnected();
                        self.stats.store_reconnects += 1;
                        continue 'store;
                    }
                }
            }
        }

        info!(event = "consumer_stopped", stats = %serde_json::to_string(&self.stats).unwrap_or_default());
        self.stats
    }

    /// Consume from `channel` into `store` until something ends the session.
    pub async fn run_session(
        &mut self,
        store: &S::Conn,
        channel: &mut B::Conn,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                d = channel.next_delivery() => d,
            };
            let delivery = match next {
                Ok(Some(d)) => d,
                Ok(None) => return SessionEnd::Drained,
                Err(e) => return SessionEnd::BrokerLost(e),
            };
            if let Err(end) = self.handle(store, channel, &delivery).await {
                return end;
            }
        }
    }

    /// Settle exactly one delivery.
    pub async fn handle(
        &mut self,
        store: &S::Conn,
        channel: &mut B::Conn,
        delivery: &Delivery,
    ) -> Result<Handled, SessionEnd> {
        self.stats.delivered += 1;
        let key = RetryLedger::key_for(&delivery.payload);

        let result = match SignedEnvelope::from_slice(&delivery.payload) {
            Ok(envelope) => store.insert(&envelope).await.map_err(Failure::Store),
            Err(e) => Err(Failure::Parse(e)),
        };

        let failure = match result {
            Ok(row) => {
                // Committed. If the ack is lost the broker redelivers and we
                // write a duplicate row: at-least-once.
                channel.ack(delivery).await.map_err(SessionEnd::BrokerLost)?;
                self.ledger.clear(&key);
                self.stats.inserted += 1;
                info!(
                    event = "db_inserted",
                    id = row.id,
                    client_id = row.client_id,
                    message = %String::from_utf8_lossy(&delivery.payload),
                    redelivered = delivery.redelivered,
                );
                return Ok(Handled::Inserted { id: row.id });
            }
            Err(f) => f,
        };

        match &failure {
            Failure::Parse(_) => self.stats.parse_errors += 1,
            Failure::Store(_) => self.stats.insert_errors += 1,
        }
        let body = String::from_utf8_lossy(&delivery.payload).into_owned();

        match failure {
            Failure::Store(e) if e.is_connectivity() => {
                // Not the message's fault: no attempt is charged.
                error!(event = "db_insert_error", error = %e, body = %body, connectivity = true);
                channel.nack(delivery, true).await.map_err(SessionEnd::BrokerLost)?;
                self.stats.requeued += 1;
                Err(SessionEnd::StoreLost(e))
            }
            failure => self.retry_or_dead_letter(channel, delivery, &key, &body, failure).await,
        }
    }

    async fn retry_or_dead_letter(
        &mut self,
        channel: &mut B::Conn,
        delivery: &Delivery,
        key: &str,
        body: &str,
        failure: Failure,
    ) -> Result<Handled, SessionEnd> {
        error!(event = "db_insert_error", error = %failure, body = %body);

        match self.ledger.record_failure(key) {
            Verdict::Retry { attempt } => {
                channel.nack(delivery, true).await.map_err(SessionEnd::BrokerLost)?;
                self.stats.requeued += 1;
                Ok(Handled::Requeued { attempt })
            }
            Verdict::DeadLetter { attempts } => {
                let parked = QueueMessage::durable(self.dead_letter_queue.clone(), delivery.payload.clone());
                if let Err(e) = channel.publish(&parked).await {
                    // Leave it on the main queue; the next failure tries again.
                    error!(event = "dead_letter_failed", queue = %self.dead_letter_queue, error = %e);
                    if e.is_connectivity() {
                        return Err(SessionEnd::BrokerLost(e));
                    }
                    channel.nack(delivery, true).await.map_err(SessionEnd::BrokerLost)?;
                    self.stats.requeued += 1;
                    return Ok(Handled::Requeued { attempt: attempts });
                }
                channel.ack(delivery).await.map_err(SessionEnd::BrokerLost)?;
                self.ledger.clear(key);
                self.stats.dead_lettered += 1;
                error!(
                    event = "dead_lettered",
                    queue = %self.dead_letter_queue,
                    attempts,
                    body = %body,
                );
                Ok(Handled::DeadLettered { attempts })
            }
        }
    }
}
