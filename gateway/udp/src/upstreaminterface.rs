use std::fmt;

use chrono::{DateTime, Utc};
use relaycore::{
    checksum::{self, ChecksumAlgorithm, ChecksumError},
    connection::{ConnectionFactory, Connector},
    token::{TokenError, TokenVerifier},
    upstream::ibroker::{BrokerError, BrokerPublisher, QueueMessage},
    Claims,
};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

/// Which family of failure dropped a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    InvalidInput,
    AuthFailed,
    IntegrityFailed,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::InvalidInput => "invalid_input",
            RejectionKind::AuthFailed => "auth_failed",
            RejectionKind::IntegrityFailed => "integrity_failed",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Rejection {
    #[error("payload is not UTF-8")]
    NotUtf8,

    #[error("payload is not JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("token missing")]
    MissingToken,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Integrity(#[from] ChecksumError),
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Rejection::NotUtf8 | Rejection::InvalidJson(_) | Rejection::NotAnObject => RejectionKind::InvalidInput,
            Rejection::MissingToken | Rejection::Token(_) => RejectionKind::AuthFailed,
            Rejection::Integrity(_) => RejectionKind::IntegrityFailed,
        }
    }

    /// Log event name.
    pub fn event(&self) -> &'static str {
        match self.kind() {
            RejectionKind::InvalidInput => "invalid_json",
            RejectionKind::AuthFailed => "auth_failed",
            RejectionKind::IntegrityFailed => "checksum_failed",
        }
    }
}

/// A datagram that passed every check.
#[derive(Debug, Clone)]
pub struct Verified {
    pub envelope: Map<String, Value>,
    pub claims: Claims,
}

/// Parse, authenticate, integrity-check. Pure: no I/O, no logging.
#[derive(Debug, Clone)]
pub struct Verifier {
    tokens: TokenVerifier,
    checksum: ChecksumAlgorithm,
}

impl Verifier {
    pub fn new(tokens: TokenVerifier, checksum: ChecksumAlgorithm) -> Self {
        Self { tokens, checksum }
    }

    pub fn verify(&self, payload: &[u8], now: DateTime<Utc>) -> Result<Verified, Rejection> {
        let text = std::str::from_utf8(payload).map_err(|_| Rejection::NotUtf8)?;
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(envelope) = value else {
            return Err(Rejection::NotAnObject);
        };

        // Auth runs first: a stale or forged token is rejected whatever the checksum says.
        let token = match envelope.get("token") {
            Some(Value::String(t)) if !t.is_empty() => t.as_str(),
            _ => return Err(Rejection::MissingToken),
        };
        let claims = self.tokens.verify(token, now)?;

        let envelope = Value::Object(envelope);
        checksum::verify(&envelope, self.checksum)?;
        let Value::Object(envelope) = envelope else {
            return Err(Rejection::NotAnObject);
        };

        Ok(Verified { envelope, claims })
    }
}

/// Result of handing one verified payload to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Published,
    /// First attempt hit a dead connection; the retry after reconnect worked.
    Republished,
    /// Both attempts failed; the datagram is gone.
    Lost(BrokerError),
}

/// Owns the broker channel and its reconnect logic.
pub struct Forwarder<F: ConnectionFactory> {
    connector: Connector<F>,
    channel: Option<F::Conn>,
    queue: String,
    /// Set once the broker has confirmed it holds `queue`.
    declared: bool,
}

impl<F: ConnectionFactory> fmt::Debug for Forwarder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("connector", &self.connector)
            .field("connected", &self.channel.is_some())
            .field("queue", &self.queue)
            .field("declared", &self.declared)
            .finish()
    }
}

impl<F> Forwarder<F>
where
    F: ConnectionFactory,
    F::Conn: BrokerPublisher,
{
    pub fn new(connector: Connector<F>, queue: impl Into<String>) -> Self {
        Self {
            connector,
            channel: None,
            queue: queue.into(),
            declared: false,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_declared(&self) -> bool {
        self.declared
    }

    /// Block until the broker accepts a connection. The first connection
    /// also declares the queue, so nothing is published before the broker
    /// will keep it.
    pub async fn connect(&mut self) {
        let mut failures: u32 = 0;
        loop {
            let mut channel = self.connector.connect().await;
            if self.declared {
                self.channel = Some(channel);
                return;
            }
            match channel.declare_queue(&self.queue).await {
                Ok(()) => {
                    info!(event = "queue_declared", queue = %self.queue);
                    self.declared = true;
                    self.channel = Some(channel);
                    return;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.connector.backoff().delay(failures);
                    error!(
                        event = "queue_declare_failed",
                        queue = %self.queue,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                    );
                    self.connector.mark_disconnected();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Service the channel while no datagram needs it; once it fails, dial
    /// a new one. Safe to drop at any point, which is how incoming traffic
    /// takes over.
    pub async fn keep_alive(&mut self) {
        match self.channel.as_mut() {
            Some(channel) => {
                let e = channel.keep_alive().await;
                warn!(event = "broker_connection_lost", queue = %self.queue, error = %e, idle = true);
                self.channel = None;
                self.connector.mark_disconnected();
            }
            None => self.connect().await,
        }
    }

    async fn publish_once(&mut self, msg: &QueueMessage) -> Result<(), BrokerError> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(BrokerError::Unavailable("not connected".into()));
        };
        let res = channel.publish(msg).await;
        if matches!(&res, Err(e) if e.is_connectivity()) {
            self.channel = None;
            self.connector.mark_disconnected();
        }
        res
    }

    /// Durable publish with exactly one reconnect-and-retry. `addr` and
    /// `message` only feed the log lines.
    pub async fn forward(&mut self, payload: &[u8], addr: &str, message: &str) -> ForwardOutcome {
        if self.channel.is_none() {
            self.connect().await;
        }
        let msg = QueueMessage::durable(self.queue.clone(), payload);

        match self.publish_once(&msg).await {
            Ok(()) => {
                info!(event = "broker_published", queue = %self.queue, addr, message);
                return ForwardOutcome::Published;
            }
            Err(e) if !e.is_connectivity() => {
                error!(event = "broker_publish_lost", queue = %self.queue, addr, message, error = %e);
                return ForwardOutcome::Lost(e);
            }
            Err(e) => warn!(event = "broker_connection_lost", queue = %self.queue, addr, message, error = %e),
        }

        self.connect().await;
        match self.publish_once(&msg).await {
            Ok(()) => {
                info!(event = "broker_republished", queue = %self.queue, addr, message);
                ForwardOutcome::Republished
            }
            Err(e) => {
                error!(event = "broker_publish_lost", queue = %self.queue, addr, message, error = %e);
                ForwardOutcome::Lost(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use relaycore::{
        token::TokenSigner, Algorithm, BackoffPolicy, MemoryBroker, MemoryConnector, Message,
        SignedEnvelope,
    };
    use std::time::Duration;

    const SECRET: &[u8] = b"test-secret";
    const Q: &str = "udp_messages";
    const ADDR: &str = "10.0.0.7:40000";

    fn verifier() -> Verifier {
        Verifier::new(TokenVerifier::new(SECRET, Algorithm::HS256), ChecksumAlgorithm::Md5)
    }

    fn sealed(text: &str, issued: DateTime<Utc>) -> SignedEnvelope {
        let token = TokenSigner::new(SECRET, Algorithm::HS256).issue(issued).unwrap();
        SignedEnvelope::seal(&Message::new(1, text), token, ChecksumAlgorithm::Md5).unwrap()
    }

    #[test]
    fn valid_envelope_is_accepted() {
        let now = Utc::now();
        let env = sealed("hello", now);
        let v = verifier().verify(&env.to_bytes().unwrap(), now).unwrap();
        assert_eq!(v.envelope["text"], "hello");
        assert_eq!(v.claims.iss, "udp_client");
    }

    #[test]
    fn mutated_text_fails_integrity() {
        let now = Utc::now();
        let mut env = sealed("hello", now);
        env.text = "hellO".into();
        let err = verifier().verify(&env.to_bytes().unwrap(), now).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::IntegrityFailed);
        assert_eq!(err.event(), "checksum_failed");
    }

    #[test]
    fn expired_token_fails_auth_before_checksum() {
        let now = Utc::now();
        let mut env = sealed("hello", now - ChronoDuration::seconds(120));
        env.checksum = "not-even-close".into();
        let err = verifier().verify(&env.to_bytes().unwrap(), now).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::AuthFailed);
        assert!(matches!(err, Rejection::Token(TokenError::Expired { .. })));
    }

    #[test]
    fn foreign_secret_fails_auth() {
        let now = Utc::now();
        let token = TokenSigner::new(b"other".to_vec(), Algorithm::HS256).issue(now).unwrap();
        let env = SignedEnvelope::seal(&Message::new(1, "x"), token, ChecksumAlgorithm::Md5).unwrap();
        let err = verifier().verify(&env.to_bytes().unwrap(), now).unwrap_err();
        assert!(matches!(err, Rejection::Token(TokenError::InvalidSignature)));
    }

    #[test]
    fn missing_or_empty_token_fails_auth() {
        let now = Utc::now();
        for payload in [
            br#"{"client_id": 1, "text": "x", "checksum": "c"}"#.as_slice(),
            br#"{"client_id": 1, "text": "x", "token": "", "checksum": "c"}"#.as_slice(),
            br#"{"client_id": 1, "text": "x", "token": 5, "checksum": "c"}"#.as_slice(),
        ] {
            let err = verifier().verify(payload, now).unwrap_err();
            assert!(matches!(err, Rejection::MissingToken), "{err:?}");
        }
    }

    #[test]
    fn missing_checksum_fails_integrity() {
        let now = Utc::now();
        let env = sealed("hello", now);
        let mut value = env.to_value();
        value.as_object_mut().unwrap().remove("checksum");
        let err = verifier().verify(&serde_json::to_vec(&value).unwrap(), now).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::IntegrityFailed);
    }

    #[test]
    fn garbage_is_invalid_input() {
        let now = Utc::now();
        for payload in [b"not json".as_slice(), b"[1, 2]".as_slice(), b"\xff\xfe".as_slice(), b"".as_slice()] {
            let err = verifier().verify(payload, now).unwrap_err();
            assert_eq!(err.kind(), RejectionKind::InvalidInput, "{err:?}");
        }
    }

    fn forwarder(broker: &MemoryBroker) -> Forwarder<MemoryConnector> {
        Forwarder::new(
            Connector::new(broker.connector(Q, 1), BackoffPolicy::fixed(Duration::from_secs(5))),
            Q,
        )
    }

    #[tokio::test]
    async fn publishes_payload_bytes_unchanged() {
        let broker = MemoryBroker::new();
        let mut fwd = forwarder(&broker);
        fwd.connect().await;

        let payload = br#"{"text": "x",   "client_id": 1}"#;
        assert_eq!(fwd.forward(payload, ADDR, "x").await, ForwardOutcome::Published);
        assert_eq!(broker.messages(Q), vec![payload.to_vec()]);
    }

    #[tokio::test]
    async fn dead_connection_is_replaced_and_publish_retried_once() {
        let broker = MemoryBroker::new();
        let mut fwd = forwarder(&broker);
        fwd.connect().await;
        broker.fail_next_publishes(1);

        assert_eq!(fwd.forward(b"m", ADDR, "m").await, ForwardOutcome::Republished);
        assert_eq!(broker.queue_len(Q), 1);
        assert_eq!(broker.connections(), 2);
        assert!(fwd.is_connected());
    }

    #[tokio::test]
    async fn second_failure_loses_the_message() {
        let broker = MemoryBroker::new();
        let mut fwd = forwarder(&broker);
        fwd.connect().await;
        broker.fail_next_publishes(2);

        assert!(matches!(fwd.forward(b"m", ADDR, "m").await, ForwardOutcome::Lost(_)));
        assert_eq!(broker.queue_len(Q), 0);
        assert!(!fwd.is_connected());

        // next datagram dials before its first attempt
        assert_eq!(fwd.forward(b"n", ADDR, "n").await, ForwardOutcome::Published);
        assert_eq!(broker.messages(Q), vec![b"n".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_spanning_reconnect_attempts_publishes_exactly_once() {
        let broker = MemoryBroker::new();
        let mut fwd = forwarder(&broker);
        fwd.connect().await;

        broker.set_available(false);
        let revive = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                broker.set_available(true);
            })
        };

        assert_eq!(fwd.forward(b"m", ADDR, "m").await, ForwardOutcome::Republished);
        revive.await.unwrap();
        assert_eq!(broker.messages(Q), vec![b"m".to_vec()]);
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn first_connection_declares_the_queue_before_anything_is_published() {
        let broker = MemoryBroker::new();
        broker.discard_undeclared();
        let mut fwd = forwarder(&broker);
        assert!(!fwd.is_declared());

        fwd.connect().await;
        assert!(fwd.is_declared());
        assert!(broker.is_declared(Q));

        assert_eq!(fwd.forward(b"kept", ADDR, "kept").await, ForwardOutcome::Published);
        assert_eq!(broker.messages(Q), vec![b"kept".to_vec()]);
        assert_eq!(broker.discarded(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn declaration_is_retried_until_the_broker_takes_it() {
        let broker = MemoryBroker::new();
        broker.discard_undeclared();
        broker.fail_next_declares(2);
        let mut fwd = forwarder(&broker);

        fwd.connect().await;
        assert!(fwd.is_declared());
        assert!(broker.is_declared(Q));
        assert_eq!(broker.connections(), 3);

        // Later reconnects do not declare again.
        broker.fail_next_declares(1);
        broker.drop_connections();
        assert_eq!(fwd.forward(b"m", ADDR, "m").await, ForwardOutcome::Republished);
        assert_eq!(broker.messages(Q), vec![b"m".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_redials_after_an_idle_loss() {
        let broker = MemoryBroker::new();
        let mut fwd = forwarder(&broker);
        fwd.connect().await;

        broker.drop_connections();
        fwd.keep_alive().await;
        assert!(!fwd.is_connected());
        fwd.keep_alive().await;
        assert!(fwd.is_connected());
        assert_eq!(broker.connections(), 2);

        assert_eq!(fwd.forward(b"m", ADDR, "m").await, ForwardOutcome::Published);
    }
}
