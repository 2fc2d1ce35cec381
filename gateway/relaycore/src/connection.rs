//! Reconnect state machine shared by every external connection.
//!
//! `Disconnected -> Connecting -> Connected -> (error) -> Disconnected`,
//! looping forever with the configured backoff. There is no retry ceiling:
//! the relay processes are long-running services and block until their
//! dependencies come back.

use std::fmt::{self, Debug};

use async_trait::async_trait;
use tracing::{error, info};

use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Dials one external dependency (broker, store).
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Conn: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Prefix for log events, e.g. `broker` gives `broker_connected`.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Self::Conn, Self::Error>;
}

/// Owns a factory plus the state of the connection it produces.
pub struct Connector<F: ConnectionFactory> {
    factory: F,
    backoff: BackoffPolicy,
    state: ConnectionState,
    attempts: u64,
}

impl<F: ConnectionFactory> Debug for Connector<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.factory.name())
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl<F: ConnectionFactory> Connector<F> {
    pub fn new(factory: F, backoff: BackoffPolicy) -> Self {
        Self {
            factory,
            backoff,
            state: ConnectionState::Disconnected,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Total dial attempts made so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Record that the connection handed out earlier has been lost.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Dial once.
    pub async fn try_connect(&mut self) -> Result<F::Conn, F::Error> {
        self.state = ConnectionState::Connecting;
        self.attempts += 1;
        match self.factory.connect().await {
            Ok(conn) => {
                self.state = ConnectionState::Connected;
                info!(event = %format!("{}_connected", self.factory.name()));
                Ok(conn)
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Dial until it works.
    pub async fn connect(&mut self) -> F::Conn {
        let mut failures: u32 = 0;
        loop {
            match self.try_connect().await {
                Ok(conn) => return conn,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff.delay(failures);
                    error!(
                        event = %format!("{}_unavailable", self.factory.name()),
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
