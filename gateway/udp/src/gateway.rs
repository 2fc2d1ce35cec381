use chrono::Utc;
use relaycore::{connection::ConnectionFactory, upstream::ibroker::BrokerPublisher, Datagram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::upstreaminterface::{ForwardOutcome, Forwarder, Rejection, RejectionKind, Verifier};

/// Per-outcome counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub forwarded: u64,
    pub republished: u64,
    pub lost: u64,
    pub invalid_input: u64,
    pub auth_failed: u64,
    pub integrity_failed: u64,
}

impl RelayStats {
    pub fn dropped(&self) -> u64 {
        self.invalid_input + self.auth_failed + self.integrity_failed
    }
}

/// What happened to one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    Republished,
    Rejected(RejectionKind),
    Lost,
}

/// Verification + forwarding, one datagram at a time.
#[derive(Debug)]
pub struct RelayGateway<F: ConnectionFactory> {
    verifier: Verifier,
    forwarder: Forwarder<F>,
    stats: RelayStats,
}

impl<F> RelayGateway<F>
where
    F: ConnectionFactory,
    F::Conn: BrokerPublisher,
{
    pub fn new(verifier: Verifier, forwarder: Forwarder<F>) -> Self {
        Self {
            verifier,
            forwarder,
            stats: RelayStats::default(),
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn forwarder_mut(&mut self) -> &mut Forwarder<F> {
        &mut self.forwarder
    }

    pub async fn handle(&mut self, datagram: Datagram) -> Outcome {
        self.stats.received += 1;
        let addr = datagram.peer.to_string();

        let verified = match self.verifier.verify(&datagram.payload, Utc::now()) {
            Ok(v) => v,
            Err(rejection) => {
                let kind = rejection.kind();
                match kind {
                    RejectionKind::InvalidInput => self.stats.invalid_input += 1,
                    RejectionKind::AuthFailed => self.stats.auth_failed += 1,
                    RejectionKind::IntegrityFailed => self.stats.integrity_failed += 1,
                }
                let reason = match &rejection {
                    Rejection::Token(e) => e.reason(),
                    _ => kind.as_str(),
                };
                error!(
                    event = rejection.event(),
                    addr = %addr,
                    reason,
                    error = %rejection,
                    raw_data = %datagram.text(),
                );
                return Outcome::Rejected(kind);
            }
        };

        let message = serde_json::Value::Object(verified.envelope).to_string();
        info!(
            event = "udp_message_received",
            addr = %addr,
            message = %message,
            checksum_valid = true,
        );

        match self.forwarder.forward(&datagram.payload, &addr, &message).await {
            ForwardOutcome::Published => {
                self.stats.forwarded += 1;
                Outcome::Forwarded
            }
            ForwardOutcome::Republished => {
                self.stats.forwarded += 1;
                self.stats.republished += 1;
                Outcome::Republished
            }
            ForwardOutcome::Lost(_) => {
                self.stats.lost += 1;
                Outcome::Lost
            }
        }
    }

    /// Drain `inbound` until it closes or `cancel` fires. Between datagrams
    /// the broker channel is kept alive, and redialed if it drops.
    pub async fn run(&mut self, mut inbound: mpsc::Receiver<Datagram>, cancel: CancellationToken) -> RelayStats {
        loop {
            let datagram = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                d = inbound.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
                _ = self.forwarder.keep_alive() => continue,
            };
            self.handle(datagram).await;
        }

        let s = self.stats;
        info!(
            event = "relay_stopped",
            received = s.received,
            forwarded = s.forwarded,
            republished = s.republished,
            lost = s.lost,
            dropped = s.dropped(),
        );
        s
    }
}
