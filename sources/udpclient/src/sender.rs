use std::{io, net::SocketAddr};

use anyhow::{Context, Result};
use async_trait::async_trait;
use relaycore::RetryLimit;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{error, info, warn};

/// Somewhere a datagram can be written to.
#[async_trait]
pub trait DatagramSink: Send {
    async fn send(&mut self, payload: &[u8]) -> io::Result<()>;
}

/// UDP socket "connected" to the relay, so sends need no address.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    server: SocketAddr,
}

impl UdpSink {
    pub async fn connect(server: &str) -> Result<Self> {
        let server = lookup_host(server)
            .await
            .with_context(|| format!("cannot resolve {server}"))?
            .next()
            .with_context(|| format!("{server} resolved to no address"))?;

        let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await.context("failed to bind local UDP socket")?;
        socket
            .connect(server)
            .await
            .with_context(|| format!("failed to set UDP peer {server}"))?;

        info!(event = "connection_made", server = %server);
        Ok(Self { socket, server })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }
}

#[async_trait]
impl DatagramSink for UdpSink {
    async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        let n = self.socket.send(payload).await?;
        if n != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {n} of {} bytes", payload.len()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { attempt: u32 },
    Failed { attempts: u32 },
}

/// Bounded local retry. Exhaustion is logged and reported, never raised:
/// the next cycle goes ahead regardless.
pub async fn send_with_retry<S: DatagramSink + ?Sized>(
    sink: &mut S,
    payload: &[u8],
    retry: &RetryLimit,
    client_id: i64,
) -> SendOutcome {
    for attempt in 1..=retry.max_attempts {
        match sink.send(payload).await {
            Ok(()) => {
                info!(
                    event = "message_sent",
                    client_id,
                    message = %String::from_utf8_lossy(payload),
                    attempt,
                );
                return SendOutcome::Sent { attempt };
            }
            Err(e) => {
                warn!(event = "send_retry", client_id, attempt, error = %e);
                if attempt < retry.max_attempts {
                    tokio::time::sleep(retry.backoff.delay(attempt)).await;
                }
            }
        }
    }

    error!(event = "send_failed", client_id, attempts = retry.max_attempts);
    SendOutcome::Failed {
        attempts: retry.max_attempts,
    }
}
