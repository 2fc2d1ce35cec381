use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use relaycore::Datagram;
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Datagrams buffered between the socket and the verification loop.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Largest UDP payload we will read.
const MAX_DATAGRAM: usize = 65_507;

/// The connectionless side of the relay.
#[derive(Debug, Clone)]
pub struct UdpDownstream {
    socket: Arc<UdpSocket>,
}

impl UdpDownstream {
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("UDP socket has no local address")
    }

    /// Read datagrams into `tx` until cancelled or the receiver is dropped.
    ///
    /// A full queue blocks the reader; the kernel socket buffer absorbs the
    /// burst and drops beyond it, as UDP does.
    pub fn spawn(&self, tx: mpsc::Sender<Datagram>, cancel: CancellationToken) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (n, peer) = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(event = "udp_listener_stopped");
                        break;
                    }
                    res = socket.recv_from(&mut buf) => match res {
                        Ok(v) => v,
                        Err(e) => {
                            // e.g. ICMP port unreachable surfaced on some platforms
                            warn!(event = "udp_recv_error", error = %e);
                            continue;
                        }
                    }
                };

                if tx.send(Datagram::new(peer, &buf[..n])).await.is_err() {
                    warn!(event = "udp_listener_stopped", reason = "inbound queue closed");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_reach_the_queue_with_their_peer() {
        let downstream = UdpDownstream::bind("127.0.0.1:0").await.unwrap();
        let addr = downstream.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let listener = downstream.spawn(tx, cancel.clone());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"{\"a\": 1}", addr).await.unwrap();
        sender.send_to(b"second", addr).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, b"{\"a\": 1}");
        assert_eq!(first.peer, sender.local_addr().unwrap());
        assert_eq!(rx.recv().await.unwrap().payload, b"second");

        cancel.cancel();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn listener_stops_when_queue_is_dropped() {
        let downstream = UdpDownstream::bind("127.0.0.1:0").await.unwrap();
        let addr = downstream.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(1);
        let listener = downstream.spawn(tx, CancellationToken::new());
        drop(rx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"x", addr).await.unwrap();
        listener.await.unwrap();
    }
}
