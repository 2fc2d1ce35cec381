use std::net::SocketAddr;

use chrono::{DateTime, Utc};

/// One datagram as it came off the socket, before any verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Datagram {
    pub fn new(peer: SocketAddr, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            peer,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload for log lines; lossy so binary junk still shows up.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
