//! Ingress relay.
//!
//! `downstreaminterface` owns the UDP socket and feeds a bounded queue;
//! `gateway` drains that queue on a single task, verifying each datagram
//! (`upstreaminterface::Verifier`) and handing the good ones to the broker
//! (`upstreaminterface::Forwarder`).
pub mod config;
pub mod downstreaminterface;
pub mod gateway;
pub mod upstreaminterface;

pub use downstreaminterface::{UdpDownstream, INBOUND_QUEUE_CAPACITY};
pub use gateway::{Outcome, RelayGateway, RelayStats};
pub use upstreaminterface::{ForwardOutcome, Forwarder, Rejection, RejectionKind, Verified, Verifier};
