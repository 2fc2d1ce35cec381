//! Originator side of the relay: build a message, sign it, send it.
pub mod client;
pub mod config;
pub mod sender;
pub mod signer;

pub use client::{message_text, Originator};
pub use sender::{send_with_retry, DatagramSink, SendOutcome, UdpSink};
pub use signer::{SignError, Signer};
