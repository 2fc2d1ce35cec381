use std::time::Duration;

use chrono::Utc;
use relaycore::{Message, RetryLimit};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    sender::{send_with_retry, DatagramSink, SendOutcome},
    signer::Signer,
};

pub fn message_text(counter: u64) -> String {
    format!("This is being sent via the UDP protocol. #{counter}")
}

/// Periodic sender: one signed message per cycle, fire-and-forget.
pub struct Originator<S: DatagramSink> {
    client_id: i64,
    signer: Signer,
    sink: S,
    retry: RetryLimit,
    interval: Duration,
}

impl<S: DatagramSink> Originator<S> {
    pub fn new(client_id: i64, signer: Signer, sink: S) -> Self {
        Self {
            client_id,
            signer,
            sink,
            retry: RetryLimit::default(),
            interval: Duration::from_secs(5),
        }
    }

    pub fn with_retry(mut self, retry: RetryLimit) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Sign and send one message. Signing failures skip the cycle.
    pub async fn cycle(&mut self, counter: u64) -> Option<SendOutcome> {
        let message = Message::new(self.client_id, message_text(counter));
        let envelope = match self.signer.sign(&message, Utc::now()) {
            Ok(env) => env,
            Err(e) => {
                error!(event = "sign_failed", client_id = self.client_id, error = %e);
                return None;
            }
        };
        let payload = match envelope.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                error!(event = "encode_failed", client_id = self.client_id, error = %e);
                return None;
            }
        };
        Some(send_with_retry(&mut self.sink, &payload, &self.retry, self.client_id).await)
    }

    /// Send every `interval` until cancelled. Returns the number of cycles
    /// that ran to completion; one interrupted by cancellation is not counted.
    pub async fn run(&mut self, cancel: CancellationToken) -> u64 {
        let mut cycles: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.cycle(cycles + 1) => cycles += 1,
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(event = "client_stopped", client_id = self.client_id, cycles);
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaycore::{checksum, token::TokenSigner, token::TokenVerifier, Algorithm, ChecksumAlgorithm, SignedEnvelope};
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    #[async_trait]
    impl DatagramSink for Recorder {
        async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn signer() -> Signer {
        Signer::new(TokenSigner::new(b"k".to_vec(), Algorithm::HS256), ChecksumAlgorithm::Md5)
    }

    #[tokio::test(start_paused = true)]
    async fn sends_numbered_messages_every_interval() {
        let sink = Recorder::default();
        let sent = sink.0.clone();
        let mut originator = Originator::new(7, signer(), sink);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { originator.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), 3);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let verifier = TokenVerifier::new(b"k".to_vec(), Algorithm::HS256);
        for (i, raw) in sent.iter().enumerate() {
            let env = SignedEnvelope::from_slice(raw).unwrap();
            assert_eq!(env.client_id, 7);
            assert_eq!(env.text, message_text(i as u64 + 1));
            assert!(verifier.verify(&env.token, Utc::now()).is_ok());
            assert!(checksum::verify(&serde_json::from_slice(raw).unwrap(), ChecksumAlgorithm::Md5).is_ok());
        }
    }

    /// Accepts the first datagram, then never finishes another send.
    struct StallsAfterFirst(usize);

    #[async_trait]
    impl DatagramSink for StallsAfterFirst {
        async fn send(&mut self, _payload: &[u8]) -> io::Result<()> {
            self.0 += 1;
            if self.0 > 1 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_cut_short_by_cancellation_is_not_counted() {
        let mut originator = Originator::new(7, signer(), StallsAfterFirst(0));
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { originator.run(cancel).await })
        };
        // First cycle at t=0 completes; the second starts at t=5 and hangs.
        tokio::time::sleep(Duration::from_secs(7)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), 1);
    }

    #[test]
    fn text_format() {
        assert_eq!(message_text(1), "This is being sent via the UDP protocol. #1");
    }
}
