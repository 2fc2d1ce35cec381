use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Default number of failed deliveries before a message is dead-lettered.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Put it back on the queue; this was failure number `attempt`.
    Retry { attempt: u32 },
    /// Out of attempts.
    DeadLetter { attempts: u32 },
}

/// Failed-delivery counts per message.
///
/// The broker does not say how often it has redelivered something, so the
/// consumer counts for itself. Counts live in memory: a restart starts every
/// message from zero again, which only delays dead-lettering.
#[derive(Debug, Clone)]
pub struct RetryLedger {
    max_attempts: u32,
    failures: HashMap<String, u32>,
}

impl Default for RetryLedger {
    fn default() -> Self {
        Self::new(MAX_DELIVERY_ATTEMPTS)
    }
}

impl RetryLedger {
    /// `max_attempts == 0` never dead-letters.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            failures: HashMap::new(),
        }
    }

    /// Identity of a payload across redeliveries: its checksum when it has
    /// one, otherwise a digest of the raw bytes.
    pub fn key_for(payload: &[u8]) -> String {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(payload) {
            if let Some(serde_json::Value::String(sum)) = map.get("checksum") {
                return format!("checksum:{sum}");
            }
        }
        format!("sha256:{}", hex::encode(Sha256::digest(payload)))
    }

    pub fn record_failure(&mut self, key: &str) -> Verdict {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let attempt = *count;

        if self.max_attempts != 0 && attempt >= self.max_attempts {
            Verdict::DeadLetter { attempts: attempt }
        } else {
            Verdict::Retry { attempt }
        }
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letters_on_the_last_allowed_attempt() {
        let mut ledger = RetryLedger::new(3);
        assert_eq!(ledger.record_failure("k"), Verdict::Retry { attempt: 1 });
        assert_eq!(ledger.record_failure("k"), Verdict::Retry { attempt: 2 });
        assert_eq!(ledger.record_failure("k"), Verdict::DeadLetter { attempts: 3 });
        assert_eq!(ledger.record_failure("other"), Verdict::Retry { attempt: 1 });
    }

    #[test]
    fn zero_means_unbounded() {
        let mut ledger = RetryLedger::new(0);
        for n in 1..=100 {
            assert_eq!(ledger.record_failure("k"), Verdict::Retry { attempt: n });
        }
    }

    #[test]
    fn clear_resets_the_count() {
        let mut ledger = RetryLedger::default();
        ledger.record_failure("k");
        ledger.clear("k");
        assert_eq!(ledger.attempts("k"), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn key_prefers_the_checksum() {
        assert_eq!(
            RetryLedger::key_for(br#"{"text": "x", "checksum": "abc"}"#),
            "checksum:abc"
        );
        let raw = RetryLedger::key_for(b"not json");
        assert!(raw.starts_with("sha256:"));
        assert_eq!(raw, RetryLedger::key_for(b"not json"));
        assert_ne!(raw, RetryLedger::key_for(b"not json either"));
    }
}
