use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksum::{self, ChecksumAlgorithm, ChecksumError};

// ---- Wire schema (datagrams and broker payloads) ----

/// The semantic payload produced by an originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub client_id: i64,
    pub text: String,
}

impl Message {
    pub fn new(client_id: i64, text: impl Into<String>) -> Self {
        Self {
            client_id,
            text: text.into(),
        }
    }
}

/// A message with its authentication token and integrity checksum attached.
/// Built once by the signer and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub client_id: i64,
    pub text: String,
    pub token: String,
    pub checksum: String,
}

impl SignedEnvelope {
    /// Attach `token` to `message` and compute the checksum over
    /// `{client_id, text, token}`.
    pub fn seal(
        message: &Message,
        token: String,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Self, ChecksumError> {
        let body = serde_json::json!({
            "client_id": message.client_id,
            "text": message.text,
            "token": token,
        });
        let checksum = checksum::compute(&body, algorithm)?;

        Ok(Self {
            client_id: message.client_id,
            text: message.text.clone(),
            token,
            checksum,
        })
    }

    pub fn message(&self) -> Message {
        Message::new(self.client_id, self.text.clone())
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "client_id": self.client_id,
            "text": self.text,
            "token": self.token,
            "checksum": self.checksum,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Claim set carried inside the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_checksum_matches_recomputation() {
        let msg = Message::new(1, "hello");
        let env = SignedEnvelope::seal(&msg, "tok".into(), ChecksumAlgorithm::Md5).unwrap();

        assert_eq!(env.client_id, 1);
        assert_eq!(env.text, "hello");
        assert!(checksum::verify(&env.to_value(), ChecksumAlgorithm::Md5).is_ok());
    }

    #[test]
    fn wire_field_names_are_stable() {
        let env = SignedEnvelope {
            client_id: 7,
            text: "t".into(),
            token: "k".into(),
            checksum: "c".into(),
        };
        let v: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        let mut keys: Vec<_> = v.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["checksum", "client_id", "text", "token"]);
    }
}
