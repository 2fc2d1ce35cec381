use chrono::{DateTime, Utc};
use relaycore::{
    checksum::{ChecksumAlgorithm, ChecksumError},
    token::{TokenError, TokenSigner},
    Message, SignedEnvelope,
};

#[derive(thiserror::Error, Debug)]
pub enum SignError {
    #[error("token: {0}")]
    Token(#[from] TokenError),

    #[error("checksum: {0}")]
    Checksum(#[from] ChecksumError),
}

/// Turns a `Message` into a `SignedEnvelope` with a fresh token.
#[derive(Debug, Clone)]
pub struct Signer {
    tokens: TokenSigner,
    checksum: ChecksumAlgorithm,
}

impl Signer {
    pub fn new(tokens: TokenSigner, checksum: ChecksumAlgorithm) -> Self {
        Self { tokens, checksum }
    }

    pub fn sign(&self, message: &Message, now: DateTime<Utc>) -> Result<SignedEnvelope, SignError> {
        let token = self.tokens.issue(now)?;
        Ok(SignedEnvelope::seal(message, token, self.checksum)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycore::{checksum, token::TokenVerifier, Algorithm};

    #[test]
    fn envelope_carries_fresh_token_and_valid_checksum() {
        let signer = Signer::new(TokenSigner::new(b"k".to_vec(), Algorithm::HS256), ChecksumAlgorithm::Md5);
        let now = Utc::now();
        let env = signer.sign(&Message::new(1, "hello"), now).unwrap();

        let claims = TokenVerifier::new(b"k".to_vec(), Algorithm::HS256)
            .verify(&env.token, now)
            .unwrap();
        assert_eq!(claims.iat, now.timestamp());
        assert_eq!(claims.exp, now.timestamp() + 30);
        assert!(checksum::verify(&env.to_value(), ChecksumAlgorithm::Md5).is_ok());
    }

    #[test]
    fn each_signature_gets_its_own_token() {
        let signer = Signer::new(TokenSigner::new(b"k".to_vec(), Algorithm::HS256), ChecksumAlgorithm::Sha256);
        let now = Utc::now();
        let a = signer.sign(&Message::new(1, "x"), now).unwrap();
        let b = signer.sign(&Message::new(1, "x"), now + chrono::Duration::seconds(1)).unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.checksum, b.checksum);
    }
}
