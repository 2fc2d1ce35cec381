//! Signed, time-bounded sender tokens (compact JWS with HMAC).
//!
//! A token is `base64url(header) "." base64url(claims) "." base64url(mac)`
//! where the MAC covers the first two segments under a shared secret.
//! Verification checks the algorithm, the MAC and the time window; it says
//! nothing about the envelope checksum, which is verified separately.

use std::{fmt, str::FromStr, time::Duration};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};

use crate::models::envelope::Claims;

pub const DEFAULT_ISSUER: &str = "udp_client";
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token algorithm '{found}' does not match configured '{expected}'")]
    AlgorithmMismatch { expected: String, found: String },

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired at {exp} (now {now})")]
    Expired { exp: i64, now: i64 },

    #[error("token issued in the future at {iat} (now {now})")]
    NotYetValid { iat: i64, now: i64 },

    #[error("token claim '{0}' missing")]
    MissingClaim(&'static str),

    #[error("unsupported signing algorithm '{0}' (expected HS256, HS384 or HS512)")]
    UnsupportedAlgorithm(String),

    #[error("signing key rejected: {0}")]
    Key(String),
}

impl TokenError {
    /// Short reason used in structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Expired { .. } => "jwt_expired",
            TokenError::NotYetValid { .. } => "jwt_immature",
            _ => "jwt_invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    HS256,
    HS384,
    HS512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::HS256 => "HS256",
            Algorithm::HS384 => "HS384",
            Algorithm::HS512 => "HS512",
        }
    }

    fn sign(&self, secret: &[u8], data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let key_err = |e: hmac::digest::InvalidLength| TokenError::Key(e.to_string());
        Ok(match self {
            Algorithm::HS256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(key_err)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Algorithm::HS384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(secret).map_err(key_err)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Algorithm::HS512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(secret).map_err(key_err)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }

    /// Constant-time comparison against `signature`.
    fn verify(&self, secret: &[u8], data: &[u8], signature: &[u8]) -> Result<(), TokenError> {
        let key_err = |e: hmac::digest::InvalidLength| TokenError::Key(e.to_string());
        let ok = match self {
            Algorithm::HS256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(key_err)?;
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
            Algorithm::HS384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(secret).map_err(key_err)?;
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
            Algorithm::HS512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(secret).map_err(key_err)?;
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(TokenError::InvalidSignature)
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HS256" => Ok(Algorithm::HS256),
            "HS384" => Ok(Algorithm::HS384),
            "HS512" => Ok(Algorithm::HS512),
            other => Err(TokenError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| TokenError::Malformed(format!("{what}: {e}")))
}

/// Issues a fresh token per message.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    algorithm: Algorithm,
    issuer: String,
    ttl: Duration,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>, algorithm: Algorithm) -> Self {
        Self {
            secret: secret.into(),
            algorithm,
            issuer: DEFAULT_ISSUER.to_string(),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn issue(&self, now: DateTime<Utc>) -> Result<String, TokenError> {
        let iat = now.timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            iat,
            exp: iat + self.ttl.as_secs() as i64,
        };
        self.encode(&claims)
    }

    pub fn encode(&self, claims: &Claims) -> Result<String, TokenError> {
        let header = Header {
            alg: self.algorithm.as_str().to_string(),
            typ: Some("JWT".to_string()),
        };
        let header = serde_json::to_vec(&header).map_err(|e| TokenError::Malformed(e.to_string()))?;
        let claims = serde_json::to_vec(claims).map_err(|e| TokenError::Malformed(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(claims)
        );
        let signature = self.algorithm.sign(&self.secret, signing_input.as_bytes())?;

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }
}

/// Checks signature and freshness of incoming tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
    algorithm: Algorithm,
    leeway_secs: i64,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &self.algorithm)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

impl TokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, algorithm: Algorithm) -> Self {
        Self {
            secret: secret.into(),
            algorithm,
            leeway_secs: 0,
        }
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway_secs = leeway.as_secs() as i64;
        self
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(h), Some(c), Some(s), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed("expected three segments".into()));
        };

        let header: Header = serde_json::from_slice(&decode_segment(h, "header")?)
            .map_err(|e| TokenError::Malformed(format!("header: {e}")))?;
        if header.alg != self.algorithm.as_str() {
            return Err(TokenError::AlgorithmMismatch {
                expected: self.algorithm.as_str().to_string(),
                found: header.alg,
            });
        }

        let signature = decode_segment(s, "signature")?;
        let signing_input = &token[..h.len() + 1 + c.len()];
        self.algorithm
            .verify(&self.secret, signing_input.as_bytes(), &signature)?;

        let raw: RawClaims = serde_json::from_slice(&decode_segment(c, "claims")?)
            .map_err(|e| TokenError::Malformed(format!("claims: {e}")))?;
        let exp = raw.exp.ok_or(TokenError::MissingClaim("exp"))?;
        let iat = raw.iat.ok_or(TokenError::MissingClaim("iat"))?;
        let iss = raw.iss.ok_or(TokenError::MissingClaim("iss"))?;

        let now = now.timestamp();
        if exp <= now - self.leeway_secs {
            return Err(TokenError::Expired { exp, now });
        }
        if iat > now + self.leeway_secs {
            return Err(TokenError::NotYetValid { iat, now });
        }

        Ok(Claims { iss, iat, exp })
    }
}
