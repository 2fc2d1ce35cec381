//! Argument groups shared by the relay binaries.
//!
//! Each binary flattens the groups it needs into its own `clap::Parser`;
//! every option can come from a flag or from the environment variable of
//! the same name, and has a default that works against a local stack.

use std::time::Duration;

use clap::Args;

use crate::{
    backoff::{BackoffKind, BackoffPolicy},
    checksum::ChecksumAlgorithm,
    telemetry::{self, LogFormat, TelemetryError},
    token::{Algorithm, TokenSigner, TokenVerifier},
};

/// Local-development secret; override with `SECRET_KEY` anywhere real.
pub const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Args, Debug, Clone)]
pub struct SigningArgs {
    /// Shared HMAC secret for sender tokens.
    #[arg(long, env = "SECRET_KEY", default_value = DEV_SECRET, hide_env_values = true)]
    pub secret_key: String,

    #[arg(long, env = "ALGORITHM", default_value_t = Algorithm::HS256)]
    pub algorithm: Algorithm,

    #[arg(long, env = "CHECKSUM_ALGORITHM", default_value_t = ChecksumAlgorithm::Md5)]
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Clock skew tolerated when checking `iat`/`exp`.
    #[arg(long, env = "TOKEN_LEEWAY_SECS", default_value_t = 0)]
    pub token_leeway_secs: u64,
}

impl SigningArgs {
    pub fn signer(&self) -> TokenSigner {
        TokenSigner::new(self.secret_key.as_bytes(), self.algorithm)
    }

    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier::new(self.secret_key.as_bytes(), self.algorithm)
            .with_leeway(Duration::from_secs(self.token_leeway_secs))
    }
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    #[arg(long, env = "BROKER_HOST", default_value = "localhost")]
    pub broker_host: String,

    #[arg(long, env = "BROKER_PORT", default_value_t = 1883)]
    pub broker_port: u16,

    #[arg(long, env = "QUEUE_NAME", default_value = "udp_messages")]
    pub queue_name: String,

    /// Publisher session identity at the broker. Consumer sessions are
    /// always named after the queue they hold.
    #[arg(long, env = "BROKER_CLIENT_ID")]
    pub broker_client_id: Option<String>,

    #[arg(long, env = "BROKER_USERNAME")]
    pub broker_username: Option<String>,

    #[arg(long, env = "BROKER_PASSWORD", hide_env_values = true)]
    pub broker_password: Option<String>,

    #[arg(long, env = "BROKER_KEEP_ALIVE_SECS", default_value_t = 30)]
    pub broker_keep_alive_secs: u64,
}

impl BrokerArgs {
    /// Explicit client id, or `<role>-<queue>`.
    pub fn client_id(&self, role: &str) -> String {
        self.broker_client_id
            .clone()
            .unwrap_or_else(|| format!("{role}-{}", self.queue_name))
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        self.broker_username
            .clone()
            .map(|user| (user, self.broker_password.clone().unwrap_or_default()))
    }
}

#[derive(Args, Debug, Clone)]
pub struct BackoffArgs {
    /// Reconnect backoff: fixed, exponential or jittered.
    #[arg(long, env = "RETRY_POLICY", default_value_t = BackoffKind::Fixed)]
    pub retry_policy: BackoffKind,

    #[arg(long, env = "RETRY_BASE_MS", default_value_t = 5000)]
    pub retry_base_ms: u64,

    #[arg(long, env = "RETRY_MAX_MS", default_value_t = 60_000)]
    pub retry_max_ms: u64,
}

impl BackoffArgs {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::from_kind(
            self.retry_policy,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
        )
    }
}

#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl LogArgs {
    pub fn init(&self) -> Result<(), TelemetryError> {
        telemetry::init_logging(self.log_format, &self.log_level)
    }
}
