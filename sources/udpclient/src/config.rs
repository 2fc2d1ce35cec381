use std::time::Duration;

use clap::Parser;
use relaycore::{
    config::{LogArgs, SigningArgs},
    token::{TokenSigner, DEFAULT_ISSUER},
    BackoffPolicy, RetryLimit,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "udp-client")]
#[command(about = "Sends signed telemetry messages to the UDP relay")]
pub struct ClientArgs {
    #[arg(long, env = "SERVER_HOST", default_value = "localhost")]
    pub server_host: String,

    #[arg(long, env = "PORT", default_value_t = 9999)]
    pub port: u16,

    #[arg(long, env = "CLIENT_ID", default_value_t = 1)]
    pub client_id: i64,

    #[arg(long, env = "SEND_INTERVAL_SECS", default_value_t = 5)]
    pub send_interval_secs: u64,

    #[arg(long, env = "SEND_RETRY_LIMIT", default_value_t = 3)]
    pub send_retry_limit: u32,

    #[arg(long, env = "SEND_RETRY_DELAY_MS", default_value_t = 1000)]
    pub send_retry_delay_ms: u64,

    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 30)]
    pub token_ttl_secs: u64,

    #[arg(long, env = "TOKEN_ISSUER", default_value = DEFAULT_ISSUER)]
    pub token_issuer: String,

    #[command(flatten)]
    pub signing: SigningArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl ClientArgs {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.port)
    }

    pub fn token_signer(&self) -> TokenSigner {
        self.signing
            .signer()
            .with_issuer(self.token_issuer.clone())
            .with_ttl(Duration::from_secs(self.token_ttl_secs))
    }

    pub fn retry(&self) -> RetryLimit {
        RetryLimit::new(
            self.send_retry_limit,
            BackoffPolicy::fixed(Duration::from_millis(self.send_retry_delay_ms)),
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }
}
