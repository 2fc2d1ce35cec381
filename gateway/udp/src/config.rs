use clap::Parser;
use relaycore::config::{BackoffArgs, BrokerArgs, LogArgs, SigningArgs};

use crate::downstreaminterface::INBOUND_QUEUE_CAPACITY;

#[derive(Parser, Debug, Clone)]
#[command(name = "udp-relay")]
#[command(about = "Verifies signed UDP datagrams and forwards them to the durable broker")]
pub struct RelayArgs {
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    #[arg(long, env = "PORT", default_value_t = 9999)]
    pub port: u16,

    #[arg(long, env = "INBOUND_QUEUE_CAPACITY", default_value_t = INBOUND_QUEUE_CAPACITY)]
    pub inbound_queue_capacity: usize,

    #[command(flatten)]
    pub signing: SigningArgs,

    #[command(flatten)]
    pub broker: BrokerArgs,

    #[command(flatten)]
    pub backoff: BackoffArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl RelayArgs {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_all_interfaces() {
        let args = RelayArgs::try_parse_from(["udp-relay"]).unwrap();
        if std::env::var_os("PORT").is_none() && std::env::var_os("BIND_HOST").is_none() {
            assert_eq!(args.bind_addr(), "0.0.0.0:9999");
        }
        assert!(args.inbound_queue_capacity > 0);
    }
}
