use clap::Parser;
use postgresdb::StoreArgs;
use relaycore::config::{BackoffArgs, BrokerArgs, LogArgs};

use crate::retryledger::MAX_DELIVERY_ATTEMPTS;

#[derive(Parser, Debug, Clone)]
#[command(name = "persistence-consumer")]
#[command(about = "Moves relayed messages from the durable broker into Postgres")]
pub struct ConsumerArgs {
    /// Failed deliveries of one message before it is dead-lettered; 0 retries forever.
    #[arg(long, env = "MAX_DELIVERY_ATTEMPTS", default_value_t = MAX_DELIVERY_ATTEMPTS)]
    pub max_delivery_attempts: u32,

    /// Defaults to `<queue>.dead`.
    #[arg(long, env = "DEAD_LETTER_QUEUE")]
    pub dead_letter_queue: Option<String>,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub broker: BrokerArgs,

    #[command(flatten)]
    pub backoff: BackoffArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl ConsumerArgs {
    pub fn dead_letter_queue(&self) -> String {
        self.dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("{}.dead", self.broker.queue_name))
    }
}
