use anyhow::{Context, Result};
use clap::Parser;
use consumer::{config::ConsumerArgs, PersistenceConsumer, RetryLedger};
use mqtt::{queue_session_id, MqttBrokerConfig, MqttConnector};
use postgresdb::PostgresConnector;
use relaycore::Connector;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ConsumerArgs::parse();
    args.log.init().context("failed to initialise logging")?;

    let policy = args.backoff.policy();
    let store = PostgresConnector::new(args.store.pg_config(), args.store.store_table.clone())
        .context("invalid store table name")?;
    let broker = MqttConnector::consumer(
        MqttBrokerConfig::from_args(&args.broker, "persistence-consumer"),
        args.broker.queue_name.clone(),
    );

    let mut consumer = PersistenceConsumer::new(
        Connector::new(store, policy.clone()),
        Connector::new(broker, policy),
        args.dead_letter_queue(),
    )
    .with_ledger(RetryLedger::new(args.max_delivery_attempts));

    info!(
        event = "consumer_configured",
        queue = %args.broker.queue_name,
        session = %queue_session_id(&args.broker.queue_name),
        dead_letter_queue = %args.dead_letter_queue(),
        table = %args.store.store_table,
        max_delivery_attempts = args.max_delivery_attempts,
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(event = "shutdown_requested");
                shutdown.cancel();
            }
            Err(e) => warn!(event = "signal_handler_failed", error = %e),
        }
    });

    consumer.run(cancel).await;
    Ok(())
}
