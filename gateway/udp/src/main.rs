use anyhow::{Context, Result};
use clap::Parser;
use mqtt::{MqttBrokerConfig, MqttConnector};
use relaycore::Connector;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use udp::{config::RelayArgs, Forwarder, RelayGateway, UdpDownstream, Verifier};

#[tokio::main]
async fn main() -> Result<()> {
    let args = RelayArgs::parse();
    args.log.init().context("failed to initialise logging")?;

    // ---- Broker first: nothing is accepted until there is somewhere to put it ----
    let broker = MqttBrokerConfig::from_args(&args.broker, "udp-relay");
    let connector = Connector::new(MqttConnector::publisher(broker), args.backoff.policy());
    let mut forwarder = Forwarder::new(connector, args.broker.queue_name.clone());
    forwarder.connect().await;

    let verifier = Verifier::new(args.signing.verifier(), args.signing.checksum_algorithm);
    let mut gateway = RelayGateway::new(verifier, forwarder);

    // ---- Transport ----
    let downstream = UdpDownstream::bind(&args.bind_addr()).await?;
    let (tx, rx) = mpsc::channel(args.inbound_queue_capacity.max(1));
    let cancel = CancellationToken::new();
    let listener = downstream.spawn(tx, cancel.clone());

    info!(
        event = "udp_server_started",
        host = %args.bind_host,
        port = args.port,
        queue = %args.broker.queue_name,
    );

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

    gateway.run(rx, cancel).await;
    listener.await.context("UDP listener task failed")?;
    info!(event = "server_connection_closed");
    Ok(())
}
