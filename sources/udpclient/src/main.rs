use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use udpclient::{config::ClientArgs, Originator, Signer, UdpSink};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();
    args.log.init().context("failed to initialise logging")?;

    let sink = UdpSink::connect(&args.server_addr()).await?;
    let signer = Signer::new(args.token_signer(), args.signing.checksum_algorithm);
    let mut originator = Originator::new(args.client_id, signer, sink)
        .with_retry(args.retry())
        .with_interval(args.interval());

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

    originator.run(cancel).await;
    Ok(())
}
