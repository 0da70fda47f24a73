//! Minimal binary exercising the distributed model registry over RPC
//! (spec §4.G): binds an endpoint, serves `requestModel`/`requestStateDict`/
//! `trainData`/`gameResult`, and logs incoming training data sizes.

use std::sync::Arc;

use alphazero_core::distributed::{server, ModelRegistry};
use alphazero_core::logging;
use clap::Parser;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "registry-server")]
struct Config {
    /// Endpoint to bind, e.g. "*:29999" or "127.0.0.1:29999".
    #[arg(short, long, default_value = "*:29999")]
    endpoint: String,

    /// RNG seed for the registry's opponent-sampling distribution.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[tokio::main]
async fn main() {
    logging::setup_logging_stderr();
    let config = Config::parse();

    let registry = Arc::new(ModelRegistry::new(config.seed));
    registry.update_model("dev", Vec::new());

    let (train_tx, mut train_rx) = mpsc::channel::<Vec<u8>>(256);
    tokio::spawn(async move {
        while let Some(payload) = train_rx.recv().await {
            log::info!("received {} bytes of training data", payload.len());
        }
    });

    log::info!("distributed registry listening on {}", config.endpoint);
    if let Err(e) = server::serve(&config.endpoint, registry, train_tx).await {
        log::error!("registry server exited: {e}");
    }
}
