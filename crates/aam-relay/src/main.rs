use aam_relay::config::{load_config, Args};
use aam_relay::{logging, server};
use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args);
    logging::init(&config);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let result = server::serve(config, shutdown).await;
    if let Err(err) = &result {
        error!(event = "relay_error", error = %format!("{err:#}"));
    }
    result
}
