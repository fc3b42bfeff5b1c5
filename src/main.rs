//! evm-indexer service entry point.

use evm_indexer::{Backfill, Config, Indexer, Storage};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "evm_indexer=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    info!(
        rpc_nodes = config.rpc_urls.len(),
        chain_id = config.chain_id,
        lab_mode = config.is_lab_mode(),
        "evm-indexer starting"
    );

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("live");

    match mode {
        "backfill" => {
            let start_block: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
            let end_block: Option<u64> = args.get(3).and_then(|s| s.parse().ok());
            let batch_size: u64 = std::env::var("BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500);

            info!(start_block, ?end_block, batch_size, "backfill mode");

            let store = Arc::new(Storage::connect(&config.database_url, config.chain_id).await?);
            let backfill = Backfill::new(config, store, batch_size);
            backfill.run(start_block, end_block).await?;
        }
        _ => {
            info!("live mode: starting continuous pipeline");
            let indexer = Indexer::new(config).await?;
            indexer.run().await?;
        }
    }

    Ok(())
}
