// TRANSACTION LIFECYCLE - SERVICE ENTRYPOINT
// Handles: wiring chain, signer, controller, tracker, event bridge and HTTP server

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use wallet_tx_lifecycle::{
    api::{self, AppState},
    chain::{ChainQuery, EthersChainQuery},
    events,
    pending::{poll_new_blocks, PendingTxTracker},
    signer::{LocalWalletSigner, RemoteKeyManagerSigner, TransactionSigner},
    types::get_chain_name,
    Config, TransactionController,
};

fn build_signer(config: &Config) -> anyhow::Result<Arc<dyn TransactionSigner>> {
    if let (Some(url), Some(key_id)) = (&config.key_manager_url, &config.key_id) {
        info!("[SIGNER] Using key manager at {} (key {})", url, key_id);
        return Ok(Arc::new(RemoteKeyManagerSigner::new(url.clone(), key_id.clone())));
    }
    if let Some(private_key) = &config.signer_private_key {
        let signer = LocalWalletSigner::from_private_key(private_key)?;
        warn!("[SIGNER] Using local development key for {}", signer.address());
        return Ok(Arc::new(signer));
    }
    anyhow::bail!("no signer configured: set KEY_MANAGER_URL and KEY_ID, or SIGNER_PRIVATE_KEY")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!("Starting Wallet Transaction Lifecycle v{}", env!("CARGO_PKG_VERSION"));
    info!("{:?}", config);

    let chain: Arc<dyn ChainQuery> = Arc::new(EthersChainQuery::new(&config.rpc_url)?);
    let signer = build_signer(&config)?;

    let controller = Arc::new(TransactionController::new(&config, chain.clone(), signer));
    info!(
        "Active network {} ({})",
        controller.network_id(),
        get_chain_name(controller.get_chain_id())
    );

    let tracker = Arc::new(PendingTxTracker::new(
        controller.store(),
        chain.clone(),
        controller.network_receiver(),
    ));

    let (block_tx, block_rx) = mpsc::channel(16);
    tokio::spawn(poll_new_blocks(chain, config.block_poll_interval, block_tx));
    tracker.clone().spawn(block_rx);

    if let Some(redis_url) = &config.redis_url {
        let redis = events::connect(redis_url).await?;
        events::spawn_redis_forwarder(redis, config.event_channel.clone(), controller.subscribe());
    }

    let app = api::router(AppState::new(controller, tracker));

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Transaction lifecycle service running on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
