//! Stratum Pool - Main Application

use anyhow::Context;
use std::sync::Arc;
use stratum_pool::{
    chain::{rpc::RpcPolicies, ChainNode, RetryPolicy, RpcClient},
    crypto::Sha256d,
    logging,
    store::MemoryStore,
    Config, Pool, APP_NAME, APP_VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(Config::load())
        .context("Failed to load configuration")?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let _guard = logging::init(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .thread_name("stratum-pool-worker")
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: family={}, scheme={}, stratum={}:{}, node={}",
        config.coin_family,
        config.reward_scheme,
        config.stratum_interface,
        config.stratum_port,
        config.node_url
    );

    let chain: Arc<dyn ChainNode> = Arc::new(
        RpcClient::new(
            &config.node_url,
            config.rpc_user.clone(),
            config.rpc_password.clone(),
            config.rpc_timeout_duration()?,
            config.insecure,
        )?
        .with_policies(RpcPolicies {
            submit: RetryPolicy::fixed(config.submit_attempts),
            ..RpcPolicies::default()
        }),
    );
    let store = Arc::new(MemoryStore::new(Some(config.retention()?)));

    let pool = Pool::new(config, chain, store, Arc::new(Sha256d))
        .await
        .context("Failed to initialize pool")?;

    Arc::new(pool).run(CancellationToken::new()).await?;
    info!("Stopped");
    Ok(())
}

/// Print current configuration
fn print_configuration(config: &Config) -> anyhow::Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}
