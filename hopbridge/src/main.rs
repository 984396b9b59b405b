use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};

use std::process;
use std::sync::Arc;

use hopbridge_lib::wg_client::WgClient;
use hopbridge_lib::wg_server::WgServer;
use hopbridge_lib::{bridge, config, logging, netdev};

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    if let Err(e) = run(args).await {
        eprintln!("hopbridge: {e:#}");
        process::exit(1);
    }
}

async fn run(args: cli::Cli) -> anyhow::Result<()> {
    let config = config::read(&args.config_path)
        .await
        .with_context(|| format!("loading configuration from {}", args.config_path.display()))?;

    logging::init(&config.logging);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let netlink = netdev::connect().context("opening netlink socket")?;

    let wg_server = WgServer::init(&config.wireguard.server, &config.datapath, &netlink)
        .await
        .context("initializing wireguard server")?;

    let wg_client = WgClient::init(&config.wireguard.client, &config.datapath, netlink)
        .await
        .context("initializing wireguard client")?;

    let (bridge, save_rx) =
        bridge::Bridge::new(config.api.clone(), wg_server, wg_client).context("creating bridge")?;
    let bridge = Arc::new(bridge);

    bridge.load().await.context("restoring persisted sessions")?;

    tokio::spawn(bridge::expire_worker(Arc::clone(&bridge)));
    tokio::spawn(bridge::save_worker(Arc::clone(&bridge), save_rx));

    bridge::http::serve(Arc::clone(&bridge), &config.api.listen)
        .await
        .context("starting API listeners")?;

    tracing::info!("started");
    wait_for_shutdown().await?;
    tracing::info!("shutting down");

    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }

    Ok(())
}
