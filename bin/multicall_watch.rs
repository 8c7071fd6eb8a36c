//! # Multicall Watch
//!
//! Runs the cache engine against live RPC endpoints and logs every cache
//! change. Useful to eyeball batching and refresh cadence on real chains.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin multicall_watch -- \
//!     --chain 1 --account 0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045 \
//!     --token 0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48
//! ```
//!
//! Press Ctrl+C to stop.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ethers::prelude::{Address, Http, Provider};
use multicall_cache::{
    balances::BalanceReader,
    block_watcher::BlockWatcher,
    executor::Multicall3Executor,
    flight_recorder::{flight_recorder_writer, FlightRecorder},
    metrics,
    multicall::MulticallCache,
    observability::{ObservabilitySink, SinkSet, TracingSink},
    settings::{LogFormat, Settings},
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "multicall_watch", about = "Watch balances through the multicall cache")]
struct Args {
    /// Settings file (defaults to $MULTICALL_CONFIG or Config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Chain to subscribe balances on (defaults to the first configured chain)
    #[arg(long)]
    chain: Option<u64>,

    /// Account whose balances are watched (repeatable)
    #[arg(long = "account")]
    accounts: Vec<Address>,

    /// ERC-20 token to watch for every account (repeatable)
    #[arg(long = "token")]
    tokens: Vec<Address>,
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    match settings.log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load(path),
        None => Settings::new(),
    }
    .context("loading settings")?;
    init_tracing(&settings);

    if settings.chains.is_empty() {
        bail!("no [[chains]] configured");
    }
    if let Some(port) = settings.metrics.prometheus_port {
        metrics::install_prometheus(port)?;
    }

    let mut sinks = SinkSet::new().with(Arc::new(TracingSink));
    let mut background = Vec::new();
    let mut recorder = None;
    let mut writer = None;
    if settings.flight_recorder.enabled {
        let (flight, rx) = FlightRecorder::new(settings.flight_recorder.capacity);
        let flight = Arc::new(flight);
        sinks = sinks.with(flight.clone());
        recorder = Some(flight);
        let path = settings.flight_recorder.path.clone();
        writer = Some(tokio::spawn(async move {
            if let Err(e) = flight_recorder_writer(rx, path).await {
                warn!("[FlightRecorder] writer stopped: {}", e);
            }
        }));
    }
    let sink: Arc<dyn ObservabilitySink> = Arc::new(sinks);

    let engine = MulticallCache::with_sink(settings.scheduler_config(), settings.grace_period(), sink);
    let mut reader = BalanceReader::new(engine.clone());

    for chain in &settings.chains {
        let provider = Arc::new(
            Provider::<Http>::try_from(chain.rpc_url.as_str())
                .with_context(|| format!("invalid rpc_url for chain {}", chain.chain_id))?,
        );
        let executor = Multicall3Executor::new(provider.clone(), chain.multicall_address);
        engine.add_chain(chain.chain_id, chain.policy(), Arc::new(executor));
        reader = reader.with_multicall_address(chain.chain_id, chain.multicall_address);

        let watcher = Arc::new(BlockWatcher::new(
            chain.chain_id,
            provider,
            engine.orchestrator().clone(),
            chain.poll_interval(),
        ));
        background.push(watcher.spawn());
        info!(
            "[Main] chain {} ready ({:?}, reference: {})",
            chain.chain_id, chain.cadence, chain.is_reference
        );
    }
    background.extend(engine.spawn());

    let chain_id = args.chain.unwrap_or(settings.chains[0].chain_id);
    if settings.chain(chain_id).is_none() {
        bail!("chain {} is not configured", chain_id);
    }
    let native = reader.native_balances(chain_id, &args.accounts);
    let tokens: Vec<_> = args
        .accounts
        .iter()
        .map(|account| reader.token_balances(chain_id, *account, &args.tokens))
        .collect();
    info!(
        "[Main] watching {} accounts and {} tokens on chain {}",
        args.accounts.len(),
        args.tokens.len(),
        chain_id
    );

    let mut changes = engine.subscribe_changes();
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(update) => info!("[Main] {} -> {:?}", update.key, update.result),
                Err(RecvError::Lagged(skipped)) => warn!("[Main] change log lagged by {} updates", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                info!("[Main] Ctrl+C received, shutting down");
                break;
            }
        }
    }

    for handle in &background {
        handle.abort();
    }
    for handle in background {
        let _ = handle.await;
    }

    // The writer exits once every sender is gone.
    drop((native, tokens, reader, engine));
    if let Some(flight) = recorder {
        let (_, recorded, dropped) = flight.stats();
        info!("[Main] flight recorder: {} events recorded, {} dropped", recorded, dropped);
    }
    if let Some(writer) = writer {
        let _ = writer.await;
    }
    Ok(())
}
