use crate::call_key::ChainId;
use crate::metrics;
use crate::orchestrator::Orchestrator;
use anyhow::{anyhow, Result};
use ethers::prelude::Middleware;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Polls `eth_blockNumber` for one chain and feeds each head to the
/// [`Orchestrator`]. The orchestrator drops heads that do not advance, so the
/// watcher does not need to be monotonic itself.
pub struct BlockWatcher<M: Middleware> {
    chain_id: ChainId,
    provider: Arc<M>,
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
    current_block: AtomicU64,
}

impl<M: Middleware + 'static> BlockWatcher<M> {
    /// # Arguments
    /// * `provider` - RPC provider of `chain_id`
    /// * `poll_interval` - Time between two `eth_blockNumber` calls
    pub fn new(
        chain_id: ChainId,
        provider: Arc<M>,
        orchestrator: Arc<Orchestrator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain_id,
            provider,
            orchestrator,
            poll_interval,
            current_block: AtomicU64::new(0),
        }
    }

    /// Last height returned by the provider (0 before the first success).
    pub fn get_cached(&self) -> u64 {
        self.current_block.load(Ordering::Relaxed)
    }

    /// Fetches the head once and hands it to the orchestrator.
    pub async fn poll_once(&self) -> Result<u64> {
        let start = Instant::now();
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| anyhow!("eth_blockNumber failed on chain {}: {}", self.chain_id, e))?
            .as_u64();
        metrics::record_rpc_call("block_watcher", "eth_blockNumber", start.elapsed());

        self.current_block.store(block, Ordering::Relaxed);
        if self.orchestrator.observe_block(self.chain_id, block) {
            debug!("[BlockWatcher] chain {} head {}", self.chain_id, block);
        }
        Ok(block)
    }

    /// Polls forever in a background task. Failures are logged and retried
    /// on the next period.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once().await {
                    warn!("[BlockWatcher] {} (last head {})", e, self.get_cached());
                }
            }
        })
    }
}
