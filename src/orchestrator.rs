//! # Chain/Block Orchestrator
//!
//! Turns block heights into scheduler passes, one lane per chain.
//!
//! - Heights are accepted only when they strictly increase; repeats and
//!   regressions from flaky watchers are dropped.
//! - At most one pass per chain is in flight. Heights that arrive meanwhile
//!   collapse into a single follow-up pass at the newest height (the lane
//!   keeps its head in a `watch` channel, which only remembers the latest
//!   value).
//! - Each chain has a [`ChainPolicy`]: `EveryBlock` lanes run a pass per new
//!   head, `FixedInterval` lanes (typically the reference chain) run at most
//!   one pass per period, at whatever head is current.
//!
//! Lanes of different chains run independently.

use crate::call_key::{CallOptions, ChainId};
use crate::executor::CallExecutor;
use crate::fetch_scheduler::{FetchScheduler, PassReport};
use crate::metrics;
use crate::observability::{NoopSink, ObservabilitySink, SchedulerEvent};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadencePolicy {
    /// One pass per new head.
    EveryBlock,
    /// One pass per period at the latest head, however many blocks arrived.
    FixedInterval(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPolicy {
    pub cadence: CadencePolicy,
    pub is_reference: bool,
    /// Listener options used when a consumer does not pass any.
    pub default_options: CallOptions,
}

impl ChainPolicy {
    pub fn every_block(default_blocks_per_fetch: u64) -> Self {
        Self {
            cadence: CadencePolicy::EveryBlock,
            is_reference: false,
            default_options: CallOptions::new(default_blocks_per_fetch),
        }
    }

    /// Reference chain polled on a fixed period, fetching on every pass.
    pub fn reference(period: Duration) -> Self {
        Self {
            cadence: CadencePolicy::FixedInterval(period),
            is_reference: true,
            default_options: CallOptions::new(1),
        }
    }
}

struct ChainLane {
    chain_id: ChainId,
    policy: ChainPolicy,
    executor: Arc<dyn CallExecutor>,
    heads: watch::Sender<u64>,
    last_processed: AtomicU64,
    pass_lock: Mutex<()>,
}

pub struct Orchestrator {
    scheduler: Arc<FetchScheduler>,
    lanes: DashMap<ChainId, Arc<ChainLane>>,
    sink: Arc<dyn ObservabilitySink>,
}

impl Orchestrator {
    pub fn new(scheduler: Arc<FetchScheduler>) -> Self {
        Self {
            scheduler,
            lanes: DashMap::new(),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Adds (or replaces) the lane of `chain_id`. Replacing resets its heads.
    pub fn register_chain(
        &self,
        chain_id: ChainId,
        policy: ChainPolicy,
        executor: Arc<dyn CallExecutor>,
    ) {
        let (heads, _) = watch::channel(0);
        let lane = Arc::new(ChainLane {
            chain_id,
            policy,
            executor,
            heads,
            last_processed: AtomicU64::new(0),
            pass_lock: Mutex::new(()),
        });
        if self.lanes.insert(chain_id, lane).is_some() {
            warn!("[Orchestrator] Chain {} registered twice, lane replaced", chain_id);
        }
        info!(
            "[Orchestrator] Chain {} registered ({:?}, reference: {})",
            chain_id, policy.cadence, policy.is_reference
        );
    }

    pub fn chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = self.lanes.iter().map(|l| *l.key()).collect();
        chains.sort_unstable();
        chains
    }

    pub fn policy(&self, chain_id: ChainId) -> Option<ChainPolicy> {
        self.lanes.get(&chain_id).map(|l| l.policy)
    }

    pub fn reference_chain(&self) -> Option<ChainId> {
        self.lanes
            .iter()
            .find(|l| l.policy.is_reference)
            .map(|l| *l.key())
    }

    /// Newest head accepted for `chain_id`.
    pub fn latest_block(&self, chain_id: ChainId) -> Option<u64> {
        self.lanes
            .get(&chain_id)
            .map(|l| *l.heads.borrow())
            .filter(|h| *h > 0)
    }

    /// Head of the last completed pass on `chain_id`.
    pub fn last_processed_block(&self, chain_id: ChainId) -> Option<u64> {
        self.lanes
            .get(&chain_id)
            .map(|l| l.last_processed.load(Ordering::Acquire))
            .filter(|h| *h > 0)
    }

    fn lane(&self, chain_id: ChainId) -> Option<Arc<ChainLane>> {
        self.lanes.get(&chain_id).map(|l| Arc::clone(l.value()))
    }

    /// Records a head reported by a watcher. Returns `false` when the height
    /// does not advance the chain (or the chain is unknown).
    pub fn observe_block(&self, chain_id: ChainId, height: u64) -> bool {
        let Some(lane) = self.lane(chain_id) else {
            warn!("[Orchestrator] Block {} for unknown chain {}", height, chain_id);
            return false;
        };

        let mut latest = 0;
        let advanced = lane.heads.send_if_modified(|current| {
            latest = *current;
            if height > *current {
                *current = height;
                true
            } else {
                false
            }
        });

        if advanced {
            metrics::set_latest_block(chain_id, height);
        } else {
            debug!(
                "[Orchestrator] Ignoring block {} on chain {} (latest {})",
                height, chain_id, latest
            );
            metrics::increment_tick_ignored(chain_id);
            self.sink.record(SchedulerEvent::TickIgnored {
                chain_id,
                height,
                latest,
            });
        }
        advanced
    }

    /// Runs one pass for `chain_id` at its latest head, if that head has not
    /// been processed yet. Waits for an in-flight pass of the same chain.
    pub async fn process_chain(&self, chain_id: ChainId) -> Option<PassReport> {
        let lane = self.lane(chain_id)?;
        self.process_lane(&lane).await
    }

    async fn process_lane(&self, lane: &ChainLane) -> Option<PassReport> {
        let _pass = lane.pass_lock.lock().await;

        let head = *lane.heads.borrow();
        let last = lane.last_processed.load(Ordering::Acquire);
        if head == 0 || head <= last {
            return None;
        }
        if last > 0 && head > last + 1 {
            metrics::increment_pass_coalesced(lane.chain_id, head - last - 1);
        }

        let report = self
            .scheduler
            .run_pass(lane.chain_id, head, lane.executor.as_ref())
            .await;
        lane.last_processed.store(head, Ordering::Release);
        Some(report)
    }

    /// Spawns one driver task per registered chain.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.lanes
            .iter()
            .map(|l| Arc::clone(l.value()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|lane| {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move { orchestrator.drive(lane).await })
            })
            .collect()
    }

    async fn drive(&self, lane: Arc<ChainLane>) {
        info!(
            "[Orchestrator] Lane for chain {} started ({:?})",
            lane.chain_id, lane.policy.cadence
        );
        match lane.policy.cadence {
            CadencePolicy::EveryBlock => {
                let mut heads = lane.heads.subscribe();
                self.process_lane(&lane).await;
                while heads.changed().await.is_ok() {
                    self.process_lane(&lane).await;
                }
            }
            CadencePolicy::FixedInterval(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    self.process_lane(&lane).await;
                }
            }
        }
    }
}
