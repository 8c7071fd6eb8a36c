//! # Fetch Scheduler
//!
//! One pass per chain per observed block:
//!
//! 1. snapshot the keys subscribed on the chain, in registration order;
//! 2. keep the DUE ones: never fetched, or fetched at least
//!    `blocks_per_fetch` blocks ago (effective value across listeners);
//! 3. pack them greedily into batches bounded by a gas budget and a call cap;
//! 4. run every batch through the chain's [`CallExecutor`] at the pass block;
//! 5. reconcile answers into the [`ResultCache`].
//!
//! A batch that fails in transport leaves its keys untouched, so they are
//! still due on the next block. The scheduler never retries on its own.

use crate::call_key::{CallKey, CallOptions, ChainId};
use crate::errors::ExecutorError;
use crate::executor::CallExecutor;
use crate::metrics;
use crate::observability::{NoopSink, ObservabilitySink, SchedulerEvent};
use crate::result_cache::{CallResult, ResultCache};
use crate::subscription_registry::SubscriptionRegistry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Gas assumed for a call that does not declare `gas_required`.
pub const DEFAULT_GAS_PER_CALL: u64 = 1_000_000;
/// Summed `gas_required` one batch may carry.
pub const DEFAULT_GAS_BUDGET_PER_BATCH: u64 = 100_000_000;
/// Upper bound on calls per batch regardless of gas, to stay under RPC payload limits.
pub const DEFAULT_MAX_CALLS_PER_BATCH: usize = 200;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub gas_budget_per_batch: u64,
    pub default_gas_per_call: u64,
    pub max_calls_per_batch: usize,
    pub batch_timeout: Duration,
    /// Evict unsubscribed cache entries older than this many blocks. `None` keeps them.
    pub max_entry_age_blocks: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            gas_budget_per_batch: DEFAULT_GAS_BUDGET_PER_BATCH,
            default_gas_per_call: DEFAULT_GAS_PER_CALL,
            max_calls_per_batch: DEFAULT_MAX_CALLS_PER_BATCH,
            batch_timeout: Duration::from_secs(10),
            max_entry_age_blocks: None,
        }
    }
}

/// A subscribed key that needs fetching at the current block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCall {
    pub key: CallKey,
    pub options: CallOptions,
    pub gas: u64,
}

/// Calls sent to the executor in one round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub chain_id: ChainId,
    pub block: u64,
    pub calls: Vec<CallKey>,
    pub gas: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Set when the whole batch failed; no key was written.
    pub transport_error: Option<ExecutorError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub chain_id: ChainId,
    pub block: u64,
    pub due: usize,
    pub batches: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_batches: usize,
    pub evicted: usize,
    pub duration: Duration,
}

/// `true` when a key last fetched at `last_fetched` must be refetched at `current_block`.
pub fn is_due(last_fetched: Option<u64>, current_block: u64, blocks_per_fetch: u64) -> bool {
    match last_fetched {
        None => true,
        Some(last) => current_block.saturating_sub(last) >= blocks_per_fetch.max(1),
    }
}

/// Greedy first-fit-in-order packing.
///
/// Calls keep their input order. A batch is closed as soon as the next call
/// would push it past `gas_budget` or `max_calls`; a single call larger than
/// the budget travels alone.
pub fn pack_batches(
    chain_id: ChainId,
    block: u64,
    due: &[DueCall],
    gas_budget: u64,
    max_calls: usize,
) -> Vec<Batch> {
    let max_calls = max_calls.max(1);
    let mut batches = Vec::new();
    let mut current = Batch {
        chain_id,
        block,
        calls: Vec::new(),
        gas: 0,
    };

    for call in due {
        let over_gas = current.gas.saturating_add(call.gas) > gas_budget;
        let over_count = current.calls.len() >= max_calls;
        if !current.calls.is_empty() && (over_gas || over_count) {
            let full = std::mem::replace(
                &mut current,
                Batch {
                    chain_id,
                    block,
                    calls: Vec::new(),
                    gas: 0,
                },
            );
            batches.push(full);
        }
        current.calls.push(call.key.clone());
        current.gas = current.gas.saturating_add(call.gas);
    }

    if !current.calls.is_empty() {
        batches.push(current);
    }
    batches
}

pub struct FetchScheduler {
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<ResultCache>,
    sink: Arc<dyn ObservabilitySink>,
    config: SchedulerConfig,
}

impl FetchScheduler {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        cache: Arc<ResultCache>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            sink: Arc::new(NoopSink),
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Subscribed keys of `chain_id` due at `current_block`, in registration order.
    pub fn due_calls(&self, chain_id: ChainId, current_block: u64) -> Vec<DueCall> {
        self.registry
            .active_for_chain(chain_id)
            .into_iter()
            .filter(|sub| {
                is_due(
                    self.cache.last_fetched_block(&sub.key),
                    current_block,
                    sub.options.blocks_per_fetch,
                )
            })
            .map(|sub| DueCall {
                gas: sub
                    .options
                    .gas_required
                    .unwrap_or(self.config.default_gas_per_call),
                key: sub.key,
                options: sub.options,
            })
            .collect()
    }

    /// Batches a pass at `block` would send.
    pub fn plan(&self, chain_id: ChainId, block: u64) -> Vec<Batch> {
        let due = self.due_calls(chain_id, block);
        pack_batches(
            chain_id,
            block,
            &due,
            self.config.gas_budget_per_batch,
            self.config.max_calls_per_batch,
        )
    }

    /// Runs one full pass for `chain_id` at `block`.
    pub async fn run_pass(
        &self,
        chain_id: ChainId,
        block: u64,
        executor: &dyn CallExecutor,
    ) -> PassReport {
        let start = Instant::now();
        self.registry.prune_idle();

        let due = self.due_calls(chain_id, block);
        self.sink.record(SchedulerEvent::PassStart {
            chain_id,
            block,
            due: due.len(),
        });

        let batches = pack_batches(
            chain_id,
            block,
            &due,
            self.config.gas_budget_per_batch,
            self.config.max_calls_per_batch,
        );
        if !batches.is_empty() {
            debug!(
                "[Scheduler] chain {} block {}: {} due calls in {} batches",
                chain_id,
                block,
                due.len(),
                batches.len()
            );
        }

        let answers = join_all(
            batches
                .iter()
                .map(|batch| self.execute_batch(batch, executor)),
        )
        .await;

        let mut report = PassReport {
            chain_id,
            block,
            due: due.len(),
            batches: batches.len(),
            succeeded: 0,
            failed: 0,
            failed_batches: 0,
            evicted: 0,
            duration: Duration::ZERO,
        };

        for (batch, answer) in batches.iter().zip(answers) {
            let outcome = self.reconcile(batch, answer);
            report.succeeded += outcome.succeeded;
            report.failed += outcome.failed;
            if outcome.transport_error.is_some() {
                report.failed_batches += 1;
            }
        }

        if let Some(max_age) = self.config.max_entry_age_blocks {
            let registry = &self.registry;
            report.evicted = self
                .cache
                .evict_older_than(chain_id, block, max_age, |key| registry.is_subscribed(key));
        }

        report.duration = start.elapsed();
        metrics::record_pass_duration(chain_id, report.duration);
        metrics::set_cache_entries(self.cache.len());
        self.sink.record(SchedulerEvent::PassEnd {
            chain_id,
            block,
            duration_ms: report.duration.as_millis() as u64,
            batches: report.batches,
            succeeded: report.succeeded,
            failed: report.failed,
            failed_batches: report.failed_batches,
        });

        if report.batches > 0 {
            info!(
                "[Scheduler] chain {} block {}: {} ok, {} failed calls, {}/{} batches failed in {:?}",
                chain_id,
                block,
                report.succeeded,
                report.failed,
                report.failed_batches,
                report.batches,
                report.duration
            );
        }

        report
    }

    async fn execute_batch(
        &self,
        batch: &Batch,
        executor: &dyn CallExecutor,
    ) -> Result<Vec<CallResult>, ExecutorError> {
        let timeout = self.config.batch_timeout;
        match tokio::time::timeout(
            timeout,
            executor.execute(batch.chain_id, batch.block, &batch.calls),
        )
        .await
        {
            Ok(answer) => answer,
            Err(_) => Err(ExecutorError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Applies one executor answer for `batch` to the cache.
    ///
    /// Safe to call again with the same answer: cache writes are idempotent
    /// per key and block.
    pub fn reconcile(
        &self,
        batch: &Batch,
        answer: Result<Vec<CallResult>, ExecutorError>,
    ) -> BatchOutcome {
        let answer = answer.and_then(|results| {
            if results.len() == batch.calls.len() {
                Ok(results)
            } else {
                Err(ExecutorError::ResultCountMismatch {
                    expected: batch.calls.len(),
                    returned: results.len(),
                })
            }
        });

        let results = match answer {
            Ok(results) => results,
            Err(error) => {
                warn!(
                    "[Scheduler] Batch of {} calls on chain {} at block {} failed: {}",
                    batch.calls.len(),
                    batch.chain_id,
                    batch.block,
                    error
                );
                metrics::record_batch(batch.chain_id, "transport_error", batch.calls.len(), batch.gas);
                self.sink.record(SchedulerEvent::BatchFailure {
                    chain_id: batch.chain_id,
                    block: batch.block,
                    calls: batch.calls.len(),
                    error: error.to_string(),
                });
                return BatchOutcome {
                    transport_error: Some(error),
                    ..BatchOutcome::default()
                };
            }
        };

        metrics::record_batch(batch.chain_id, "ok", batch.calls.len(), batch.gas);

        let mut outcome = BatchOutcome::default();
        // Results are stamped with the block the pass was scheduled at,
        // whatever the executor reported.
        for (key, result) in batch.calls.iter().zip(results) {
            let stamped = match result {
                CallResult::Success { data, .. } => {
                    outcome.succeeded += 1;
                    CallResult::Success {
                        data,
                        block: batch.block,
                    }
                }
                CallResult::Failure { reason, .. } => {
                    debug!("[Scheduler] Call {} failed: {}", key, reason);
                    outcome.failed += 1;
                    CallResult::Failure {
                        reason,
                        block: batch.block,
                    }
                }
                CallResult::Pending => continue,
            };
            self.cache.apply(key, stamped);
        }

        metrics::record_calls(batch.chain_id, "success", outcome.succeeded);
        metrics::record_calls(batch.chain_id, "failure", outcome.failed);
        outcome
    }
}
