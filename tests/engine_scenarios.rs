//! End-to-end scenarios for the multicall cache engine.
//!
//! A scripted in-memory executor stands in for the chain, so every pass is
//! deterministic and its batches can be inspected.

use async_trait::async_trait;
use ethers::types::{Address, Bytes};
use multicall_cache::{
    fetch_scheduler::SchedulerConfig,
    observability::{RecordingSink, SchedulerEvent},
    result_cache::ApplyOutcome,
    CallExecutor, CallKey, CallOptions, CallResult, ChainId, ChainPolicy, ExecutorError,
    MulticallCache,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
enum Script {
    Succeed,
    FailKeys(HashSet<CallKey>),
    Transport,
}

struct ScriptedExecutor {
    script: Mutex<Script>,
    batches: Mutex<Vec<(u64, Vec<CallKey>)>>,
}

impl ScriptedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script::Succeed),
            batches: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    fn batches(&self) -> Vec<(u64, Vec<CallKey>)> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _chain_id: ChainId,
        block: u64,
        batch: &[CallKey],
    ) -> Result<Vec<CallResult>, ExecutorError> {
        self.batches.lock().unwrap().push((block, batch.to_vec()));
        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Transport => Err(ExecutorError::Transport("connection reset".into())),
            Script::Succeed => Ok(batch.iter().map(|k| success(k, block)).collect()),
            Script::FailKeys(failing) => Ok(batch
                .iter()
                .map(|k| {
                    if failing.contains(k) {
                        CallResult::Failure {
                            reason: "reverted".into(),
                            block,
                        }
                    } else {
                        success(k, block)
                    }
                })
                .collect()),
        }
    }
}

fn success(key: &CallKey, block: u64) -> CallResult {
    CallResult::Success {
        data: Bytes::from(vec![key.target.0[0]; 32]),
        block,
    }
}

fn key(byte: u8) -> CallKey {
    CallKey::new(1, Address::repeat_byte(byte), vec![0x70, 0xa0, 0x82, 0x31])
}

fn engine_with(config: SchedulerConfig) -> (MulticallCache, Arc<ScriptedExecutor>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let engine = MulticallCache::with_sink(config, Duration::ZERO, sink.clone());
    let executor = ScriptedExecutor::new();
    engine.add_chain(1, ChainPolicy::every_block(1), executor.clone());
    (engine, executor, sink)
}

fn engine() -> (MulticallCache, Arc<ScriptedExecutor>, Arc<RecordingSink>) {
    engine_with(SchedulerConfig::default())
}

async fn tick(engine: &MulticallCache, block: u64) -> usize {
    assert!(engine.observe_block(1, block));
    engine.process_chain(1).await.map_or(0, |report| report.due)
}

#[tokio::test]
async fn key_with_interval_five_is_refetched_every_five_blocks() {
    let (engine, executor, _) = engine();
    let k = key(1);
    let _handle = engine.subscribe(k.clone(), CallOptions::new(5));

    assert_eq!(engine.scheduler().due_calls(1, 100).len(), 1);
    assert_eq!(tick(&engine, 100).await, 1);
    assert_eq!(engine.read(&k), success(&k, 100));

    assert!(engine.scheduler().due_calls(1, 104).is_empty());
    assert_eq!(tick(&engine, 104).await, 0);
    assert_eq!(executor.batches().len(), 1);

    assert_eq!(tick(&engine, 105).await, 1);
    assert_eq!(engine.read(&k), success(&k, 105));
    assert_eq!(executor.batches().len(), 2);
}

#[tokio::test]
async fn mixed_batch_is_stamped_at_the_batch_block() {
    let (engine, executor, _) = engine();
    let keys = [key(1), key(2), key(3)];
    let _handles: Vec<_> = keys
        .iter()
        .map(|k| engine.subscribe(k.clone(), CallOptions::default()))
        .collect();
    executor.set(Script::FailKeys(HashSet::from([keys[1].clone()])));

    engine.observe_block(1, 77);
    let report = engine.process_chain(1).await.unwrap();
    assert_eq!((report.batches, report.succeeded, report.failed), (1, 2, 1));

    assert_eq!(engine.read(&keys[0]), success(&keys[0], 77));
    assert_eq!(
        engine.read(&keys[1]),
        CallResult::Failure {
            reason: "reverted".into(),
            block: 77
        }
    );
    assert_eq!(engine.read(&keys[2]), success(&keys[2], 77));

    let states: Vec<_> = keys.iter().map(|k| engine.call_state(k)).collect();
    assert!(states.iter().all(|s| s.block == Some(77) && !s.loading));
    assert_eq!(states[1].error.as_deref(), Some("reverted"));
}

#[tokio::test]
async fn transport_failure_keeps_previous_results_and_keys_due() {
    let (engine, executor, sink) = engine();
    let (a, b) = (key(0xa), key(0xb));
    let _ha = engine.subscribe(a.clone(), CallOptions::default());
    let _hb = engine.subscribe(b.clone(), CallOptions::default());

    tick(&engine, 90).await;
    executor.set(Script::Transport);
    let mut changes = engine.subscribe_changes();

    engine.observe_block(1, 95);
    let report = engine.process_chain(1).await.unwrap();
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.succeeded + report.failed, 0);

    assert_eq!(engine.read(&a), success(&a, 90));
    assert_eq!(engine.read(&b), success(&b, 90));
    assert_eq!(engine.scheduler().due_calls(1, 95).len(), 2);
    assert!(changes.try_recv().is_err());
    assert_eq!(
        sink.count(|e| matches!(e, SchedulerEvent::BatchFailure { block: 95, calls: 2, .. })),
        1
    );

    // Recovers on the next block without any retry logic of its own.
    executor.set(Script::Succeed);
    tick(&engine, 96).await;
    assert_eq!(engine.read(&a), success(&a, 96));
}

#[tokio::test]
async fn shortest_interval_wins_until_its_listener_leaves() {
    let (engine, _, _) = engine();
    let k = key(1);
    let slow = engine.subscribe(k.clone(), CallOptions::new(10));
    let fast = engine.subscribe(k.clone(), CallOptions::new(3));
    assert_eq!(engine.registry().effective_blocks_per_fetch(&k), Some(3));

    tick(&engine, 100).await;
    assert_eq!(engine.scheduler().due_calls(1, 103).len(), 1);

    assert!(engine.unsubscribe(&fast));
    assert_eq!(engine.registry().effective_blocks_per_fetch(&k), Some(10));
    assert!(engine.scheduler().due_calls(1, 103).is_empty());
    assert_eq!(engine.scheduler().due_calls(1, 110).len(), 1);

    assert!(engine.unsubscribe(&slow));
    assert!(!engine.registry().is_subscribed(&k));
}

#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let (engine, _, _) = engine();
    let k = key(1);
    let result = success(&k, 50);

    assert_eq!(engine.cache().apply(&k, result.clone()), ApplyOutcome::Inserted);
    let once = engine.cache().entry(&k).unwrap();
    assert_eq!(engine.cache().apply(&k, result), ApplyOutcome::Unchanged);
    assert_eq!(engine.cache().entry(&k).unwrap(), once);

    // An older answer arriving late never wins.
    assert_eq!(engine.cache().apply(&k, success(&k, 40)), ApplyOutcome::Stale);
    assert_eq!(engine.read(&k), success(&k, 50));
}

#[tokio::test]
async fn listener_count_tracks_subscribes_minus_successful_releases() {
    let (engine, _, sink) = engine();
    let k = key(1);
    let mut handles = Vec::new();
    let mut expected: usize = 0;

    for step in 0..40u32 {
        if step % 3 == 2 {
            if let Some(handle) = handles.pop() {
                assert!(engine.unsubscribe(&handle));
                expected -= 1;
                // A second release of the same handle is a no-op.
                assert!(!engine.unsubscribe(&handle));
            }
        } else {
            handles.push(engine.subscribe(k.clone(), CallOptions::default()));
            expected += 1;
        }
        assert_eq!(engine.registry().listener_count(&k), expected);
    }
    for handle in handles.drain(..) {
        assert!(engine.unsubscribe(&handle));
    }
    assert_eq!(engine.registry().listener_count(&k), 0);
    assert_eq!(
        sink.count(|e| matches!(e, SchedulerEvent::DoubleRelease { .. })),
        13
    );
}

#[tokio::test]
async fn gas_budget_splits_due_calls_in_order() {
    let config = SchedulerConfig {
        gas_budget_per_batch: 3_000_000,
        ..SchedulerConfig::default()
    };
    let (engine, executor, _) = engine_with(config);
    let keys: Vec<_> = (1..=7).map(key).collect();
    let _handles: Vec<_> = keys
        .iter()
        .map(|k| engine.subscribe(k.clone(), CallOptions::default()))
        .collect();

    let report = {
        engine.observe_block(1, 10);
        engine.process_chain(1).await.unwrap()
    };
    assert_eq!(report.batches, 3);

    let mut sizes: Vec<usize> = executor.batches().iter().map(|(_, b)| b.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 3, 3]);
    assert!(keys.iter().all(|k| engine.read(k).block() == Some(10)));
}

#[tokio::test]
async fn never_reload_fetches_once() {
    let (engine, executor, _) = engine();
    let k = key(9);
    let _handle = engine.subscribe(k.clone(), CallOptions::never_reload());

    tick(&engine, 1).await;
    tick(&engine, 2).await;
    tick(&engine, 1_000_000).await;
    assert_eq!(executor.batches().len(), 1);
    assert_eq!(engine.read(&k), success(&k, 1));
}

#[tokio::test(start_paused = true)]
async fn spawned_lane_follows_heads() {
    let (engine, executor, _) = engine();
    let k = key(4);
    let _handle = engine.subscribe(k.clone(), CallOptions::default());
    let mut changes = engine.subscribe_changes();
    let lanes = engine.spawn();

    engine.observe_block(1, 21);
    let update = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.key, k);
    assert_eq!(update.result.block(), Some(21));
    assert_eq!(executor.batches()[0].0, 21);

    for lane in lanes {
        lane.abort();
    }
}

/// Blocks inside every batch until the test lets it go, and tracks how many
/// batches run at once.
#[derive(Default)]
struct GatedExecutor {
    entered: Notify,
    release: Notify,
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
    blocks: Mutex<Vec<u64>>,
}

#[async_trait]
impl CallExecutor for GatedExecutor {
    async fn execute(
        &self,
        _chain_id: ChainId,
        block: u64,
        batch: &[CallKey],
    ) -> Result<Vec<CallResult>, ExecutorError> {
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
        self.blocks.lock().unwrap().push(block);

        self.entered.notify_one();
        self.release.notified().await;

        self.inflight.fetch_sub(1, Ordering::SeqCst);
        Ok(batch.iter().map(|k| success(k, block)).collect())
    }
}

#[tokio::test]
async fn ticks_during_a_running_pass_fold_into_one_follow_up() {
    let engine = MulticallCache::new(SchedulerConfig::default(), Duration::ZERO);
    let executor = Arc::new(GatedExecutor::default());
    engine.add_chain(1, ChainPolicy::every_block(1), executor.clone());

    let (kept, dropped) = (key(1), key(2));
    let _kept = engine.subscribe(kept.clone(), CallOptions::default());
    let dropped_handle = engine.subscribe(dropped.clone(), CallOptions::default());
    let mut changes = engine.subscribe_changes();
    let lanes = engine.spawn();

    engine.observe_block(1, 100);
    executor.entered.notified().await;

    // The pass at 100 is blocked in the executor.
    for height in 101..=103 {
        assert!(engine.observe_block(1, height));
    }
    assert!(engine.unsubscribe(&dropped_handle));
    let direct = tokio::spawn({
        let engine = engine.clone();
        async move { engine.process_chain(1).await }
    });

    executor.release.notify_one();
    executor.entered.notified().await;
    executor.release.notify_one();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let update = changes.recv().await.unwrap();
            if update.key == kept && update.result.block() == Some(103) {
                break;
            }
        }
    })
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(5), direct)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*executor.blocks.lock().unwrap(), vec![100, 103]);
    assert_eq!(executor.max_inflight.load(Ordering::SeqCst), 1);
    // Unsubscribed mid-flight: the answer is cached anyway, and never refreshed.
    assert_eq!(engine.read(&dropped), success(&dropped, 100));
    assert_eq!(engine.read(&kept), success(&kept, 103));

    for lane in lanes {
        lane.abort();
    }
}

/// Never answers while `stall` is set.
struct StallingExecutor {
    stall: AtomicBool,
}

#[async_trait]
impl CallExecutor for StallingExecutor {
    async fn execute(
        &self,
        _chain_id: ChainId,
        block: u64,
        batch: &[CallKey],
    ) -> Result<Vec<CallResult>, ExecutorError> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(batch.iter().map(|k| success(k, block)).collect())
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_batch_leaves_keys_due() {
    let config = SchedulerConfig {
        batch_timeout: Duration::from_secs(2),
        ..SchedulerConfig::default()
    };
    let sink = Arc::new(RecordingSink::new());
    let engine = MulticallCache::with_sink(config, Duration::ZERO, sink.clone());
    let executor = Arc::new(StallingExecutor {
        stall: AtomicBool::new(true),
    });
    engine.add_chain(1, ChainPolicy::every_block(1), executor.clone());
    let k = key(5);
    let _handle = engine.subscribe(k.clone(), CallOptions::default());

    engine.observe_block(1, 10);
    let report = engine.process_chain(1).await.unwrap();
    assert_eq!(report.failed_batches, 1);
    assert_eq!(engine.read(&k), CallResult::Pending);
    assert_eq!(engine.scheduler().due_calls(1, 10).len(), 1);
    assert_eq!(
        sink.count(|e| matches!(
            e,
            SchedulerEvent::BatchFailure { error, .. } if error.contains("timed out")
        )),
        1
    );

    executor.stall.store(false, Ordering::SeqCst);
    engine.observe_block(1, 11);
    engine.process_chain(1).await.unwrap();
    assert_eq!(engine.read(&k), success(&k, 11));
}

/// Reports a head of its own instead of the requested block.
struct SkewedExecutor;

#[async_trait]
impl CallExecutor for SkewedExecutor {
    async fn execute(
        &self,
        _chain_id: ChainId,
        _block: u64,
        batch: &[CallKey],
    ) -> Result<Vec<CallResult>, ExecutorError> {
        Ok(batch.iter().map(|k| success(k, 5000)).collect())
    }
}

#[tokio::test]
async fn cache_is_stamped_with_the_pass_block_not_the_executor_view() {
    let engine = MulticallCache::new(SchedulerConfig::default(), Duration::ZERO);
    engine.add_chain(1, ChainPolicy::every_block(1), Arc::new(SkewedExecutor));
    let k = key(1);
    let _handle = engine.subscribe(k.clone(), CallOptions::new(5));

    engine.observe_block(1, 100);
    engine.process_chain(1).await.unwrap();
    assert_eq!(engine.read(&k).block(), Some(100));
    assert!(engine.scheduler().due_calls(1, 104).is_empty());
    assert_eq!(engine.scheduler().due_calls(1, 105).len(), 1);
}
