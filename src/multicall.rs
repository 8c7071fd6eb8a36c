//! # Multicall Cache
//!
//! Consumer-facing entry point. One [`MulticallCache`] per process owns the
//! registry, the result cache, the scheduler and the orchestrator, and is
//! cloned (cheaply) into every component that needs it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use multicall_cache::{call_key::parse_function, multicall::MulticallCache};
//! use ethers::abi::Token;
//!
//! # fn demo(cache: MulticallCache, token: ethers::types::Address, account: ethers::types::Address) -> anyhow::Result<()> {
//! let balance_of = parse_function("balanceOf(address) view returns (uint256)")?;
//! let group = cache.single_call(1, token, &balance_of, &[Token::Address(account)], None);
//! for state in group.states() {
//!     if let Some(tokens) = state.decode(&balance_of) {
//!         println!("balance: {:?}", tokens);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::call_key::{normalize, CallKey, CallOptions, ChainId};
use crate::errors::CallKeyError;
use crate::executor::CallExecutor;
use crate::fetch_scheduler::{is_due, FetchScheduler, PassReport, SchedulerConfig};
use crate::observability::{NoopSink, ObservabilitySink};
use crate::orchestrator::{ChainPolicy, Orchestrator};
use crate::result_cache::{CacheUpdate, CallResult, ResultCache};
use crate::subscription_registry::{SubscriptionHandle, SubscriptionRegistry};
use ethers::abi::{Function, Token};
use ethers::types::{Address, Bytes};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// What a consumer sees for one call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallState {
    /// `false` when the call could not be built (bad arguments).
    pub valid: bool,
    pub result: Option<Bytes>,
    /// Block the current result (or error) was fetched at.
    pub block: Option<u64>,
    /// No result yet.
    pub loading: bool,
    /// A result exists but a newer one is due.
    pub syncing: bool,
    pub error: Option<String>,
}

impl CallState {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Decodes the raw result against `function`'s outputs.
    pub fn decode(&self, function: &Function) -> Option<Vec<Token>> {
        let data = self.result.as_ref()?;
        function.decode_output(data.as_ref()).ok()
    }
}

#[derive(Clone)]
pub struct MulticallCache {
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<ResultCache>,
    scheduler: Arc<FetchScheduler>,
    orchestrator: Arc<Orchestrator>,
}

impl MulticallCache {
    pub fn new(config: SchedulerConfig, grace_period: Duration) -> Self {
        Self::with_sink(config, grace_period, Arc::new(NoopSink))
    }

    pub fn with_sink(
        config: SchedulerConfig,
        grace_period: Duration,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(grace_period).with_sink(sink.clone()));
        let cache = Arc::new(ResultCache::new());
        let scheduler = Arc::new(
            FetchScheduler::new(registry.clone(), cache.clone(), config).with_sink(sink.clone()),
        );
        let orchestrator = Arc::new(Orchestrator::new(scheduler.clone()).with_sink(sink));
        Self {
            registry,
            cache,
            scheduler,
            orchestrator,
        }
    }

    pub fn add_chain(&self, chain_id: ChainId, policy: ChainPolicy, executor: Arc<dyn CallExecutor>) {
        self.orchestrator.register_chain(chain_id, policy, executor);
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<FetchScheduler> {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Listener options of `chain_id` when the caller gives none.
    pub fn default_options(&self, chain_id: ChainId) -> CallOptions {
        self.orchestrator
            .policy(chain_id)
            .map(|p| p.default_options)
            .unwrap_or_default()
    }

    /// Latest cached result, `Pending` when nothing was fetched yet. Never
    /// triggers a fetch.
    pub fn read(&self, key: &CallKey) -> CallResult {
        self.cache.get(key).unwrap_or(CallResult::Pending)
    }

    pub fn subscribe(&self, key: CallKey, options: CallOptions) -> SubscriptionHandle {
        self.registry.subscribe(key, options)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheUpdate> {
        self.cache.subscribe_changes()
    }

    pub fn observe_block(&self, chain_id: ChainId, height: u64) -> bool {
        self.orchestrator.observe_block(chain_id, height)
    }

    /// Runs the pass for the latest head of `chain_id` now, instead of
    /// waiting for its lane.
    pub async fn process_chain(&self, chain_id: ChainId) -> Option<PassReport> {
        self.orchestrator.process_chain(chain_id).await
    }

    /// Starts one background lane per registered chain.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        self.orchestrator.spawn()
    }

    /// Consumer view of `key` relative to its chain's latest head.
    pub fn call_state(&self, key: &CallKey) -> CallState {
        let latest = self.orchestrator.latest_block(key.chain_id);
        let blocks_per_fetch = self
            .registry
            .effective_blocks_per_fetch(key)
            .unwrap_or_else(|| self.default_options(key.chain_id).blocks_per_fetch);
        let syncing = |block: u64| {
            latest.map_or(false, |head| head > block && is_due(Some(block), head, blocks_per_fetch))
        };

        match self.cache.get(key) {
            None | Some(CallResult::Pending) => CallState {
                valid: true,
                loading: true,
                ..CallState::default()
            },
            Some(CallResult::Success { data, block }) => CallState {
                valid: true,
                result: Some(data),
                block: Some(block),
                syncing: syncing(block),
                ..CallState::default()
            },
            Some(CallResult::Failure { reason, block }) => CallState {
                valid: true,
                block: Some(block),
                syncing: syncing(block),
                error: Some(reason),
                ..CallState::default()
            },
        }
    }

    /// Subscribes to a list of prepared calls. Calls that failed to build
    /// keep their slot and read as invalid.
    pub fn watch(
        &self,
        calls: Vec<Result<CallKey, CallKeyError>>,
        options: Option<CallOptions>,
    ) -> CallGroup {
        let slots = calls
            .into_iter()
            .map(|call| {
                call.map(|key| {
                    let options = options.unwrap_or_else(|| self.default_options(key.chain_id));
                    self.registry.subscribe(key, options)
                })
            })
            .collect();
        CallGroup {
            owner: self.clone(),
            slots,
        }
    }

    /// One function, one target, one argument list.
    pub fn single_call(
        &self,
        chain_id: ChainId,
        target: Address,
        function: &Function,
        args: &[Token],
        options: Option<CallOptions>,
    ) -> CallGroup {
        self.watch(vec![normalize(chain_id, target, function, args)], options)
    }

    /// Same function on one target, once per argument list.
    pub fn single_contract_multiple_data(
        &self,
        chain_id: ChainId,
        target: Address,
        function: &Function,
        args_list: &[Vec<Token>],
        options: Option<CallOptions>,
    ) -> CallGroup {
        let calls = args_list
            .iter()
            .map(|args| normalize(chain_id, target, function, args))
            .collect();
        self.watch(calls, options)
    }

    /// Same function and arguments on several targets.
    pub fn multiple_contract_single_data(
        &self,
        chain_id: ChainId,
        targets: &[Address],
        function: &Function,
        args: &[Token],
        options: Option<CallOptions>,
    ) -> CallGroup {
        let calls = targets
            .iter()
            .map(|target| normalize(chain_id, *target, function, args))
            .collect();
        self.watch(calls, options)
    }
}

/// Subscriptions taken together by one consumer. Dropping the group
/// releases every listener it holds.
pub struct CallGroup {
    owner: MulticallCache,
    slots: Vec<Result<SubscriptionHandle, CallKeyError>>,
}

impl CallGroup {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Key of each slot, `None` for calls that failed to build.
    pub fn keys(&self) -> Vec<Option<CallKey>> {
        self.slots
            .iter()
            .map(|slot| slot.as_ref().ok().map(|h| h.key().clone()))
            .collect()
    }

    pub fn states(&self) -> Vec<CallState> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Ok(handle) => self.owner.call_state(handle.key()),
                Err(e) => CallState::invalid(e.to_string()),
            })
            .collect()
    }

    pub fn any_loading(&self) -> bool {
        self.states().iter().any(|s| s.loading)
    }
}

impl Drop for CallGroup {
    fn drop(&mut self) {
        for handle in self.slots.iter().flatten() {
            self.owner.registry.unsubscribe(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_key::parse_function;
    use crate::errors::ExecutorError;
    use async_trait::async_trait;
    use ethers::abi::encode;
    use ethers::types::U256;

    struct Balances;

    #[async_trait]
    impl CallExecutor for Balances {
        async fn execute(
            &self,
            _chain_id: ChainId,
            block: u64,
            batch: &[CallKey],
        ) -> Result<Vec<CallResult>, ExecutorError> {
            Ok(batch
                .iter()
                .map(|key| CallResult::Success {
                    data: Bytes::from(encode(&[Token::Uint(U256::from(key.target.0[19]))])),
                    block,
                })
                .collect())
        }
    }

    fn engine() -> MulticallCache {
        let cache = MulticallCache::new(SchedulerConfig::default(), Duration::ZERO);
        cache.add_chain(1, ChainPolicy::every_block(1), Arc::new(Balances));
        cache
    }

    #[tokio::test]
    async fn group_reads_loading_then_results() {
        let engine = engine();
        let balance_of = parse_function("balanceOf(address) view returns (uint256)").unwrap();
        let tokens = [Address::repeat_byte(5), Address::repeat_byte(9)];
        let group = engine.multiple_contract_single_data(
            1,
            &tokens,
            &balance_of,
            &[Token::Address(Address::repeat_byte(1))],
            None,
        );
        assert!(group.any_loading());

        engine.observe_block(1, 10);
        engine.process_chain(1).await;

        let states = group.states();
        assert!(!group.any_loading());
        let values: Vec<U256> = states
            .iter()
            .map(|s| s.decode(&balance_of).unwrap()[0].clone().into_uint().unwrap())
            .collect();
        assert_eq!(values, vec![U256::from(5), U256::from(9)]);
    }

    #[tokio::test]
    async fn bad_calls_are_invalid_without_poisoning_the_group() {
        let engine = engine();
        let balance_of = parse_function("balanceOf(address)").unwrap();
        let group = engine.single_contract_multiple_data(
            1,
            Address::repeat_byte(5),
            &balance_of,
            &[
                vec![Token::Address(Address::repeat_byte(1))],
                vec![Token::Bool(true)],
            ],
            None,
        );
        let states = group.states();
        assert!(states[0].valid && states[0].loading);
        assert!(!states[1].valid);
        assert_eq!(group.keys()[1], None);
        assert_eq!(engine.registry().len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_group_releases_its_listeners() {
        let engine = engine();
        let balance_of = parse_function("balanceOf(address)").unwrap();
        let args = [Token::Address(Address::repeat_byte(1))];
        let group = engine.single_call(1, Address::repeat_byte(5), &balance_of, &args, None);
        let key = group.keys()[0].clone().unwrap();
        assert_eq!(engine.registry().listener_count(&key), 1);

        drop(group);
        assert_eq!(engine.registry().listener_count(&key), 0);
    }

    #[tokio::test]
    async fn stale_results_are_syncing() {
        let engine = engine();
        let balance_of = parse_function("balanceOf(address)").unwrap();
        let args = [Token::Address(Address::repeat_byte(1))];
        let group = engine.single_call(
            1,
            Address::repeat_byte(5),
            &balance_of,
            &args,
            Some(CallOptions::new(3)),
        );

        engine.observe_block(1, 10);
        engine.process_chain(1).await;
        engine.observe_block(1, 12);
        assert!(!group.states()[0].syncing);
        engine.observe_block(1, 13);
        let state = group.states()[0].clone();
        assert!(state.syncing);
        assert_eq!(state.block, Some(10));
        assert!(state.result.is_some());
    }

    #[test]
    fn read_never_fetches() {
        let engine = engine();
        let key = CallKey::new(1, Address::repeat_byte(1), vec![1]);
        assert_eq!(engine.read(&key), CallResult::Pending);
        assert!(engine.cache().is_empty());
    }
}
