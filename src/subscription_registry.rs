//! # Subscription Registry
//!
//! Reference-counted interest in call keys. The scheduler only fetches keys
//! that appear here.
//!
//! Every `subscribe` adds one listener and returns a handle; releasing the
//! handle removes exactly that listener. When listeners of one key ask for
//! different `blocks_per_fetch`, the smallest one wins and is recomputed as
//! listeners come and go.
//!
//! A key whose last listener left stays registered for `grace_period` with
//! its last effective options, so a quick unmount/remount does not drop it
//! out of the fetch set.

use crate::call_key::{CallKey, CallOptions, ChainId};
use crate::metrics;
use crate::observability::{NoopSink, ObservabilitySink, SchedulerEvent};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Proof of one listener on one key. Release it with
/// [`SubscriptionRegistry::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    key: CallKey,
    options: CallOptions,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }

    pub fn options(&self) -> CallOptions {
        self.options
    }
}

/// Snapshot of one registered key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub key: CallKey,
    pub listener_count: usize,
    /// Effective options: minimum interval, maximum gas across listeners.
    pub options: CallOptions,
    /// Registration order, used for deterministic batch packing.
    pub seq: u64,
}

#[derive(Debug)]
struct Listeners {
    seq: u64,
    intervals: BTreeMap<u64, usize>,
    gas: BTreeMap<u64, usize>,
    idle_since: Option<Instant>,
    last_options: CallOptions,
}

impl Listeners {
    fn new(seq: u64, options: CallOptions) -> Self {
        Self {
            seq,
            intervals: BTreeMap::new(),
            gas: BTreeMap::new(),
            idle_since: None,
            last_options: options,
        }
    }

    fn count(&self) -> usize {
        self.intervals.values().sum()
    }

    fn add(&mut self, options: CallOptions) {
        *self.intervals.entry(options.blocks_per_fetch).or_insert(0) += 1;
        if let Some(gas) = options.gas_required {
            *self.gas.entry(gas).or_insert(0) += 1;
        }
        self.idle_since = None;
        self.last_options = self.effective();
    }

    fn remove(&mut self, options: CallOptions) {
        decrement(&mut self.intervals, options.blocks_per_fetch);
        if let Some(gas) = options.gas_required {
            decrement(&mut self.gas, gas);
        }
        if self.intervals.is_empty() {
            self.idle_since = Some(Instant::now());
        } else {
            self.last_options = self.effective();
        }
    }

    fn effective(&self) -> CallOptions {
        match self.intervals.keys().next() {
            Some(&blocks_per_fetch) => CallOptions {
                blocks_per_fetch,
                gas_required: self.gas.keys().next_back().copied(),
            },
            None => self.last_options,
        }
    }

    fn expired(&self, now: Instant, grace: Duration) -> bool {
        match self.idle_since {
            Some(since) => now.saturating_duration_since(since) >= grace,
            None => false,
        }
    }
}

fn decrement(map: &mut BTreeMap<u64, usize>, key: u64) {
    if let Some(count) = map.get_mut(&key) {
        *count -= 1;
        if *count == 0 {
            map.remove(&key);
        }
    }
}

pub struct SubscriptionRegistry {
    subscriptions: DashMap<CallKey, Listeners>,
    live_handles: DashMap<u64, ()>,
    next_handle: AtomicU64,
    next_seq: AtomicU64,
    grace_period: Duration,
    sink: Arc<dyn ObservabilitySink>,
}

impl SubscriptionRegistry {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            subscriptions: DashMap::new(),
            live_handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            grace_period,
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Adds one listener for `key`. Each call counts, even for a key that is
    /// already registered.
    pub fn subscribe(&self, key: CallKey, options: CallOptions) -> SubscriptionHandle {
        let options = CallOptions {
            blocks_per_fetch: options.blocks_per_fetch.max(1),
            ..options
        };
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);

        {
            let mut listeners = self
                .subscriptions
                .entry(key.clone())
                .or_insert_with(|| {
                    Listeners::new(self.next_seq.fetch_add(1, Ordering::Relaxed), options)
                });
            listeners.add(options);
        }
        self.live_handles.insert(id, ());
        metrics::set_active_subscriptions(self.subscriptions.len());

        debug!(
            "[Registry] +1 listener on {} (blocks_per_fetch: {})",
            key, options.blocks_per_fetch
        );

        SubscriptionHandle { id, key, options }
    }

    /// Removes the listener behind `handle`. Returns `false` (and reports a
    /// double release) if the handle was already released.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        if self.live_handles.remove(&handle.id).is_none() {
            warn!(
                "[Registry] Handle {} for {} released twice, ignoring",
                handle.id, handle.key
            );
            metrics::increment_double_release();
            self.sink.record(SchedulerEvent::DoubleRelease {
                handle_id: handle.id,
                key: handle.key.to_string(),
            });
            return false;
        }

        if let Some(mut listeners) = self.subscriptions.get_mut(&handle.key) {
            listeners.remove(handle.options);
        }

        if self.grace_period.is_zero() {
            self.subscriptions
                .remove_if(&handle.key, |_, listeners| listeners.count() == 0);
        }
        metrics::set_active_subscriptions(self.subscriptions.len());

        debug!("[Registry] -1 listener on {}", handle.key);
        true
    }

    /// Current listener count for `key` (0 when unknown or idle).
    pub fn listener_count(&self, key: &CallKey) -> usize {
        self.subscriptions
            .get(key)
            .map(|l| l.count())
            .unwrap_or(0)
    }

    /// `blocks_per_fetch` the scheduler uses for `key`, if it is registered.
    pub fn effective_blocks_per_fetch(&self, key: &CallKey) -> Option<u64> {
        self.subscriptions
            .get(key)
            .map(|l| l.effective().blocks_per_fetch)
    }

    /// Registered with listeners, or idle but still inside the grace period.
    pub fn is_subscribed(&self, key: &CallKey) -> bool {
        let now = Instant::now();
        self.subscriptions
            .get(key)
            .map(|l| l.count() > 0 || !l.expired(now, self.grace_period))
            .unwrap_or(false)
    }

    /// Keys of `chain_id` that should be kept fresh, in registration order.
    pub fn active_for_chain(&self, chain_id: ChainId) -> Vec<Subscription> {
        let now = Instant::now();
        let mut active: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.key().chain_id == chain_id)
            .filter(|entry| entry.count() > 0 || !entry.expired(now, self.grace_period))
            .map(|entry| Subscription {
                key: entry.key().clone(),
                listener_count: entry.count(),
                options: entry.effective(),
                seq: entry.seq,
            })
            .collect();
        active.sort_by_key(|s| s.seq);
        active
    }

    /// Drops keys whose last listener left longer than the grace period ago.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let grace = self.grace_period;
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|_, listeners| listeners.count() > 0 || !listeners.expired(now, grace));
        let pruned = before.saturating_sub(self.subscriptions.len());
        if pruned > 0 {
            debug!("[Registry] Pruned {} idle subscriptions", pruned);
            metrics::set_active_subscriptions(self.subscriptions.len());
        }
        pruned
    }

    /// Number of registered keys, idle ones included.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
