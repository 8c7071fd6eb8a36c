//! # Result Cache
//!
//! Latest result per [`CallKey`], shared by every consumer of every chain.
//!
//! Reads never block on a fetch and never trigger one: fetching is pushed by
//! the [`FetchScheduler`](crate::fetch_scheduler::FetchScheduler). A key
//! nobody subscribes to can stay absent forever.
//!
//! Writes are idempotent per key and block, and an entry never moves back to
//! an older block. Every write that changes an entry is announced on a
//! broadcast channel so reactive consumers can re-read.

use crate::call_key::{CallKey, ChainId};
use crate::metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Outcome of one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    /// Not fetched yet.
    Pending,
    Success { data: Bytes, block: u64 },
    /// The call itself reverted or returned nothing usable.
    Failure { reason: String, block: u64 },
}

impl CallResult {
    /// Block the result was fetched at. `None` while pending.
    pub fn block(&self) -> Option<u64> {
        match self {
            CallResult::Pending => None,
            CallResult::Success { block, .. } | CallResult::Failure { block, .. } => Some(*block),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CallResult::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallResult::Success { .. })
    }

    pub fn data(&self) -> Option<&Bytes> {
        match self {
            CallResult::Success { data, .. } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CallKey,
    pub latest_result: CallResult,
    pub last_fetched_block: Option<u64>,
}

/// Announced once per write that changed an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdate {
    pub key: CallKey,
    pub result: CallResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// Same result at the same block was already stored.
    Unchanged,
    /// The stored result is from a newer block; the write was dropped.
    Stale,
    /// `Pending` carries nothing to store.
    Skipped,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::Updated)
    }
}

pub struct ResultCache {
    entries: DashMap<CallKey, CacheEntry>,
    changes: broadcast::Sender<CacheUpdate>,
}

impl ResultCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            changes,
        }
    }

    /// Latest result for `key`, `None` if it was never fetched.
    pub fn get(&self, key: &CallKey) -> Option<CallResult> {
        self.entries.get(key).map(|e| e.latest_result.clone())
    }

    pub fn entry(&self, key: &CallKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn last_fetched_block(&self, key: &CallKey) -> Option<u64> {
        self.entries.get(key).and_then(|e| e.last_fetched_block)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receiver of every change from now on. Lagging receivers lose the
    /// oldest updates, never the cache state itself.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheUpdate> {
        self.changes.subscribe()
    }

    /// Stores `result` for `key` unless a newer block is already cached.
    pub fn apply(&self, key: &CallKey, result: CallResult) -> ApplyOutcome {
        let block = match result.block() {
            Some(block) => block,
            None => return ApplyOutcome::Skipped,
        };

        let outcome = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                match entry.last_fetched_block {
                    Some(last) if block < last => ApplyOutcome::Stale,
                    Some(last) if block == last && entry.latest_result == result => {
                        ApplyOutcome::Unchanged
                    }
                    _ => {
                        entry.latest_result = result.clone();
                        entry.last_fetched_block = Some(block);
                        ApplyOutcome::Updated
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    key: key.clone(),
                    latest_result: result.clone(),
                    last_fetched_block: Some(block),
                });
                ApplyOutcome::Inserted
            }
        };

        if outcome.changed() {
            // Err only means nobody is listening.
            let _ = self.changes.send(CacheUpdate {
                key: key.clone(),
                result,
            });
        } else if outcome == ApplyOutcome::Stale {
            debug!("[ResultCache] Dropped stale write for {} at block {}", key, block);
        }

        outcome
    }

    /// Drops entries of `chain_id` last fetched more than `max_age_blocks`
    /// before `current_block`, except those `keep` still wants.
    pub fn evict_older_than(
        &self,
        chain_id: ChainId,
        current_block: u64,
        max_age_blocks: u64,
        keep: impl Fn(&CallKey) -> bool,
    ) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            if key.chain_id != chain_id || keep(key) {
                return true;
            }
            match entry.last_fetched_block {
                Some(last) => current_block.saturating_sub(last) <= max_age_blocks,
                None => true,
            }
        });
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(
                "[ResultCache] Evicted {} entries of chain {} older than {} blocks",
                evicted, chain_id, max_age_blocks
            );
        }
        metrics::set_cache_entries(self.entries.len());
        evicted
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}
