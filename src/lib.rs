//! # Multicall Cache
//!
//! A block-scoped, multi-chain cache of read-only contract calls. Consumers
//! subscribe to calls; the engine batches every due call of a chain into
//! Multicall3 `aggregate3` requests once per observed block and keeps the
//! latest result of each call, tagged with the block it was read at.
//!
//! ## Overview
//!
//! - **Subscriptions**: reference-counted listeners per call, each with its
//!   own refresh interval (`blocks_per_fetch`). The shortest interval wins.
//! - **Scheduling**: one pass per chain per block. Due calls are packed into
//!   batches bounded by a gas budget and executed concurrently.
//! - **Cache**: monotonic per call. An answer from an older block never
//!   replaces a newer one, and a failed batch never erases a good result.
//! - **Orchestration**: one lane per chain. Ticks that arrive while a pass is
//!   running are folded into the next pass.
//!
//! ## Architecture
//!
//! ### Call layer
//! [`call_key`] normalizes (chain, target, function, arguments) into a
//! [`CallKey`](call_key::CallKey). [`multicall`] is the consumer facade.
//!
//! ### Engine layer
//! [`subscription_registry`], [`fetch_scheduler`], [`result_cache`] and
//! [`orchestrator`].
//!
//! ### I/O layer
//! [`executor`] (Multicall3 over `ethers`) and [`block_watcher`].

// Call Layer
/// Call normalization and listener options
pub mod call_key;
/// Consumer facade, call groups and call states
pub mod multicall;
/// Native and ERC-20 balance watches
pub mod balances;

// Engine Layer
/// Listener bookkeeping per call key
pub mod subscription_registry;
/// Due selection, batch packing and pass execution
pub mod fetch_scheduler;
/// Latest result per call key
pub mod result_cache;
/// Per-chain lanes driven by block ticks
pub mod orchestrator;

// I/O Layer
/// Remote executor trait and Multicall3 implementation
pub mod executor;
/// Block height polling
pub mod block_watcher;

// Infrastructure
/// Error types
pub mod errors;
/// Engine events and sinks
pub mod observability;
/// JSON-lines event recording
pub mod flight_recorder;
/// Metrics (no-op unless the `observability` feature is enabled)
pub mod metrics;
/// Configuration loading
pub mod settings;

pub use call_key::{CallKey, CallOptions, ChainId, NEVER_RELOAD};
pub use errors::{CallKeyError, ExecutorError, SettingsError};
pub use executor::{CallExecutor, Multicall3Executor};
pub use multicall::{CallGroup, CallState, MulticallCache};
pub use orchestrator::{CadencePolicy, ChainPolicy};
pub use result_cache::CallResult;
