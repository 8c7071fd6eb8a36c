// src/metrics.rs

// Helpers take their labels even when the recorder is compiled out.
#![cfg_attr(not(feature = "observability"), allow(unused_variables))]

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

use crate::call_key::ChainId;
use std::time::Duration;

/// Registers descriptions for every metric emitted by the engine.
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "multicall_batches_total",
        Unit::Count,
        "Multicall batches sent to an executor, labeled by chain and outcome (ok, transport_error)."
    );
    describe_counter!(
        "multicall_calls_total",
        Unit::Count,
        "Individual calls reconciled into the cache, labeled by chain and outcome (success, failure)."
    );
    describe_counter!(
        "multicall_double_release_total",
        Unit::Count,
        "Subscription handles released more than once."
    );
    describe_counter!(
        "multicall_ticks_ignored_total",
        Unit::Count,
        "Block heights dropped because they did not advance the chain."
    );
    describe_counter!(
        "multicall_passes_coalesced_total",
        Unit::Count,
        "Block ticks folded into a later scheduler pass."
    );
    describe_counter!(
        "multicall_flight_recorder_dropped_total",
        Unit::Count,
        "Flight recorder events dropped because the writer queue was full."
    );
    describe_histogram!(
        "multicall_batch_size",
        "Number of calls per multicall batch."
    );
    describe_histogram!(
        "multicall_batch_gas",
        "Summed gasRequired of each multicall batch."
    );
    describe_histogram!(
        "multicall_pass_duration_ms",
        "Wall time of one scheduler pass in milliseconds."
    );
    describe_histogram!(
        "multicall_rpc_call_ms",
        "Latency of auxiliary RPC calls (block number polling) in milliseconds."
    );
    describe_gauge!(
        "multicall_active_subscriptions",
        "Call keys with at least one listener or inside the release grace period."
    );
    describe_gauge!("multicall_cache_entries", "Entries held by the result cache.");
    describe_gauge!(
        "multicall_latest_block",
        "Latest block height observed per chain."
    );
}

pub fn record_batch(chain_id: ChainId, outcome: &'static str, size: usize, gas: u64) {
    counter!("multicall_batches_total", 1, "chain" => chain_id.to_string(), "outcome" => outcome);
    histogram!("multicall_batch_size", size as f64);
    histogram!("multicall_batch_gas", gas as f64);
}

pub fn record_calls(chain_id: ChainId, outcome: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    counter!("multicall_calls_total", count as u64, "chain" => chain_id.to_string(), "outcome" => outcome);
}

pub fn increment_double_release() {
    increment_counter!("multicall_double_release_total");
}

pub fn increment_tick_ignored(chain_id: ChainId) {
    increment_counter!("multicall_ticks_ignored_total", "chain" => chain_id.to_string());
}

pub fn increment_pass_coalesced(chain_id: ChainId, skipped: u64) {
    counter!("multicall_passes_coalesced_total", skipped, "chain" => chain_id.to_string());
}

pub fn increment_flight_recorder_dropped() {
    increment_counter!("multicall_flight_recorder_dropped_total");
}

pub fn record_pass_duration(chain_id: ChainId, duration: Duration) {
    histogram!(
        "multicall_pass_duration_ms",
        duration.as_secs_f64() * 1000.0,
        "chain" => chain_id.to_string()
    );
}

pub fn record_rpc_call(component: &'static str, method: &'static str, duration: Duration) {
    histogram!(
        "multicall_rpc_call_ms",
        duration.as_secs_f64() * 1000.0,
        "component" => component,
        "method" => method
    );
}

pub fn set_active_subscriptions(count: usize) {
    gauge!("multicall_active_subscriptions", count as f64);
}

pub fn set_cache_entries(count: usize) {
    gauge!("multicall_cache_entries", count as f64);
}

pub fn set_latest_block(chain_id: ChainId, block: u64) {
    gauge!("multicall_latest_block", block as f64, "chain" => chain_id.to_string());
}

/// Installs the Prometheus recorder with an HTTP listener on `port` and
/// registers metric descriptions.
#[cfg(feature = "observability")]
pub fn install_prometheus(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    describe_metrics();
    Ok(())
}

/// Without the `observability` feature there is nothing to serve.
#[cfg(not(feature = "observability"))]
pub fn install_prometheus(port: u16) -> anyhow::Result<()> {
    tracing::warn!(
        "[Metrics] prometheus_port {} ignored: built without the `observability` feature",
        port
    );
    Ok(())
}
