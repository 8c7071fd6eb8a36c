use crate::call_key::{CallOptions, ChainId};
use crate::errors::SettingsError;
use crate::executor::MULTICALL3;
use crate::fetch_scheduler::{
    SchedulerConfig, DEFAULT_GAS_BUDGET_PER_BATCH, DEFAULT_GAS_PER_CALL,
    DEFAULT_MAX_CALLS_PER_BATCH,
};
use crate::orchestrator::{CadencePolicy, ChainPolicy};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use config::builder::DefaultState;
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Scheduler {
    #[serde(default = "default_gas_budget_per_batch")]
    pub gas_budget_per_batch: u64,
    #[serde(default = "default_gas_per_call")]
    pub default_gas_per_call: u64,
    #[serde(default = "default_max_calls_per_batch")]
    pub max_calls_per_batch: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
}

fn default_gas_budget_per_batch() -> u64 {
    DEFAULT_GAS_BUDGET_PER_BATCH
}
fn default_gas_per_call() -> u64 {
    DEFAULT_GAS_PER_CALL
}
fn default_max_calls_per_batch() -> usize {
    DEFAULT_MAX_CALLS_PER_BATCH
}
fn default_batch_timeout_ms() -> u64 {
    10_000
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            gas_budget_per_batch: default_gas_budget_per_batch(),
            default_gas_per_call: default_gas_per_call(),
            max_calls_per_batch: default_max_calls_per_batch(),
            batch_timeout_ms: default_batch_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Subscriptions {
    /// How long a key with no listener keeps being fetched before it is dropped.
    #[serde(default)]
    pub grace_period_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheSettings {
    /// 0 disables stale eviction.
    #[serde(default)]
    pub max_entry_age_blocks: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Metrics {
    /// Serve Prometheus metrics on this port (requires the `observability` feature).
    #[serde(default)]
    pub prometheus_port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FlightRecorderSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_flight_recorder_path")]
    pub path: PathBuf,
    #[serde(default = "default_flight_recorder_capacity")]
    pub capacity: usize,
}

fn default_flight_recorder_path() -> PathBuf {
    PathBuf::from("flight_recorder.jsonl")
}
fn default_flight_recorder_capacity() -> usize {
    10_000
}

impl Default for FlightRecorderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_flight_recorder_path(),
            capacity: default_flight_recorder_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cadence {
    #[default]
    EveryBlock,
    FixedInterval { interval_ms: u64 },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Chain {
    pub chain_id: ChainId,
    pub rpc_url: String,
    #[serde(default = "default_multicall_address")]
    pub multicall_address: Address,
    #[serde(default = "default_blocks_per_fetch")]
    pub blocks_per_fetch: u64,
    #[serde(default)]
    pub is_reference: bool,
    #[serde(default)]
    pub cadence: Cadence,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_multicall_address() -> Address {
    MULTICALL3
}
fn default_blocks_per_fetch() -> u64 {
    1
}
fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Chain {
    pub fn policy(&self) -> ChainPolicy {
        let cadence = match self.cadence {
            Cadence::EveryBlock => CadencePolicy::EveryBlock,
            Cadence::FixedInterval { interval_ms } => {
                CadencePolicy::FixedInterval(Duration::from_millis(interval_ms))
            }
        };
        ChainPolicy {
            cadence,
            is_reference: self.is_reference,
            default_options: CallOptions::new(self.blocks_per_fetch),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub subscriptions: Subscriptions,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub flight_recorder: FlightRecorderSettings,
    #[serde(default)]
    pub chains: Vec<Chain>,
}

impl Settings {
    /// Loads `.env`, then `Config.toml` (or `$MULTICALL_CONFIG`), then
    /// `MULTICALL_*` environment overrides.
    pub fn new() -> Result<Self, SettingsError> {
        dotenv::dotenv().ok();
        let path = env::var("MULTICALL_CONFIG").unwrap_or_else(|_| "Config.toml".to_string());
        Self::load(&path)
    }

    pub fn load(path: &str) -> Result<Self, SettingsError> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            // MULTICALL_SCHEDULER__GAS_BUDGET_PER_BATCH=... style overrides
            .add_source(
                Environment::with_prefix("MULTICALL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        let mut settings = Self::build(builder)?;

        // Per-chain RPC override: MULTICALL_RPC_URL_<chain_id>
        for chain in settings.chains.iter_mut() {
            if let Ok(url) = env::var(format!("MULTICALL_RPC_URL_{}", chain.chain_id)) {
                let trimmed = url.trim();
                if !trimmed.is_empty() {
                    chain.rpc_url = trimmed.to_string();
                }
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from a TOML document, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, SettingsError> {
        let settings = Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, SettingsError> {
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.scheduler.gas_budget_per_batch == 0 {
            return Err(SettingsError::Invalid(
                "scheduler.gas_budget_per_batch must be >= 1".to_string(),
            ));
        }
        if self.scheduler.max_calls_per_batch == 0 {
            return Err(SettingsError::Invalid(
                "scheduler.max_calls_per_batch must be >= 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(SettingsError::Invalid(format!(
                    "chain {} is configured twice",
                    chain.chain_id
                )));
            }
            if chain.blocks_per_fetch == 0 {
                return Err(SettingsError::Invalid(format!(
                    "chain {}: blocks_per_fetch must be >= 1",
                    chain.chain_id
                )));
            }
            if chain.poll_interval_ms == 0 {
                return Err(SettingsError::Invalid(format!(
                    "chain {}: poll_interval_ms must be >= 1",
                    chain.chain_id
                )));
            }
            if let Cadence::FixedInterval { interval_ms: 0 } = chain.cadence {
                return Err(SettingsError::Invalid(format!(
                    "chain {}: cadence interval_ms must be >= 1",
                    chain.chain_id
                )));
            }
        }

        let references = self.chains.iter().filter(|c| c.is_reference).count();
        if references > 1 {
            return Err(SettingsError::Invalid(format!(
                "{} chains are marked is_reference, at most one is allowed",
                references
            )));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            gas_budget_per_batch: self.scheduler.gas_budget_per_batch,
            default_gas_per_call: self.scheduler.default_gas_per_call,
            max_calls_per_batch: self.scheduler.max_calls_per_batch,
            batch_timeout: Duration::from_millis(self.scheduler.batch_timeout_ms),
            max_entry_age_blocks: match self.cache.max_entry_age_blocks {
                0 => None,
                age => Some(age),
            },
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.subscriptions.grace_period_ms)
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&Chain> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}
