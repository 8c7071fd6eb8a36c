//! Error types shared across the cache engine.
//!
//! Only call construction and transport can fail with an `Err`. A call that
//! reverts inside a batch is not an error here: it becomes
//! [`CallResult::Failure`](crate::result_cache::CallResult::Failure) and is
//! visible to consumers through the cache.

/// Rejected call construction. The call never reaches the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallKeyError {
    #[error("Invalid function signature `{signature}`: {reason}")]
    InvalidSignature { signature: String, reason: String },
    #[error("Arguments do not match `{function}`: {reason}")]
    Encoding { function: String, reason: String },
}

/// Whole-batch failure reported by a [`CallExecutor`](crate::executor::CallExecutor).
///
/// None of the keys in the batch are touched in the cache; they stay due and
/// are retried on the next tick of their chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Batch timed out after {0} ms")]
    Timeout(u64),
    #[error("Malformed multicall response: {0}")]
    MalformedResponse(String),
    #[error("Executor returned {returned} results for a batch of {expected} calls")]
    ResultCountMismatch { expected: usize, returned: usize },
    #[error("No executor registered for chain {0}")]
    UnknownChain(u64),
}

/// Settings could not be loaded or failed validation.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}
