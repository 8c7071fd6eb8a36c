//! # Remote Executor
//!
//! The I/O boundary of the engine. An executor runs one batch of calls at one
//! block and answers with one [`CallResult`] per call, in order, or with a
//! batch-level [`ExecutorError`].
//!
//! [`Multicall3Executor`] is the on-chain implementation: every batch becomes
//! a single `eth_call` to Multicall3 `aggregate3` with `allowFailure = true`,
//! pinned to the scheduled block, so one reverting call never poisons its
//! siblings.

use crate::call_key::{CallKey, ChainId};
use crate::errors::ExecutorError;
use crate::result_cache::CallResult;
use async_trait::async_trait;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// Canonical Multicall3 deployment address, identical on most EVM chains.
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

/// [`MULTICALL3_ADDRESS`] as an [`Address`].
pub const MULTICALL3: Address = H160([
    0xca, 0x11, 0xbd, 0xe0, 0x59, 0x77, 0xb3, 0x63, 0x11, 0x67, 0x02, 0x88, 0x62, 0xbe, 0x2a, 0x17,
    0x39, 0x76, 0xca, 0x11,
]);

#[async_trait]
pub trait CallExecutor: Send + Sync {
    /// Executes `batch` on `chain_id` at `block`.
    ///
    /// On `Ok`, the result vector must have exactly one entry per call.
    async fn execute(
        &self,
        chain_id: ChainId,
        block: u64,
        batch: &[CallKey],
    ) -> Result<Vec<CallResult>, ExecutorError>;
}

/// Executes batches through Multicall3 `aggregate3` over any `ethers` middleware.
#[derive(Clone)]
pub struct Multicall3Executor<M: Middleware> {
    provider: Arc<M>,
    multicall_address: Address,
    aggregate3: Function,
}

impl<M: Middleware + 'static> Multicall3Executor<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address) -> Self {
        Self {
            provider,
            multicall_address,
            aggregate3: aggregate3_function(),
        }
    }

    pub fn multicall_address(&self) -> Address {
        self.multicall_address
    }

    fn encode(&self, batch: &[CallKey]) -> Result<Vec<u8>, ExecutorError> {
        // Call3 struct: (address target, bool allowFailure, bytes callData)
        let calls = batch
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();

        self.aggregate3
            .encode_input(&[Token::Array(calls)])
            .map_err(|e| ExecutorError::MalformedResponse(format!("encode aggregate3: {}", e)))
    }
}

#[async_trait]
impl<M: Middleware + 'static> CallExecutor for Multicall3Executor<M> {
    async fn execute(
        &self,
        chain_id: ChainId,
        block: u64,
        batch: &[CallKey],
    ) -> Result<Vec<CallResult>, ExecutorError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        debug_assert!(batch.iter().all(|k| k.chain_id == chain_id));

        let calldata = self.encode(batch)?;
        let tx: ethers::types::transaction::eip2718::TypedTransaction = TransactionRequest::new()
            .to(self.multicall_address)
            .data(calldata)
            .into();
        let block_id = BlockId::Number(BlockNumber::Number(U64::from(block)));

        let response = self
            .provider
            .call(&tx, Some(block_id))
            .await
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;

        let results = decode_aggregate3(&response, block)?;
        debug!(
            "[Multicall3] chain {} block {}: {} calls, {} ok",
            chain_id,
            block,
            results.len(),
            results.iter().filter(|r| r.is_success()).count()
        );
        Ok(results)
    }
}

fn aggregate3_function() -> Function {
    // function aggregate3(Call3[] calldata calls) public payable returns (Result[] memory returnData)
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: aggregate3_output(),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
}

fn aggregate3_output() -> ParamType {
    // Result struct: (bool success, bytes returnData)
    ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Bool,
        ParamType::Bytes,
    ])))
}

/// Decodes an `aggregate3` return payload into per-call results stamped at `block`.
pub fn decode_aggregate3(response: &[u8], block: u64) -> Result<Vec<CallResult>, ExecutorError> {
    let decoded = ethers::abi::decode(&[aggregate3_output()], response)
        .map_err(|e| ExecutorError::MalformedResponse(e.to_string()))?;

    let results = decoded
        .into_iter()
        .next()
        .and_then(|t| t.into_array())
        .ok_or_else(|| ExecutorError::MalformedResponse("expected Result[]".to_string()))?;

    results
        .into_iter()
        .map(|token| match token {
            Token::Tuple(mut fields) if fields.len() == 2 => {
                let data = fields.pop().and_then(|t| t.into_bytes());
                let success = fields.pop().and_then(|t| t.into_bool());
                match (success, data) {
                    (Some(true), Some(data)) if !data.is_empty() => Ok(CallResult::Success {
                        data: Bytes::from(data),
                        block,
                    }),
                    (Some(true), Some(_)) => Ok(CallResult::Failure {
                        reason: "empty return data".to_string(),
                        block,
                    }),
                    (Some(false), Some(data)) => Ok(CallResult::Failure {
                        reason: revert_reason(&data),
                        block,
                    }),
                    _ => Err(ExecutorError::MalformedResponse(
                        "Result tuple has wrong field types".to_string(),
                    )),
                }
            }
            _ => Err(ExecutorError::MalformedResponse(
                "expected (bool,bytes) tuple".to_string(),
            )),
        })
        .collect()
}

/// Human-readable revert reason: decodes `Error(string)`, otherwise hex.
fn revert_reason(data: &[u8]) -> String {
    const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

    if data.is_empty() {
        return "reverted".to_string();
    }
    if data.len() > 4 && data[..4] == ERROR_STRING_SELECTOR {
        if let Ok(tokens) = ethers::abi::decode(&[ParamType::String], &data[4..]) {
            if let Some(Token::String(message)) = tokens.into_iter().next() {
                return format!("reverted: {}", message);
            }
        }
    }
    format!("reverted: 0x{}", hex::encode(data))
}
