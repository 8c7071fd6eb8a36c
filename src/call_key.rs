//! # Call Keys
//!
//! A [`CallKey`] is the canonical identity of one remote read: the chain it
//! runs on, the contract it targets and the ABI-encoded calldata. Two calls
//! with the same tuple share one cache entry and one subscription, whatever
//! call site produced them.
//!
//! Arguments are encoded positionally. Callers that want deduplication across
//! call sites must present arguments in a canonical order (for example the
//! balance helpers sort account lists before building keys).

use crate::errors::CallKeyError;
use ethers::abi::{AbiParser, Function, Token};
use ethers::types::{Address, Bytes};
use std::fmt;

/// Chain identifier (EIP-155).
pub type ChainId = u64;

/// `blocks_per_fetch` value for calls that are fetched once and never refreshed.
pub const NEVER_RELOAD: u64 = u64::MAX;

/// Canonical identity of a single remote read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub chain_id: ChainId,
    pub target: Address,
    pub call_data: Bytes,
}

impl CallKey {
    pub fn new(chain_id: ChainId, target: Address, call_data: impl Into<Bytes>) -> Self {
        Self {
            chain_id,
            target,
            call_data: call_data.into(),
        }
    }

    /// 4-byte function selector, if the calldata carries one.
    pub fn selector(&self) -> Option<[u8; 4]> {
        let data = self.call_data.as_ref();
        if data.len() < 4 {
            return None;
        }
        Some([data[0], data[1], data[2], data[3]])
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:?}:0x{}",
            self.chain_id,
            self.target,
            hex::encode(self.call_data.as_ref())
        )
    }
}

/// Per-subscriber listener options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallOptions {
    /// Minimum number of blocks between two fetches of the same key. Always >= 1.
    pub blocks_per_fetch: u64,
    /// Gas the call is expected to use. Only drives batch packing.
    pub gas_required: Option<u64>,
}

impl CallOptions {
    pub fn new(blocks_per_fetch: u64) -> Self {
        Self {
            blocks_per_fetch: blocks_per_fetch.max(1),
            gas_required: None,
        }
    }

    /// Fetch once, never refresh while a result is cached.
    pub fn never_reload() -> Self {
        Self::new(NEVER_RELOAD)
    }

    pub fn with_gas_required(mut self, gas_required: u64) -> Self {
        self.gas_required = Some(gas_required);
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Parses a human-readable function signature.
///
/// Accepts both `balanceOf(address)` and
/// `function balanceOf(address) view returns (uint256)`.
pub fn parse_function(signature: &str) -> Result<Function, CallKeyError> {
    let trimmed = signature.trim();
    let normalized = if trimmed.starts_with("function ") {
        trimmed.to_string()
    } else {
        format!("function {}", trimmed)
    };

    AbiParser::default()
        .parse_function(&normalized)
        .map_err(|e| CallKeyError::InvalidSignature {
            signature: trimmed.to_string(),
            reason: e.to_string(),
        })
}

/// Builds the [`CallKey`] for `function(args)` on `target`.
///
/// Fails when the argument list does not type-check against the function
/// inputs. Pure: no I/O, no shared state.
pub fn normalize(
    chain_id: ChainId,
    target: Address,
    function: &Function,
    args: &[Token],
) -> Result<CallKey, CallKeyError> {
    let call_data = function
        .encode_input(args)
        .map_err(|e| CallKeyError::Encoding {
            function: function.name.clone(),
            reason: e.to_string(),
        })?;

    Ok(CallKey::new(chain_id, target, call_data))
}

/// [`normalize`] from a human-readable signature.
pub fn normalize_signature(
    chain_id: ChainId,
    target: Address,
    signature: &str,
    args: &[Token],
) -> Result<CallKey, CallKeyError> {
    let function = parse_function(signature)?;
    normalize(chain_id, target, &function, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn account() -> Address {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    fn token() -> Address {
        "0x00000000000000000000000000000000000000bb".parse().unwrap()
    }

    #[test]
    fn identical_calls_produce_identical_keys() {
        let f = parse_function("balanceOf(address)").unwrap();
        let a = normalize(1, token(), &f, &[Token::Address(account())]).unwrap();
        let b = normalize_signature(
            1,
            token(),
            "function balanceOf(address) view returns (uint256)",
            &[Token::Address(account())],
        )
        .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.selector(), Some([0x70, 0xa0, 0x82, 0x31]));
        assert_eq!(a.call_data.len(), 4 + 32);
    }

    #[test]
    fn chain_is_part_of_identity() {
        let f = parse_function("balanceOf(address)").unwrap();
        let mainnet = normalize(1, token(), &f, &[Token::Address(account())]).unwrap();
        let arbitrum = normalize(42161, token(), &f, &[Token::Address(account())]).unwrap();
        assert_ne!(mainnet, arbitrum);
    }

    #[test]
    fn arguments_are_positional() {
        let f = parse_function("allowance(address,address)").unwrap();
        let ab = normalize(
            1,
            token(),
            &f,
            &[Token::Address(account()), Token::Address(token())],
        )
        .unwrap();
        let ba = normalize(
            1,
            token(),
            &f,
            &[Token::Address(token()), Token::Address(account())],
        )
        .unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn mismatched_arguments_are_rejected() {
        let f = parse_function("balanceOf(address)").unwrap();
        let err = normalize(1, token(), &f, &[Token::Uint(U256::from(7))]).unwrap_err();
        assert!(matches!(err, CallKeyError::Encoding { .. }));

        let err = normalize(1, token(), &f, &[]).unwrap_err();
        assert!(matches!(err, CallKeyError::Encoding { .. }));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let err = parse_function("balanceOf(address").unwrap_err();
        assert!(matches!(err, CallKeyError::InvalidSignature { .. }));
    }

    #[test]
    fn blocks_per_fetch_is_at_least_one() {
        assert_eq!(CallOptions::new(0).blocks_per_fetch, 1);
        assert_eq!(CallOptions::never_reload().blocks_per_fetch, NEVER_RELOAD);
        assert_eq!(
            CallOptions::new(3).with_gas_required(185_000).gas_required,
            Some(185_000)
        );
    }
}
