//! Native and ERC-20 balance watches built on the multicall cache.

use crate::call_key::{CallOptions, ChainId};
use crate::executor::MULTICALL3;
use crate::multicall::{CallGroup, MulticallCache};
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::types::{Address, U256};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;

/// `gasRequired` hint for ERC-20 `balanceOf`. Some tokens run hooks in
/// `balanceOf`, so the default per-call estimate is not used.
pub const TOKEN_BALANCE_GAS_REQUIRED: u64 = 185_000;

/// 0.01 native units kept back for gas by [`max_amount_spend`].
pub fn min_native_for_gas() -> U256 {
    U256::exp10(16)
}

/// Largest amount that can be spent out of `amount`. Native balances keep
/// [`min_native_for_gas`] in reserve.
pub fn max_amount_spend(amount: U256, is_native: bool) -> U256 {
    if !is_native {
        return amount;
    }
    amount.saturating_sub(min_native_for_gas())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Balances {
    /// Only addresses with a decoded result are present.
    pub amounts: IndexMap<Address, U256>,
    pub any_loading: bool,
}

impl Balances {
    pub fn get(&self, address: &Address) -> Option<U256> {
        self.amounts.get(address).copied()
    }
}

/// Live balance subscription. Dropping it releases every listener.
pub struct BalanceWatch {
    group: CallGroup,
    addresses: Vec<Address>,
    function: Function,
}

impl BalanceWatch {
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn group(&self) -> &CallGroup {
        &self.group
    }

    pub fn balances(&self) -> Balances {
        let states = self.group.states();
        let any_loading = states.iter().any(|s| s.loading);
        let amounts = self
            .addresses
            .iter()
            .zip(states.iter())
            .filter_map(|(address, state)| {
                let amount = state.decode(&self.function)?.into_iter().next()?.into_uint()?;
                Some((*address, amount))
            })
            .collect();
        Balances {
            amounts,
            any_loading,
        }
    }
}

/// What a wallet can hold on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Currency {
    Native,
    Token(Address),
}

impl Currency {
    pub fn is_native(&self) -> bool {
        matches!(self, Currency::Native)
    }

    pub fn token(&self) -> Option<Address> {
        match self {
            Currency::Native => None,
            Currency::Token(address) => Some(*address),
        }
    }
}

/// Balances of one account across mixed currencies, reported in the order
/// the currencies were requested.
pub struct CurrencyBalances {
    account: Address,
    currencies: Vec<Currency>,
    native: Option<BalanceWatch>,
    tokens: Option<BalanceWatch>,
}

impl CurrencyBalances {
    pub fn account(&self) -> Address {
        self.account
    }

    pub fn currencies(&self) -> &[Currency] {
        &self.currencies
    }

    /// One slot per requested currency; `None` until a result decodes.
    pub fn balances(&self) -> Vec<Option<U256>> {
        let native = self.native.as_ref().map(BalanceWatch::balances);
        let tokens = self.tokens.as_ref().map(BalanceWatch::balances);
        self.currencies
            .iter()
            .map(|currency| match currency {
                Currency::Native => native.as_ref()?.get(&self.account),
                Currency::Token(token) => tokens.as_ref()?.get(token),
            })
            .collect()
    }

    /// First requested currency, for single-currency watches.
    pub fn balance(&self) -> Option<U256> {
        self.balances().into_iter().next().flatten()
    }

    pub fn any_loading(&self) -> bool {
        self.native.iter().chain(self.tokens.iter()).any(|w| w.group().any_loading())
    }
}

pub struct BalanceReader {
    cache: MulticallCache,
    multicall_addresses: HashMap<ChainId, Address>,
    get_eth_balance: Function,
    balance_of: Function,
}

impl BalanceReader {
    pub fn new(cache: MulticallCache) -> Self {
        Self {
            cache,
            multicall_addresses: HashMap::new(),
            get_eth_balance: uint_view("getEthBalance", "addr"),
            balance_of: uint_view("balanceOf", "account"),
        }
    }

    /// Overrides the Multicall3 deployment used for native balances on `chain_id`.
    pub fn with_multicall_address(mut self, chain_id: ChainId, address: Address) -> Self {
        self.multicall_addresses.insert(chain_id, address);
        self
    }

    pub fn multicall_address(&self, chain_id: ChainId) -> Address {
        self.multicall_addresses
            .get(&chain_id)
            .copied()
            .unwrap_or(MULTICALL3)
    }

    /// Native balances through Multicall3 `getEthBalance`. Accounts are
    /// sorted and deduplicated.
    pub fn native_balances(&self, chain_id: ChainId, accounts: &[Address]) -> BalanceWatch {
        let mut sorted = accounts.to_vec();
        sorted.sort();
        let addresses: Vec<Address> = sorted.into_iter().collect::<IndexSet<_>>().into_iter().collect();

        let args: Vec<Vec<Token>> = addresses.iter().map(|a| vec![Token::Address(*a)]).collect();
        let group = self.cache.single_contract_multiple_data(
            chain_id,
            self.multicall_address(chain_id),
            &self.get_eth_balance,
            &args,
            None,
        );
        BalanceWatch {
            group,
            addresses,
            function: self.get_eth_balance.clone(),
        }
    }

    /// ERC-20 balances of `account`, one call per token.
    pub fn token_balances(
        &self,
        chain_id: ChainId,
        account: Address,
        tokens: &[Address],
    ) -> BalanceWatch {
        let addresses: Vec<Address> = tokens.iter().copied().collect::<IndexSet<_>>().into_iter().collect();
        let options: CallOptions = self
            .cache
            .default_options(chain_id)
            .with_gas_required(TOKEN_BALANCE_GAS_REQUIRED);
        let group = self.cache.multiple_contract_single_data(
            chain_id,
            &addresses,
            &self.balance_of,
            &[Token::Address(account)],
            Some(options),
        );
        BalanceWatch {
            group,
            addresses,
            function: self.balance_of.clone(),
        }
    }

    /// Balances of `account` for a mix of native and token currencies. Only
    /// the calls the mix needs are subscribed.
    pub fn currency_balances(
        &self,
        chain_id: ChainId,
        account: Address,
        currencies: &[Currency],
    ) -> CurrencyBalances {
        let tokens: Vec<Address> = currencies.iter().filter_map(Currency::token).collect();
        let native = currencies
            .iter()
            .any(Currency::is_native)
            .then(|| self.native_balances(chain_id, &[account]));
        let tokens = (!tokens.is_empty()).then(|| self.token_balances(chain_id, account, &tokens));
        CurrencyBalances {
            account,
            currencies: currencies.to_vec(),
            native,
            tokens,
        }
    }

    pub fn currency_balance(&self, chain_id: ChainId, account: Address, currency: Currency) -> CurrencyBalances {
        self.currency_balances(chain_id, account, &[currency])
    }

    pub fn token_balance(&self, chain_id: ChainId, account: Address, token: Address) -> CurrencyBalances {
        self.currency_balance(chain_id, account, Currency::Token(token))
    }
}

// function <name>(address <arg>) view returns (uint256)
fn uint_view(name: &str, arg: &str) -> Function {
    Function {
        name: name.to_string(),
        inputs: vec![Param {
            name: arg.to_string(),
            kind: ParamType::Address,
            internal_type: None,
        }],
        outputs: vec![Param {
            name: String::new(),
            kind: ParamType::Uint(256),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::View,
    }
}
