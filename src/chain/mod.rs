//! Chain leg interfaces
//!
//! The coordinator never talks to a node directly. Each asset is served by an
//! adapter implementing one of the two leg traits:
//! - `ScriptLeg` for redeemable-script chains (BTC, BCH)
//! - `ContractLeg` for the escrow contract chain (ETH and tokens)
//!
//! Every call receives the caller's `Identity` explicitly.

pub mod abi;

use crate::error::{LedgerResult, SwapError, SwapResult};
use crate::swap::{Asset, Identity, ScriptValues, Secret, SecretHash, Swap};

use async_trait::async_trait;
use ethers::types::U256;
use std::collections::HashMap;
use std::sync::Arc;

/// Script-chain operations used by both roles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScriptLeg: Send + Sync {
    /// Spendable balance of the caller's script-chain address
    async fn fetch_balance(&self, who: &Identity) -> LedgerResult<U256>;

    /// Derive the HTLC script address for `values`
    async fn create_script(&self, who: &Identity, values: &ScriptValues) -> LedgerResult<String>;

    /// Pay `amount` into the script, returning the funding tx id
    async fn fund_script(
        &self,
        who: &Identity,
        values: &ScriptValues,
        amount: U256,
    ) -> LedgerResult<String>;

    /// Whether the script holds at least `amount`
    async fn check_script_funded(
        &self,
        who: &Identity,
        values: &ScriptValues,
        amount: U256,
    ) -> LedgerResult<bool>;

    /// Redeem the script with the secret
    async fn withdraw(
        &self,
        who: &Identity,
        values: &ScriptValues,
        secret: &Secret,
        destination: Option<String>,
    ) -> LedgerResult<String>;

    /// Signed refund transaction, not broadcast
    async fn get_refund_hex_transaction(
        &self,
        who: &Identity,
        values: &ScriptValues,
    ) -> LedgerResult<String>;

    /// Reclaim the script after its lock time
    async fn refund(&self, who: &Identity, values: &ScriptValues) -> LedgerResult<String>;
}

/// Escrow contract operations. Escrows are keyed by (funder, recipient).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContractLeg: Send + Sync {
    /// Caller's wallet balance of the leg's asset
    async fn fetch_balance(&self, who: &Identity) -> LedgerResult<U256>;

    /// Caller's native coin balance, which pays contract fees
    async fn fetch_native_balance(&self, who: &Identity) -> LedgerResult<U256>;

    /// Amount locked by `funder` for the caller
    async fn get_balance(&self, who: &Identity, funder: &str) -> LedgerResult<U256>;

    /// Validate the escrow locked by `funder` for the caller.
    /// Returns a description of the first mismatch, if any.
    async fn check_balance(
        &self,
        who: &Identity,
        funder: &str,
        amount: U256,
        secret_hash: &SecretHash,
    ) -> LedgerResult<Option<String>>;

    /// Whether the caller still has an open escrow for `recipient`
    async fn check_swap_exists(&self, who: &Identity, recipient: &str) -> LedgerResult<bool>;

    /// Payout address recorded in the escrow locked by `funder` for the caller
    async fn get_target_wallet(&self, who: &Identity, funder: &str)
        -> LedgerResult<Option<String>>;

    /// Lock `amount` for `recipient`. Targeted when `target_wallet` is given.
    async fn create(
        &self,
        who: &Identity,
        recipient: &str,
        secret_hash: &SecretHash,
        amount: U256,
        target_wallet: Option<String>,
    ) -> LedgerResult<String>;

    /// Withdraw the escrow locked by `funder` for the caller
    async fn withdraw(&self, who: &Identity, secret: &Secret, funder: &str)
        -> LedgerResult<String>;

    /// Withdraw on behalf of `recipient`; the caller pays the fee
    async fn withdraw_other(
        &self,
        who: &Identity,
        secret: &Secret,
        funder: &str,
        recipient: &str,
    ) -> LedgerResult<String>;

    /// Reclaim the caller's escrow for `recipient`
    async fn refund(&self, who: &Identity, recipient: &str) -> LedgerResult<String>;

    /// Fee the caller needs on hand to withdraw
    async fn calc_withdraw_fee(&self, who: &Identity) -> LedgerResult<U256>;

    /// Secret revealed by the withdraw of the caller's escrow for `recipient`
    async fn get_secret(&self, who: &Identity, recipient: &str) -> LedgerResult<Option<Secret>>;

    /// Recover the secret from a withdraw transaction's input
    async fn get_secret_from_tx_hash(
        &self,
        who: &Identity,
        tx_hash: &str,
    ) -> LedgerResult<Option<Secret>>;
}

/// The two legs of one swap, resolved once at flow construction
#[derive(Clone)]
pub struct Legs {
    pub script: Arc<dyn ScriptLeg>,
    pub contract: Arc<dyn ContractLeg>,
}

/// Adapters registered per asset
#[derive(Default, Clone)]
pub struct AdapterSet {
    script: HashMap<Asset, Arc<dyn ScriptLeg>>,
    contract: HashMap<Asset, Arc<dyn ContractLeg>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, asset: Asset, leg: Arc<dyn ScriptLeg>) -> Self {
        self.script.insert(asset, leg);
        self
    }

    pub fn with_contract(mut self, asset: Asset, leg: Arc<dyn ContractLeg>) -> Self {
        self.contract.insert(asset, leg);
        self
    }

    /// Pick the script and contract adapters a swap needs
    pub fn resolve(&self, swap: &Swap) -> SwapResult<Legs> {
        let (script_asset, contract_asset) =
            if swap.sell_asset.is_script_asset() && swap.buy_asset.is_contract_asset() {
                (&swap.sell_asset, &swap.buy_asset)
            } else if swap.buy_asset.is_script_asset() && swap.sell_asset.is_contract_asset() {
                (&swap.buy_asset, &swap.sell_asset)
            } else {
                return Err(SwapError::Config(format!(
                    "Unsupported pair {} -> {}",
                    swap.sell_asset, swap.buy_asset
                )));
            };

        let script = self.script.get(script_asset).cloned().ok_or_else(|| {
            SwapError::Config(format!("No script adapter for {}", script_asset))
        })?;
        let contract = self.contract.get(contract_asset).cloned().ok_or_else(|| {
            SwapError::Config(format!("No contract adapter for {}", contract_asset))
        })?;

        Ok(Legs { script, contract })
    }

    pub fn assets(&self) -> Vec<Asset> {
        self.script
            .keys()
            .chain(self.contract.keys())
            .cloned()
            .collect()
    }
}
