//! Simulated ledgers
//!
//! In-memory stand-ins for a script chain node and an escrow contract. They
//! enforce the same rules the real chains do (hash checks, recipient keys,
//! lock times, one open escrow per pair, fees) and report failures with the
//! same categories a node adapter would.

use crate::chain::{abi, ContractLeg, ScriptLeg};
use crate::error::{LedgerError, LedgerResult};
use crate::swap::{utc_now, Asset, Identity, ScriptValues, Secret, SecretHash};

use async_trait::async_trait;
use bitcoin::hashes::{hash160, Hash};
use dashmap::DashMap;
use ethers::types::U256;
use tracing::{debug, info};

fn tx_id() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Shared failure injection and call counting
#[derive(Default)]
struct Faults {
    pending: DashMap<&'static str, LedgerError>,
    calls: DashMap<&'static str, usize>,
}

impl Faults {
    /// Count the call and pop an injected failure, if any
    fn enter(&self, op: &'static str) -> LedgerResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.pending.remove(op) {
            Some((_, err)) => {
                debug!("Injected failure for {}: {}", op, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn calls(&self, op: &str) -> usize {
        self.calls.get(op).map(|c| *c).unwrap_or(0)
    }
}

fn debit(balances: &DashMap<String, U256>, account: &str, amount: U256) -> LedgerResult<()> {
    let mut entry = balances.entry(account.to_string()).or_default();
    if *entry < amount {
        return Err(LedgerError::Rejected(format!(
            "balance {} of {} below {}",
            *entry, account, amount
        )));
    }
    *entry -= amount;
    Ok(())
}

fn credit(balances: &DashMap<String, U256>, account: &str, amount: U256) {
    *balances.entry(account.to_string()).or_default() += amount;
}

fn balance(balances: &DashMap<String, U256>, account: &str) -> U256 {
    balances.get(account).map(|b| *b).unwrap_or_default()
}

/// Script chain (BTC, BCH) with HTLC outputs
pub struct SimScriptChain {
    asset: Asset,
    /// By address, scripts included
    balances: DashMap<String, U256>,
    /// Script address -> commitment
    scripts: DashMap<String, ScriptValues>,
    faults: Faults,
}

impl SimScriptChain {
    pub fn new(asset: Asset) -> Self {
        Self {
            asset,
            balances: DashMap::new(),
            scripts: DashMap::new(),
            faults: Faults::default(),
        }
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn credit(&self, address: &str, amount: impl Into<U256>) {
        credit(&self.balances, address, amount.into());
    }

    pub fn balance_of(&self, address: &str) -> U256 {
        balance(&self.balances, address)
    }

    /// Address a script would get, without registering it
    pub fn script_address(&self, values: &ScriptValues) -> String {
        let encoded = serde_json::to_vec(values).unwrap_or_default();
        format!(
            "{}-htlc-{}",
            self.asset.to_string().to_lowercase(),
            hex::encode(hash160::Hash::hash(&encoded).to_byte_array())
        )
    }

    /// Pay into a script from outside the coordinator
    pub fn deposit_to_script(&self, values: &ScriptValues, amount: impl Into<U256>) -> String {
        let address = self.script_address(values);
        self.scripts.insert(address.clone(), values.clone());
        credit(&self.balances, &address, amount.into());
        address
    }

    pub fn script_balance(&self, values: &ScriptValues) -> U256 {
        self.balance_of(&self.script_address(values))
    }

    /// Fail the next call of `op` with `err`
    pub fn fail_next(&self, op: &'static str, err: LedgerError) {
        self.faults.pending.insert(op, err);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.faults.calls(op)
    }

    fn drain_script(&self, address: &str) -> LedgerResult<U256> {
        let mut entry = self.balances.entry(address.to_string()).or_default();
        if entry.is_zero() {
            return Err(LedgerError::ExecutionFailed(
                "script failed: output already spent".to_string(),
            ));
        }
        Ok(std::mem::take(&mut *entry))
    }
}

#[async_trait]
impl ScriptLeg for SimScriptChain {
    async fn fetch_balance(&self, who: &Identity) -> LedgerResult<U256> {
        self.faults.enter("fetch_balance")?;
        Ok(self.balance_of(&who.script_address))
    }

    async fn create_script(&self, _who: &Identity, values: &ScriptValues) -> LedgerResult<String> {
        self.faults.enter("create_script")?;
        let address = self.script_address(values);
        self.scripts.insert(address.clone(), values.clone());
        Ok(address)
    }

    async fn fund_script(
        &self,
        who: &Identity,
        values: &ScriptValues,
        amount: U256,
    ) -> LedgerResult<String> {
        self.faults.enter("fund_script")?;
        let address = self.script_address(values);
        if !self.scripts.contains_key(&address) {
            return Err(LedgerError::Rejected(format!("unknown script {}", address)));
        }
        debit(&self.balances, &who.script_address, amount)?;
        credit(&self.balances, &address, amount);

        let tx = tx_id();
        info!("{}: {} locked {} in {} ({})", self.asset, who.peer_id, amount, address, tx);
        Ok(tx)
    }

    async fn check_script_funded(
        &self,
        _who: &Identity,
        values: &ScriptValues,
        amount: U256,
    ) -> LedgerResult<bool> {
        self.faults.enter("check_script_funded")?;
        let held = self.script_balance(values);
        Ok(!held.is_zero() && held >= amount)
    }

    async fn withdraw(
        &self,
        who: &Identity,
        values: &ScriptValues,
        secret: &Secret,
        destination: Option<String>,
    ) -> LedgerResult<String> {
        self.faults.enter("withdraw")?;
        if who.script_public_key != values.recipient_public_key {
            return Err(LedgerError::Rejected(
                "signature does not match the script recipient".to_string(),
            ));
        }
        if secret.hash() != values.secret_hash {
            return Err(LedgerError::ExecutionFailed(
                "script failed: secret does not match".to_string(),
            ));
        }

        let address = self.script_address(values);
        let amount = self.drain_script(&address)?;
        let to = destination.unwrap_or_else(|| who.script_address.clone());
        credit(&self.balances, &to, amount);

        let tx = tx_id();
        info!("{}: {} redeemed {} to {} ({})", self.asset, address, amount, to, tx);
        Ok(tx)
    }

    async fn get_refund_hex_transaction(
        &self,
        who: &Identity,
        values: &ScriptValues,
    ) -> LedgerResult<String> {
        self.faults.enter("get_refund_hex_transaction")?;
        let draft = serde_json::json!({
            "script": self.script_address(values),
            "refundTo": who.script_address,
            "lockTime": values.lock_time,
        });
        Ok(hex::encode(draft.to_string()))
    }

    async fn refund(&self, who: &Identity, values: &ScriptValues) -> LedgerResult<String> {
        self.faults.enter("refund")?;
        if who.script_public_key != values.owner_public_key {
            return Err(LedgerError::Rejected(
                "signature does not match the script owner".to_string(),
            ));
        }
        if !values.is_refundable_at(utc_now()) {
            return Err(LedgerError::Rejected("non-final: lock time not reached".to_string()));
        }

        let address = self.script_address(values);
        let amount = self.drain_script(&address)?;
        credit(&self.balances, &who.script_address, amount);

        let tx = tx_id();
        info!("{}: {} refunded {} from {} ({})", self.asset, who.peer_id, amount, address, tx);
        Ok(tx)
    }
}

/// One escrow, keyed by (funder, recipient)
#[derive(Debug, Clone)]
pub struct Escrow {
    pub amount: U256,
    pub secret_hash: SecretHash,
    pub target_wallet: Option<String>,
    pub created_at: i64,
    /// Set by the withdraw; kept after the amount is paid out
    pub secret: Option<Secret>,
}

/// Escrow contract on an account chain (ETH or a token)
pub struct SimContractChain {
    asset: Asset,
    withdraw_fee: U256,
    refund_after_secs: i64,
    /// Leg asset by lower-cased address
    balances: DashMap<String, U256>,
    /// Native coin for fees; ETH uses `balances`
    native: DashMap<String, U256>,
    escrows: DashMap<(String, String), Escrow>,
    /// Tx hash -> call input
    inputs: DashMap<String, Vec<u8>>,
    faults: Faults,
}

fn key(address: &str) -> String {
    address.to_lowercase()
}

impl SimContractChain {
    pub fn new(asset: Asset, withdraw_fee: impl Into<U256>, refund_after_secs: i64) -> Self {
        Self {
            asset,
            withdraw_fee: withdraw_fee.into(),
            refund_after_secs,
            balances: DashMap::new(),
            native: DashMap::new(),
            escrows: DashMap::new(),
            inputs: DashMap::new(),
            faults: Faults::default(),
        }
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    fn gas(&self) -> &DashMap<String, U256> {
        if self.asset == Asset::Eth {
            &self.balances
        } else {
            &self.native
        }
    }

    pub fn credit(&self, address: &str, amount: impl Into<U256>) {
        credit(&self.balances, &key(address), amount.into());
    }

    pub fn credit_native(&self, address: &str, amount: impl Into<U256>) {
        credit(self.gas(), &key(address), amount.into());
    }

    pub fn balance_of(&self, address: &str) -> U256 {
        balance(&self.balances, &key(address))
    }

    pub fn native_balance_of(&self, address: &str) -> U256 {
        balance(self.gas(), &key(address))
    }

    /// Create an escrow directly, bypassing balances
    pub fn open_escrow(
        &self,
        funder: &str,
        recipient: &str,
        amount: impl Into<U256>,
        secret_hash: SecretHash,
        target_wallet: Option<String>,
    ) {
        self.escrows.insert(
            (key(funder), key(recipient)),
            Escrow {
                amount: amount.into(),
                secret_hash,
                target_wallet,
                created_at: utc_now(),
                secret: None,
            },
        );
    }

    pub fn escrow(&self, funder: &str, recipient: &str) -> Option<Escrow> {
        self.escrows
            .get(&(key(funder), key(recipient)))
            .map(|e| e.clone())
    }

    pub fn fail_next(&self, op: &'static str, err: LedgerError) {
        self.faults.pending.insert(op, err);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.faults.calls(op)
    }

    fn charge_fee(&self, payer: &str) -> LedgerResult<()> {
        let gas = self.gas();
        let mut entry = gas.entry(key(payer)).or_default();
        if *entry < self.withdraw_fee {
            return Err(LedgerError::InsufficientFee(
                "insufficient funds for gas * price + value".to_string(),
            ));
        }
        *entry -= self.withdraw_fee;
        Ok(())
    }

    /// Pay out an escrow with the secret; the fee comes from `payer`
    fn redeem(
        &self,
        payer: &str,
        secret: &Secret,
        funder: &str,
        recipient: &str,
        input: Vec<u8>,
    ) -> LedgerResult<String> {
        let id = (key(funder), key(recipient));
        let (amount, to) = {
            let escrow = self
                .escrows
                .get(&id)
                .filter(|e| !e.amount.is_zero())
                .ok_or_else(|| LedgerError::ExecutionFailed("execution reverted: no swap".into()))?;
            if secret.hash() != escrow.secret_hash {
                return Err(LedgerError::ExecutionFailed(
                    "Transaction ran out of gas".to_string(),
                ));
            }
            let to = escrow
                .target_wallet
                .clone()
                .unwrap_or_else(|| recipient.to_string());
            (escrow.amount, to)
        };

        self.charge_fee(payer)?;

        if let Some(mut escrow) = self.escrows.get_mut(&id) {
            escrow.amount = U256::zero();
            escrow.secret = Some(*secret);
        }
        credit(&self.balances, &key(&to), amount);

        let tx = format!("0x{}", tx_id());
        self.inputs.insert(tx.clone(), input);
        info!("{}: escrow {} -> {} paid {} to {} ({})", self.asset, funder, recipient, amount, to, tx);
        Ok(tx)
    }
}

#[async_trait]
impl ContractLeg for SimContractChain {
    async fn fetch_balance(&self, who: &Identity) -> LedgerResult<U256> {
        self.faults.enter("fetch_balance")?;
        Ok(self.balance_of(&who.eth_address))
    }

    async fn fetch_native_balance(&self, who: &Identity) -> LedgerResult<U256> {
        self.faults.enter("fetch_native_balance")?;
        Ok(self.native_balance_of(&who.eth_address))
    }

    async fn get_balance(&self, who: &Identity, funder: &str) -> LedgerResult<U256> {
        self.faults.enter("get_balance")?;
        Ok(self
            .escrow(funder, &who.eth_address)
            .map(|e| e.amount)
            .unwrap_or_default())
    }

    async fn check_balance(
        &self,
        who: &Identity,
        funder: &str,
        amount: U256,
        secret_hash: &SecretHash,
    ) -> LedgerResult<Option<String>> {
        self.faults.enter("check_balance")?;
        let Some(escrow) = self.escrow(funder, &who.eth_address) else {
            return Ok(Some(format!("no escrow from {}", funder)));
        };
        if escrow.amount < amount {
            return Ok(Some(format!("escrow holds {}, expected {}", escrow.amount, amount)));
        }
        if escrow.secret_hash != *secret_hash {
            return Ok(Some(format!(
                "escrow commits to {}, expected {}",
                escrow.secret_hash, secret_hash
            )));
        }
        Ok(None)
    }

    async fn check_swap_exists(&self, who: &Identity, recipient: &str) -> LedgerResult<bool> {
        self.faults.enter("check_swap_exists")?;
        Ok(self
            .escrow(&who.eth_address, recipient)
            .is_some_and(|e| !e.amount.is_zero()))
    }

    async fn get_target_wallet(
        &self,
        who: &Identity,
        funder: &str,
    ) -> LedgerResult<Option<String>> {
        self.faults.enter("get_target_wallet")?;
        Ok(self
            .escrow(funder, &who.eth_address)
            .and_then(|e| e.target_wallet))
    }

    async fn create(
        &self,
        who: &Identity,
        recipient: &str,
        secret_hash: &SecretHash,
        amount: U256,
        target_wallet: Option<String>,
    ) -> LedgerResult<String> {
        self.faults.enter("create")?;
        if self
            .escrow(&who.eth_address, recipient)
            .is_some_and(|e| !e.amount.is_zero())
        {
            return Err(LedgerError::ExecutionFailed(
                "execution reverted: swap exists".to_string(),
            ));
        }
        debit(&self.balances, &key(&who.eth_address), amount)?;
        self.open_escrow(&who.eth_address, recipient, amount, *secret_hash, target_wallet);

        let tx = format!("0x{}", tx_id());
        info!("{}: {} locked {} for {} ({})", self.asset, who.peer_id, amount, recipient, tx);
        Ok(tx)
    }

    async fn withdraw(
        &self,
        who: &Identity,
        secret: &Secret,
        funder: &str,
    ) -> LedgerResult<String> {
        self.faults.enter("withdraw")?;
        let input = abi::encode_withdraw_call(secret, funder)
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        self.redeem(&who.eth_address, secret, funder, &who.eth_address, input)
    }

    async fn withdraw_other(
        &self,
        who: &Identity,
        secret: &Secret,
        funder: &str,
        recipient: &str,
    ) -> LedgerResult<String> {
        self.faults.enter("withdraw_other")?;
        let input = abi::encode_withdraw_other_call(secret, funder, recipient)
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        self.redeem(&who.eth_address, secret, funder, recipient, input)
    }

    async fn refund(&self, who: &Identity, recipient: &str) -> LedgerResult<String> {
        self.faults.enter("refund")?;
        let id = (key(&who.eth_address), key(recipient));
        let amount = {
            let escrow = self
                .escrows
                .get(&id)
                .filter(|e| !e.amount.is_zero())
                .ok_or_else(|| LedgerError::ExecutionFailed("execution reverted: no swap".into()))?;
            if utc_now() < escrow.created_at + self.refund_after_secs {
                return Err(LedgerError::Rejected(
                    "escrow is still locked".to_string(),
                ));
            }
            escrow.amount
        };

        self.escrows.remove(&id);
        credit(&self.balances, &key(&who.eth_address), amount);

        let tx = format!("0x{}", tx_id());
        info!("{}: {} refunded {} from escrow for {} ({})", self.asset, who.peer_id, amount, recipient, tx);
        Ok(tx)
    }

    async fn calc_withdraw_fee(&self, _who: &Identity) -> LedgerResult<U256> {
        self.faults.enter("calc_withdraw_fee")?;
        Ok(self.withdraw_fee)
    }

    async fn get_secret(&self, who: &Identity, recipient: &str) -> LedgerResult<Option<Secret>> {
        self.faults.enter("get_secret")?;
        Ok(self
            .escrow(&who.eth_address, recipient)
            .and_then(|e| e.secret))
    }

    async fn get_secret_from_tx_hash(
        &self,
        _who: &Identity,
        tx_hash: &str,
    ) -> LedgerResult<Option<Secret>> {
        self.faults.enter("get_secret_from_tx_hash")?;
        let Some(input) = self.inputs.get(tx_hash).map(|i| i.clone()) else {
            return Ok(None);
        };
        abi::decode_withdraw_input(&input).map_err(|e| LedgerError::Rejected(e.to_string()))
    }
}
