//! Flow state bag and persisted snapshot

use crate::swap::{ScriptValues, Secret, SecretHash, Swap};

use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Everything a flow has learned so far. Fields only ever get filled in or
/// flipped by step actions; the whole bag is persisted after each mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowState {
    // sign
    pub is_participant_signed: bool,
    pub is_signed: bool,
    pub is_swap_exist: bool,

    // commitment
    pub secret: Option<Secret>,
    pub secret_hash: Option<SecretHash>,

    // script leg
    pub script_values: Option<ScriptValues>,
    pub script_address: Option<String>,
    pub script_funding_tx: Option<String>,
    pub is_script_funded: bool,
    pub is_script_verified: bool,

    // balance sync
    pub is_balance_fetching: bool,
    pub is_balance_enough: bool,
    pub balance: Option<U256>,

    // contract leg
    pub eth_swap_creation_tx: Option<String>,
    pub is_eth_contract_funded: bool,
    pub target_wallet: Option<String>,
    pub eth_withdraw_attempted: bool,
    pub eth_swap_withdraw_tx: Option<String>,
    pub is_eth_withdrawn: bool,

    // fee-exhaustion handshake
    pub require_withdraw_fee: bool,
    pub withdraw_fee: Option<U256>,
    pub withdraw_request_sent: bool,
    pub withdraw_request_accepted: bool,
    pub withdraw_request_incoming: bool,

    // script withdraw
    pub script_withdraw_attempted: bool,
    pub script_withdraw_tx: Option<String>,
    pub is_script_withdrawn: bool,

    // refund
    pub refund_tx: Option<String>,
    pub refund_tx_hex: Option<String>,
    pub is_refunded: bool,

    pub is_counterparty_finished: bool,
    pub is_finished: bool,
}

/// What a store keeps for one swap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub swap: Swap,
    /// Protocol name, checked on restore
    pub protocol: String,
    pub step: u8,
    pub state: FlowState,
}

impl FlowRecord {
    pub fn new(swap: Swap, protocol: impl Into<String>) -> Self {
        Self {
            swap,
            protocol: protocol.into(),
            step: 0,
            state: FlowState::default(),
        }
    }
}

/// Step guard passed to `finish_step`
#[derive(Debug, Clone, Copy, Default)]
pub struct StepMeta<'a> {
    /// Name of the step being completed; `None` advances unconditionally
    pub step: Option<&'a str>,
    /// Ignore a mismatch instead of failing
    pub silent: bool,
}

impl<'a> StepMeta<'a> {
    pub fn step(name: &'a str) -> Self {
        Self {
            step: Some(name),
            silent: false,
        }
    }

    pub fn silent(name: &'a str) -> Self {
        Self {
            step: Some(name),
            silent: true,
        }
    }
}

/// Observable flow lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    StepEntered { step: u8, name: String },
    StateChanged { step: u8 },
    ProtocolError { kind: String, message: String },
    Finished,
}
