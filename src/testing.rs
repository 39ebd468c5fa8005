//! Shared fixtures for unit tests

use crate::chain::AdapterSet;
use crate::config::FlowConfig;
use crate::devnet::{SimContractChain, SimScriptChain};
use crate::flow::{Flow, SwapContext};
use crate::peer::{LocalPeer, LocalRoom};
use crate::protocol::ProtocolDescriptor;
use crate::retry::GenerationRegistry;
use crate::state::MemoryStore;
use crate::swap::{Asset, Identity, Role, Swap};

use ethers::types::U256;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

pub const SWAP_ID: &str = "swap-1";
pub const SELL_SATS: u64 = 100_000;
pub const BUY_UNITS: u64 = 50_000_000;
pub const WITHDRAW_FEE: u64 = 21_000;

pub fn owner_identity() -> Identity {
    Identity {
        peer_id: "owner".into(),
        script_address: "owner-btc".into(),
        script_public_key: "02aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
        eth_address: "0x1111111111111111111111111111111111111111".into(),
    }
}

pub fn participant_identity() -> Identity {
    Identity {
        peer_id: "participant".into(),
        script_address: "participant-btc".into(),
        script_public_key: "03bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into(),
        eth_address: "0x2222222222222222222222222222222222222222".into(),
    }
}

/// Owner selling BTC for USDT
pub fn owner_swap() -> Swap {
    Swap {
        id: SWAP_ID.into(),
        role: Role::Owner,
        sell_asset: Asset::Btc,
        sell_amount: U256::from(SELL_SATS),
        buy_asset: Asset::Token("USDT".into()),
        buy_amount: U256::from(BUY_UNITS),
        counterparty: participant_identity(),
        destination_buy_address: None,
        destination_sell_address: None,
    }
}

/// The participant's view of `owner`
pub fn participant_swap(owner: &Swap) -> Swap {
    Swap {
        id: owner.id.clone(),
        role: Role::Participant,
        sell_asset: owner.buy_asset.clone(),
        sell_amount: owner.buy_amount,
        buy_asset: owner.sell_asset.clone(),
        buy_amount: owner.sell_amount,
        counterparty: owner_identity(),
        destination_buy_address: owner.destination_sell_address.clone(),
        destination_sell_address: owner.destination_buy_address.clone(),
    }
}

pub fn sample_swap() -> Swap {
    owner_swap()
}

pub fn test_config() -> FlowConfig {
    FlowConfig {
        poll_interval_ms: 1_000,
        escrow_poll_interval_ms: 20_000,
        script_lock_window_secs: 3 * 3600,
        script_lock_margin_secs: 3600,
        auto_secret: false,
        withdraw_assist: true,
    }
}

/// Wait (in virtual time) until `cond` holds
pub async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(3600), async {
        while !cond().await {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Both peers of one swap on simulated chains. Needs a tokio runtime.
pub struct Harness {
    pub room: LocalRoom,
    pub generations: Arc<GenerationRegistry>,
    pub btc: Arc<SimScriptChain>,
    pub bch: Arc<SimScriptChain>,
    pub eth: Arc<SimContractChain>,
    pub usdt: Arc<SimContractChain>,
    pub owner: Identity,
    pub participant: Identity,
    pub owner_store: Arc<MemoryStore>,
    pub participant_store: Arc<MemoryStore>,
    pub owner_peer: Arc<LocalPeer>,
    pub participant_peer: Arc<LocalPeer>,
    pub config: FlowConfig,
}

impl Harness {
    pub fn new() -> Self {
        let room = LocalRoom::new();
        let owner = owner_identity();
        let participant = participant_identity();

        Self {
            owner_peer: Arc::new(room.join(owner.peer_id.clone())),
            participant_peer: Arc::new(room.join(participant.peer_id.clone())),
            room,
            generations: Arc::new(GenerationRegistry::new()),
            btc: Arc::new(SimScriptChain::new(Asset::Btc)),
            bch: Arc::new(SimScriptChain::new(Asset::Bch)),
            eth: Arc::new(SimContractChain::new(Asset::Eth, WITHDRAW_FEE, 0)),
            usdt: Arc::new(SimContractChain::new(
                Asset::Token("USDT".into()),
                WITHDRAW_FEE,
                0,
            )),
            owner,
            participant,
            owner_store: Arc::new(MemoryStore::new()),
            participant_store: Arc::new(MemoryStore::new()),
            config: test_config(),
        }
    }

    pub fn adapters(&self) -> AdapterSet {
        AdapterSet::new()
            .with_script(Asset::Btc, self.btc.clone())
            .with_script(Asset::Bch, self.bch.clone())
            .with_contract(Asset::Eth, self.eth.clone())
            .with_contract(Asset::Token("USDT".into()), self.usdt.clone())
    }

    pub fn owner_context(&self) -> SwapContext {
        self.owner_context_with(self.adapters())
    }

    pub fn owner_context_with(&self, adapters: AdapterSet) -> SwapContext {
        SwapContext {
            identity: self.owner.clone(),
            room: self.owner_peer.clone(),
            store: self.owner_store.clone(),
            generations: self.generations.clone(),
            adapters: Arc::new(adapters),
            config: self.config.clone(),
        }
    }

    pub fn participant_context(&self) -> SwapContext {
        SwapContext {
            identity: self.participant.clone(),
            room: self.participant_peer.clone(),
            store: self.participant_store.clone(),
            generations: self.generations.clone(),
            adapters: Arc::new(self.adapters()),
            config: self.config.clone(),
        }
    }

    pub async fn owner_flow(&self, swap: Swap) -> Arc<Flow> {
        let protocol = Arc::new(ProtocolDescriptor::for_swap(&swap).unwrap());
        Flow::new(swap, protocol, self.owner_context()).await.unwrap()
    }

    pub async fn participant_flow(&self, swap: Swap) -> Arc<Flow> {
        let protocol = Arc::new(ProtocolDescriptor::for_swap(&swap).unwrap());
        Flow::new(swap, protocol, self.participant_context())
            .await
            .unwrap()
    }

    /// Balances for a plain BTC -> USDT run
    pub fn fund_btc_usdt(&self) {
        self.btc.credit(&self.owner.script_address, 1_000_000u64);
        self.usdt.credit(&self.participant.eth_address, 100_000_000u64);
        self.usdt.credit_native(&self.owner.eth_address, 1_000_000u64);
        self.usdt.credit_native(&self.participant.eth_address, 1_000_000u64);
    }
}
