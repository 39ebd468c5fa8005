//! Local devnet
//!
//! Wires two swap hosts (owner and participant) to simulated ledgers and an
//! in-process peer room, so a full swap can run inside one binary.

mod ledger;

pub use ledger::{Escrow, SimContractChain, SimScriptChain};

use crate::chain::AdapterSet;
use crate::config::{DevnetConfig, Settings};
use crate::error::SwapResult;
use crate::flow::SwapContext;
use crate::host::{HostRegistry, SwapHost};
use crate::peer::LocalRoom;
use crate::retry::GenerationRegistry;
use crate::state::open_store;
use crate::swap::{Asset, Identity, Role, Swap};

use bitcoin::hashes::{hash160, Hash};
use ethers::types::{Address, U256};
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use tracing::info;

/// Deterministic keys and addresses for a devnet peer
pub fn devnet_identity(peer_id: &str) -> Identity {
    let key_hash = hash160::Hash::hash(peer_id.as_bytes()).to_byte_array();
    let eth_hash = Keccak256::digest(peer_id.as_bytes());
    let eth_address = Address::from_slice(&eth_hash[12..]);

    Identity {
        peer_id: peer_id.to_string(),
        script_address: format!("{}-wallet", peer_id),
        script_public_key: format!("02{}{}", hex::encode(key_hash), hex::encode(&key_hash[..12])),
        eth_address: format!("{:?}", eth_address),
    }
}

/// Simulated chains served to both hosts
pub struct DevnetChains {
    pub btc: Arc<SimScriptChain>,
    pub bch: Arc<SimScriptChain>,
    pub eth: Arc<SimContractChain>,
    pub token: Arc<SimContractChain>,
}

impl DevnetChains {
    pub fn new(config: &DevnetConfig) -> Self {
        Self {
            btc: Arc::new(SimScriptChain::new(Asset::Btc)),
            bch: Arc::new(SimScriptChain::new(Asset::Bch)),
            eth: Arc::new(SimContractChain::new(
                Asset::Eth,
                config.withdraw_fee,
                config.refund_after_secs,
            )),
            token: Arc::new(SimContractChain::new(
                Asset::Token(config.token.to_uppercase()),
                config.withdraw_fee,
                config.refund_after_secs,
            )),
        }
    }

    pub fn adapters(&self) -> AdapterSet {
        AdapterSet::new()
            .with_script(Asset::Btc, self.btc.clone())
            .with_script(Asset::Bch, self.bch.clone())
            .with_contract(Asset::Eth, self.eth.clone())
            .with_contract(self.token.asset().clone(), self.token.clone())
    }
}

/// Two hosts sharing one room and one set of chains
pub struct Devnet {
    pub chains: DevnetChains,
    pub room: LocalRoom,
    pub generations: Arc<GenerationRegistry>,
    pub hosts: Arc<HostRegistry>,
    pub owner: Identity,
    pub participant: Identity,
    config: DevnetConfig,
}

impl Devnet {
    /// Build the devnet and resume whatever the stores hold
    pub async fn new(settings: &Settings) -> SwapResult<Self> {
        let config = settings.devnet.clone();
        let chains = DevnetChains::new(&config);
        let owner = devnet_identity(&config.owner_peer);
        let participant = devnet_identity(&config.participant_peer);

        chains.btc.credit(&owner.script_address, config.owner_script_funds);
        chains.bch.credit(&owner.script_address, config.owner_script_funds);
        chains.token.credit(&participant.eth_address, config.participant_token_funds);
        chains.eth.credit(&participant.eth_address, config.participant_token_funds);
        for chain in [&chains.token, &chains.eth] {
            chain.credit_native(&owner.eth_address, config.owner_gas);
            chain.credit_native(&participant.eth_address, config.participant_gas);
        }

        let room = LocalRoom::new();
        let generations = Arc::new(GenerationRegistry::new());
        let adapters = Arc::new(chains.adapters());
        let hosts = Arc::new(HostRegistry::new());

        for identity in [&owner, &participant] {
            let ctx = SwapContext {
                identity: identity.clone(),
                room: Arc::new(room.join(identity.peer_id.clone())),
                store: open_store(&settings.store, &identity.peer_id).await?,
                generations: generations.clone(),
                adapters: adapters.clone(),
                config: settings.flow.clone(),
            };
            info!(
                "Devnet peer {} (script {}, eth {})",
                identity.peer_id, identity.script_address, identity.eth_address
            );
            hosts.insert(identity.peer_id.clone(), Arc::new(SwapHost::new(ctx)));
        }

        let devnet = Self {
            chains,
            room,
            generations,
            hosts,
            owner,
            participant,
            config,
        };
        devnet.restore().await?;
        Ok(devnet)
    }

    async fn restore(&self) -> SwapResult<usize> {
        let mut resumed = 0;
        // The participant listens before the owner starts talking
        for peer in [&self.participant.peer_id, &self.owner.peer_id] {
            if let Some(host) = self.host(peer) {
                resumed += host.restore().await?;
            }
        }
        Ok(resumed)
    }

    pub fn host(&self, peer_id: &str) -> Option<Arc<SwapHost>> {
        self.hosts.get(peer_id).map(|h| h.clone())
    }

    /// Both sides of one BTC -> token swap
    pub fn demo_swap_pair(&self) -> (Swap, Swap) {
        let id = Swap::new_id();
        let owner_swap = Swap {
            id: id.clone(),
            role: Role::Owner,
            sell_asset: Asset::Btc,
            sell_amount: U256::from(self.config.sell_amount),
            buy_asset: self.chains.token.asset().clone(),
            buy_amount: U256::from(self.config.buy_amount),
            counterparty: self.participant.clone(),
            destination_buy_address: None,
            destination_sell_address: None,
        };
        let participant_swap = Swap {
            id,
            role: Role::Participant,
            sell_asset: owner_swap.buy_asset.clone(),
            sell_amount: owner_swap.buy_amount,
            buy_asset: owner_swap.sell_asset.clone(),
            buy_amount: owner_swap.sell_amount,
            counterparty: self.owner.clone(),
            destination_buy_address: None,
            destination_sell_address: None,
        };
        (owner_swap, participant_swap)
    }

    /// Start a demo swap on both hosts
    pub async fn start_demo(&self) -> SwapResult<String> {
        let (owner_swap, participant_swap) = self.demo_swap_pair();
        let id = owner_swap.id.clone();

        if let Some(host) = self.host(&self.participant.peer_id) {
            host.start_swap(participant_swap).await?;
        }
        if let Some(host) = self.host(&self.owner.peer_id) {
            host.start_swap(owner_swap).await?;
        }

        info!("Demo swap {} started", id);
        Ok(id)
    }

    pub fn stop(&self) {
        for host in self.hosts.iter() {
            host.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_until;

    #[test]
    fn test_identity_is_deterministic() {
        let a = devnet_identity("owner");
        let b = devnet_identity("owner");
        assert_eq!(a, b);
        assert!(a.validate().is_ok());
        assert!(a.eth_address.parse::<Address>().is_ok());
        assert_ne!(a.eth_address, devnet_identity("participant").eth_address);
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_swap_completes() {
        let mut settings = Settings::parse(
            r#"
            [flow]
            poll_interval_ms = 1000
            auto_secret = true

            [api]
            host = "127.0.0.1"
            port = 0

            [metrics]
            enabled = false
            port = 0
            "#,
        )
        .unwrap();
        settings.devnet.withdraw_fee = 100;

        let devnet = Devnet::new(&settings).await.unwrap();
        let id = devnet.start_demo().await.unwrap();

        let owner = devnet.host("owner").unwrap().get(&id).unwrap();
        let participant = devnet.host("participant").unwrap().get(&id).unwrap();
        wait_until(|| async {
            owner.state().await.is_finished && participant.state().await.is_finished
        })
        .await;

        let config = &settings.devnet;
        assert_eq!(
            devnet.chains.token.balance_of(&devnet.owner.eth_address),
            U256::from(config.buy_amount)
        );
        assert_eq!(
            devnet.chains.btc.balance_of(&devnet.participant.script_address),
            U256::from(config.sell_amount)
        );
        devnet.stop();
    }
}
