//! Swap protocols
//!
//! Every direction shares the same eight-step shape. The owner funds the
//! script leg and holds the secret; the participant funds the contract leg.
//!
//! | # | owner          | participant       |
//! |---|----------------|-------------------|
//! | 1 | sign           | sign              |
//! | 2 | submit-secret  | wait-lock-script  |
//! | 3 | sync-balance   | verify-script     |
//! | 4 | lock-script    | sync-balance      |
//! | 5 | wait-lock-eth  | lock-eth          |
//! | 6 | withdraw-eth   | wait-withdraw-eth |
//! | 7 | finish         | withdraw-script   |
//! | 8 | end            | finish            |

mod common;
mod owner;
mod participant;
#[cfg(test)]
mod scenarios;
mod withdraw;

use crate::error::{SwapError, SwapResult};
use crate::flow::Flow;
use crate::peer::SwapMessage;
use crate::swap::{Asset, Role, Swap};

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub mod steps {
    pub const SIGN: &str = "sign";
    pub const SUBMIT_SECRET: &str = "submit-secret";
    pub const SYNC_BALANCE: &str = "sync-balance";
    pub const LOCK_SCRIPT: &str = "lock-script";
    pub const WAIT_LOCK_ETH: &str = "wait-lock-eth";
    pub const WITHDRAW_ETH: &str = "withdraw-eth";
    pub const WAIT_LOCK_SCRIPT: &str = "wait-lock-script";
    pub const VERIFY_SCRIPT: &str = "verify-script";
    pub const LOCK_ETH: &str = "lock-eth";
    pub const WAIT_WITHDRAW_ETH: &str = "wait-withdraw-eth";
    pub const WITHDRAW_SCRIPT: &str = "withdraw-script";
    pub const FINISH: &str = "finish";
    pub const END: &str = "end";
}

pub type StepAction = Arc<dyn Fn(Arc<Flow>) -> BoxFuture<'static, SwapResult<()>> + Send + Sync>;

pub type MessageHandler =
    Arc<dyn Fn(Arc<Flow>, SwapMessage) -> BoxFuture<'static, SwapResult<()>> + Send + Sync>;

pub struct StepDef {
    pub name: &'static str,
    pub action: StepAction,
}

fn step<F, Fut>(name: &'static str, action: F) -> StepDef
where
    F: Fn(Arc<Flow>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwapResult<()>> + Send + 'static,
{
    StepDef {
        name,
        action: Arc::new(move |flow| action(flow).boxed()),
    }
}

fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Arc<Flow>, SwapMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwapResult<()>> + Send + 'static,
{
    Arc::new(move |flow, message| f(flow, message).boxed())
}

/// One direction of a swap, seen from one role
pub struct ProtocolDescriptor {
    /// e.g. `BTC2USDT`
    pub name: String,
    pub role: Role,
    pub sell: Asset,
    pub buy: Asset,
    /// Token escrows carry a payout address that the owner must verify
    pub check_target_wallet: bool,
    pub steps: Vec<StepDef>,
    pub on_message: MessageHandler,
}

impl fmt::Debug for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDescriptor")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl ProtocolDescriptor {
    fn owner(sell: Asset, buy: Asset) -> Self {
        Self {
            name: format!("{}2{}", sell, buy),
            role: Role::Owner,
            check_target_wallet: buy.is_token(),
            sell,
            buy,
            steps: vec![
                step(steps::SIGN, owner::sign),
                step(steps::SUBMIT_SECRET, owner::submit_secret),
                step(steps::SYNC_BALANCE, owner::sync_balance),
                step(steps::LOCK_SCRIPT, owner::lock_script),
                step(steps::WAIT_LOCK_ETH, owner::wait_lock_eth),
                step(steps::WITHDRAW_ETH, withdraw::withdraw_eth),
                step(steps::FINISH, owner::finish),
                step(steps::END, owner::end),
            ],
            on_message: handler(owner::on_message),
        }
    }

    fn participant(sell: Asset, buy: Asset) -> Self {
        Self {
            name: format!("{}2{}", sell, buy),
            role: Role::Participant,
            check_target_wallet: sell.is_token(),
            sell,
            buy,
            steps: vec![
                step(steps::SIGN, participant::sign),
                step(steps::WAIT_LOCK_SCRIPT, participant::wait_lock_script),
                step(steps::VERIFY_SCRIPT, participant::verify_script),
                step(steps::SYNC_BALANCE, participant::sync_balance),
                step(steps::LOCK_ETH, participant::lock_eth),
                step(steps::WAIT_WITHDRAW_ETH, participant::wait_withdraw_eth),
                step(steps::WITHDRAW_SCRIPT, withdraw::withdraw_script),
                step(steps::FINISH, participant::finish),
            ],
            on_message: handler(participant::on_message),
        }
    }

    /// Owner selling BTC for a contract-chain token
    pub fn btc_to_token(token: &str) -> Self {
        Self::owner(Asset::Btc, Asset::Token(token.to_uppercase()))
    }

    /// Owner selling BCH for ETH
    pub fn bch_to_eth() -> Self {
        Self::owner(Asset::Bch, Asset::Eth)
    }

    /// Participant selling a token for BTC
    pub fn token_to_btc(token: &str) -> Self {
        Self::participant(Asset::Token(token.to_uppercase()), Asset::Btc)
    }

    /// Pick the protocol matching a swap's role and pair
    pub fn for_swap(swap: &Swap) -> SwapResult<Self> {
        let sell = &swap.sell_asset;
        let buy = &swap.buy_asset;
        match swap.role {
            Role::Owner if sell.is_script_asset() && buy.is_contract_asset() => {
                Ok(Self::owner(sell.clone(), buy.clone()))
            }
            Role::Participant if sell.is_contract_asset() && buy.is_script_asset() => {
                Ok(Self::participant(sell.clone(), buy.clone()))
            }
            role => Err(SwapError::Config(format!(
                "No {:?} protocol for {} -> {}",
                role, sell, buy
            ))),
        }
    }

    /// Step definition by 1-based index
    pub fn step(&self, index: u8) -> Option<&StepDef> {
        (index as usize)
            .checked_sub(1)
            .and_then(|i| self.steps.get(i))
    }

    pub fn step_name(&self, index: u8) -> Option<&'static str> {
        self.step(index).map(|s| s.name)
    }

    /// 1-based index of a named step
    pub fn step_index(&self, name: &str) -> Option<u8> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .map(|i| (i + 1) as u8)
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{owner_swap, participant_swap};

    #[test]
    fn test_shared_shape() {
        let owner = ProtocolDescriptor::btc_to_token("usdt");
        assert_eq!(owner.name, "BTC2USDT");
        assert!(owner.check_target_wallet);
        assert_eq!(owner.steps.len(), 8);
        assert_eq!(owner.step_index(steps::WITHDRAW_ETH), Some(6));
        assert_eq!(owner.step_name(8), Some(steps::END));
        assert_eq!(owner.step_name(0), None);
        assert_eq!(owner.step_name(9), None);

        let bch = ProtocolDescriptor::bch_to_eth();
        assert_eq!(bch.name, "BCH2ETH");
        assert!(!bch.check_target_wallet);

        let participant = ProtocolDescriptor::token_to_btc("USDT");
        assert_eq!(participant.name, "USDT2BTC");
        assert_eq!(participant.role, Role::Participant);
        assert_eq!(participant.step_index(steps::SYNC_BALANCE), Some(4));
        assert_eq!(participant.step_name(8), Some(steps::FINISH));
    }

    #[test]
    fn test_for_swap_checks_role_and_pair() {
        let owner = owner_swap();
        assert_eq!(ProtocolDescriptor::for_swap(&owner).unwrap().name, "BTC2USDT");

        let participant = participant_swap(&owner);
        assert_eq!(
            ProtocolDescriptor::for_swap(&participant).unwrap().name,
            "USDT2BTC"
        );

        let mut wrong = owner.clone();
        wrong.role = Role::Participant;
        assert!(matches!(
            ProtocolDescriptor::for_swap(&wrong),
            Err(SwapError::Config(_))
        ));
    }
}
