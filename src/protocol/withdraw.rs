//! Withdraw steps and the fee-exhaustion handshake
//!
//! Ledger failures are classified:
//! - already known: the withdraw is in flight or done, treat as progress
//! - execution failed: wrong secret or spent escrow, log and park
//! - insufficient fee: ask the counter-party to withdraw for us, and watch
//!   for a fee deposit in parallel
//! - anything else: log and park until retried

use super::steps::*;
use crate::error::{LedgerError, SwapError, SwapResult};
use crate::flow::{Flow, StepMeta};
use crate::metrics::record_withdraw_outcome;
use crate::peer::SwapMessage;
use crate::retry::Attempt;
use crate::swap::Secret;

use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONTRACT_LEG: &str = "contract";
const SCRIPT_LEG: &str = "script";

/// Owner step: redeem the participant's escrow with the secret
pub(super) async fn withdraw_eth(flow: Arc<Flow>) -> SwapResult<()> {
    // A fee deposit sends the withdraw round again inside this run
    while attempt_eth_withdraw(&flow).await? {
        info!("Swap {}: fee deposited, retrying withdraw", flow.id());
    }
    Ok(())
}

/// One withdraw attempt. `Ok(true)` asks for another one.
async fn attempt_eth_withdraw(flow: &Arc<Flow>) -> SwapResult<bool> {
    let state = flow.state().await;
    if state.is_eth_withdrawn {
        flow.finish_step(StepMeta::silent(WITHDRAW_ETH), |_| {})
            .await?;
        return Ok(false);
    }
    if state.is_refunded {
        info!("Swap {}: script refunded, not withdrawing the escrow", flow.id());
        return Ok(false);
    }

    let secret = state
        .secret
        .ok_or_else(|| SwapError::Precondition("secret missing at withdraw".to_string()))?;
    let me = flow.identity().clone();
    let funder = flow.swap().counterparty.eth_address.clone();
    let contract = flow.legs().contract.clone();

    let locked = contract.get_balance(&me, &funder).await?;
    if locked.is_zero() && state.eth_withdraw_attempted {
        let tx_hash = state.eth_swap_withdraw_tx.clone();
        if withdrawn_by(flow, tx_hash.as_deref(), &secret).await {
            info!(
                "Swap {}: escrow already drained by an earlier withdraw",
                flow.id()
            );
            complete_eth_withdraw(flow, tx_hash, true).await?;
        } else {
            flow.protocol_error(
                "escrow_refunded",
                "escrow is empty and no withdraw of ours drained it",
            );
        }
        return Ok(false);
    }

    if let Some(reason) = contract
        .check_balance(&me, &funder, flow.swap().buy_amount, &secret.hash())
        .await?
    {
        flow.protocol_error("escrow_mismatch", reason);
        return Ok(false);
    }

    if flow.protocol().check_target_wallet {
        let expected = flow
            .swap()
            .destination_buy_address
            .clone()
            .unwrap_or_else(|| me.eth_address.clone());
        let actual = contract
            .get_target_wallet(&me, &funder)
            .await?
            .unwrap_or_else(|| me.eth_address.clone());
        if !actual.eq_ignore_ascii_case(&expected) {
            flow.protocol_error(
                "target_wallet_mismatch",
                format!("escrow pays {} instead of {}", actual, expected),
            );
            return Ok(false);
        }
    }

    // Claimed under the flow lock, so a refund and a withdraw never both start
    let claimed = flow
        .set_state(|s| {
            if s.is_refunded {
                return false;
            }
            s.eth_withdraw_attempted = true;
            true
        })
        .await?;
    if !claimed {
        return Ok(false);
    }

    match contract.withdraw(&me, &secret, &funder).await {
        Ok(tx) => {
            record_withdraw_outcome(CONTRACT_LEG, "ok");
            info!("Swap {}: withdrew escrow in {}", flow.id(), tx);
            complete_eth_withdraw(flow, Some(tx), true).await?;
            Ok(false)
        }
        Err(LedgerError::AlreadyKnown(msg)) => {
            record_withdraw_outcome(CONTRACT_LEG, "already_known");
            debug!("Swap {}: withdraw already known: {}", flow.id(), msg);
            complete_eth_withdraw(flow, None, true).await?;
            Ok(false)
        }
        Err(LedgerError::InsufficientFee(msg)) => {
            record_withdraw_outcome(CONTRACT_LEG, "insufficient_fee");
            warn!("Swap {}: cannot pay the withdraw fee: {}", flow.id(), msg);
            wait_for_withdraw_fee(flow).await
        }
        Err(e) => {
            record_withdraw_outcome(CONTRACT_LEG, e.label());
            warn!("Swap {}: withdraw failed, parking: {}", flow.id(), e);
            Ok(false)
        }
    }
}

/// Whether `tx_hash` is a withdraw that revealed our secret
async fn withdrawn_by(flow: &Flow, tx_hash: Option<&str>, secret: &Secret) -> bool {
    let Some(tx_hash) = tx_hash else {
        return false;
    };
    match flow
        .legs()
        .contract
        .get_secret_from_tx_hash(flow.identity(), tx_hash)
        .await
    {
        Ok(revealed) => revealed.as_ref() == Some(secret),
        Err(e) => {
            warn!("Swap {}: cannot read withdraw {}: {}", flow.id(), tx_hash, e);
            false
        }
    }
}

async fn complete_eth_withdraw(
    flow: &Arc<Flow>,
    tx_hash: Option<String>,
    announce: bool,
) -> SwapResult<()> {
    let advanced = flow
        .finish_step(StepMeta::silent(WITHDRAW_ETH), |s| {
            s.is_eth_withdrawn = true;
            s.require_withdraw_fee = false;
            if tx_hash.is_some() {
                s.eth_swap_withdraw_tx = tx_hash.clone();
            }
        })
        .await?;

    if advanced && announce {
        flow.send(SwapMessage::FinishEthWithdraw).await?;
        if let Some(tx_hash) = tx_hash {
            flow.send(SwapMessage::EthWithdrawTxHash { tx_hash }).await?;
        }
    }
    Ok(())
}

async fn wait_for_withdraw_fee(flow: &Arc<Flow>) -> SwapResult<bool> {
    let me = flow.identity().clone();
    let contract = flow.legs().contract.clone();

    let fee = match contract.calc_withdraw_fee(&me).await {
        Ok(fee) => fee,
        Err(e) => {
            warn!("Swap {}: cannot estimate withdraw fee: {}", flow.id(), e);
            U256::zero()
        }
    };
    flow.set_state(|s| {
        s.require_withdraw_fee = true;
        s.withdraw_fee = Some(fee);
    })
    .await?;

    if flow.config().withdraw_assist {
        flow.request_withdraw_assist().await?;
    }

    let deposited = flow
        .poll(WITHDRAW_ETH, flow.config().poll_interval(), || {
            let contract = contract.clone();
            let me = me.clone();
            async move {
                match contract.fetch_native_balance(&me).await {
                    Ok(balance) if !fee.is_zero() && balance >= fee => Attempt::Ready(()),
                    Ok(_) => Attempt::Retry,
                    Err(e) => {
                        debug!("Fee balance check failed: {}", e);
                        Attempt::Retry
                    }
                }
            }
        })
        .await;

    Ok(deposited.is_some() && flow.is_at(WITHDRAW_ETH).await)
}

/// Owner: the participant agreed to withdraw for us, hand over the secret
pub(super) async fn reveal_for_assisted_withdraw(flow: &Arc<Flow>) -> SwapResult<()> {
    let state = flow.state().await;
    if !state.require_withdraw_fee || state.is_eth_withdrawn {
        debug!("Swap {}: unsolicited withdraw acceptance", flow.id());
        return Ok(());
    }
    let (Some(secret), Some(secret_hash)) = (state.secret, state.secret_hash) else {
        return Ok(());
    };

    flow.set_state(|s| s.withdraw_request_accepted = true).await?;
    flow.send(SwapMessage::DoWithdraw {
        secret,
        secret_hash,
    })
    .await
}

/// Owner: the participant reports the assisted withdraw; trust the chain, not the message
pub(super) async fn confirm_assisted_withdraw(flow: &Arc<Flow>, tx_hash: String) -> SwapResult<()> {
    let state = flow.state().await;
    if !state.require_withdraw_fee || state.is_eth_withdrawn {
        return Ok(());
    }
    let Some(secret) = state.secret else {
        return Ok(());
    };

    let remaining = flow
        .legs()
        .contract
        .get_balance(flow.identity(), &flow.swap().counterparty.eth_address)
        .await?;
    if !remaining.is_zero() {
        warn!(
            "Swap {}: escrow still holds {} after reported withdraw {}",
            flow.id(),
            remaining,
            tx_hash
        );
        return Ok(());
    }
    if !withdrawn_by(flow, Some(tx_hash.as_str()), &secret).await {
        flow.protocol_error(
            "escrow_refunded",
            format!("{} is not a withdraw with our secret", tx_hash),
        );
        return Ok(());
    }

    info!("Swap {}: escrow withdrawn for us in {}", flow.id(), tx_hash);
    record_withdraw_outcome(CONTRACT_LEG, "assisted");
    complete_eth_withdraw(flow, Some(tx_hash), false).await
}

/// Participant: withdraw the owner's escrow on their behalf
pub(super) async fn withdraw_for_counterparty(flow: &Arc<Flow>, secret: Secret) -> SwapResult<()> {
    let state = flow.state().await;
    if !state.withdraw_request_incoming {
        warn!("Swap {}: ignoring unrequested withdraw", flow.id());
        return Ok(());
    }
    if state.secret_hash != Some(secret.hash()) {
        flow.protocol_error("secret_mismatch", "secret does not match the committed hash");
        return Ok(());
    }

    let me = flow.identity().clone();
    let owner = flow.swap().counterparty.eth_address.clone();

    let tx_hash = match flow
        .legs()
        .contract
        .withdraw_other(&me, &secret, &me.eth_address, &owner)
        .await
    {
        Ok(tx) => Some(tx),
        Err(LedgerError::AlreadyKnown(_)) => None,
        Err(e) => {
            record_withdraw_outcome(CONTRACT_LEG, e.label());
            warn!("Swap {}: assisted withdraw failed: {}", flow.id(), e);
            return Ok(());
        }
    };
    record_withdraw_outcome(CONTRACT_LEG, "withdraw_other");

    flow.set_state(|s| {
        s.withdraw_request_incoming = false;
        if tx_hash.is_some() {
            s.eth_swap_withdraw_tx = tx_hash.clone();
        }
    })
    .await?;

    if let Some(tx_hash) = tx_hash {
        flow.send(SwapMessage::EthWithdrawTxHash { tx_hash }).await?;
    }

    flow.finish_step(StepMeta::silent(WAIT_WITHDRAW_ETH), |s| {
        s.secret.get_or_insert(secret);
    })
    .await?;
    Ok(())
}

/// Participant step: redeem the owner's script with the revealed secret
pub(super) async fn withdraw_script(flow: Arc<Flow>) -> SwapResult<()> {
    let state = flow.state().await;
    if state.is_script_withdrawn {
        flow.finish_step(StepMeta::silent(WITHDRAW_SCRIPT), |_| {})
            .await?;
        return Ok(());
    }

    let values = state
        .script_values
        .clone()
        .ok_or_else(|| SwapError::Precondition("script values missing".to_string()))?;
    let secret = state
        .secret
        .ok_or_else(|| SwapError::Precondition("secret missing at withdraw".to_string()))?;
    let me = flow.identity().clone();
    let script = flow.legs().script.clone();

    if state.script_withdraw_attempted
        && !script.check_script_funded(&me, &values, U256::one()).await?
    {
        info!("Swap {}: script already spent by an earlier withdraw", flow.id());
        return complete_script_withdraw(&flow, state.script_withdraw_tx.clone()).await;
    }

    flow.set_state(|s| s.script_withdraw_attempted = true).await?;

    let destination = flow.swap().destination_buy_address.clone();
    match script.withdraw(&me, &values, &secret, destination).await {
        Ok(tx) => {
            record_withdraw_outcome(SCRIPT_LEG, "ok");
            info!("Swap {}: withdrew script in {}", flow.id(), tx);
            complete_script_withdraw(&flow, Some(tx)).await
        }
        Err(LedgerError::AlreadyKnown(msg)) => {
            record_withdraw_outcome(SCRIPT_LEG, "already_known");
            debug!("Swap {}: script withdraw already known: {}", flow.id(), msg);
            complete_script_withdraw(&flow, None).await
        }
        Err(e) => {
            record_withdraw_outcome(SCRIPT_LEG, e.label());
            warn!("Swap {}: script withdraw failed, parking: {}", flow.id(), e);
            Ok(())
        }
    }
}

async fn complete_script_withdraw(flow: &Arc<Flow>, tx_hash: Option<String>) -> SwapResult<()> {
    flow.finish_step(StepMeta::silent(WITHDRAW_SCRIPT), |s| {
        s.is_script_withdrawn = true;
        if tx_hash.is_some() {
            s.script_withdraw_tx = tx_hash;
        }
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{AdapterSet, MockContractLeg};
    use crate::flow::{FlowEvent, FlowRecord, FlowState};
    use crate::peer::{PeerChannel, Subscription};
    use crate::protocol::ProtocolDescriptor;
    use crate::state::StateStore;
    use crate::swap::Asset;
    use crate::testing::{owner_swap, wait_until, Harness, BUY_UNITS, SWAP_ID};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    /// Owner flow resumed at withdraw-eth over a mocked escrow contract
    async fn owner_at_withdraw(harness: &Harness, contract: MockContractLeg) -> Arc<Flow> {
        let swap = owner_swap();
        let secret = Secret::random();
        let mut record = FlowRecord::new(swap.clone(), "BTC2USDT");
        record.step = 6;
        record.state = FlowState {
            is_participant_signed: true,
            secret: Some(secret),
            secret_hash: Some(secret.hash()),
            is_script_funded: true,
            is_eth_contract_funded: true,
            ..Default::default()
        };
        harness.owner_store.save(&swap.id, &record).await.unwrap();

        let adapters = AdapterSet::new()
            .with_script(Asset::Btc, harness.btc.clone())
            .with_contract(Asset::Token("USDT".into()), Arc::new(contract));
        let protocol = Arc::new(ProtocolDescriptor::for_swap(&swap).unwrap());
        let flow = Flow::new(swap, protocol, harness.owner_context_with(adapters))
            .await
            .unwrap();
        flow.start().await.unwrap();
        flow
    }

    fn funded_escrow() -> MockContractLeg {
        let mut contract = MockContractLeg::new();
        contract
            .expect_get_balance()
            .returning(|_, _| Ok(U256::from(BUY_UNITS)));
        contract.expect_check_balance().returning(|_, _, _, _| Ok(None));
        contract.expect_get_target_wallet().returning(|_, _| Ok(None));
        contract
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_known_counts_as_withdrawn() {
        let harness = Harness::new();
        let mut contract = funded_escrow();
        contract
            .expect_withdraw()
            .times(1)
            .returning(|_, _, _| Err(LedgerError::AlreadyKnown("known transaction".into())));

        let flow = owner_at_withdraw(&harness, contract).await;
        wait_until(|| async { flow.step().await == 7 }).await;

        let state = flow.state().await;
        assert!(state.is_eth_withdrawn);
        assert!(state.eth_withdraw_attempted);
        assert!(state.eth_swap_withdraw_tx.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_failure_parks() {
        let harness = Harness::new();
        let mut contract = funded_escrow();
        contract
            .expect_withdraw()
            .times(1)
            .returning(|_, _, _| Err(LedgerError::ExecutionFailed("execution reverted".into())));

        let flow = owner_at_withdraw(&harness, contract).await;
        wait_until(|| async { flow.state().await.eth_withdraw_attempted }).await;
        sleep(Duration::from_secs(60)).await;

        let state = flow.state().await;
        assert_eq!(flow.step().await, 6);
        assert!(!state.is_eth_withdrawn);
        assert!(!state.require_withdraw_fee);
        flow.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_fee_requests_assist() {
        let harness = Harness::new();
        let mut contract = funded_escrow();
        contract
            .expect_withdraw()
            .times(1)
            .returning(|_, _, _| Err(LedgerError::InsufficientFee("insufficient funds".into())));
        contract
            .expect_calc_withdraw_fee()
            .returning(|_| Ok(U256::from(21_000u64)));
        contract
            .expect_fetch_native_balance()
            .returning(|_| Ok(U256::zero()));

        let mut requests = Subscription::new(SWAP_ID, harness.participant_peer.subscribe());
        let flow = owner_at_withdraw(&harness, contract).await;

        let hash = requests
            .once(|m| match m {
                SwapMessage::RequestWithdraw { secret_hash } => Some(*secret_hash),
                _ => None,
            })
            .await
            .unwrap();
        assert_eq!(Some(hash), flow.state().await.secret_hash);

        let state = flow.state().await;
        assert!(state.require_withdraw_fee);
        assert!(state.withdraw_request_sent);
        assert_eq!(state.withdraw_fee, Some(U256::from(21_000u64)));
        assert_eq!(flow.step().await, 6);

        // A second request is never sent
        assert!(!flow.request_withdraw_assist().await.unwrap());
        flow.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_escrow_after_attempt_completes() {
        let harness = Harness::new();
        let secret = Secret::random();
        let mut contract = MockContractLeg::new();
        contract.expect_get_balance().returning(|_, _| Ok(U256::zero()));
        contract
            .expect_get_secret_from_tx_hash()
            .withf(|_, tx| tx == "0xabc")
            .returning(move |_, _| Ok(Some(secret)));
        contract.expect_withdraw().never();

        let swap = owner_swap();
        let mut record = FlowRecord::new(swap.clone(), "BTC2USDT");
        record.step = 6;
        record.state = FlowState {
            secret: Some(secret),
            secret_hash: Some(secret.hash()),
            eth_withdraw_attempted: true,
            eth_swap_withdraw_tx: Some("0xabc".into()),
            ..Default::default()
        };
        harness.owner_store.save(&swap.id, &record).await.unwrap();

        let adapters = AdapterSet::new()
            .with_script(Asset::Btc, harness.btc.clone())
            .with_contract(Asset::Token("USDT".into()), Arc::new(contract));
        let protocol = Arc::new(ProtocolDescriptor::for_swap(&swap).unwrap());
        let flow = Flow::new(swap, protocol, harness.owner_context_with(adapters))
            .await
            .unwrap();
        flow.start().await.unwrap();

        wait_until(|| async { flow.step().await == 7 }).await;
        let state = flow.state().await;
        assert!(state.is_eth_withdrawn);
        assert_eq!(state.eth_swap_withdraw_tx.as_deref(), Some("0xabc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refunded_escrow_is_not_a_withdraw() {
        let harness = Harness::new();
        let balance_reads = Arc::new(AtomicUsize::new(0));

        let mut contract = MockContractLeg::new();
        let reads = balance_reads.clone();
        // Funded for the first attempt, refunded by the participant after it
        contract.expect_get_balance().returning(move |_, _| {
            if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(U256::from(BUY_UNITS))
            } else {
                Ok(U256::zero())
            }
        });
        contract.expect_check_balance().returning(|_, _, _, _| Ok(None));
        contract.expect_get_target_wallet().returning(|_, _| Ok(None));
        contract
            .expect_withdraw()
            .times(1)
            .returning(|_, _, _| Err(LedgerError::InsufficientFee("insufficient funds".into())));
        contract
            .expect_calc_withdraw_fee()
            .returning(|_| Ok(U256::from(21_000u64)));
        contract
            .expect_fetch_native_balance()
            .returning(|_| Ok(U256::from(21_000u64)));

        let flow = owner_at_withdraw(&harness, contract).await;
        wait_until(|| async { balance_reads.load(Ordering::SeqCst) >= 2 }).await;
        sleep(Duration::from_secs(60)).await;

        let state = flow.state().await;
        assert_eq!(flow.step().await, 6);
        assert!(state.eth_withdraw_attempted);
        assert!(!state.is_eth_withdrawn);
        assert!(state.eth_swap_withdraw_tx.is_none());

        // The parked step re-runs, and still does not count the refund as ours
        flow.retry_step().await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(flow.step().await, 6);
        assert!(!flow.state().await.is_eth_withdrawn);
        flow.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_escrow_with_foreign_tx_parks() {
        let harness = Harness::new();
        let mut contract = MockContractLeg::new();
        contract.expect_get_balance().returning(|_, _| Ok(U256::zero()));
        contract
            .expect_get_secret_from_tx_hash()
            .returning(|_, _| Ok(Some(Secret::random())));
        contract.expect_withdraw().never();

        let swap = owner_swap();
        let secret = Secret::random();
        let mut record = FlowRecord::new(swap.clone(), "BTC2USDT");
        record.step = 6;
        record.state = FlowState {
            secret: Some(secret),
            secret_hash: Some(secret.hash()),
            eth_withdraw_attempted: true,
            eth_swap_withdraw_tx: Some("0xdef".into()),
            ..Default::default()
        };
        harness.owner_store.save(&swap.id, &record).await.unwrap();

        let adapters = AdapterSet::new()
            .with_script(Asset::Btc, harness.btc.clone())
            .with_contract(Asset::Token("USDT".into()), Arc::new(contract));
        let protocol = Arc::new(ProtocolDescriptor::for_swap(&swap).unwrap());
        let flow = Flow::new(swap, protocol, harness.owner_context_with(adapters))
            .await
            .unwrap();
        let mut events = flow.events();
        flow.start().await.unwrap();

        loop {
            if let FlowEvent::ProtocolError { kind, .. } = events.recv().await.unwrap() {
                assert_eq!(kind, "escrow_refunded");
                break;
            }
        }
        assert_eq!(flow.step().await, 6);
        assert!(!flow.state().await.is_eth_withdrawn);
        flow.stop();
    }
}
