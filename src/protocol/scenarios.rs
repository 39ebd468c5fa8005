//! Two-party runs over the simulated chains

use super::{steps, ProtocolDescriptor};
use crate::chain::ScriptLeg;
use crate::devnet::SimScriptChain;
use crate::error::{LedgerResult, SwapError};
use crate::flow::{Flow, FlowEvent, FlowRecord, FlowState};
use crate::peer::{PeerChannel, SwapMessage};
use crate::state::StateStore;
use crate::swap::{Asset, Identity, ScriptValues, Secret};
use crate::testing::{
    owner_swap, participant_swap, wait_until, Harness, BUY_UNITS, SELL_SATS, SWAP_ID,
    WITHDRAW_FEE,
};

use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Script chain whose funding transaction takes a while to go out
struct SlowFunding {
    inner: Arc<SimScriptChain>,
    delay: Duration,
}

#[async_trait]
impl ScriptLeg for SlowFunding {
    async fn fetch_balance(&self, who: &Identity) -> LedgerResult<U256> {
        self.inner.fetch_balance(who).await
    }

    async fn create_script(&self, who: &Identity, values: &ScriptValues) -> LedgerResult<String> {
        self.inner.create_script(who, values).await
    }

    async fn fund_script(
        &self,
        who: &Identity,
        values: &ScriptValues,
        amount: U256,
    ) -> LedgerResult<String> {
        sleep(self.delay).await;
        self.inner.fund_script(who, values, amount).await
    }

    async fn check_script_funded(
        &self,
        who: &Identity,
        values: &ScriptValues,
        amount: U256,
    ) -> LedgerResult<bool> {
        self.inner.check_script_funded(who, values, amount).await
    }

    async fn withdraw(
        &self,
        who: &Identity,
        values: &ScriptValues,
        secret: &Secret,
        destination: Option<String>,
    ) -> LedgerResult<String> {
        self.inner.withdraw(who, values, secret, destination).await
    }

    async fn get_refund_hex_transaction(
        &self,
        who: &Identity,
        values: &ScriptValues,
    ) -> LedgerResult<String> {
        self.inner.get_refund_hex_transaction(who, values).await
    }

    async fn refund(&self, who: &Identity, values: &ScriptValues) -> LedgerResult<String> {
        self.inner.refund(who, values).await
    }
}

async fn announce_escrow(harness: &Harness, tx_hash: &str) {
    harness
        .participant_peer
        .send_to(
            &harness.owner.peer_id,
            SWAP_ID,
            SwapMessage::CreateEthContract {
                tx_hash: tx_hash.to_string(),
            },
        )
        .await
        .unwrap();
}

async fn start_pair(harness: &Harness) -> (Arc<Flow>, Arc<Flow>) {
    let owner_swap = owner_swap();
    let participant = harness
        .participant_flow(participant_swap(&owner_swap))
        .await;
    let owner = harness.owner_flow(owner_swap).await;

    participant.start().await.unwrap();
    owner.start().await.unwrap();
    (owner, participant)
}

async fn wait_finished(owner: &Flow, participant: &Flow) {
    wait_until(|| async {
        owner.state().await.is_finished && participant.state().await.is_finished
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_btc_for_token_happy_path() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.fund_btc_usdt();

    let (owner, participant) = start_pair(&harness).await;
    wait_finished(&owner, &participant).await;

    assert_eq!(
        harness.btc.balance_of(&harness.participant.script_address),
        U256::from(SELL_SATS)
    );
    assert_eq!(
        harness.btc.balance_of(&harness.owner.script_address),
        U256::from(1_000_000 - SELL_SATS)
    );
    assert_eq!(
        harness.usdt.balance_of(&harness.owner.eth_address),
        U256::from(BUY_UNITS)
    );

    let owner_state = owner.state().await;
    assert!(owner_state.is_eth_withdrawn);
    assert!(owner_state.is_counterparty_finished);
    assert!(!owner_state.require_withdraw_fee);
    assert_eq!(owner.step().await, 8);

    let participant_state = participant.state().await;
    assert!(participant_state.is_script_verified);
    assert!(participant_state.is_script_withdrawn);
    assert_eq!(participant_state.secret, owner_state.secret);
    assert_eq!(harness.btc.calls("fund_script"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_secret_submitted_by_operator() {
    let harness = Harness::new();
    harness.fund_btc_usdt();

    let (owner, participant) = start_pair(&harness).await;
    wait_until(|| async { owner.is_at(steps::SUBMIT_SECRET).await }).await;
    assert!(owner.state().await.is_participant_signed);

    let secret = Secret::random();
    let hash = owner.submit_secret(secret).await.unwrap();
    assert_eq!(hash, secret.hash());

    wait_finished(&owner, &participant).await;
    assert_eq!(participant.state().await.secret, Some(secret));
}

#[tokio::test(start_paused = true)]
async fn test_deposit_into_script_skips_funding() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.usdt.credit(&harness.participant.eth_address, 100_000_000u64);
    harness.usdt.credit_native(&harness.owner.eth_address, 1_000_000u64);

    let (owner, participant) = start_pair(&harness).await;
    wait_until(|| async { owner.state().await.script_address.is_some() }).await;

    let state = owner.state().await;
    assert!(owner.is_at(steps::SYNC_BALANCE).await);
    assert!(!state.is_balance_enough);
    assert_eq!(state.balance, Some(U256::zero()));

    let values = state.script_values.clone().unwrap();
    let address = harness.btc.deposit_to_script(&values, SELL_SATS);
    assert_eq!(Some(address), state.script_address);

    wait_finished(&owner, &participant).await;
    assert_eq!(harness.btc.calls("fund_script"), 0);
    assert_eq!(
        harness.btc.balance_of(&harness.participant.script_address),
        U256::from(SELL_SATS)
    );
}

#[tokio::test(start_paused = true)]
async fn test_sync_balance_after_wallet_top_up() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;

    let (owner, _participant) = start_pair(&harness).await;
    wait_until(|| async { owner.state().await.script_address.is_some() }).await;

    harness.btc.credit(&harness.owner.script_address, 1_000_000u64);
    owner.sync_balance().await.unwrap();

    wait_until(|| async { owner.step().await >= 5 }).await;
    let state = owner.state().await;
    assert!(state.is_balance_enough);
    assert!(state.is_script_funded);
    assert_eq!(harness.btc.calls("fund_script"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fee_exhaustion_assisted_withdraw() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.btc.credit(&harness.owner.script_address, 1_000_000u64);
    harness.usdt.credit(&harness.participant.eth_address, 100_000_000u64);
    harness.usdt.credit_native(&harness.participant.eth_address, 1_000_000u64);

    let (owner, participant) = start_pair(&harness).await;
    wait_finished(&owner, &participant).await;

    // Paid out to the owner, fee paid by the participant
    assert_eq!(
        harness.usdt.balance_of(&harness.owner.eth_address),
        U256::from(BUY_UNITS)
    );
    assert_eq!(
        harness.usdt.native_balance_of(&harness.participant.eth_address),
        U256::from(1_000_000u64 - WITHDRAW_FEE)
    );
    assert_eq!(harness.usdt.calls("withdraw_other"), 1);

    let owner_state = owner.state().await;
    assert!(owner_state.withdraw_request_sent);
    assert!(owner_state.withdraw_request_accepted);
    assert!(owner_state.is_eth_withdrawn);
    assert_eq!(owner_state.withdraw_fee, Some(U256::from(WITHDRAW_FEE)));
    assert!(owner_state.eth_swap_withdraw_tx.is_some());

    let participant_state = participant.state().await;
    assert!(!participant_state.withdraw_request_incoming);
    assert!(participant_state.is_script_withdrawn);
}

#[tokio::test(start_paused = true)]
async fn test_fee_deposit_retries_withdraw() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.config.withdraw_assist = false;
    harness.btc.credit(&harness.owner.script_address, 1_000_000u64);
    harness.usdt.credit(&harness.participant.eth_address, 100_000_000u64);

    let (owner, participant) = start_pair(&harness).await;
    wait_until(|| async { owner.state().await.require_withdraw_fee }).await;
    assert!(owner.is_at(steps::WITHDRAW_ETH).await);
    assert!(!owner.state().await.withdraw_request_sent);

    harness
        .usdt
        .credit_native(&harness.owner.eth_address, WITHDRAW_FEE);
    wait_finished(&owner, &participant).await;

    assert_eq!(harness.usdt.calls("withdraw_other"), 0);
    assert!(harness
        .usdt
        .native_balance_of(&harness.owner.eth_address)
        .is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_open_escrow_blocks_sign_until_refund() {
    let harness = Harness::new();
    harness.fund_btc_usdt();
    harness.usdt.open_escrow(
        &harness.participant.eth_address,
        &harness.owner.eth_address,
        1_000u64,
        Secret::random().hash(),
        None,
    );

    let (owner, participant) = start_pair(&harness).await;
    wait_until(|| async { owner.state().await.is_swap_exist }).await;
    assert!(participant.state().await.is_swap_exist);
    assert!(owner.is_at(steps::SIGN).await);
    assert!(participant.is_at(steps::SIGN).await);

    participant.try_refund().await.unwrap();

    wait_until(|| async { owner.step().await == 2 }).await;
    let owner_state = owner.state().await;
    assert!(owner_state.is_participant_signed);
    assert!(!owner_state.is_swap_exist);

    let participant_state = participant.state().await;
    assert!(participant_state.is_signed);
    assert!(participant_state.refund_tx.is_some());
    assert!(harness
        .usdt
        .escrow(&harness.participant.eth_address, &harness.owner.eth_address)
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_from_store() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.btc.credit(&harness.owner.script_address, 1_000_000u64);
    harness.usdt.credit_native(&harness.owner.eth_address, 1_000_000u64);

    let (owner, participant) = start_pair(&harness).await;
    wait_until(|| async { owner.is_at(steps::WAIT_LOCK_ETH).await }).await;
    wait_until(|| async { participant.is_at(steps::SYNC_BALANCE).await }).await;
    assert_eq!(harness.btc.calls("fund_script"), 1);

    // Restart the owner from its store
    owner.stop();
    drop(owner);
    let owner = harness.owner_flow(owner_swap()).await;
    assert_eq!(owner.step().await, 5);
    owner.start().await.unwrap();

    harness.usdt.credit(&harness.participant.eth_address, 100_000_000u64);
    participant.sync_balance().await.unwrap();
    wait_finished(&owner, &participant).await;

    assert_eq!(harness.btc.calls("fund_script"), 1);
    assert_eq!(harness.btc.calls("refund"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_lock_time_rejected_and_refunded() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.config.script_lock_window_secs = 0;
    harness.fund_btc_usdt();

    let swap = owner_swap();
    let participant = harness.participant_flow(participant_swap(&swap)).await;
    let mut events = participant.events();
    let owner = harness.owner_flow(swap).await;
    participant.start().await.unwrap();
    owner.start().await.unwrap();

    loop {
        if let FlowEvent::ProtocolError { kind, .. } = events.recv().await.unwrap() {
            assert_eq!(kind, "lock_time_too_short");
            break;
        }
    }
    assert!(participant.is_at(steps::VERIFY_SCRIPT).await);
    assert!(!participant.state().await.is_script_verified);
    assert!(harness.usdt.escrow(&harness.participant.eth_address, &harness.owner.eth_address).is_none());

    wait_until(|| async { owner.is_at(steps::WAIT_LOCK_ETH).await }).await;
    let hex = owner.get_refund_tx_hex().await.unwrap();
    assert!(!hex.is_empty());
    assert_eq!(owner.state().await.refund_tx_hex, Some(hex));

    owner.try_refund().await.unwrap();
    let state = owner.state().await;
    assert!(state.is_refunded);
    assert!(state.refund_tx.is_some());
    assert_eq!(
        harness.btc.balance_of(&harness.owner.script_address),
        U256::from(1_000_000u64)
    );

    // A second refund has nothing left to reclaim
    assert!(owner.try_refund().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_bch_for_eth() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.bch.credit(&harness.owner.script_address, 1_000_000u64);
    harness.eth.credit(&harness.participant.eth_address, 100_000_000u64);
    harness.eth.credit(&harness.owner.eth_address, 1_000_000u64);

    let mut swap = owner_swap();
    swap.sell_asset = Asset::Bch;
    swap.buy_asset = Asset::Eth;

    let participant = harness.participant_flow(participant_swap(&swap)).await;
    let owner = harness.owner_flow(swap).await;
    assert_eq!(owner.protocol().name, "BCH2ETH");
    assert_eq!(participant.protocol().name, "ETH2BCH");
    assert!(!owner.protocol().check_target_wallet);

    participant.start().await.unwrap();
    owner.start().await.unwrap();
    wait_finished(&owner, &participant).await;

    assert_eq!(
        harness.eth.balance_of(&harness.owner.eth_address),
        U256::from(1_000_000u64 - WITHDRAW_FEE + BUY_UNITS)
    );
    assert_eq!(
        harness.bch.balance_of(&harness.participant.script_address),
        U256::from(SELL_SATS)
    );
    assert_eq!(harness.btc.calls("fund_script"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_targeted_escrow_pays_destination() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.fund_btc_usdt();
    let destination = "0x4444444444444444444444444444444444444444".to_string();

    let mut swap = owner_swap();
    swap.destination_buy_address = Some(destination.clone());
    let participant = harness.participant_flow(participant_swap(&swap)).await;
    let owner = harness.owner_flow(swap).await;
    participant.start().await.unwrap();
    owner.start().await.unwrap();
    wait_finished(&owner, &participant).await;

    assert_eq!(harness.usdt.balance_of(&destination), U256::from(BUY_UNITS));
    assert!(harness.usdt.balance_of(&harness.owner.eth_address).is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_retry_during_slow_funding_funds_once() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.fund_btc_usdt();

    let slow = Arc::new(SlowFunding {
        inner: harness.btc.clone(),
        delay: Duration::from_secs(30),
    });
    let adapters = harness.adapters().with_script(Asset::Btc, slow);

    let swap = owner_swap();
    let participant = harness.participant_flow(participant_swap(&swap)).await;
    let protocol = Arc::new(ProtocolDescriptor::for_swap(&swap).unwrap());
    let owner = Flow::new(swap, protocol, harness.owner_context_with(adapters))
        .await
        .unwrap();
    participant.start().await.unwrap();
    owner.start().await.unwrap();

    wait_until(|| async { owner.is_at(steps::LOCK_SCRIPT).await }).await;
    sleep(Duration::from_secs(5)).await;
    assert!(matches!(
        owner.retry_step().await,
        Err(SwapError::Precondition(_))
    ));

    wait_finished(&owner, &participant).await;
    assert_eq!(harness.btc.calls("fund_script"), 1);
    assert_eq!(
        harness.btc.balance_of(&harness.owner.script_address),
        U256::from(1_000_000 - SELL_SATS)
    );
}

#[tokio::test(start_paused = true)]
async fn test_refund_stops_escrow_wait() {
    let mut harness = Harness::new();
    harness.config.auto_secret = true;
    harness.config.script_lock_window_secs = 0;
    harness.fund_btc_usdt();

    let (owner, _participant) = start_pair(&harness).await;
    wait_until(|| async { owner.is_at(steps::WAIT_LOCK_ETH).await }).await;
    owner.try_refund().await.unwrap();

    // The escrow shows up after the script is gone
    let hash = owner.state().await.secret_hash.unwrap();
    harness.usdt.open_escrow(
        &harness.participant.eth_address,
        &harness.owner.eth_address,
        BUY_UNITS,
        hash,
        None,
    );
    announce_escrow(&harness, "0xlate").await;
    sleep(Duration::from_secs(120)).await;

    assert!(owner.is_at(steps::WAIT_LOCK_ETH).await);
    let state = owner.state().await;
    assert!(state.is_refunded);
    assert!(!state.is_eth_contract_funded);
    assert!(!state.eth_withdraw_attempted);
    assert_eq!(harness.usdt.calls("withdraw"), 0);

    // Retrying the step does not pick the escrow up either
    owner.retry_step().await.unwrap();
    sleep(Duration::from_secs(60)).await;
    assert!(owner.is_at(steps::WAIT_LOCK_ETH).await);
    assert_eq!(harness.usdt.calls("withdraw"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_escrow_poll_and_announcement_advance_once() {
    let harness = Harness::new();
    harness
        .usdt
        .credit_native(&harness.owner.eth_address, 1_000_000u64);

    let swap = owner_swap();
    let secret = Secret::random();
    let mut record = FlowRecord::new(swap.clone(), "BTC2USDT");
    record.step = 5;
    record.state = FlowState {
        is_participant_signed: true,
        secret: Some(secret),
        secret_hash: Some(secret.hash()),
        is_script_funded: true,
        ..Default::default()
    };
    harness.owner_store.save(&swap.id, &record).await.unwrap();

    let owner = harness.owner_flow(swap).await;
    let mut events = owner.events();
    owner.start().await.unwrap();

    // Fund the escrow so the next balance check and the announcement land together
    sleep(Duration::from_secs(1)).await;
    harness.usdt.open_escrow(
        &harness.participant.eth_address,
        &harness.owner.eth_address,
        BUY_UNITS,
        secret.hash(),
        None,
    );
    sleep(Duration::from_millis(18_990)).await;
    announce_escrow(&harness, "0xfeed").await;

    wait_until(|| async { owner.state().await.is_eth_withdrawn }).await;
    sleep(Duration::from_secs(60)).await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    let entered_withdraw = |e: &FlowEvent| {
        matches!(e, FlowEvent::StepEntered { name, .. } if name == steps::WITHDRAW_ETH)
    };
    let first_entry = received.iter().position(entered_withdraw).unwrap();
    let transitions = received[..first_entry]
        .iter()
        .filter(|e| matches!(e, FlowEvent::StateChanged { step: 6 }))
        .count();

    assert_eq!(transitions, 1);
    assert_eq!(received.iter().filter(|e| entered_withdraw(e)).count(), 1);
    assert_eq!(owner.step().await, 7);
    assert!(owner.state().await.is_eth_contract_funded);
    assert_eq!(harness.usdt.calls("withdraw"), 1);
}
