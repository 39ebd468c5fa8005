//! Owner side: funds the script leg and holds the secret

use super::steps::*;
use super::withdraw;
use crate::error::SwapResult;
use crate::flow::{Flow, StepMeta};
use crate::peer::SwapMessage;
use crate::retry::Attempt;
use crate::swap::Secret;

use std::sync::Arc;
use tracing::{debug, info, warn};

pub(super) async fn sign(flow: Arc<Flow>) -> SwapResult<()> {
    if flow.state().await.is_participant_signed {
        flow.finish_step(StepMeta::silent(SIGN), |_| {}).await?;
        return Ok(());
    }

    let mut sub = flow.subscribe();
    flow.send(SwapMessage::RequestSign).await?;

    loop {
        match sub.recv().await? {
            SwapMessage::SwapSign => {
                flow.finish_step(StepMeta::silent(SIGN), |s| {
                    s.is_participant_signed = true;
                    s.is_swap_exist = false;
                })
                .await?;
                return Ok(());
            }
            SwapMessage::SwapExists => {
                warn!(
                    "Swap {}: counter-party still has an open escrow with us, waiting for its refund",
                    flow.id()
                );
                flow.set_state(|s| s.is_swap_exist = true).await?;
            }
            SwapMessage::RefundCompleted => {
                let was_blocked = flow
                    .set_state(|s| std::mem::replace(&mut s.is_swap_exist, false))
                    .await?;
                if was_blocked {
                    info!("Swap {}: counter-party refunded, asking to sign again", flow.id());
                    flow.send(SwapMessage::RequestSign).await?;
                }
            }
            _ => {}
        }

        if !flow.is_at(SIGN).await {
            return Ok(());
        }
    }
}

pub(super) async fn submit_secret(flow: Arc<Flow>) -> SwapResult<()> {
    if flow.state().await.secret_hash.is_some() {
        flow.finish_step(StepMeta::silent(SUBMIT_SECRET), |_| {}).await?;
        return Ok(());
    }

    if flow.config().auto_secret {
        flow.submit_secret(Secret::random()).await?;
    } else {
        info!("Swap {} waiting for the secret", flow.id());
    }
    Ok(())
}

pub(super) async fn sync_balance(flow: Arc<Flow>) -> SwapResult<()> {
    let me = flow.identity().clone();
    let amount = flow.swap().sell_amount;
    let script = flow.legs().script.clone();

    flow.set_state(|s| s.is_balance_fetching = true).await?;
    let balance = script.fetch_balance(&me).await;
    let enough = matches!(&balance, Ok(b) if *b >= amount);
    flow.set_state(|s| {
        s.is_balance_fetching = false;
        s.is_balance_enough = enough;
        if let Ok(b) = &balance {
            s.balance = Some(*b);
        }
    })
    .await?;
    let balance = balance?;

    if enough {
        flow.finish_step(StepMeta::silent(SYNC_BALANCE), |_| {}).await?;
        return Ok(());
    }

    info!(
        "Swap {}: balance {} below {}, waiting for a deposit",
        flow.id(),
        balance,
        amount
    );

    // Park, but let a deposit straight into the script complete the step
    let values = flow.ensure_script_values().await?;
    let address = script.create_script(&me, &values).await?;
    flow.set_state(|s| s.script_address = Some(address.clone()))
        .await?;
    info!("Swap {}: deposit address {}", flow.id(), address);

    let funded = flow
        .poll(SYNC_BALANCE, flow.config().poll_interval(), || {
            let script = script.clone();
            let me = me.clone();
            let values = values.clone();
            async move {
                match script.check_script_funded(&me, &values, amount).await {
                    Ok(true) => Attempt::Ready(()),
                    Ok(false) => Attempt::Retry,
                    Err(e) => {
                        debug!("Deposit check failed: {}", e);
                        Attempt::Retry
                    }
                }
            }
        })
        .await;

    if funded.is_some() {
        info!("Swap {}: script funded by deposit", flow.id());
        flow.finish_step(StepMeta::silent(SYNC_BALANCE), |s| {
            s.is_balance_enough = true;
        })
        .await?;
    }
    Ok(())
}

pub(super) async fn lock_script(flow: Arc<Flow>) -> SwapResult<()> {
    let me = flow.identity().clone();
    let amount = flow.swap().sell_amount;
    let script = flow.legs().script.clone();

    let values = flow.ensure_script_values().await?;
    let address = script.create_script(&me, &values).await?;

    let funding_tx = if script.check_script_funded(&me, &values, amount).await? {
        info!("Swap {}: script {} already funded", flow.id(), address);
        flow.state().await.script_funding_tx
    } else {
        let tx = script.fund_script(&me, &values, amount).await?;
        info!("Swap {}: funded script {} in {}", flow.id(), address, tx);
        Some(tx)
    };

    let advanced = flow
        .finish_step(StepMeta::silent(LOCK_SCRIPT), |s| {
            s.script_address = Some(address);
            s.script_funding_tx = funding_tx;
            s.is_script_funded = true;
            s.is_refunded = false;
        })
        .await?;

    if advanced {
        announce_script(&flow).await?;
    }
    Ok(())
}

async fn announce_script(flow: &Flow) -> SwapResult<()> {
    let state = flow.state().await;
    match state.script_values {
        Some(script_values) if state.is_script_funded => {
            flow.send(SwapMessage::CreateScript {
                script_values,
                funding_tx: state.script_funding_tx,
                destination_address: flow.swap().destination_buy_address.clone(),
            })
            .await
        }
        _ => Ok(()),
    }
}

pub(super) async fn wait_lock_eth(flow: Arc<Flow>) -> SwapResult<()> {
    let state = flow.state().await;
    if state.is_refunded {
        info!("Swap {}: script refunded, no longer waiting for the escrow", flow.id());
        return Ok(());
    }
    if state.is_eth_contract_funded {
        flow.finish_step(StepMeta::silent(WAIT_LOCK_ETH), |_| {})
            .await?;
        return Ok(());
    }

    let me = flow.identity().clone();
    let funder = flow.swap().counterparty.eth_address.clone();
    let contract = flow.legs().contract.clone();
    let mut sub = flow.subscribe();

    let poll = flow.poll(WAIT_LOCK_ETH, flow.config().escrow_poll_interval(), || {
        let contract = contract.clone();
        let me = me.clone();
        let funder = funder.clone();
        async move {
            match contract.get_balance(&me, &funder).await {
                Ok(balance) if !balance.is_zero() => Attempt::Ready(()),
                Ok(_) => Attempt::Retry,
                Err(e) => {
                    debug!("Escrow balance check failed: {}", e);
                    Attempt::Retry
                }
            }
        }
    });
    let announced = sub.once(|m| match m {
        SwapMessage::CreateEthContract { tx_hash } => Some(tx_hash.clone()),
        _ => None,
    });

    let creation_tx = tokio::select! {
        Some(()) = poll => None,
        Ok(tx_hash) = announced => Some(tx_hash),
        _ = flow.left_step(WAIT_LOCK_ETH) => return Ok(()),
    };

    if flow.state().await.is_refunded {
        info!("Swap {}: escrow appeared after the refund, ignoring it", flow.id());
        return Ok(());
    }
    flow.finish_step(StepMeta::silent(WAIT_LOCK_ETH), |s| {
        s.is_eth_contract_funded = true;
        if s.eth_swap_creation_tx.is_none() {
            s.eth_swap_creation_tx = creation_tx;
        }
    })
    .await?;
    Ok(())
}

pub(super) async fn finish(flow: Arc<Flow>) -> SwapResult<()> {
    if flow.state().await.is_counterparty_finished {
        flow.finish_step(StepMeta::silent(FINISH), |s| s.is_finished = true)
            .await?;
    }
    Ok(())
}

pub(super) async fn end(flow: Arc<Flow>) -> SwapResult<()> {
    debug!("Swap {} reached its last step", flow.id());
    Ok(())
}

pub(super) async fn on_message(flow: Arc<Flow>, message: SwapMessage) -> SwapResult<()> {
    match message {
        SwapMessage::RequestScript => announce_script(&flow).await,
        SwapMessage::RequestEthWithdrawTxHash => {
            match flow.state().await.eth_swap_withdraw_tx {
                Some(tx_hash) => flow.send(SwapMessage::EthWithdrawTxHash { tx_hash }).await,
                None => Ok(()),
            }
        }
        SwapMessage::AcceptWithdrawRequest => withdraw::reveal_for_assisted_withdraw(&flow).await,
        SwapMessage::EthWithdrawTxHash { tx_hash } => {
            withdraw::confirm_assisted_withdraw(&flow, tx_hash).await
        }
        SwapMessage::SwapFinished => {
            flow.set_state(|s| s.is_counterparty_finished = true).await?;
            flow.finish_step(StepMeta::silent(FINISH), |s| s.is_finished = true)
                .await?;
            Ok(())
        }
        _ => Ok(()),
    }
}
