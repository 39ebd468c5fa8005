//! Participant side: verifies the owner's script, then funds the escrow

use super::steps::*;
use super::withdraw;
use crate::error::{SwapError, SwapResult};
use crate::flow::{Flow, StepMeta};
use crate::peer::{Subscription, SwapMessage};
use crate::retry::Attempt;
use crate::swap::{utc_now, Secret};

use std::sync::Arc;
use tracing::{debug, info, warn};

pub(super) async fn sign(flow: Arc<Flow>) -> SwapResult<()> {
    let me = flow.identity().clone();
    let owner = flow.swap().counterparty.eth_address.clone();

    if flow
        .legs()
        .contract
        .check_swap_exists(&me, &owner)
        .await?
    {
        warn!(
            "Swap {}: an earlier escrow for {} is still open, refund it before signing",
            flow.id(),
            owner
        );
        flow.set_state(|s| s.is_swap_exist = true).await?;
        flow.send(SwapMessage::SwapExists).await?;
        return Ok(());
    }

    let advanced = flow
        .finish_step(StepMeta::silent(SIGN), |s| {
            s.is_signed = true;
            s.is_swap_exist = false;
        })
        .await?;
    if advanced {
        flow.send(SwapMessage::SwapSign).await?;
    }
    Ok(())
}

pub(super) async fn wait_lock_script(flow: Arc<Flow>) -> SwapResult<()> {
    let state = flow.state().await;
    if state.script_values.is_some() {
        flow.finish_step(StepMeta::silent(WAIT_LOCK_SCRIPT), |_| {})
            .await?;
        return Ok(());
    }

    let mut sub = flow.subscribe();
    flow.send(SwapMessage::RequestScript).await?;

    let (values, funding_tx, destination) = sub
        .once(|m| match m {
            SwapMessage::CreateScript {
                script_values,
                funding_tx,
                destination_address,
            } => Some((
                script_values.clone(),
                funding_tx.clone(),
                destination_address.clone(),
            )),
            _ => None,
        })
        .await?;

    if let Some(known) = state.secret_hash {
        if known != values.secret_hash {
            flow.protocol_error(
                "secret_hash_changed",
                format!("script commits to {}, expected {}", values.secret_hash, known),
            );
            return Ok(());
        }
    }

    info!(
        "Swap {}: owner locked script (hash {}, lock time {})",
        flow.id(),
        values.secret_hash,
        values.lock_time
    );

    flow.finish_step(StepMeta::silent(WAIT_LOCK_SCRIPT), |s| {
        s.secret_hash.get_or_insert(values.secret_hash);
        s.script_values = Some(values);
        s.script_funding_tx = funding_tx;
        s.target_wallet = destination;
    })
    .await?;
    Ok(())
}

pub(super) async fn verify_script(flow: Arc<Flow>) -> SwapResult<()> {
    let state = flow.state().await;
    let values = state
        .script_values
        .clone()
        .ok_or_else(|| SwapError::Precondition("no script values to verify".to_string()))?;
    let me = flow.identity().clone();

    if values.recipient_public_key != me.script_public_key {
        flow.protocol_error(
            "script_recipient_mismatch",
            format!("script pays {}", values.recipient_public_key),
        );
        return Ok(());
    }
    if values.owner_public_key != flow.swap().counterparty.script_public_key {
        flow.protocol_error(
            "script_owner_mismatch",
            format!("script refunds to {}", values.owner_public_key),
        );
        return Ok(());
    }
    if state.secret_hash != Some(values.secret_hash) {
        flow.protocol_error("secret_hash_mismatch", "script hash differs from the recorded one");
        return Ok(());
    }
    let remaining = values.lock_time - utc_now();
    if remaining < flow.config().script_lock_margin_secs {
        flow.protocol_error(
            "lock_time_too_short",
            format!(
                "{}s left, {}s required",
                remaining,
                flow.config().script_lock_margin_secs
            ),
        );
        return Ok(());
    }

    let amount = flow.swap().buy_amount;
    let script = flow.legs().script.clone();
    let funded = flow
        .poll(VERIFY_SCRIPT, flow.config().poll_interval(), || {
            let script = script.clone();
            let me = me.clone();
            let values = values.clone();
            async move {
                match script.check_script_funded(&me, &values, amount).await {
                    Ok(true) => Attempt::Ready(()),
                    Ok(false) => Attempt::Retry,
                    Err(e) => {
                        debug!("Script funding check failed: {}", e);
                        Attempt::Retry
                    }
                }
            }
        })
        .await;

    if funded.is_some() {
        flow.finish_step(StepMeta::silent(VERIFY_SCRIPT), |s| {
            s.is_script_verified = true;
            s.is_script_funded = true;
        })
        .await?;
    }
    Ok(())
}

pub(super) async fn sync_balance(flow: Arc<Flow>) -> SwapResult<()> {
    let me = flow.identity().clone();
    let amount = flow.swap().sell_amount;

    flow.set_state(|s| s.is_balance_fetching = true).await?;
    let balance = flow.legs().contract.fetch_balance(&me).await;
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
        flow.finish_step(StepMeta::silent(SYNC_BALANCE), |_| {})
            .await?;
    } else {
        info!(
            "Swap {}: balance {} below {}, waiting for sync",
            flow.id(),
            balance,
            amount
        );
    }
    Ok(())
}

pub(super) async fn lock_eth(flow: Arc<Flow>) -> SwapResult<()> {
    let state = flow.state().await;
    let me = flow.identity().clone();
    let owner = flow.swap().counterparty.eth_address.clone();
    let contract = flow.legs().contract.clone();

    let creation_tx = if let Some(tx) = state.eth_swap_creation_tx.clone() {
        tx
    } else if contract.check_swap_exists(&me, &owner).await? {
        info!("Swap {}: escrow already created", flow.id());
        String::new()
    } else {
        let secret_hash = state
            .secret_hash
            .ok_or_else(|| SwapError::Precondition("secret hash missing".to_string()))?;
        let target = if flow.protocol().check_target_wallet {
            flow.swap()
                .destination_sell_address
                .clone()
                .or_else(|| state.target_wallet.clone())
        } else {
            None
        };
        let tx = contract
            .create(&me, &owner, &secret_hash, flow.swap().sell_amount, target)
            .await?;
        info!("Swap {}: escrow created in {}", flow.id(), tx);
        tx
    };

    let advanced = flow
        .finish_step(StepMeta::silent(LOCK_ETH), |s| {
            if !creation_tx.is_empty() {
                s.eth_swap_creation_tx = Some(creation_tx.clone());
            }
            s.is_eth_contract_funded = true;
        })
        .await?;

    if advanced {
        flow.send(SwapMessage::CreateEthContract {
            tx_hash: creation_tx,
        })
        .await?;
    }
    Ok(())
}

pub(super) async fn wait_withdraw_eth(flow: Arc<Flow>) -> SwapResult<()> {
    let state = flow.state().await;
    if state.secret.is_some() {
        flow.finish_step(StepMeta::silent(WAIT_WITHDRAW_ETH), |_| {})
            .await?;
        return Ok(());
    }
    let expected = state
        .secret_hash
        .ok_or_else(|| SwapError::Precondition("secret hash missing".to_string()))?;

    let me = flow.identity().clone();
    let owner = flow.swap().counterparty.eth_address.clone();
    let contract = flow.legs().contract.clone();
    let mut sub = flow.subscribe();

    let poll = flow.poll(WAIT_WITHDRAW_ETH, flow.config().poll_interval(), || {
        let contract = contract.clone();
        let me = me.clone();
        let owner = owner.clone();
        async move {
            match contract.get_secret(&me, &owner).await {
                Ok(Some(secret)) => Attempt::Ready(secret),
                Ok(None) => Attempt::Retry,
                Err(e) => {
                    debug!("Secret lookup failed: {}", e);
                    Attempt::Retry
                }
            }
        }
    });

    let secret = tokio::select! {
        Some(secret) = poll => secret,
        Ok(secret) = secret_from_peer(&flow, &mut sub) => secret,
        _ = flow.left_step(WAIT_WITHDRAW_ETH) => return Ok(()),
    };

    if secret.hash() != expected {
        flow.protocol_error("secret_mismatch", "revealed secret does not match the hash");
        return Ok(());
    }

    info!("Swap {}: secret revealed", flow.id());
    flow.finish_step(StepMeta::silent(WAIT_WITHDRAW_ETH), |s| {
        s.secret.get_or_insert(secret);
    })
    .await?;
    Ok(())
}

/// Follow the owner's withdraw announcements until one yields the secret
async fn secret_from_peer(flow: &Flow, sub: &mut Subscription) -> SwapResult<Secret> {
    let me = flow.identity();
    let owner = &flow.swap().counterparty.eth_address;
    let contract = &flow.legs().contract;

    loop {
        match sub.recv().await? {
            SwapMessage::FinishEthWithdraw => match contract.get_secret(me, owner).await? {
                Some(secret) => return Ok(secret),
                None => flow.send(SwapMessage::RequestEthWithdrawTxHash).await?,
            },
            SwapMessage::EthWithdrawTxHash { tx_hash } => {
                if let Some(secret) = contract.get_secret_from_tx_hash(me, &tx_hash).await? {
                    return Ok(secret);
                }
            }
            _ => {}
        }
    }
}

pub(super) async fn finish(flow: Arc<Flow>) -> SwapResult<()> {
    flow.send(SwapMessage::SwapFinished).await?;
    flow.finish_step(StepMeta::silent(FINISH), |s| {
        s.is_finished = true;
        s.is_counterparty_finished = true;
    })
    .await?;
    Ok(())
}

pub(super) async fn on_message(flow: Arc<Flow>, message: SwapMessage) -> SwapResult<()> {
    match message {
        SwapMessage::RequestSign => {
            let state = flow.state().await;
            if state.is_swap_exist {
                flow.send(SwapMessage::SwapExists).await
            } else if state.is_signed {
                flow.send(SwapMessage::SwapSign).await
            } else {
                Ok(())
            }
        }
        SwapMessage::RequestWithdraw { secret_hash } => {
            if !flow.config().withdraw_assist {
                debug!("Swap {}: withdraw assist disabled", flow.id());
                return Ok(());
            }
            let state = flow.state().await;
            if state.secret_hash != Some(secret_hash) || !state.is_eth_contract_funded {
                warn!("Swap {}: ignoring withdraw request", flow.id());
                return Ok(());
            }
            flow.set_state(|s| s.withdraw_request_incoming = true).await?;
            flow.send(SwapMessage::AcceptWithdrawRequest).await
        }
        SwapMessage::DoWithdraw { secret, .. } => {
            withdraw::withdraw_for_counterparty(&flow, secret).await
        }
        _ => Ok(()),
    }
}
