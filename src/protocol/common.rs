//! Operations shared by every protocol, triggered by the host or operator

use super::steps;
use crate::error::{SwapError, SwapResult};
use crate::flow::{Flow, StepMeta};
use crate::peer::SwapMessage;
use crate::swap::{utc_now, Role, ScriptValues, Secret, SecretHash};

use std::sync::Arc;
use tracing::{debug, info};

impl Flow {
    /// Commit the owner's secret.
    ///
    /// Idempotent once a hash is recorded: later calls return the recorded
    /// hash and change nothing.
    pub async fn submit_secret(self: &Arc<Self>, secret: Secret) -> SwapResult<SecretHash> {
        if self.swap().role != Role::Owner {
            return Err(SwapError::Precondition(
                "only the owner submits a secret".to_string(),
            ));
        }

        let state = self.state().await;
        if let Some(hash) = state.secret_hash {
            debug!("Swap {} secret already submitted", self.id());
            return Ok(hash);
        }
        if !state.is_participant_signed {
            return Err(SwapError::Precondition(
                "counter-party has not signed the swap yet".to_string(),
            ));
        }

        let hash = secret.hash();
        self.finish_step(StepMeta::step(steps::SUBMIT_SECRET), |s| {
            if s.secret_hash.is_none() {
                s.secret = Some(secret);
                s.secret_hash = Some(hash);
            }
        })
        .await?;

        info!("Swap {} secret committed ({})", self.id(), hash);
        Ok(hash)
    }

    /// Re-check the balance of the sync-balance step
    pub async fn sync_balance(self: &Arc<Self>) -> SwapResult<()> {
        if !self.is_at(steps::SYNC_BALANCE).await {
            return Err(SwapError::Precondition(format!(
                "swap {} is not waiting for a balance",
                self.id()
            )));
        }
        self.restart_step(steps::SYNC_BALANCE).await
    }

    /// Script values for the current funding cycle.
    /// Fresh values are generated when none exist or the last cycle was refunded.
    pub(crate) async fn ensure_script_values(&self) -> SwapResult<ScriptValues> {
        let owner_public_key = self.identity().script_public_key.clone();
        let recipient_public_key = self.swap().counterparty.script_public_key.clone();
        let window = self.config().script_lock_window_secs;

        self.set_state(|s| {
            let secret_hash = s.secret_hash.ok_or_else(|| {
                SwapError::Precondition("secret hash is not committed yet".to_string())
            })?;

            match &s.script_values {
                Some(values) if !s.is_refunded => Ok(values.clone()),
                _ => {
                    let values = ScriptValues {
                        secret_hash,
                        owner_public_key,
                        recipient_public_key,
                        lock_time: utc_now() + window,
                    };
                    s.script_values = Some(values.clone());
                    s.script_address = None;
                    s.script_funding_tx = None;
                    s.is_refunded = false;
                    Ok(values)
                }
            }
        })
        .await?
    }

    /// Reclaim this side's locked funds.
    ///
    /// The owner refunds the script after its lock time; the participant
    /// refunds its escrow. Either way the counter-party is told, so a
    /// parked sign step can start over.
    pub async fn try_refund(self: &Arc<Self>) -> SwapResult<String> {
        let me = self.identity().clone();

        let tx = match self.swap().role {
            Role::Owner => {
                let state = self.state().await;
                let values = state.script_values.clone().ok_or_else(|| {
                    SwapError::Precondition("no script to refund".to_string())
                })?;
                if state.is_refunded {
                    return Err(SwapError::Precondition("script already refunded".to_string()));
                }
                if state.eth_withdraw_attempted {
                    return Err(SwapError::Precondition(
                        "escrow withdraw already attempted, the secret may be public".to_string(),
                    ));
                }
                let now = utc_now();
                if !values.is_refundable_at(now) {
                    return Err(SwapError::Precondition(format!(
                        "script is locked for another {}s",
                        values.lock_time - now
                    )));
                }

                let tx = self.legs().script.refund(&me, &values).await?;
                self.set_state(|s| {
                    s.refund_tx = Some(tx.clone());
                    s.is_refunded = true;
                    s.is_swap_exist = false;
                    s.is_script_funded = false;
                })
                .await?;
                tx
            }
            Role::Participant => {
                let owner = self.swap().counterparty.eth_address.clone();
                let contract = self.legs().contract.clone();
                if !contract.check_swap_exists(&me, &owner).await? {
                    return Err(SwapError::Precondition("no open escrow to refund".to_string()));
                }

                let tx = contract.refund(&me, &owner).await?;
                self.set_state(|s| {
                    s.refund_tx = Some(tx.clone());
                    s.is_refunded = true;
                    s.is_swap_exist = false;
                    s.is_eth_contract_funded = false;
                })
                .await?;
                tx
            }
        };

        info!("Swap {} refunded: {}", self.id(), tx);
        crate::metrics::record_refund(&self.protocol().name);
        // Nothing a running poll finds may move this cycle forward
        self.supersede_polls().await;
        self.send(SwapMessage::RefundCompleted).await?;

        if self.is_at(steps::SIGN).await {
            if let Err(e) = self.retry_step().await {
                debug!("Swap {} sign not re-run after refund: {}", self.id(), e);
            }
        }

        Ok(tx)
    }

    /// Signed refund transaction for the owner's script, for safekeeping
    pub async fn get_refund_tx_hex(&self) -> SwapResult<String> {
        if self.swap().role != Role::Owner {
            return Err(SwapError::Precondition(
                "refund transactions exist only for the script leg".to_string(),
            ));
        }

        let values = self
            .state()
            .await
            .script_values
            .ok_or_else(|| SwapError::Precondition("no script values yet".to_string()))?;

        let hex = self
            .legs()
            .script
            .get_refund_hex_transaction(self.identity(), &values)
            .await?;
        self.set_state(|s| s.refund_tx_hex = Some(hex.clone())).await?;
        Ok(hex)
    }

    /// Ask the participant to withdraw on our behalf. Sent at most once.
    pub async fn request_withdraw_assist(&self) -> SwapResult<bool> {
        if self.swap().role != Role::Owner {
            return Err(SwapError::Precondition(
                "only the owner requests an assisted withdraw".to_string(),
            ));
        }

        let secret_hash = self
            .state()
            .await
            .secret_hash
            .ok_or_else(|| SwapError::Precondition("secret hash is not committed yet".to_string()))?;

        let first = self
            .set_state(|s| !std::mem::replace(&mut s.withdraw_request_sent, true))
            .await?;
        if first {
            info!("Swap {} requesting assisted withdraw", self.id());
            self.send(SwapMessage::RequestWithdraw { secret_hash }).await?;
        }
        Ok(first)
    }
}
