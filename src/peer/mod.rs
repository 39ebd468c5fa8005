//! Peer messaging between the two sides of a swap
//!
//! Messages travel as `{event, data}` JSON envelopes. The transport is
//! external; `LocalRoom` provides an in-process hub for the devnet and tests.

pub mod local;

pub use local::{LocalPeer, LocalRoom};

use crate::error::{SwapError, SwapResult};
use crate::swap::{ScriptValues, Secret, SecretHash};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Swap protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SwapMessage {
    #[serde(rename = "request sign")]
    RequestSign,
    #[serde(rename = "swap sign")]
    SwapSign,
    #[serde(rename = "swap exists")]
    SwapExists,
    #[serde(rename = "refund completed")]
    RefundCompleted,
    #[serde(rename = "create script")]
    CreateScript {
        script_values: ScriptValues,
        funding_tx: Option<String>,
        /// Where the owner wants the contract leg paid out
        destination_address: Option<String>,
    },
    #[serde(rename = "request script")]
    RequestScript,
    #[serde(rename = "create eth contract")]
    CreateEthContract { tx_hash: String },
    #[serde(rename = "finish eth withdraw")]
    FinishEthWithdraw,
    #[serde(rename = "eth withdraw tx hash")]
    EthWithdrawTxHash { tx_hash: String },
    #[serde(rename = "request eth withdraw tx hash")]
    RequestEthWithdrawTxHash,
    #[serde(rename = "swap finished")]
    SwapFinished,
    #[serde(rename = "request withdraw")]
    RequestWithdraw { secret_hash: SecretHash },
    #[serde(rename = "accept withdraw request")]
    AcceptWithdrawRequest,
    #[serde(rename = "do withdraw")]
    DoWithdraw {
        secret: Secret,
        secret_hash: SecretHash,
    },
}

impl SwapMessage {
    /// Wire event name
    pub fn event(&self) -> &'static str {
        match self {
            SwapMessage::RequestSign => "request sign",
            SwapMessage::SwapSign => "swap sign",
            SwapMessage::SwapExists => "swap exists",
            SwapMessage::RefundCompleted => "refund completed",
            SwapMessage::CreateScript { .. } => "create script",
            SwapMessage::RequestScript => "request script",
            SwapMessage::CreateEthContract { .. } => "create eth contract",
            SwapMessage::FinishEthWithdraw => "finish eth withdraw",
            SwapMessage::EthWithdrawTxHash { .. } => "eth withdraw tx hash",
            SwapMessage::RequestEthWithdrawTxHash => "request eth withdraw tx hash",
            SwapMessage::SwapFinished => "swap finished",
            SwapMessage::RequestWithdraw { .. } => "request withdraw",
            SwapMessage::AcceptWithdrawRequest => "accept withdraw request",
            SwapMessage::DoWithdraw { .. } => "do withdraw",
        }
    }
}

/// Envelope carried by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub swap_id: String,
    pub from_peer: String,
    /// Unicast target; `None` means every peer in the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer: Option<String>,
    pub message: SwapMessage,
}

/// Transport used by flows to reach the counter-party
#[async_trait]
pub trait PeerChannel: Send + Sync {
    fn peer_id(&self) -> &str;

    /// Durable subscription to every message addressed to this peer.
    /// Self-originated messages are never delivered.
    fn subscribe(&self) -> broadcast::Receiver<PeerMessage>;

    async fn send_message(&self, swap_id: &str, message: SwapMessage) -> SwapResult<()>;

    async fn send_to(&self, peer_id: &str, swap_id: &str, message: SwapMessage) -> SwapResult<()>;
}

/// Messages of one swap, received through a peer channel.
/// Dropping it unsubscribes.
pub struct Subscription {
    swap_id: String,
    rx: broadcast::Receiver<PeerMessage>,
}

impl Subscription {
    pub fn new(swap_id: impl Into<String>, rx: broadcast::Receiver<PeerMessage>) -> Self {
        Self {
            swap_id: swap_id.into(),
            rx,
        }
    }

    /// Next message for this swap
    pub async fn recv(&mut self) -> SwapResult<SwapMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if msg.swap_id == self.swap_id => return Ok(msg.message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Swap {} subscription lagged by {} messages", self.swap_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SwapError::Peer("peer channel closed".to_string()));
                }
            }
        }
    }

    /// Wait for the first message `pick` accepts
    pub async fn once<T, F>(&mut self, mut pick: F) -> SwapResult<T>
    where
        F: FnMut(&SwapMessage) -> Option<T>,
    {
        loop {
            let message = self.recv().await?;
            if let Some(value) = pick(&message) {
                return Ok(value);
            }
        }
    }
}
