//! In-process peer room
//!
//! Every message is serialized to JSON and broadcast on a shared hub, the way
//! a pubsub transport would carry it. Each joined peer runs a forwarder task
//! that decodes envelopes and drops its own messages and unicasts addressed
//! to someone else.

use super::{PeerChannel, PeerMessage, SwapMessage};
use crate::error::{SwapError, SwapResult};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const HUB_CAPACITY: usize = 1024;

/// Shared hub all local peers join
#[derive(Clone)]
pub struct LocalRoom {
    hub: broadcast::Sender<String>,
}

impl Default for LocalRoom {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRoom {
    pub fn new() -> Self {
        let (hub, _) = broadcast::channel(HUB_CAPACITY);
        Self { hub }
    }

    /// Join the room as `peer_id`. Must be called inside a tokio runtime.
    pub fn join(&self, peer_id: impl Into<String>) -> LocalPeer {
        let peer_id = peer_id.into();
        let (inbox, _) = broadcast::channel(HUB_CAPACITY);
        let mut hub_rx = self.hub.subscribe();

        let forwarder = tokio::spawn({
            let peer_id = peer_id.clone();
            let inbox = inbox.clone();
            async move {
                loop {
                    let raw = match hub_rx.recv().await {
                        Ok(raw) => raw,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Peer {} dropped {} room messages", peer_id, n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    let msg: PeerMessage = match serde_json::from_str(&raw) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Peer {} ignoring malformed message: {}", peer_id, e);
                            continue;
                        }
                    };

                    if msg.from_peer == peer_id {
                        continue;
                    }
                    if matches!(&msg.to_peer, Some(to) if *to != peer_id) {
                        continue;
                    }

                    // No subscribers yet is fine
                    let _ = inbox.send(msg);
                }
            }
        });

        LocalPeer {
            peer_id,
            hub: self.hub.clone(),
            inbox,
            forwarder,
        }
    }
}

/// One participant's connection to a `LocalRoom`
pub struct LocalPeer {
    peer_id: String,
    hub: broadcast::Sender<String>,
    inbox: broadcast::Sender<PeerMessage>,
    forwarder: tokio::task::JoinHandle<()>,
}

impl LocalPeer {
    fn publish(&self, msg: PeerMessage) -> SwapResult<()> {
        debug!(
            "{} -> {}: {} ({})",
            msg.from_peer,
            msg.to_peer.as_deref().unwrap_or("*"),
            msg.message.event(),
            msg.swap_id
        );
        let raw = serde_json::to_string(&msg)?;
        self.hub
            .send(raw)
            .map_err(|_| SwapError::Peer("room has no listeners".to_string()))?;
        Ok(())
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[async_trait]
impl PeerChannel for LocalPeer {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerMessage> {
        self.inbox.subscribe()
    }

    async fn send_message(&self, swap_id: &str, message: SwapMessage) -> SwapResult<()> {
        self.publish(PeerMessage {
            swap_id: swap_id.to_string(),
            from_peer: self.peer_id.clone(),
            to_peer: None,
            message,
        })
    }

    async fn send_to(&self, peer_id: &str, swap_id: &str, message: SwapMessage) -> SwapResult<()> {
        self.publish(PeerMessage {
            swap_id: swap_id.to_string(),
            from_peer: self.peer_id.clone(),
            to_peer: Some(peer_id.to_string()),
            message,
        })
    }
}
