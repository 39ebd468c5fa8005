//! Swap host: builds, restores and retires the flows of one peer

use crate::error::{SwapError, SwapResult};
use crate::flow::{Flow, SwapContext};
use crate::protocol::ProtocolDescriptor;
use crate::swap::{Asset, Identity, Swap};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Hosts by peer id, shared with the API
pub type HostRegistry = DashMap<String, Arc<SwapHost>>;

/// Owns every flow of one local peer
pub struct SwapHost {
    ctx: SwapContext,
    /// Flows indexed by swap id
    flows: DashMap<String, Arc<Flow>>,
}

impl SwapHost {
    pub fn new(ctx: SwapContext) -> Self {
        Self {
            ctx,
            flows: DashMap::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.ctx.identity.peer_id
    }

    pub fn identity(&self) -> &Identity {
        &self.ctx.identity
    }

    /// Assets this host has adapters for
    pub fn assets(&self) -> Vec<Asset> {
        let mut assets = self.ctx.adapters.assets();
        assets.sort_by_key(|a| a.to_string());
        assets
    }

    /// Build a flow for a new swap without starting it
    pub async fn create_swap(&self, swap: Swap) -> SwapResult<Arc<Flow>> {
        if let Some(existing) = self.flows.get(&swap.id) {
            return Ok(existing.clone());
        }

        let protocol = Arc::new(ProtocolDescriptor::for_swap(&swap)?);
        info!(
            "{}: hosting swap {} as {:?} ({})",
            self.peer_id(),
            swap.id,
            swap.role,
            protocol.name
        );

        let flow = Flow::new(swap, protocol, self.ctx.clone()).await?;
        self.flows.insert(flow.id().to_string(), flow.clone());
        self.update_gauge();
        Ok(flow)
    }

    /// Build and start a flow
    pub async fn start_swap(&self, swap: Swap) -> SwapResult<Arc<Flow>> {
        let flow = self.create_swap(swap).await?;
        flow.start().await?;
        Ok(flow)
    }

    /// Rebuild every stored flow and resume the unfinished ones
    pub async fn restore(&self) -> SwapResult<usize> {
        let mut resumed = 0;

        for swap_id in self.ctx.store.list().await? {
            if self.flows.contains_key(&swap_id) {
                continue;
            }
            let Some(record) = self.ctx.store.load(&swap_id).await? else {
                continue;
            };

            let flow = match self.create_swap(record.swap).await {
                Ok(flow) => flow,
                Err(e) => {
                    warn!("{}: cannot restore swap {}: {}", self.peer_id(), swap_id, e);
                    continue;
                }
            };

            if record.step > 0 && !record.state.is_finished {
                flow.start().await?;
                resumed += 1;
            }
        }

        info!("{}: resumed {} swaps", self.peer_id(), resumed);
        Ok(resumed)
    }

    pub fn get(&self, swap_id: &str) -> SwapResult<Arc<Flow>> {
        self.flows
            .get(swap_id)
            .map(|f| f.clone())
            .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))
    }

    pub fn flows(&self) -> Vec<Arc<Flow>> {
        let mut flows: Vec<_> = self.flows.iter().map(|e| e.value().clone()).collect();
        flows.sort_by(|a, b| a.id().cmp(b.id()));
        flows
    }

    /// Retire a flow and drop its snapshot
    pub async fn remove(&self, swap_id: &str) -> SwapResult<()> {
        let (_, flow) = self
            .flows
            .remove(swap_id)
            .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
        flow.stop();
        self.ctx.store.remove(swap_id).await?;
        self.update_gauge();
        info!("{}: retired swap {}", self.peer_id(), swap_id);
        Ok(())
    }

    /// Stop every flow; snapshots stay for the next restore
    pub fn stop(&self) {
        for entry in self.flows.iter() {
            entry.value().stop();
        }
        info!("{}: host stopped", self.peer_id());
    }

    /// Whether the host's store answers
    pub async fn health_check(&self) -> SwapResult<()> {
        self.ctx.store.health_check().await
    }

    fn update_gauge(&self) {
        crate::metrics::set_active_flows(self.peer_id(), self.flows.len());
    }
}
