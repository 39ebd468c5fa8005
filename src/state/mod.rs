//! Persisted flow snapshots
//!
//! Backends:
//! - `MemoryStore` for tests and throwaway devnets
//! - `FileStore`, one JSON document per swap
//! - `PgStateStore`, PostgreSQL table namespaced by peer id

mod file;
mod postgres;

pub use file::FileStore;
pub use postgres::PgStateStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{SwapError, SwapResult};
use crate::flow::FlowRecord;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Storage for flow snapshots keyed by swap id
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, swap_id: &str) -> SwapResult<Option<FlowRecord>>;

    /// Replace the stored snapshot. Must be durable when it returns.
    async fn save(&self, swap_id: &str, record: &FlowRecord) -> SwapResult<()>;

    async fn remove(&self, swap_id: &str) -> SwapResult<()>;

    async fn list(&self) -> SwapResult<Vec<String>>;

    /// Whether the backend is reachable
    async fn health_check(&self) -> SwapResult<()> {
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, FlowRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, swap_id: &str) -> SwapResult<Option<FlowRecord>> {
        Ok(self.records.get(swap_id).map(|r| r.clone()))
    }

    async fn save(&self, swap_id: &str, record: &FlowRecord) -> SwapResult<()> {
        self.records.insert(swap_id.to_string(), record.clone());
        Ok(())
    }

    async fn remove(&self, swap_id: &str) -> SwapResult<()> {
        self.records.remove(swap_id);
        Ok(())
    }

    async fn list(&self) -> SwapResult<Vec<String>> {
        let mut ids: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Open the configured backend for one host
pub async fn open_store(config: &StoreConfig, namespace: &str) -> SwapResult<Arc<dyn StateStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory state store for {}", namespace);
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::File => {
            let root = config
                .path
                .as_deref()
                .ok_or_else(|| SwapError::Config("store.path is required for file store".into()))?;
            let store = FileStore::open(std::path::Path::new(root).join(namespace)).await?;
            info!("Using file state store at {:?}", store.dir());
            Ok(Arc::new(store))
        }
        StoreBackend::Postgres => {
            let store = PgStateStore::new(config, namespace).await?;
            store.run_migrations().await?;
            info!("Using PostgreSQL state store for {}", namespace);
            Ok(Arc::new(store))
        }
    }
}
