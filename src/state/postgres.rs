//! PostgreSQL flow store

use super::StateStore;
use crate::config::StoreConfig;
use crate::error::{SwapError, SwapResult};
use crate::flow::FlowRecord;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Flow snapshots in PostgreSQL, one row per (namespace, swap)
pub struct PgStateStore {
    pool: PgPool,
    namespace: String,
}

impl PgStateStore {
    /// Connect using the store settings
    pub async fn new(config: &StoreConfig, namespace: &str) -> SwapResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| SwapError::Config("store.url is required for postgres".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await?;

        Ok(Self::with_pool(pool, namespace))
    }

    pub fn with_pool(pool: PgPool, namespace: &str) -> Self {
        Self {
            pool,
            namespace: namespace.to_string(),
        }
    }

    /// Create tables inline
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_flows (
                namespace VARCHAR(128) NOT NULL,
                swap_id VARCHAR(128) NOT NULL,
                protocol VARCHAR(32) NOT NULL,
                step SMALLINT NOT NULL,
                record TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (namespace, swap_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swap_flows_namespace
            ON swap_flows (namespace, updated_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self, swap_id: &str) -> SwapResult<Option<FlowRecord>> {
        let row = sqlx::query("SELECT record FROM swap_flows WHERE namespace = $1 AND swap_id = $2")
            .bind(&self.namespace)
            .bind(swap_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("record");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, swap_id: &str, record: &FlowRecord) -> SwapResult<()> {
        let raw = serde_json::to_string(record)?;

        sqlx::query(
            r#"
            INSERT INTO swap_flows (namespace, swap_id, protocol, step, record, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (namespace, swap_id)
            DO UPDATE SET protocol = $3, step = $4, record = $5, updated_at = NOW()
            "#,
        )
        .bind(&self.namespace)
        .bind(swap_id)
        .bind(&record.protocol)
        .bind(record.step as i16)
        .bind(raw)
        .execute(&self.pool)
        .await?;

        debug!("Saved swap {} at step {}", swap_id, record.step);
        Ok(())
    }

    async fn remove(&self, swap_id: &str) -> SwapResult<()> {
        sqlx::query("DELETE FROM swap_flows WHERE namespace = $1 AND swap_id = $2")
            .bind(&self.namespace)
            .bind(swap_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> SwapResult<Vec<String>> {
        let rows = sqlx::query("SELECT swap_id FROM swap_flows WHERE namespace = $1 ORDER BY swap_id")
            .bind(&self.namespace)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.get("swap_id")).collect())
    }

    async fn health_check(&self) -> SwapResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
