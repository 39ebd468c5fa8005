//! Configuration management for the swap coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub devnet: DevnetConfig,
}

/// Timing and behaviour shared by every flow of a host
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Deposit, script funding, fee and secret polls
    pub poll_interval_ms: u64,
    /// Counter-party escrow balance poll
    pub escrow_poll_interval_ms: u64,
    /// Owner script lock time is now + this window
    pub script_lock_window_secs: i64,
    /// Participant requires at least this much lock time left
    pub script_lock_margin_secs: i64,
    /// Generate the secret instead of waiting for submit_secret
    pub auto_secret: bool,
    /// Take part in the fee-exhaustion withdraw handshake
    pub withdraw_assist: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            escrow_poll_interval_ms: 20_000,
            script_lock_window_secs: 3 * 3600,
            script_lock_margin_secs: 3600,
            auto_secret: false,
            withdraw_assist: true,
        }
    }
}

impl FlowConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn escrow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.escrow_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Root directory for the file backend
    pub path: Option<String>,
    /// Connection URL for the postgres backend
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: None,
            url: None,
            max_connections: 5,
            min_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Simulated ledgers and the two local peers of the devnet binary
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevnetConfig {
    pub owner_peer: String,
    pub participant_peer: String,
    /// Token symbol served by the simulated contract chain
    pub token: String,
    /// Start one BTC -> token swap on boot
    pub demo_swap: bool,
    /// Satoshis the owner sells
    pub sell_amount: u64,
    /// Token units the participant sells
    pub buy_amount: u64,
    pub owner_script_funds: u64,
    pub participant_token_funds: u64,
    /// Native balance for contract-chain fees
    pub owner_gas: u64,
    pub participant_gas: u64,
    pub withdraw_fee: u64,
    /// Seconds before an escrow may be refunded
    pub refund_after_secs: i64,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            owner_peer: "owner".to_string(),
            participant_peer: "participant".to_string(),
            token: "USDT".to_string(),
            demo_swap: true,
            sell_amount: 100_000,
            buy_amount: 50_000_000,
            owner_script_funds: 1_000_000,
            participant_token_funds: 1_000_000_000,
            owner_gas: 1_000_000,
            participant_gas: 1_000_000,
            withdraw_fee: 21_000,
            refund_after_secs: 3600,
        }
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_COORDINATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse a TOML document after environment substitution
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.flow.poll_interval_ms == 0 || self.flow.escrow_poll_interval_ms == 0 {
            anyhow::bail!("Polling intervals must be positive");
        }

        if self.flow.script_lock_margin_secs > self.flow.script_lock_window_secs {
            anyhow::bail!(
                "Lock margin ({}s) exceeds lock window ({}s); participants would reject every script",
                self.flow.script_lock_margin_secs,
                self.flow.script_lock_window_secs
            );
        }

        match self.store.backend {
            StoreBackend::File if self.store.path.is_none() => {
                anyhow::bail!("store.path is required for the file backend")
            }
            StoreBackend::Postgres if self.store.url.is_none() => {
                anyhow::bail!("store.url is required for the postgres backend")
            }
            _ => {}
        }

        if self.devnet.owner_peer == self.devnet.participant_peer {
            anyhow::bail!("Devnet peers must have distinct ids");
        }

        if self.devnet.token.is_empty() {
            tracing::warn!("Devnet token symbol is empty - demo swap disabled");
        }

        Ok(())
    }
}

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
