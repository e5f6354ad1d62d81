//! ## Pool Configuration
//!
//! Defines [`PoolConfig`], loaded from a TOML file through `ext-config`.
//!
//! Sections:
//! - `[stratum]` miner-facing listener ([`StratumConfig`])
//! - `[node]` blockchain node collaborator ([`NodeConfig`])
//! - `[storage]` system of record and share dedup set ([`StorageConfig`])
//! - `[cashier]` block resolution, settlement, pruning and payouts ([`CashierConfig`])
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use ext_config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::error::PoolResult;

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Escrow wallet every coinbase pays to and payouts are sent from.
    pub pool_wallet: String,
    #[serde(default)]
    pub stratum: StratumConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cashier: CashierConfig,
    /// The path to the log file for the pool.
    log_file: Option<PathBuf>,
}

impl PoolConfig {
    /// Reads and deserializes a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> PoolResult<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        let config = Config::builder()
            .add_source(File::new(&path, FileFormat::Toml))
            .build()?
            .try_deserialize::<PoolConfig>()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> PoolResult<Self> {
        let config = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?
            .try_deserialize::<PoolConfig>()?;
        Ok(config)
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StratumConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    /// Fixed difficulty sent once per session and recorded on every share.
    #[serde(default = "default_difficulty")]
    pub difficulty: u64,
    /// Glob (`*` wildcard) matched against the miner's announced client name to pick the
    /// large-nonce job encoding.
    #[serde(default = "default_big_job_pattern")]
    pub big_job_pattern: String,
    #[serde(default = "default_wallet_grace_period_secs")]
    pub wallet_grace_period_secs: u64,
}

impl StratumConfig {
    pub fn wallet_grace_period(&self) -> Duration {
        Duration::from_secs(self.wallet_grace_period_secs)
    }
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            difficulty: default_difficulty(),
            big_job_pattern: default_big_job_pattern(),
            wallet_grace_period_secs: default_wallet_grace_period_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// In-process node producing templates on a timer.
    Dev,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_kind")]
    pub kind: NodeKind,
    /// Interval between new templates produced by the dev node. Zero disables the clock.
    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,
    /// Fallback poll interval when no template notification arrives.
    #[serde(default = "default_template_poll_interval_ms")]
    pub template_poll_interval_ms: u64,
    /// Big-endian hex of the network target used by the dev node.
    #[serde(default = "default_network_target_hex")]
    pub network_target_hex: String,
    #[serde(default = "default_coinbase_reward")]
    pub coinbase_reward: u64,
    /// DAA ticks between an accepted block and its coinbase payment.
    #[serde(default = "default_coinbase_maturity")]
    pub coinbase_maturity: u64,
}

impl NodeConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    pub fn template_poll_interval(&self) -> Duration {
        Duration::from_millis(self.template_poll_interval_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            kind: default_node_kind(),
            block_interval_ms: default_block_interval_ms(),
            template_poll_interval_ms: default_template_poll_interval_ms(),
            network_target_hex: default_network_target_hex(),
            coinbase_reward: default_coinbase_reward(),
            coinbase_maturity: default_coinbase_maturity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    /// Database file, required for the sqlite backend.
    pub database_path: Option<String>,
    /// Name of the share dedup sorted set.
    #[serde(default = "default_dedup_key")]
    pub dedup_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            database_path: None,
            dedup_key: default_dedup_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CashierConfig {
    /// Trailing share window for PPLNS effort.
    #[serde(default = "default_pplns_window")]
    pub pplns_window: u64,
    /// Number of shares (by blue score) kept by the pruner.
    #[serde(default = "default_share_retention")]
    pub share_retention: u64,
    #[serde(default = "default_resolve_interval_secs")]
    pub resolve_interval_secs: u64,
    #[serde(default = "default_settlement_interval_secs")]
    pub settlement_interval_secs: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    #[serde(default = "default_unconfirmed_batch")]
    pub unconfirmed_batch: usize,
    #[serde(default = "default_confirmed_batch")]
    pub confirmed_batch: usize,
    /// DAA window after a block in which its coinbase payment must appear.
    #[serde(default = "default_coinbase_window")]
    pub coinbase_window: u64,
    /// Age after which share keys leave the dedup set.
    #[serde(default = "default_dedup_retention_secs")]
    pub dedup_retention_secs: u64,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default = "default_payout_batch")]
    pub payout_batch: usize,
    #[serde(default)]
    pub wallet_password: Option<String>,
}

impl CashierConfig {
    pub fn resolve_interval(&self) -> Duration {
        Duration::from_secs(self.resolve_interval_secs)
    }

    pub fn settlement_interval(&self) -> Duration {
        Duration::from_secs(self.settlement_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

impl Default for CashierConfig {
    fn default() -> Self {
        Self {
            pplns_window: default_pplns_window(),
            share_retention: default_share_retention(),
            resolve_interval_secs: default_resolve_interval_secs(),
            settlement_interval_secs: default_settlement_interval_secs(),
            prune_interval_secs: default_prune_interval_secs(),
            unconfirmed_batch: default_unconfirmed_batch(),
            confirmed_batch: default_confirmed_batch(),
            coinbase_window: default_coinbase_window(),
            dedup_retention_secs: default_dedup_retention_secs(),
            payouts_enabled: false,
            payout_batch: default_payout_batch(),
            wallet_password: None,
        }
    }
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5555))
}

fn default_difficulty() -> u64 {
    4
}

fn default_big_job_pattern() -> String {
    "*BzMiner*".to_string()
}

fn default_wallet_grace_period_secs() -> u64 {
    20
}

fn default_node_kind() -> NodeKind {
    NodeKind::Dev
}

fn default_block_interval_ms() -> u64 {
    1000
}

fn default_template_poll_interval_ms() -> u64 {
    500
}

fn default_network_target_hex() -> String {
    format!("00{}", "ff".repeat(31))
}

fn default_coinbase_reward() -> u64 {
    // 50 coins in the smallest unit
    50 * 100_000_000
}

fn default_coinbase_maturity() -> u64 {
    5
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_dedup_key() -> String {
    pplns_storage::DEFAULT_DEDUP_KEY.to_string()
}

fn default_pplns_window() -> u64 {
    100_000
}

fn default_share_retention() -> u64 {
    1_000_000
}

fn default_resolve_interval_secs() -> u64 {
    30
}

fn default_settlement_interval_secs() -> u64 {
    60
}

fn default_prune_interval_secs() -> u64 {
    300
}

fn default_unconfirmed_batch() -> usize {
    10
}

fn default_confirmed_batch() -> usize {
    100
}

fn default_coinbase_window() -> u64 {
    32
}

fn default_dedup_retention_secs() -> u64 {
    3600
}

fn default_payout_batch() -> usize {
    1024
}
