//! In-process node for development and tests.
//!
//! Produces a new template every `block_interval`, computes proof of work as
//! double-SHA256 over `pre_pow_hash || timestamp || nonce`, remembers accepted blocks
//! and pays a coinbase to the template's payee `coinbase_maturity` DAA ticks later.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bitcoin::hashes::{sha256d, Hash};
use pplns_storage::CoinbasePayment;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{BlockTemplate, NodeApi, PowCheck, PowHash, TemplateHeader};
use crate::{config::NodeConfig, error::NodeError};

#[derive(Debug, Clone)]
pub struct DevNodeConfig {
    /// Zero disables the template clock; call [`DevNode::advance`] instead.
    pub block_interval: Duration,
    pub network_target: PowHash,
    pub coinbase_reward: u64,
    pub coinbase_maturity: u64,
    pub start_daa_score: u64,
}

impl Default for DevNodeConfig {
    fn default() -> Self {
        let mut target = [0xff; 32];
        target[0] = 0x00;
        Self {
            block_interval: Duration::ZERO,
            network_target: PowHash(target),
            coinbase_reward: 50 * 100_000_000,
            coinbase_maturity: 5,
            start_daa_score: 1_000_000,
        }
    }
}

impl DevNodeConfig {
    pub fn from_node_config(config: &NodeConfig) -> Result<Self, NodeError> {
        Ok(Self {
            block_interval: config.block_interval(),
            network_target: PowHash::from_hex(&config.network_target_hex)?,
            coinbase_reward: config.coinbase_reward,
            coinbase_maturity: config.coinbase_maturity,
            ..Default::default()
        })
    }
}

struct DevChain {
    blue_score: u64,
    daa_score: u64,
    tip: [u8; 32],
    accepted: HashSet<String>,
    coinbase: Vec<CoinbasePayment>,
}

struct DevShared {
    chain: Mutex<DevChain>,
    listeners: Mutex<Vec<mpsc::Sender<()>>>,
}

impl DevShared {
    fn chain(&self) -> MutexGuard<'_, DevChain> {
        self.chain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<mpsc::Sender<()>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves the chain forward one tick and notifies subscribers. Returns the number of
    /// live subscribers.
    fn advance(&self) -> usize {
        {
            let mut chain = self.chain();
            chain.blue_score += 1;
            chain.daa_score += 1;
            let mut preimage = chain.tip.to_vec();
            preimage.extend_from_slice(&chain.daa_score.to_le_bytes());
            chain.tip = sha256d::Hash::hash(&preimage).to_byte_array();
        }
        let mut listeners = self.listeners();
        listeners.retain(|listener| match listener.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        listeners.len()
    }
}

pub struct DevNode {
    config: DevNodeConfig,
    shared: Arc<DevShared>,
    clock_started: AtomicBool,
}

impl DevNode {
    pub fn new(config: DevNodeConfig) -> Self {
        let chain = DevChain {
            blue_score: config.start_daa_score.saturating_sub(1000),
            daa_score: config.start_daa_score,
            tip: sha256d::Hash::hash(b"dev-genesis").to_byte_array(),
            accepted: HashSet::new(),
            coinbase: Vec::new(),
        };
        Self {
            config,
            shared: Arc::new(DevShared {
                chain: Mutex::new(chain),
                listeners: Mutex::new(Vec::new()),
            }),
            clock_started: AtomicBool::new(false),
        }
    }

    /// Produce the next template and wake subscribers.
    pub fn advance(&self) {
        self.shared.advance();
    }

    pub fn blue_score(&self) -> u64 {
        self.shared.chain().blue_score
    }

    pub fn daa_score(&self) -> u64 {
        self.shared.chain().daa_score
    }

    /// Search for a nonce whose proof of work does (`mines_block`) or does not meet the
    /// network target, starting at `start`.
    pub fn find_nonce(&self, header: &TemplateHeader, start: u64, mines_block: bool) -> u64 {
        let mut nonce = start;
        loop {
            if self.compute_pow(header, nonce).meets_target() == mines_block {
                return nonce;
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    fn pow_value(header: &TemplateHeader, nonce: u64) -> PowHash {
        let mut preimage = Vec::with_capacity(48);
        preimage.extend_from_slice(&header.pre_pow_hash);
        preimage.extend_from_slice(&header.timestamp_ms.to_le_bytes());
        preimage.extend_from_slice(&nonce.to_le_bytes());
        PowHash(sha256d::Hash::hash(&preimage).to_byte_array())
    }

    fn start_clock(&self) {
        if self.config.block_interval.is_zero() || self.clock_started.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let shared = self.shared.clone();
        let interval = self.config.block_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shared.advance() == 0 {
                    debug!("Dev node clock stopped, no template subscribers left");
                    break;
                }
            }
        });
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[async_trait]
impl NodeApi for DevNode {
    async fn get_block_template(&self, pay_address: &str) -> Result<BlockTemplate, NodeError> {
        let chain = self.shared.chain();
        let mut preimage = chain.tip.to_vec();
        preimage.extend_from_slice(pay_address.as_bytes());
        let pre_pow_hash = sha256d::Hash::hash(&preimage).to_byte_array();

        Ok(BlockTemplate {
            header: TemplateHeader {
                pre_pow_hash,
                timestamp_ms: now_ms(),
                blue_score: chain.blue_score,
                daa_score: chain.daa_score,
                bits: 0x207fffff,
            },
            body: json!({
                "payAddress": pay_address,
                "transactions": [],
            }),
        })
    }

    async fn submit_block(
        &self,
        template: &BlockTemplate,
        nonce: u64,
    ) -> Result<String, NodeError> {
        let check = self.compute_pow(&template.header, nonce);
        if !check.meets_target() {
            return Err(NodeError::Rejected(
                "block does not meet network target".to_string(),
            ));
        }
        let payee = template
            .body
            .get("payAddress")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::Rejected("template has no pay address".to_string()))?
            .to_string();

        let hash = check.value.to_hex();
        let mut chain = self.shared.chain();
        if !chain.accepted.insert(hash.clone()) {
            return Err(NodeError::DuplicateBlock);
        }

        let mut preimage = b"coinbase".to_vec();
        preimage.extend_from_slice(&check.value.0);
        chain.coinbase.push(CoinbasePayment {
            tx_id: hex::encode(sha256d::Hash::hash(&preimage).to_byte_array()),
            wallet: payee,
            amount: self.config.coinbase_reward,
            daa_score: template.header.daa_score + self.config.coinbase_maturity,
        });
        info!(hash = %hash, daa_score = template.header.daa_score, "Dev node accepted block");
        Ok(hash)
    }

    fn compute_pow(&self, header: &TemplateHeader, nonce: u64) -> PowCheck {
        PowCheck {
            value: Self::pow_value(header, nonce),
            target: self.config.network_target,
        }
    }

    async fn new_template_notifications(&self) -> Result<mpsc::Receiver<()>, NodeError> {
        let (sender, receiver) = mpsc::channel(16);
        self.shared.listeners().push(sender);
        self.start_clock();
        Ok(receiver)
    }

    async fn wait_for_sync(&self) -> Result<(), NodeError> {
        info!("Dev node is always synced");
        Ok(())
    }

    async fn get_coinbase_payments(
        &self,
        wallet: &str,
        after_daa_score: u64,
    ) -> Result<Vec<CoinbasePayment>, NodeError> {
        let chain = self.shared.chain();
        let mut payments: Vec<CoinbasePayment> = chain
            .coinbase
            .iter()
            .filter(|p| {
                p.wallet == wallet && p.daa_score > after_daa_score && p.daa_score <= chain.daa_score
            })
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.daa_score);
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_block_submission_and_duplicate() {
        let node = DevNode::new(DevNodeConfig::default());
        let template = node.get_block_template("pool").await.unwrap();

        let miss = node.find_nonce(&template.header, 0, false);
        assert!(matches!(
            node.submit_block(&template, miss).await,
            Err(NodeError::Rejected(_))
        ));

        let hit = node.find_nonce(&template.header, 0, true);
        let hash = node.submit_block(&template, hit).await.unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(
            node.submit_block(&template, hit).await,
            Err(NodeError::DuplicateBlock)
        );
    }

    #[tokio::test]
    async fn test_coinbase_matures_after_advancing() {
        let node = DevNode::new(DevNodeConfig::default());
        let template = node.get_block_template("pool").await.unwrap();
        let nonce = node.find_nonce(&template.header, 0, true);
        node.submit_block(&template, nonce).await.unwrap();

        assert!(node.get_coinbase_payments("pool", 0).await.unwrap().is_empty());
        for _ in 0..5 {
            node.advance();
        }
        let payments = node.get_coinbase_payments("pool", 0).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].daa_score, template.header.daa_score + 5);
        assert!(node
            .get_coinbase_payments("pool", payments[0].daa_score)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_advance_notifies_subscribers() {
        let node = DevNode::new(DevNodeConfig::default());
        let mut notifications = node.new_template_notifications().await.unwrap();
        let before = node.blue_score();
        node.advance();
        assert_eq!(notifications.recv().await, Some(()));
        assert_eq!(node.blue_score(), before + 1);
    }
}
