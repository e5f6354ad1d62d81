//! Boundary to the blockchain node and the wallet daemon.
//!
//! The pool never hashes headers or builds blocks itself. It asks a [`NodeApi`] for
//! templates, for the proof-of-work value of a header with a given nonce, and to accept
//! finished blocks. Payouts go through a [`WalletApi`].

use std::fmt;

use async_trait::async_trait;
use pplns_storage::CoinbasePayment;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{NodeError, WalletError};

pub mod dev;
pub mod wallet;

pub use dev::{DevNode, DevNodeConfig};
pub use wallet::MockWallet;

/// A 256-bit proof-of-work value or target, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PowHash(pub [u8; 32]);

impl PowHash {
    pub const MAX: PowHash = PowHash([0xff; 32]);

    pub fn from_hex(s: &str) -> Result<Self, NodeError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| NodeError::Rejected(format!("invalid target hex: {}", e)))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NodeError::Rejected("target must be 32 bytes".to_string()))?;
        Ok(PowHash(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PowHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Proof-of-work value of a header with a candidate nonce, and the target it must meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowCheck {
    pub value: PowHash,
    pub target: PowHash,
}

impl PowCheck {
    /// A nonce mines a block when its value does not exceed the target.
    pub fn meets_target(&self) -> bool {
        self.value <= self.target
    }
}

/// Header fields the pool needs from a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateHeader {
    /// Header commitment without nonce and timestamp, sent to miners.
    pub pre_pow_hash: [u8; 32],
    pub timestamp_ms: u64,
    pub blue_score: u64,
    pub daa_score: u64,
    pub bits: u32,
}

/// Block template as returned by the node. The body is opaque to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub header: TemplateHeader,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn get_block_template(&self, pay_address: &str) -> Result<BlockTemplate, NodeError>;

    /// Submit `template` completed with `nonce`. Returns the accepted block hash.
    async fn submit_block(&self, template: &BlockTemplate, nonce: u64)
        -> Result<String, NodeError>;

    fn compute_pow(&self, header: &TemplateHeader, nonce: u64) -> PowCheck;

    /// Receiver that yields once per new template. Dropping it unsubscribes.
    async fn new_template_notifications(&self) -> Result<mpsc::Receiver<()>, NodeError>;

    async fn wait_for_sync(&self) -> Result<(), NodeError>;

    /// Coinbase outputs paying `wallet` with daa score greater than `after_daa_score`.
    async fn get_coinbase_payments(
        &self,
        wallet: &str,
        after_daa_score: u64,
    ) -> Result<Vec<CoinbasePayment>, NodeError>;
}

#[async_trait]
pub trait WalletApi: Send + Sync {
    /// Send `amount` from `from` to `to`. Returns the transaction id.
    async fn send(
        &self,
        to: &str,
        from: &str,
        amount: u64,
        password: &str,
    ) -> Result<String, WalletError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pow_hash_orders_numerically() {
        let mut low = [0u8; 32];
        low[31] = 0xff;
        let mut high = [0u8; 32];
        high[0] = 0x01;
        assert!(PowHash(low) < PowHash(high));
        assert!(PowHash(high) < PowHash::MAX);
    }

    #[test]
    fn test_pow_check_boundary_is_inclusive() {
        let target = PowHash::from_hex(&format!("00{}", "ff".repeat(31))).unwrap();
        let check = PowCheck {
            value: target,
            target,
        };
        assert!(check.meets_target());
        assert!(!PowCheck {
            value: PowHash::MAX,
            target
        }
        .meets_target());
        assert!(PowHash::from_hex("abcd").is_err());
    }
}
