//! Record types for shares, blocks, coinbase payments and the payout ledger.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

use crate::error::StorageError;

/// Miner or pool wallet address, kept opaque.
pub type WalletAddr = String;

/// Accumulated difficulty per wallet over a share window.
pub type EffortMap = HashMap<WalletAddr, u64>;

/// A share that passed freshness and dedup checks and was credited to a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedShare {
    pub wallet: WalletAddr,
    /// Blue score of the job the share was mined against
    pub blue_score: u64,
    pub nonce: u64,
    /// Weight of the share in PPLNS effort
    pub difficulty: u64,
    /// Unix seconds at which the share was accepted
    pub timestamp: u64,
}

/// Lifecycle of a pool-found block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Unconfirmed,
    Confirmed,
    PaymentPending,
    Paid,
    Error,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Unconfirmed => "unconfirmed",
            BlockStatus::Confirmed => "confirmed",
            BlockStatus::PaymentPending => "payment_pending",
            BlockStatus::Paid => "paid",
            BlockStatus::Error => "error",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unconfirmed" => Ok(BlockStatus::Unconfirmed),
            "confirmed" => Ok(BlockStatus::Confirmed),
            "payment_pending" => Ok(BlockStatus::PaymentPending),
            "paid" => Ok(BlockStatus::Paid),
            "error" => Ok(BlockStatus::Error),
            other => Err(StorageError::InvalidData(format!(
                "unknown block status '{}'",
                other
            ))),
        }
    }
}

/// A block accepted by the node but not yet matched to its coinbase reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedBlock {
    pub hash: String,
    /// Wallet of the miner whose share produced the block
    pub miner: WalletAddr,
    /// Wallet the coinbase pays to (the pool wallet)
    pub payee: WalletAddr,
    /// Serialized template the block was built from
    pub block_json: String,
    pub blue_score: u64,
    pub daa_score: u64,
    /// Unix seconds at which the block was accepted
    pub timestamp: u64,
}

/// A mined block together with the coinbase payment that rewarded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedBlock {
    pub block: UnconfirmedBlock,
    pub coinbase: CoinbasePayment,
}

/// An on-chain coinbase output paying a pool wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinbasePayment {
    pub tx_id: String,
    pub wallet: WalletAddr,
    /// Amount in the chain's smallest unit
    pub amount: u64,
    pub daa_score: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryStatus {
    Owed,
    Submitted,
    Confirmed,
    Error,
}

impl LedgerEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryStatus::Owed => "owed",
            LedgerEntryStatus::Submitted => "submitted",
            LedgerEntryStatus::Confirmed => "confirmed",
            LedgerEntryStatus::Error => "error",
        }
    }
}

impl fmt::Display for LedgerEntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEntryStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owed" => Ok(LedgerEntryStatus::Owed),
            "submitted" => Ok(LedgerEntryStatus::Submitted),
            "confirmed" => Ok(LedgerEntryStatus::Confirmed),
            "error" => Ok(LedgerEntryStatus::Error),
            other => Err(StorageError::InvalidData(format!(
                "unknown ledger status '{}'",
                other
            ))),
        }
    }
}

/// Payout computed for one wallet from one block, before it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub wallet: WalletAddr,
    pub amount: u64,
    pub daa_score: u64,
}

/// A row in the payout ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Row id assigned by the store
    pub id: u64,
    pub wallet: WalletAddr,
    pub amount: u64,
    pub daa_score: u64,
    /// Block whose reward this entry distributes
    pub block_hash: String,
    pub status: LedgerEntryStatus,
    pub tx_id: Option<String>,
}

/// Stored block row, including resolution state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub block: UnconfirmedBlock,
    pub status: BlockStatus,
    /// Coinbase transaction stamped on the block by the resolver
    pub coinbase_tx: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_status_strings() {
        for status in [
            BlockStatus::Unconfirmed,
            BlockStatus::Confirmed,
            BlockStatus::PaymentPending,
            BlockStatus::Paid,
            BlockStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<BlockStatus>().unwrap(), status);
        }
        assert!("pending".parse::<BlockStatus>().is_err());
    }

    #[test]
    fn test_ledger_status_serde_matches_column_values() {
        let json = serde_json::to_string(&LedgerEntryStatus::Owed).unwrap();
        assert_eq!(json, "\"owed\"");
        let json = serde_json::to_string(&BlockStatus::PaymentPending).unwrap();
        assert_eq!(json, "\"payment_pending\"");
    }
}
