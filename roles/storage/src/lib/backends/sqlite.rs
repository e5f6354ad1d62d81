//! SQLite storage backend implementation.
//!
//! Tables mirror the pool's relational schema: `shares`, `blocks`, `coinbase_payments`,
//! `ledger` and the `share_buffer` sorted set. Multi-row ledger writes run inside a single
//! SQLite transaction.

use async_trait::async_trait;
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqliteRow, Row, SqlitePool};
use std::{path::Path, str::FromStr};

use crate::{
    dedup::{ShareDedupStore, DEFAULT_DEDUP_KEY},
    error::{StorageError, StorageResult},
    pool_storage::{PoolStorage, StorageHealth},
    types::{
        BlockRecord, BlockStatus, CoinbasePayment, ConfirmedBlock, EffortMap, LedgerEntry,
        LedgerEntryStatus, NewLedgerEntry, PersistedShare, UnconfirmedBlock,
    },
    unix_now,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS shares (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        wallet TEXT NOT NULL,
        bluescore INTEGER NOT NULL,
        nonce INTEGER NOT NULL,
        diff INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blocks (
        hash TEXT PRIMARY KEY,
        miner TEXT NOT NULL,
        payee TEXT NOT NULL,
        daascore INTEGER NOT NULL,
        bluescore INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'unconfirmed',
        block_json TEXT NOT NULL,
        coinbase_reward TEXT,
        timestamp INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS coinbase_payments (
        tx TEXT NOT NULL,
        wallet TEXT NOT NULL,
        amount INTEGER NOT NULL,
        daascore INTEGER NOT NULL,
        PRIMARY KEY (wallet, daascore, tx)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payee TEXT NOT NULL,
        amount INTEGER NOT NULL,
        daascore INTEGER NOT NULL,
        block_hash TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'owed',
        tx_id TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS share_buffer (
        key TEXT NOT NULL,
        member TEXT NOT NULL,
        score INTEGER NOT NULL,
        PRIMARY KEY (key, member)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_shares_timestamp ON shares(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_shares_bluescore ON shares(bluescore)",
    "CREATE INDEX IF NOT EXISTS idx_blocks_status ON blocks(status, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger(status)",
    "CREATE INDEX IF NOT EXISTS idx_share_buffer_score ON share_buffer(key, score)",
];

/// SQLite implementation of [`PoolStorage`] and [`ShareDedupStore`].
pub struct SqliteStorage {
    pool: Option<SqlitePool>,
    database_path: String,
    dedup_key: String,
}

impl SqliteStorage {
    /// Create a new SqliteStorage instance
    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            pool: None,
            database_path: database_path.into(),
            dedup_key: DEFAULT_DEDUP_KEY.to_string(),
        }
    }

    /// Use a different sorted-set name for share dedup.
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    /// Get database connection pool
    fn get_pool(&self) -> StorageResult<&SqlitePool> {
        self.pool.as_ref().ok_or(StorageError::BackendUnavailable)
    }

    async fn create_tables(&self) -> StorageResult<()> {
        let pool = self.get_pool()?;
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(pool)
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?;
        }
        Ok(())
    }

    fn block_from_row(row: &SqliteRow) -> UnconfirmedBlock {
        UnconfirmedBlock {
            hash: row.get("hash"),
            miner: row.get("miner"),
            payee: row.get("payee"),
            block_json: row.get("block_json"),
            blue_score: row.get::<i64, _>("bluescore") as u64,
            daa_score: row.get::<i64, _>("daascore") as u64,
            timestamp: row.get::<i64, _>("timestamp") as u64,
        }
    }

    fn payment_from_row(row: &SqliteRow) -> CoinbasePayment {
        CoinbasePayment {
            tx_id: row.get("tx"),
            wallet: row.get("wallet"),
            amount: row.get::<i64, _>("amount") as u64,
            daa_score: row.get::<i64, _>("daascore") as u64,
        }
    }

    fn ledger_from_row(row: &SqliteRow) -> StorageResult<LedgerEntry> {
        Ok(LedgerEntry {
            id: row.get::<i64, _>("id") as u64,
            wallet: row.get("payee"),
            amount: row.get::<i64, _>("amount") as u64,
            daa_score: row.get::<i64, _>("daascore") as u64,
            block_hash: row.get("block_hash"),
            status: row.get::<String, _>("status").parse()?,
            tx_id: row.get("tx_id"),
        })
    }
}

#[async_trait]
impl PoolStorage for SqliteStorage {
    async fn initialize(&mut self) -> StorageResult<()> {
        tracing::info!("Initializing SQLite storage backend at: {}", self.database_path);

        if let Some(parent) = Path::new(&self.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StorageError::BackendError(format!(
                        "Failed to create database directory: {}",
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", self.database_path))
            .map_err(|e| StorageError::ConfigError(e.to_string()))?
            .create_if_missing(true);

        self.pool = Some(
            SqlitePool::connect_with(options)
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?,
        );

        self.create_tables().await?;

        tracing::info!("SQLite storage initialized successfully");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if let Some(pool) = self.pool.as_ref() {
            pool.close().await;
            tracing::info!("SQLite storage closed");
        }
        Ok(())
    }

    async fn put_share(&self, share: &PersistedShare) -> StorageResult<()> {
        let pool = self.get_pool()?;
        sqlx::query(
            "INSERT INTO shares (wallet, bluescore, nonce, diff, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&share.wallet)
        .bind(share.blue_score as i64)
        .bind(share.nonce as i64)
        .bind(share.difficulty as i64)
        .bind(share.timestamp as i64)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn get_effort_by_wallet(&self, before: u64, window: u64) -> StorageResult<EffortMap> {
        let pool = self.get_pool()?;
        let rows = sqlx::query(
            r#"
            SELECT subq.wallet AS wallet, SUM(subq.diff) AS effort
            FROM (SELECT wallet, diff FROM shares WHERE timestamp <= ?1
                  ORDER BY timestamp DESC, id DESC LIMIT ?2) AS subq
            GROUP BY subq.wallet
            "#,
        )
        .bind(before.min(i64::MAX as u64) as i64)
        .bind(window.min(i64::MAX as u64) as i64)
        .fetch_all(pool)
        .await?;

        let mut effort = EffortMap::new();
        for row in rows {
            effort.insert(row.get("wallet"), row.get::<i64, _>("effort") as u64);
        }
        Ok(effort)
    }

    async fn prune_shares(&self, keep: u64) -> StorageResult<u64> {
        let pool = self.get_pool()?;
        let result = sqlx::query(
            r#"
            DELETE FROM shares WHERE bluescore <
                (SELECT MIN(bluescore) FROM
                    (SELECT bluescore FROM shares ORDER BY bluescore DESC LIMIT ?1))
            "#,
        )
        .bind(keep.min(i64::MAX as u64) as i64)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn put_block(&self, block: &UnconfirmedBlock) -> StorageResult<()> {
        let pool = self.get_pool()?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO blocks
            (hash, miner, payee, daascore, bluescore, status, block_json, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&block.hash)
        .bind(&block.miner)
        .bind(&block.payee)
        .bind(block.daa_score as i64)
        .bind(block.blue_score as i64)
        .bind(BlockStatus::Unconfirmed.as_str())
        .bind(&block.block_json)
        .bind(block.timestamp as i64)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::InvalidData(format!(
                "block {} already recorded",
                block.hash
            )));
        }
        Ok(())
    }

    async fn get_block(&self, hash: &str) -> StorageResult<Option<BlockRecord>> {
        let pool = self.get_pool()?;
        let row = sqlx::query("SELECT * FROM blocks WHERE hash = ?1")
            .bind(hash)
            .fetch_optional(pool)
            .await?;

        match row {
            Some(row) => Ok(Some(BlockRecord {
                block: Self::block_from_row(&row),
                status: row.get::<String, _>("status").parse()?,
                coinbase_tx: row.get("coinbase_reward"),
            })),
            None => Ok(None),
        }
    }

    async fn get_unconfirmed_blocks(&self, limit: usize) -> StorageResult<Vec<UnconfirmedBlock>> {
        let pool = self.get_pool()?;
        let rows = sqlx::query(
            "SELECT * FROM blocks WHERE status = ?1 ORDER BY timestamp, daascore LIMIT ?2",
        )
        .bind(BlockStatus::Unconfirmed.as_str())
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

        Ok(rows.iter().map(Self::block_from_row).collect())
    }

    async fn get_confirmed_blocks(&self, limit: usize) -> StorageResult<Vec<ConfirmedBlock>> {
        let pool = self.get_pool()?;
        let rows = sqlx::query(
            r#"
            SELECT b.hash, b.miner, b.payee, b.daascore, b.bluescore, b.block_json, b.timestamp,
                   cp.tx AS cp_tx, cp.wallet AS cp_wallet, cp.amount AS cp_amount,
                   cp.daascore AS cp_daascore
            FROM blocks b
            JOIN coinbase_payments cp ON cp.tx = b.coinbase_reward
            WHERE b.status = ?1
            ORDER BY b.timestamp, b.daascore
            LIMIT ?2
            "#,
        )
        .bind(BlockStatus::Confirmed.as_str())
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ConfirmedBlock {
                block: Self::block_from_row(row),
                coinbase: CoinbasePayment {
                    tx_id: row.get("cp_tx"),
                    wallet: row.get("cp_wallet"),
                    amount: row.get::<i64, _>("cp_amount") as u64,
                    daa_score: row.get::<i64, _>("cp_daascore") as u64,
                },
            })
            .collect())
    }

    async fn confirm_block(&self, hash: &str, coinbase_tx: &str) -> StorageResult<bool> {
        let pool = self.get_pool()?;
        let result = sqlx::query(
            "UPDATE blocks SET coinbase_reward = ?1, status = ?2 WHERE status = ?3 AND hash = ?4",
        )
        .bind(coinbase_tx)
        .bind(BlockStatus::Confirmed.as_str())
        .bind(BlockStatus::Unconfirmed.as_str())
        .bind(hash)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_coinbase_payment(&self, payment: &CoinbasePayment) -> StorageResult<bool> {
        let pool = self.get_pool()?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO coinbase_payments (tx, wallet, amount, daascore) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&payment.tx_id)
        .bind(&payment.wallet)
        .bind(payment.amount as i64)
        .bind(payment.daa_score as i64)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_coinbase_payment(
        &self,
        wallet: &str,
        daa_score: u64,
        window: u64,
    ) -> StorageResult<Option<CoinbasePayment>> {
        let pool = self.get_pool()?;
        let row = sqlx::query(
            r#"
            SELECT tx, wallet, amount, daascore FROM coinbase_payments
            WHERE wallet = ?1 AND daascore > ?2 AND daascore <= ?3
            ORDER BY daascore ASC LIMIT 1
            "#,
        )
        .bind(wallet)
        .bind(daa_score as i64)
        .bind(daa_score.saturating_add(window) as i64)
        .fetch_optional(pool)
        .await?;

        Ok(row.as_ref().map(Self::payment_from_row))
    }

    async fn get_coinbase_tip(&self, wallet: &str) -> StorageResult<Option<u64>> {
        let pool = self.get_pool()?;
        let row = sqlx::query("SELECT MAX(daascore) AS tip FROM coinbase_payments WHERE wallet = ?1")
            .bind(wallet)
            .fetch_one(pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("tip").map(|tip| tip as u64))
    }

    async fn commit_block_payouts(
        &self,
        block_hash: &str,
        entries: &[NewLedgerEntry],
    ) -> StorageResult<bool> {
        let pool = self.get_pool()?;
        let mut tx = pool.begin().await?;

        let advanced = sqlx::query("UPDATE blocks SET status = ?1 WHERE hash = ?2 AND status = ?3")
            .bind(BlockStatus::PaymentPending.as_str())
            .bind(block_hash)
            .bind(BlockStatus::Confirmed.as_str())
            .execute(&mut *tx)
            .await?;
        if advanced.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for entry in entries {
            sqlx::query(
                "INSERT INTO ledger (payee, amount, daascore, block_hash, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&entry.wallet)
            .bind(entry.amount as i64)
            .bind(entry.daa_score as i64)
            .bind(block_hash)
            .bind(LedgerEntryStatus::Owed.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get_ledger_entries_by_status(
        &self,
        status: LedgerEntryStatus,
        limit: usize,
    ) -> StorageResult<Vec<LedgerEntry>> {
        let pool = self.get_pool()?;
        let rows = sqlx::query("SELECT * FROM ledger WHERE status = ?1 ORDER BY id LIMIT ?2")
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(pool)
            .await?;

        rows.iter().map(Self::ledger_from_row).collect()
    }

    async fn update_ledger_entry(
        &self,
        id: u64,
        status: LedgerEntryStatus,
        tx_id: Option<&str>,
    ) -> StorageResult<()> {
        let pool = self.get_pool()?;
        let result =
            sqlx::query("UPDATE ledger SET status = ?1, tx_id = COALESCE(?2, tx_id) WHERE id = ?3")
                .bind(status.as_str())
                .bind(tx_id)
                .bind(id as i64)
                .execute(pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("ledger entry {}", id)));
        }
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<StorageHealth> {
        let pool = match self.get_pool() {
            Ok(pool) => pool,
            Err(_) => {
                return Ok(StorageHealth {
                    is_healthy: false,
                    backend_type: "sqlite".to_string(),
                    connection_status: "not initialized".to_string(),
                    last_operation_timestamp: None,
                    error_message: Some("pool not initialized".to_string()),
                })
            }
        };

        let probe = sqlx::query("SELECT 1").fetch_one(pool).await;
        Ok(StorageHealth {
            is_healthy: probe.is_ok(),
            backend_type: "sqlite".to_string(),
            connection_status: if probe.is_ok() { "connected" } else { "error" }.to_string(),
            last_operation_timestamp: Some(unix_now()),
            error_message: probe.err().map(|e| e.to_string()),
        })
    }
}

#[async_trait]
impl ShareDedupStore for SqliteStorage {
    async fn add_if_new(&self, member: &str, score: u64) -> StorageResult<bool> {
        let pool = self.get_pool()?;
        let result =
            sqlx::query("INSERT OR IGNORE INTO share_buffer (key, member, score) VALUES (?1, ?2, ?3)")
                .bind(&self.dedup_key)
                .bind(member)
                .bind(score as i64)
                .execute(pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn range_by_score(&self, min: u64, max: u64) -> StorageResult<Vec<String>> {
        let pool = self.get_pool()?;
        let rows = sqlx::query(
            "SELECT member FROM share_buffer WHERE key = ?1 AND score >= ?2 AND score <= ?3 ORDER BY score, member",
        )
        .bind(&self.dedup_key)
        .bind(min.min(i64::MAX as u64) as i64)
        .bind(max.min(i64::MAX as u64) as i64)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("member")).collect())
    }

    async fn count(&self) -> StorageResult<u64> {
        let pool = self.get_pool()?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM share_buffer WHERE key = ?1")
            .bind(&self.dedup_key)
            .fetch_one(pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn remove_by_score(&self, min: u64, max: u64) -> StorageResult<u64> {
        let pool = self.get_pool()?;
        let result =
            sqlx::query("DELETE FROM share_buffer WHERE key = ?1 AND score >= ?2 AND score <= ?3")
                .bind(&self.dedup_key)
                .bind(min.min(i64::MAX as u64) as i64)
                .bind(max.min(i64::MAX as u64) as i64)
                .execute(pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn storage(dir: &TempDir) -> SqliteStorage {
        let path = dir.path().join("pool.db");
        let mut storage = SqliteStorage::new(path.to_string_lossy().to_string());
        storage.initialize().await.unwrap();
        storage
    }

    fn block(hash: &str, daa_score: u64, timestamp: u64) -> UnconfirmedBlock {
        UnconfirmedBlock {
            hash: hash.to_string(),
            miner: "miner".to_string(),
            payee: "pool".to_string(),
            block_json: "{}".to_string(),
            blue_score: daa_score,
            daa_score,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_sqlite_share_effort_and_prune() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir).await;
        for i in 1..=6u64 {
            let wallet = if i % 2 == 0 { "even" } else { "odd" };
            storage
                .put_share(&PersistedShare {
                    wallet: wallet.to_string(),
                    blue_score: i,
                    nonce: u64::MAX - i,
                    difficulty: 4,
                    timestamp: 100 + i,
                })
                .await
                .unwrap();
        }

        let effort = storage.get_effort_by_wallet(104, 100).await.unwrap();
        assert_eq!(effort.get("odd"), Some(&8));
        assert_eq!(effort.get("even"), Some(&8));

        assert_eq!(storage.prune_shares(0).await.unwrap(), 0);
        assert_eq!(storage.prune_shares(2).await.unwrap(), 4);
        let effort = storage.get_effort_by_wallet(u64::MAX, 100).await.unwrap();
        assert_eq!(effort.values().sum::<u64>(), 8);
    }

    #[tokio::test]
    async fn test_sqlite_block_lifecycle() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir).await;

        storage.put_block(&block("h1", 28554656, 10)).await.unwrap();
        assert!(storage.put_block(&block("h1", 28554656, 10)).await.is_err());
        storage
            .put_coinbase_payment(&CoinbasePayment {
                tx_id: "tx1".to_string(),
                wallet: "pool".to_string(),
                amount: 1000,
                daa_score: 28554661,
            })
            .await
            .unwrap();

        let found = storage
            .find_coinbase_payment("pool", 28554656, 32)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.tx_id, "tx1");
        assert_eq!(storage.get_coinbase_tip("pool").await.unwrap(), Some(28554661));
        assert_eq!(storage.get_coinbase_tip("nobody").await.unwrap(), None);

        assert!(storage.confirm_block("h1", "tx1").await.unwrap());
        assert!(!storage.confirm_block("h1", "tx1").await.unwrap());

        let confirmed = storage.get_confirmed_blocks(100).await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].coinbase.amount, 1000);

        let entries = vec![
            NewLedgerEntry { wallet: "a".to_string(), amount: 600, daa_score: 28554656 },
            NewLedgerEntry { wallet: "b".to_string(), amount: 400, daa_score: 28554656 },
        ];
        assert!(storage.commit_block_payouts("h1", &entries).await.unwrap());
        assert!(!storage.commit_block_payouts("h1", &entries).await.unwrap());

        let owed = storage
            .get_ledger_entries_by_status(LedgerEntryStatus::Owed, 10)
            .await
            .unwrap();
        assert_eq!(owed.len(), 2);
        let record = storage.get_block("h1").await.unwrap().unwrap();
        assert_eq!(record.status, BlockStatus::PaymentPending);
    }

    #[tokio::test]
    async fn test_sqlite_share_buffer() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir).await;

        assert!(storage.add_if_new("10_1", 50).await.unwrap());
        assert!(!storage.add_if_new("10_1", 60).await.unwrap());
        assert!(storage.add_if_new("10_2", 70).await.unwrap());
        assert_eq!(storage.count().await.unwrap(), 2);
        assert_eq!(storage.range_by_score(0, 60).await.unwrap(), vec!["10_1"]);
        assert_eq!(storage.remove_by_score(0, 60).await.unwrap(), 1);
        assert_eq!(storage.count().await.unwrap(), 1);
    }
}
