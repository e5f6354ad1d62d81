//! Sends owed ledger entries through the wallet daemon.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use pplns_storage::{LedgerEntryStatus, PoolStorage};
use tracing::{error, info, warn};

use crate::{error::PoolResult, node::WalletApi};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayoutReport {
    pub submitted: usize,
    pub failed: usize,
    /// Sends that went out but whose `submitted` status is not stored yet
    pub unrecorded: usize,
}

pub struct PayoutIssuer {
    storage: Arc<dyn PoolStorage>,
    wallet: Arc<dyn WalletApi>,
    pool_wallet: String,
    password: String,
    batch: usize,
    /// Ledger entry id to tx id for sends whose status write failed. These entries are
    /// still `owed` in storage and must not be sent again.
    unrecorded: Mutex<HashMap<u64, String>>,
}

impl PayoutIssuer {
    pub fn new(
        storage: Arc<dyn PoolStorage>,
        wallet: Arc<dyn WalletApi>,
        pool_wallet: String,
        password: String,
        batch: usize,
    ) -> Self {
        Self {
            storage,
            wallet,
            pool_wallet,
            password,
            batch,
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    fn unrecorded(&self) -> MutexGuard<'_, HashMap<u64, String>> {
        self.unrecorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Each entry moves to `submitted` with its tx id, or to `error` if the send fails.
    ///
    /// A failed status write after a successful send is kept in memory and retried on
    /// the next call. The entry is never sent twice.
    pub async fn issue_once(&self) -> PoolResult<PayoutReport> {
        self.record_pending().await;

        let entries = self
            .storage
            .get_ledger_entries_by_status(LedgerEntryStatus::Owed, self.batch)
            .await?;

        let mut report = PayoutReport::default();
        for entry in entries {
            if self.unrecorded().contains_key(&entry.id) {
                report.unrecorded += 1;
                continue;
            }
            match self
                .wallet
                .send(&entry.wallet, &self.pool_wallet, entry.amount, &self.password)
                .await
            {
                Ok(tx_id) => {
                    info!(wallet = %entry.wallet, amount = entry.amount, tx_id = %tx_id, "Payout submitted");
                    report.submitted += 1;
                    if let Err(e) = self
                        .storage
                        .update_ledger_entry(entry.id, LedgerEntryStatus::Submitted, Some(&tx_id))
                        .await
                    {
                        error!(entry_id = entry.id, tx_id = %tx_id, error = %e, "Failed to record submitted payout");
                        self.unrecorded().insert(entry.id, tx_id);
                        report.unrecorded += 1;
                    }
                }
                Err(e) => {
                    error!(wallet = %entry.wallet, amount = entry.amount, error = %e, "Payout failed");
                    report.failed += 1;
                    if let Err(e) = self
                        .storage
                        .update_ledger_entry(entry.id, LedgerEntryStatus::Error, None)
                        .await
                    {
                        warn!(entry_id = entry.id, error = %e, "Failed to record payout error");
                    }
                }
            }
        }
        Ok(report)
    }

    /// Retries the status write for sends that already went out.
    async fn record_pending(&self) {
        let pending: Vec<(u64, String)> = self
            .unrecorded()
            .iter()
            .map(|(id, tx_id)| (*id, tx_id.clone()))
            .collect();
        for (id, tx_id) in pending {
            match self
                .storage
                .update_ledger_entry(id, LedgerEntryStatus::Submitted, Some(&tx_id))
                .await
            {
                Ok(()) => {
                    info!(entry_id = id, tx_id = %tx_id, "Recorded submitted payout");
                    self.unrecorded().remove(&id);
                }
                Err(e) => {
                    error!(entry_id = id, tx_id = %tx_id, error = %e, "Still unable to record submitted payout");
                }
            }
        }
    }
}
