//! Wallet that records sends instead of broadcasting them.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::WalletApi;
use crate::error::WalletError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPayment {
    pub to: String,
    pub from: String,
    pub amount: u64,
    pub tx_id: String,
}

#[derive(Debug, Default)]
pub struct MockWallet {
    sent: Mutex<Vec<SentPayment>>,
    /// Destinations for which `send` fails.
    failing: Mutex<Vec<String>>,
}

impl MockWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends_to(&self, wallet: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(wallet.to_string());
    }

    pub fn sent(&self) -> Vec<SentPayment> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl WalletApi for MockWallet {
    async fn send(
        &self,
        to: &str,
        from: &str,
        amount: u64,
        _password: &str,
    ) -> Result<String, WalletError> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|w| w == to);
        if failing {
            return Err(WalletError::SendFailed {
                to: to.to_string(),
                amount,
                reason: "destination rejected".to_string(),
            });
        }

        let mut sent = self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx_id = format!("mock-tx-{}", sent.len() + 1);
        sent.push(SentPayment {
            to: to.to_string(),
            from: from.to_string(),
            amount,
            tx_id: tx_id.clone(),
        });
        info!(to, amount, tx_id = %tx_id, "Recorded payout");
        Ok(tx_id)
    }
}
