use std::sync::Arc;

use tracing::error;

use super::{
    block_resolver::BlockResolver, coinbase_ledger::CoinbaseLedger, payouts::PayoutIssuer,
    settlement::Settlement,
};

/// What one pipeline pass did. `None` marks a step that failed and was logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub resolved: Option<usize>,
    pub ingested: Option<usize>,
    pub settled: Option<usize>,
    pub payouts_submitted: Option<usize>,
}

/// Resolve, ingest coinbase payments, settle, then pay out when enabled. A failing step
/// does not stop the ones after it.
pub struct Pipeline {
    resolver: Arc<BlockResolver>,
    coinbase: CoinbaseLedger,
    settlement: Settlement,
    payouts: Option<PayoutIssuer>,
}

impl Pipeline {
    pub fn new(
        resolver: Arc<BlockResolver>,
        coinbase: CoinbaseLedger,
        settlement: Settlement,
        payouts: Option<PayoutIssuer>,
    ) -> Self {
        Self {
            resolver,
            coinbase,
            settlement,
            payouts,
        }
    }

    pub async fn run_once(&self) -> PipelineReport {
        let resolved = self
            .resolver
            .resolve_once()
            .await
            .map_err(|e| error!(error = %e, "Error committing resolved blocks"))
            .ok();
        let ingested = self
            .coinbase
            .ingest_once()
            .await
            .map_err(|e| error!(error = %e, "Error performing coinbase ingest for pending blocks"))
            .ok();
        let settled = self
            .settlement
            .settle_once()
            .await
            .map_err(|e| error!(error = %e, "Error performing ledger update"))
            .ok();

        let payouts_submitted = match &self.payouts {
            Some(payouts) => payouts
                .issue_once()
                .await
                .map_err(|e| error!(error = %e, "Error issuing payouts"))
                .ok()
                .map(|report| report.submitted),
            None => None,
        };

        PipelineReport {
            resolved,
            ingested,
            settled,
            payouts_submitted,
        }
    }
}
