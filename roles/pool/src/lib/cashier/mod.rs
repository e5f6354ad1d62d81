//! ## Cashier
//!
//! Background settlement for the pool:
//! - [`block_resolver`] matches unconfirmed blocks to their coinbase payment
//! - [`coinbase_ledger`] pulls coinbase payments for the pool wallet from the node
//! - [`settlement`] turns confirmed blocks into `owed` ledger entries
//! - [`payouts`] sends owed entries through the wallet daemon
//! - [`pruner`] bounds share history and the dedup set
//!
//! [`Cashier::start`] runs the resolver, the combined [`pipeline`] and the pruner on their
//! own intervals until shutdown.

use std::{future::Future, sync::Arc, time::Duration};

use pplns_storage::{PoolStorage, ShareDedupStore, StorageError};
use tokio::{
    sync::broadcast,
    time::{Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::{
    config::CashierConfig,
    error::{PoolError, PoolResult},
    node::{NodeApi, WalletApi},
    status::{send_status, State, Status},
    task_manager::TaskManager,
    utils::{wait_for_shutdown, ShutdownMessage},
};

pub mod block_resolver;
pub mod coinbase_ledger;
pub mod payouts;
pub mod pipeline;
pub mod pruner;
pub mod settlement;

use block_resolver::BlockResolver;
use coinbase_ledger::CoinbaseLedger;
use payouts::PayoutIssuer;
use pipeline::Pipeline;
use pruner::Pruner;
use settlement::Settlement;

pub struct Cashier {
    resolver: Arc<BlockResolver>,
    pipeline: Arc<Pipeline>,
    pruner: Arc<Pruner>,
    resolve_interval: Duration,
    settlement_interval: Duration,
    prune_interval: Duration,
}

impl Cashier {
    pub fn new(
        config: &CashierConfig,
        pool_wallet: &str,
        storage: Arc<dyn PoolStorage>,
        dedup: Arc<dyn ShareDedupStore>,
        node: Arc<dyn NodeApi>,
        wallet: Arc<dyn WalletApi>,
    ) -> Self {
        let resolver = Arc::new(BlockResolver::new(
            storage.clone(),
            config.unconfirmed_batch,
            config.coinbase_window,
        ));
        let payouts = if config.payouts_enabled {
            Some(PayoutIssuer::new(
                storage.clone(),
                wallet,
                pool_wallet.to_string(),
                config.wallet_password.clone().unwrap_or_default(),
                config.payout_batch,
            ))
        } else {
            None
        };
        let pipeline = Pipeline::new(
            resolver.clone(),
            CoinbaseLedger::new(node, storage.clone(), pool_wallet.to_string()),
            Settlement::new(storage.clone(), config.confirmed_batch, config.pplns_window),
            payouts,
        );
        let pruner = Pruner::new(
            storage,
            dedup,
            config.share_retention,
            config.dedup_retention_secs,
        );

        Self {
            resolver,
            pipeline: Arc::new(pipeline),
            pruner: Arc::new(pruner),
            resolve_interval: config.resolve_interval(),
            settlement_interval: config.settlement_interval(),
            prune_interval: config.prune_interval(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Spawn the resolver, pipeline and pruner loops on `task_manager`.
    pub fn start(
        &self,
        notify_shutdown: broadcast::Sender<ShutdownMessage>,
        status_sender: async_channel::Sender<Status>,
        task_manager: Arc<TaskManager>,
    ) {
        let resolver = self.resolver.clone();
        task_manager.spawn(run_periodic(
            "block resolver",
            self.resolve_interval,
            notify_shutdown.subscribe(),
            status_sender.clone(),
            move || {
                let resolver = resolver.clone();
                async move { resolver.resolve_once().await.map(|_| ()) }
            },
        ));

        let pipeline = self.pipeline.clone();
        task_manager.spawn(run_periodic(
            "cashier pipeline",
            self.settlement_interval,
            notify_shutdown.subscribe(),
            status_sender.clone(),
            move || {
                let pipeline = pipeline.clone();
                async move {
                    pipeline.run_once().await;
                    Ok(())
                }
            },
        ));

        let pruner = self.pruner.clone();
        task_manager.spawn(run_periodic(
            "pruner",
            self.prune_interval,
            notify_shutdown.subscribe(),
            status_sender,
            move || {
                let pruner = pruner.clone();
                async move { pruner.prune_once().await.map(|_| ()) }
            },
        ));
    }
}

/// Runs `tick` every `period` until shutdown. Errors are logged and retried on the next
/// tick, except for a storage backend that has gone away, which stops the pool.
async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<ShutdownMessage>,
    status_sender: async_channel::Sender<Status>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = PoolResult<()>>,
{
    if period.is_zero() {
        warn!("{name} disabled: zero interval");
        return;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Starting {name}, every {period:?}");

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("{name}: received shutdown signal");
                break;
            }
            _ = interval.tick() => match tick().await {
                Ok(()) => {}
                Err(PoolError::Storage(StorageError::BackendUnavailable)) => {
                    error!("{name}: storage backend unavailable");
                    send_status(&status_sender, State::CashierShutdown(name.to_string())).await;
                    break;
                }
                Err(e) => error!("{name} failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_loop_ticks_until_shutdown() {
        let (notify_shutdown, _) = broadcast::channel(4);
        let (status_sender, _status_receiver) = async_channel::unbounded();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let handle = tokio::spawn(run_periodic(
            "test",
            Duration::from_secs(30),
            notify_shutdown.subscribe(),
            status_sender,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        notify_shutdown.send(ShutdownMessage::ShutdownAll).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_backend_reports_status() {
        let (notify_shutdown, _) = broadcast::channel(4);
        let (status_sender, status_receiver) = async_channel::unbounded();

        run_periodic(
            "resolver",
            Duration::from_millis(1),
            notify_shutdown.subscribe(),
            status_sender,
            || async { Err(PoolError::Storage(StorageError::BackendUnavailable)) },
        )
        .await;

        let status = status_receiver.recv().await.unwrap();
        assert_eq!(status.state, State::CashierShutdown("resolver".to_string()));
    }
}
