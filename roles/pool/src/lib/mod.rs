use std::sync::Arc;

use pplns_storage::{backends::memory::MemoryStorage, PoolStorage, ShareDedupStore};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    cashier::Cashier,
    client_registry::{BigJobMatcher, ClientRegistry},
    config::{PoolConfig, StorageBackend, StorageConfig},
    error::{PoolError, PoolResult},
    job_manager::JobManager,
    metrics::PoolMetrics,
    node::{DevNode, DevNodeConfig, MockWallet, NodeApi, WalletApi},
    share_validator::ShareValidator,
    status::{State, Status},
    stratum::{server::StratumServer, StratumHandler},
    task_manager::TaskManager,
    template_receiver::TemplateReceiver,
    utils::ShutdownMessage,
};

pub mod cashier;
pub mod client_registry;
pub mod config;
pub mod error;
pub mod job_manager;
pub mod metrics;
pub mod node;
pub mod session;
pub mod share_validator;
pub mod status;
pub mod stratum;
pub mod task_manager;
pub mod template_receiver;
pub mod utils;

#[derive(Debug, Clone)]
pub struct PoolWorker {
    config: PoolConfig,
    notify_shutdown: broadcast::Sender<ShutdownMessage>,
}

impl PoolWorker {
    pub fn new(config: PoolConfig) -> Self {
        let (notify_shutdown, _) = tokio::sync::broadcast::channel::<ShutdownMessage>(100);
        Self {
            config,
            notify_shutdown,
        }
    }

    /// Starts the pool and runs until Ctrl+C or a component reports a fatal status.
    pub async fn start(&self) -> PoolResult<()> {
        if self.config.pool_wallet.is_empty() {
            return Err(PoolError::Custom("pool_wallet must be set".to_string()));
        }

        let notify_shutdown = self.notify_shutdown.clone();
        let task_manager = Arc::new(TaskManager::new());
        let (status_sender, status_receiver) = async_channel::unbounded::<Status>();

        let (storage, dedup) = open_storage(&self.config.storage).await?;
        info!("Storage backend {:?} initialized", self.config.storage.backend);

        let metrics = Arc::new(PoolMetrics::new());
        let jobs = Arc::new(JobManager::new());
        let node: Arc<dyn NodeApi> = Arc::new(DevNode::new(DevNodeConfig::from_node_config(
            &self.config.node,
        )?));
        let wallet: Arc<dyn WalletApi> = Arc::new(MockWallet::new());
        debug!("Collaborators initialized.");

        let stratum = &self.config.stratum;
        let registry = Arc::new(ClientRegistry::new(
            metrics.clone(),
            stratum.difficulty,
            BigJobMatcher::new(stratum.big_job_pattern.clone()),
            stratum.wallet_grace_period(),
        ));
        let validator = Arc::new(ShareValidator::new(
            node.clone(),
            jobs.clone(),
            storage.clone(),
            dedup.clone(),
            metrics.clone(),
            stratum.difficulty,
            self.config.pool_wallet.clone(),
        ));
        let server = StratumServer::bind(
            stratum.listen_address,
            registry.clone(),
            Arc::new(StratumHandler::new(validator)),
            metrics.clone(),
        )
        .await?;

        TemplateReceiver::new(
            node.clone(),
            jobs,
            registry,
            self.config.pool_wallet.clone(),
            self.config.node.template_poll_interval(),
        )
        .start(
            notify_shutdown.clone(),
            status_sender.clone(),
            task_manager.clone(),
        )
        .await?;

        server.start(
            notify_shutdown.clone(),
            status_sender.clone(),
            task_manager.clone(),
        );

        Cashier::new(
            &self.config.cashier,
            &self.config.pool_wallet,
            storage.clone(),
            dedup,
            node,
            wallet,
        )
        .start(notify_shutdown.clone(), status_sender, task_manager.clone());

        info!("Waiting for shutdown signal or component status...");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, initiating graceful shutdown...");
            }
            message = status_receiver.recv() => match message.map(|status| status.state) {
                Ok(State::TemplateListenerShutdown(reason)) => {
                    warn!("Template listener shutdown ({reason}), initiating full shutdown.");
                }
                Ok(State::StratumServerShutdown(reason)) => {
                    warn!("Stratum server shutdown ({reason}), initiating full shutdown.");
                }
                Ok(State::CashierShutdown(task)) => {
                    warn!("Cashier task {task} shut down, initiating full shutdown.");
                }
                Err(_) => warn!("Every component exited, shutting down."),
            }
        }
        let _ = notify_shutdown.send(ShutdownMessage::ShutdownAll);

        warn!("Graceful shutdown initiated");

        info!("Waiting for tasks to complete gracefully...");
        let graceful_shutdown = tokio::time::timeout(
            tokio::time::Duration::from_secs(10),
            task_manager.join_all(),
        );

        match graceful_shutdown.await {
            Ok(_) => {
                info!("All tasks completed gracefully");
            }
            Err(_) => {
                warn!("Graceful shutdown timeout exceeded, aborting remaining tasks...");
                task_manager.abort_all().await;
                info!("Joining aborted tasks...");
                task_manager.join_all().await;
            }
        }

        if let Err(e) = storage.close().await {
            error!("Failed to close storage: {e}");
        }
        info!("Final counters: {:?}", metrics.snapshot());
        info!("Pool shutdown complete.");
        Ok(())
    }
}

impl Drop for PoolWorker {
    fn drop(&mut self) {
        info!("PoolWorker dropped");
        let _ = self.notify_shutdown.send(ShutdownMessage::ShutdownAll);
    }
}

/// Opens the configured backend. One instance serves both the system of record and the
/// share dedup set.
pub async fn open_storage(
    config: &StorageConfig,
) -> PoolResult<(Arc<dyn PoolStorage>, Arc<dyn ShareDedupStore>)> {
    match config.backend {
        StorageBackend::Memory => {
            let mut storage = MemoryStorage::new();
            storage.initialize().await?;
            let storage = Arc::new(storage);
            let dedup: Arc<dyn ShareDedupStore> = storage.clone();
            let storage: Arc<dyn PoolStorage> = storage;
            Ok((storage, dedup))
        }
        #[cfg(feature = "sqlite-backend")]
        StorageBackend::Sqlite => {
            let path = config.database_path.clone().ok_or_else(|| {
                PoolError::Custom("storage.database_path is required for sqlite".to_string())
            })?;
            let mut storage = pplns_storage::backends::sqlite::SqliteStorage::new(path)
                .with_dedup_key(config.dedup_key.clone());
            storage.initialize().await?;
            let storage = Arc::new(storage);
            let dedup: Arc<dyn ShareDedupStore> = storage.clone();
            let storage: Arc<dyn PoolStorage> = storage;
            Ok((storage, dedup))
        }
        #[cfg(not(feature = "sqlite-backend"))]
        StorageBackend::Sqlite => Err(PoolError::Custom(
            "pool was built without the sqlite-backend feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_storage() {
        let (storage, dedup) = open_storage(&StorageConfig::default()).await.unwrap();
        assert!(dedup.add_if_new("1_1", 10).await.unwrap());
        assert!(!dedup.add_if_new("1_1", 11).await.unwrap());
        assert!(storage.get_block("missing").await.unwrap().is_none());
    }

    #[cfg(not(feature = "sqlite-backend"))]
    #[tokio::test]
    async fn test_sqlite_requires_feature() {
        let config = StorageConfig {
            backend: StorageBackend::Sqlite,
            database_path: Some("/tmp/pool.db".to_string()),
            ..Default::default()
        };
        assert!(open_storage(&config).await.is_err());
    }
}
