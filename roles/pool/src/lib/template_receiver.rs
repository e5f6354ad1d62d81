//! ## Template Receiver
//!
//! Turns node templates into work. Waits for the node to sync, then on every new-template
//! notification (or on the poll interval, if notifications go quiet) fetches a template
//! paying the pool wallet, stores it as a [`WorkJob`] and broadcasts it to every session.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc},
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    client_registry::ClientRegistry,
    error::{NodeError, PoolResult},
    job_manager::{JobManager, WorkJob},
    node::NodeApi,
    status::{send_status, State, Status},
    task_manager::TaskManager,
    utils::{wait_for_shutdown, ShutdownMessage},
};

pub struct TemplateReceiver {
    node: Arc<dyn NodeApi>,
    jobs: Arc<JobManager>,
    registry: Arc<ClientRegistry>,
    pool_wallet: String,
    poll_interval: Duration,
}

impl TemplateReceiver {
    pub fn new(
        node: Arc<dyn NodeApi>,
        jobs: Arc<JobManager>,
        registry: Arc<ClientRegistry>,
        pool_wallet: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            node,
            jobs,
            registry,
            pool_wallet,
            poll_interval,
        }
    }

    /// Fetch a fresh template, register it and send it to every session.
    pub async fn refresh(&self) -> Result<Arc<WorkJob>, NodeError> {
        let template = self.node.get_block_template(&self.pool_wallet).await?;
        let job = self.jobs.add_job(template);
        debug!(
            job_id = job.id,
            blue_score = job.blue_score(),
            "New block template"
        );
        self.registry.broadcast(&job);
        Ok(job)
    }

    /// Waits for node sync, publishes a first job, then spawns the listener task.
    pub async fn start(
        self,
        notify_shutdown: broadcast::Sender<ShutdownMessage>,
        status_sender: async_channel::Sender<Status>,
        task_manager: Arc<TaskManager>,
    ) -> PoolResult<()> {
        info!("Waiting for node sync...");
        self.node.wait_for_sync().await?;
        let notifications = self.node.new_template_notifications().await?;
        self.refresh().await?;
        info!("Template listener started");

        let shutdown = notify_shutdown.subscribe();
        task_manager.spawn(self.listen(notifications, shutdown, status_sender));
        Ok(())
    }

    async fn listen(
        self,
        mut notifications: mpsc::Receiver<()>,
        mut shutdown: broadcast::Receiver<ShutdownMessage>,
        status_sender: async_channel::Sender<Status>,
    ) {
        let mut poll = (!self.poll_interval.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + self.poll_interval,
                self.poll_interval,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Template listener: received shutdown signal");
                    break;
                }
                notification = notifications.recv() => match notification {
                    Some(()) => {
                        if let Some(poll) = poll.as_mut() {
                            poll.reset();
                        }
                        if let Err(e) = self.refresh().await {
                            error!(error = %e, "Error getting block template");
                        }
                    }
                    None => {
                        warn!("Node closed the template notification stream");
                        send_status(
                            &status_sender,
                            State::TemplateListenerShutdown("notification stream closed".to_string()),
                        )
                        .await;
                        break;
                    }
                },
                _ = poll_tick(&mut poll) => {
                    if let Err(e) = self.refresh().await {
                        error!(error = %e, "Error polling block template");
                    }
                }
            }
        }
    }
}

async fn poll_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client_registry::BigJobMatcher,
        metrics::PoolMetrics,
        node::{DevNode, DevNodeConfig},
    };

    fn receiver(node: Arc<DevNode>, jobs: Arc<JobManager>, poll: Duration) -> TemplateReceiver {
        let registry = Arc::new(ClientRegistry::new(
            Arc::new(PoolMetrics::new()),
            4,
            BigJobMatcher::new("*BzMiner*"),
            Duration::from_secs(20),
        ));
        TemplateReceiver::new(node, jobs, registry, "pool".to_string(), poll)
    }

    #[tokio::test]
    async fn test_refresh_registers_job_for_pool_wallet() {
        let node = Arc::new(DevNode::new(DevNodeConfig::default()));
        let jobs = Arc::new(JobManager::new());
        let receiver = receiver(node.clone(), jobs.clone(), Duration::ZERO);

        let job = receiver.refresh().await.unwrap();
        assert_eq!(job.id, 1);
        assert_eq!(job.blue_score(), node.blue_score());
        assert_eq!(job.template.body["payAddress"], "pool");
        assert!(jobs.get_job(1).is_some());
    }

    #[tokio::test]
    async fn test_notifications_produce_jobs_until_shutdown() {
        let node = Arc::new(DevNode::new(DevNodeConfig::default()));
        let jobs = Arc::new(JobManager::new());
        let task_manager = Arc::new(TaskManager::new());
        let (notify_shutdown, _) = broadcast::channel(4);
        let (status_sender, _status_receiver) = async_channel::unbounded();

        receiver(node.clone(), jobs.clone(), Duration::ZERO)
            .start(notify_shutdown.clone(), status_sender, task_manager.clone())
            .await
            .unwrap();
        assert_eq!(jobs.latest_id(), 1);

        node.advance();
        node.advance();
        for _ in 0..100 {
            if jobs.latest_id() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(jobs.latest_id() >= 2);

        notify_shutdown.send(ShutdownMessage::ShutdownAll).unwrap();
        task_manager.join_all().await;
    }
}
