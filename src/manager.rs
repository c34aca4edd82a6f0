//! Process-wide queue registry and lifecycle orchestration.
//!
//! One [`QueueManager`] per process, injected wherever it is needed (no
//! hidden global). It owns no durable state: everything lives in the store,
//! and the manager only tracks which queues, workers, and processors exist
//! in this process.

use crate::{
    config::Config,
    job::{Job, JobOptions},
    queue::{Queue, QueueOptions},
    stats::{QueueStats, SystemInfo},
    store::{RedisStore, Store},
    webhook::{WebhookConfig, WebhookDispatcher},
    worker::{JobHandler, Worker},
    ConveyorError, Result,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Poll interval for the per-worker crash monitor.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Registry mapping queue name → queue, worker (at most one), and processor.
///
/// # Examples
///
/// ```rust,no_run
/// use conveyor::{Config, QueueManager, worker::JobResult};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> conveyor::Result<()> {
/// let manager = QueueManager::connect(Config::from_env()?).await?;
///
/// manager.create_queue("email", None).await;
/// manager
///     .register_processor("email", Arc::new(|job| Box::pin(async move {
///         println!("sending {:?}", job.data);
///         Ok(JobResult::success())
///     })))
///     .await;
/// manager.start_worker("email", None).await?;
///
/// manager.add_job("email", json!({"to": "user@example.com"}), None, None).await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueManager {
    store: Arc<dyn Store>,
    config: Config,
    http_client: reqwest::Client,
    dispatcher: Arc<WebhookDispatcher>,
    queues: Arc<RwLock<HashMap<String, Arc<Queue>>>>,
    workers: Arc<RwLock<HashMap<String, Arc<Worker>>>>,
    processors: Arc<RwLock<HashMap<String, JobHandler>>>,
    started_at: DateTime<Utc>,
}

impl QueueManager {
    /// Connect to the configured Redis server and build a manager around it.
    pub async fn connect(config: Config) -> Result<Self> {
        let store = RedisStore::connect(&config.redis_url()).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Build a manager around an existing store.
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let dispatcher = Arc::new(WebhookDispatcher::new(
            config.webhook_timeout,
            config.webhook_retry_attempts,
        ));
        Self {
            store,
            config,
            http_client: reqwest::Client::new(),
            dispatcher,
            queues: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(RwLock::new(HashMap::new())),
            processors: Arc::new(RwLock::new(HashMap::new())),
            started_at: Utc::now(),
        }
    }

    /// Get or create the queue with the given name. Idempotent: options are
    /// only applied when the queue does not exist yet.
    pub async fn create_queue(&self, name: &str, options: Option<QueueOptions>) -> Arc<Queue> {
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get(name) {
            return Arc::clone(queue);
        }

        let options = options.unwrap_or_else(|| QueueOptions {
            retry_delay: self.config.default_retry_delay,
            ..Default::default()
        });
        let queue = Arc::new(Queue::new(name, Arc::clone(&self.store), options));
        queues.insert(name.to_string(), Arc::clone(&queue));
        info!("created queue {}", name);
        queue
    }

    /// Look up an existing queue.
    pub async fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Stop the queue's worker (if any), wipe its keys, and forget it.
    /// Returns whether the queue existed.
    pub async fn remove_queue(&self, name: &str) -> Result<bool> {
        let worker = self.workers.write().await.remove(name);
        if let Some(worker) = worker {
            worker.stop().await?;
        }

        let queue = self.queues.write().await.remove(name);
        let Some(queue) = queue else {
            return Ok(false);
        };
        self.processors.write().await.remove(name);
        queue.clean().await?;
        info!("removed queue {}", name);
        Ok(true)
    }

    /// Construct a job and enqueue it. Fails when the queue does not exist
    /// or the webhook configuration is invalid.
    pub async fn add_job(
        &self,
        name: &str,
        data: serde_json::Value,
        options: Option<JobOptions>,
        webhook: Option<WebhookConfig>,
    ) -> Result<Job> {
        let queue = self.require_queue(name).await?;

        if let Some(webhook) = &webhook {
            let problems = crate::webhook::validate(webhook);
            if !problems.is_empty() {
                return Err(ConveyorError::Validation { messages: problems });
            }
        }

        let options = options.unwrap_or_else(|| JobOptions {
            max_attempts: self.config.default_retry_attempts,
            ..Default::default()
        });
        let mut job = Job::new(name, data).with_options(options);
        if let Some(webhook) = webhook {
            job = job.with_webhook(webhook);
        }

        queue.add(&job).await?;
        Ok(job)
    }

    /// Load a job record from its queue.
    pub async fn get_job(&self, name: &str, id: crate::JobId) -> Result<Option<Job>> {
        self.require_queue(name).await?.get(id).await
    }

    /// Remove a job from its queue entirely. Returns whether anything was
    /// removed.
    pub async fn remove_job(&self, name: &str, id: crate::JobId) -> Result<bool> {
        self.require_queue(name).await?.remove(id).await
    }

    /// Update a job's progress field.
    pub async fn update_job_progress(
        &self,
        name: &str,
        id: crate::JobId,
        progress: u8,
    ) -> Result<()> {
        self.require_queue(name).await?.update_progress(id, progress).await
    }

    /// Register the processor invoked by `start_worker` for this queue.
    /// Replaces any previous registration.
    pub async fn register_processor(&self, name: &str, handler: JobHandler) {
        self.processors
            .write()
            .await
            .insert(name.to_string(), handler);
        info!("registered processor for queue {}", name);
    }

    /// Start a generic worker for the queue.
    ///
    /// Errors when the queue does not exist or no processor is registered;
    /// returns `Ok(false)` when a worker is already running for it.
    pub async fn start_worker(&self, name: &str, concurrency: Option<usize>) -> Result<bool> {
        let queue = self.require_queue(name).await?;
        let handler = self
            .processors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ConveyorError::Queue {
                message: format!("no processor registered for queue {}", name),
            })?;

        let worker = Arc::new(Worker::new(
            queue,
            handler,
            Arc::clone(&self.dispatcher),
            concurrency,
            self.config.default_concurrency,
        ));
        self.install_worker(name, worker).await
    }

    /// Start an HTTP-task worker for the queue; no processor registration
    /// needed, the dispatcher is built in.
    pub async fn start_http_worker(&self, name: &str, concurrency: Option<usize>) -> Result<bool> {
        let queue = self.require_queue(name).await?;
        let worker = Arc::new(Worker::for_http_tasks(
            queue,
            self.http_client.clone(),
            Arc::clone(&self.dispatcher),
            concurrency,
            self.config.default_concurrency,
        ));
        self.install_worker(name, worker).await
    }

    /// Stop and forget the queue's worker. Returns whether one was running.
    pub async fn stop_worker(&self, name: &str) -> Result<bool> {
        let worker = self.workers.write().await.remove(name);
        match worker {
            Some(worker) => {
                worker.stop().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every running worker.
    pub async fn stop_all_workers(&self) -> Result<()> {
        let workers: Vec<(String, Arc<Worker>)> =
            self.workers.write().await.drain().collect();
        for (name, worker) in workers {
            if let Err(e) = worker.stop().await {
                error!("failed to stop worker for queue {}: {}", name, e);
            }
        }
        Ok(())
    }

    /// Wipe every registered queue's keys.
    pub async fn clean_all_queues(&self) -> Result<()> {
        let queues: Vec<Arc<Queue>> = self.queues.read().await.values().cloned().collect();
        for queue in queues {
            queue.clean().await?;
        }
        Ok(())
    }

    /// Stats for one queue.
    pub async fn get_stats(&self, name: &str) -> Result<QueueStats> {
        self.require_queue(name).await?.stats().await
    }

    /// Stats for every registered queue.
    pub async fn get_all_stats(&self) -> Result<Vec<QueueStats>> {
        let queues: Vec<Arc<Queue>> = self.queues.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            stats.push(queue.stats().await?);
        }
        Ok(stats)
    }

    /// Process-level overview.
    pub async fn get_system_info(&self) -> SystemInfo {
        let mut queues: Vec<String> = self.queues.read().await.keys().cloned().collect();
        queues.sort();
        let mut running_workers: Vec<String> = self
            .workers
            .read()
            .await
            .iter()
            .filter(|(_, worker)| worker.is_running())
            .map(|(name, _)| name.clone())
            .collect();
        running_workers.sort();
        let mut registered_processors: Vec<String> =
            self.processors.read().await.keys().cloned().collect();
        registered_processors.sort();

        SystemInfo {
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            queues,
            running_workers,
            registered_processors,
            default_concurrency: self.config.default_concurrency,
        }
    }

    /// Graceful shutdown: stop all workers. The store connection drops with
    /// the manager.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down queue manager");
        self.stop_all_workers().await
    }

    async fn require_queue(&self, name: &str) -> Result<Arc<Queue>> {
        self.get_queue(name)
            .await
            .ok_or_else(|| ConveyorError::Queue {
                message: format!("unknown queue {}", name),
            })
    }

    async fn install_worker(&self, name: &str, worker: Arc<Worker>) -> Result<bool> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(name) {
            return Ok(false);
        }
        worker.start()?;
        workers.insert(name.to_string(), Arc::clone(&worker));
        drop(workers);

        self.spawn_crash_monitor(name.to_string(), worker);
        Ok(true)
    }

    fn spawn_crash_monitor(&self, name: String, worker: Arc<Worker>) {
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;
                if worker.crashed() {
                    warn!("worker for queue {} crashed; deregistering it", name);
                    workers.write().await.remove(&name);
                    break;
                }
                if !worker.is_running() {
                    // Stopped through the manager; nothing to clean up.
                    break;
                }
            }
        });
    }
}
