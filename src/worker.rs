//! Worker types for draining a queue.
//!
//! A [`Worker`] owns `concurrency` consumer loops plus one periodic sweeper
//! for its queue. Consumers claim jobs, invoke the processor, and record the
//! outcome; the sweeper promotes due delayed jobs (and, when configured,
//! reclaims stalled ones). One bad job never stops the pool: every error is
//! recovered inside the loop that saw it.
//!
//! # Lifecycle
//!
//! `Idle → Running → Stopping → Idle`. Starting a running worker is an
//! error; stopping an idle one is a no-op. `stop()` raises a flag observed
//! at each loop iteration and waits up to 30 seconds for in-flight jobs to
//! drain; processors are never interrupted, and a processor that outlives
//! the grace period still gets its terminal write when it finishes.

use crate::{
    error::ConveyorError,
    job::{Job, JobId, JobStatus},
    queue::Queue,
    webhook::{WebhookDispatcher, WebhookEvent},
    Result,
};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

/// How often the sweeper fires.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Pause after an error from the loop itself (e.g. a store hiccup).
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// How long `stop()` waits for in-flight jobs.
const STOP_GRACE: Duration = Duration::from_secs(30);
/// Drain poll interval during `stop()`.
const STOP_POLL: Duration = Duration::from_secs(1);

/// Result returned by job processors, optionally carrying result data that
/// is stored on the completed job.
#[derive(Debug, Clone, Default)]
pub struct JobResult {
    pub data: Option<serde_json::Value>,
}

impl JobResult {
    /// Success with nothing to store.
    pub fn success() -> Self {
        Self { data: None }
    }

    /// Success with result data.
    pub fn with_data(data: serde_json::Value) -> Self {
        Self { data: Some(data) }
    }
}

/// Type alias for job processor functions.
///
/// Processors are async functions that take a [`Job`] and return a
/// [`Result<JobResult>`]. Returning an error triggers the queue's
/// retry/backoff path.
///
/// # Examples
///
/// ```rust
/// use conveyor::{Job, worker::{JobHandler, JobResult}};
/// use std::sync::Arc;
///
/// let handler: JobHandler = Arc::new(|job: Job| {
///     Box::pin(async move {
///         println!("processing {:?}", job.data);
///         Ok(JobResult::success())
///     })
/// });
/// ```
pub type JobHandler = Arc<
    dyn Fn(Job) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<JobResult>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Running,
    Stopping,
}

/// A pool of concurrent consumers for one queue.
pub struct Worker {
    queue: Arc<Queue>,
    handler: JobHandler,
    dispatcher: Arc<WebhookDispatcher>,
    concurrency: usize,
    state: Mutex<WorkerState>,
    running: AtomicBool,
    crashed: AtomicBool,
    epoch: AtomicU64,
    active_jobs: Mutex<HashSet<JobId>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker for `queue` running `handler`.
    ///
    /// Effective concurrency is the explicit argument, falling back to the
    /// queue's option, falling back to the system default; always at least 1.
    pub fn new(
        queue: Arc<Queue>,
        handler: JobHandler,
        dispatcher: Arc<WebhookDispatcher>,
        concurrency: Option<usize>,
        default_concurrency: usize,
    ) -> Self {
        let concurrency = concurrency
            .or(queue.options().concurrency)
            .unwrap_or(default_concurrency)
            .max(1);
        Self {
            queue,
            handler,
            dispatcher,
            concurrency,
            state: Mutex::new(WorkerState::Idle),
            running: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            active_jobs: Mutex::new(HashSet::new()),
            sweeper: Mutex::new(None),
            watchdog: Mutex::new(None),
        }
    }

    /// Create a worker whose processor is the built-in HTTP-task dispatcher.
    pub fn for_http_tasks(
        queue: Arc<Queue>,
        client: reqwest::Client,
        dispatcher: Arc<WebhookDispatcher>,
        concurrency: Option<usize>,
        default_concurrency: usize,
    ) -> Self {
        Self::new(
            queue,
            crate::http_task::http_task_handler(client),
            dispatcher,
            concurrency,
            default_concurrency,
        )
    }

    /// Launch the sweeper and the consumer loops.
    ///
    /// Fails if the worker is already running or still stopping.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                WorkerState::Running => {
                    return Err(ConveyorError::Worker {
                        message: format!(
                            "worker for queue {} is already running",
                            self.queue.name()
                        ),
                    });
                }
                WorkerState::Stopping => {
                    return Err(ConveyorError::Worker {
                        message: format!(
                            "worker for queue {} is still stopping",
                            self.queue.name()
                        ),
                    });
                }
                WorkerState::Idle => *state = WorkerState::Running,
            }
        }

        self.running.store(true, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "worker started for queue {} with concurrency {}",
            self.queue.name(),
            self.concurrency
        );

        let sweeper = tokio::spawn({
            let worker = Arc::clone(self);
            async move { worker.sweeper_loop().await }
        });
        *self.sweeper.lock().unwrap() = Some(sweeper);

        let mut consumers = Vec::with_capacity(self.concurrency);
        for index in 0..self.concurrency {
            consumers.push(tokio::spawn({
                let worker = Arc::clone(self);
                async move { worker.consumer_loop(index).await }
            }));
        }

        // If every consumer exits while the run flag is still up, something
        // killed them from the inside (panicking handlers); mark the worker
        // crashed so the manager can forget and restart it.
        let watchdog = tokio::spawn({
            let worker = Arc::clone(self);
            async move {
                for handle in consumers {
                    if let Err(e) = handle.await {
                        error!(
                            "consumer task for queue {} aborted: {}",
                            worker.queue.name(),
                            e
                        );
                    }
                }
                if worker.epoch.load(Ordering::SeqCst) == epoch
                    && worker.running.swap(false, Ordering::SeqCst)
                {
                    worker.crashed.store(true, Ordering::SeqCst);
                    *worker.state.lock().unwrap() = WorkerState::Idle;
                    error!(
                        "all consumers for queue {} exited unexpectedly",
                        worker.queue.name()
                    );
                }
            }
        });
        *self.watchdog.lock().unwrap() = Some(watchdog);

        Ok(())
    }

    /// Signal the loops to stop and wait for in-flight jobs to drain.
    ///
    /// Returns after at most 30 seconds; jobs still in flight at that point
    /// continue in the background and their terminal writes still apply.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                WorkerState::Idle | WorkerState::Stopping => return Ok(()),
                WorkerState::Running => *state = WorkerState::Stopping,
            }
        }

        info!("stopping worker for queue {}", self.queue.name());
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        loop {
            let in_flight = self.active_jobs.lock().unwrap().len();
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "worker for queue {} stopped with {} job(s) still in flight",
                    self.queue.name(),
                    in_flight
                );
                break;
            }
            sleep(STOP_POLL).await;
        }

        *self.state.lock().unwrap() = WorkerState::Idle;
        info!("worker for queue {} stopped", self.queue.name());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Jobs currently being processed by this worker.
    pub fn active_job_count(&self) -> usize {
        self.active_jobs.lock().unwrap().len()
    }

    async fn consumer_loop(&self, index: usize) {
        debug!(
            "consumer {} started for queue {}",
            index,
            self.queue.name()
        );
        while self.running.load(Ordering::SeqCst) {
            match self.queue.next().await {
                Ok(Some(job)) => self.handle_job(job).await,
                Ok(None) => {
                    // The dequeue already blocked for its timeout.
                }
                Err(e) => {
                    error!("queue {} consumer error: {}", self.queue.name(), e);
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }
        debug!("consumer {} for queue {} exiting", index, self.queue.name());
    }

    async fn handle_job(&self, mut job: Job) {
        let job_id = job.id;
        self.active_jobs.lock().unwrap().insert(job_id);
        debug!("processing job {} on queue {}", job_id, self.queue.name());

        match (self.handler)(job.clone()).await {
            Ok(result) => {
                if let Err(e) = self.queue.complete(&mut job, result.data).await {
                    error!("failed to record completion of job {}: {}", job_id, e);
                } else if job.webhook.is_some() {
                    let delivery = self
                        .dispatcher
                        .dispatch(WebhookEvent::Completed, &job)
                        .await;
                    if !delivery.success {
                        warn!(
                            "completion webhook for job {} not delivered: {}",
                            job_id,
                            delivery.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
            }
            Err(e) => {
                let message = match &e {
                    ConveyorError::Worker { message } => message.clone(),
                    other => other.to_string(),
                };
                match self.queue.fail(&mut job, &message).await {
                    Ok(()) => {
                        // Failed (rather than Delayed) after fail() means no
                        // retries remain; only then does the webhook fire.
                        if job.webhook.is_some() && job.status == JobStatus::Failed {
                            let delivery =
                                self.dispatcher.dispatch(WebhookEvent::Failed, &job).await;
                            if !delivery.success {
                                warn!(
                                    "failure webhook for job {} not delivered: {}",
                                    job_id,
                                    delivery.error.as_deref().unwrap_or("unknown error")
                                );
                            }
                        }
                    }
                    Err(e) => error!("failed to record failure of job {}: {}", job_id, e),
                }
            }
        }

        self.active_jobs.lock().unwrap().remove(&job_id);
    }

    async fn sweeper_loop(&self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.queue.promote_delayed().await {
                warn!("queue {} delayed sweep failed: {}", self.queue.name(), e);
            }
            if let Some(older_than) = self.queue.options().reclaim_stalled_after {
                if let Err(e) = self.queue.reclaim_stalled(older_than).await {
                    warn!("queue {} stalled reclaim failed: {}", self.queue.name(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::QueueOptions,
        store::MemoryStore,
    };
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_queue(name: &str, options: QueueOptions) -> Arc<Queue> {
        Arc::new(Queue::new(name, Arc::new(MemoryStore::new()), options))
    }

    fn test_dispatcher() -> Arc<WebhookDispatcher> {
        Arc::new(WebhookDispatcher::new(Duration::from_secs(5), 1))
    }

    fn noop_handler() -> JobHandler {
        Arc::new(|_job: Job| Box::pin(async move { Ok(JobResult::success()) }))
    }

    async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let queue = test_queue("twice", QueueOptions::default());
        let worker = Arc::new(Worker::new(
            queue,
            noop_handler(),
            test_dispatcher(),
            Some(1),
            5,
        ));

        worker.start().unwrap();
        assert!(worker.start().is_err());
        worker.stop().await.unwrap();
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_a_noop() {
        let queue = test_queue("idle", QueueOptions::default());
        let worker = Arc::new(Worker::new(
            queue,
            noop_handler(),
            test_dispatcher(),
            Some(1),
            5,
        ));
        worker.stop().await.unwrap();
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_concurrency_resolution_order() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

        let queue_opt = Arc::new(Queue::new(
            "conc",
            store.clone(),
            QueueOptions {
                concurrency: Some(7),
                ..Default::default()
            },
        ));
        let explicit = Worker::new(
            queue_opt.clone(),
            noop_handler(),
            test_dispatcher(),
            Some(2),
            5,
        );
        assert_eq!(explicit.concurrency(), 2);

        let from_queue = Worker::new(queue_opt, noop_handler(), test_dispatcher(), None, 5);
        assert_eq!(from_queue.concurrency(), 7);

        let plain = Arc::new(Queue::new("conc2", store, QueueOptions::default()));
        let from_default = Worker::new(plain, noop_handler(), test_dispatcher(), None, 5);
        assert_eq!(from_default.concurrency(), 5);
    }

    #[tokio::test]
    async fn test_delayed_job_is_processed_once() {
        let queue = test_queue("delayed", QueueOptions::default());
        let invocations = Arc::new(AtomicUsize::new(0));
        let handler: JobHandler = {
            let invocations = invocations.clone();
            Arc::new(move |_job: Job| {
                let invocations = invocations.clone();
                Box::pin(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(JobResult::success())
                })
            })
        };

        let job = Job::new("delayed", json!({})).with_delay(Duration::from_millis(200));
        queue.add(&job).await.unwrap();

        let worker = Arc::new(Worker::new(
            queue.clone(),
            handler,
            test_dispatcher(),
            Some(1),
            5,
        ));
        worker.start().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.stats().await.unwrap().completed_jobs < 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "delayed job was not completed in time"
            );
            sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.delayed, 0);

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_worker_preserves_fifo_order() {
        let queue = test_queue("order", QueueOptions::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let handler: JobHandler = {
            let order = order.clone();
            Arc::new(move |job: Job| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(job.data["label"].as_str().unwrap().to_string());
                    Ok(JobResult::success())
                })
            })
        };

        for label in ["a", "b", "c"] {
            queue
                .add(&Job::new("order", json!({ "label": label })))
                .await
                .unwrap();
        }

        let worker = Arc::new(Worker::new(
            queue.clone(),
            handler,
            test_dispatcher(),
            Some(1),
            5,
        ));
        worker.start().unwrap();

        let done = {
            let order = order.clone();
            wait_until(Duration::from_secs(5), move || {
                order.lock().unwrap().len() == 3
            })
            .await
        };
        assert!(done, "jobs were not processed in time");
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_until_success_counts_failed_attempts() {
        // Short backoff base keeps retry delays in the tens of milliseconds.
        let queue = test_queue(
            "flaky",
            QueueOptions {
                retry_delay: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let invocations = Arc::new(AtomicUsize::new(0));
        let handler: JobHandler = {
            let invocations = invocations.clone();
            Arc::new(move |_job: Job| {
                let invocations = invocations.clone();
                Box::pin(async move {
                    let n = invocations.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(ConveyorError::Worker {
                            message: format!("transient failure {}", n),
                        })
                    } else {
                        Ok(JobResult::success())
                    }
                })
            })
        };

        let job = Job::new("flaky", json!({})).with_max_attempts(3);
        let job_id = queue.add(&job).await.unwrap();

        let worker = Arc::new(Worker::new(
            queue.clone(),
            handler,
            test_dispatcher(),
            Some(1),
            5,
        ));
        worker.start().unwrap();

        let done = {
            let invocations = invocations.clone();
            wait_until(Duration::from_secs(10), move || {
                invocations.load(Ordering::SeqCst) == 3
            })
            .await
        };
        assert!(done, "job did not reach its third attempt");
        worker.stop().await.unwrap();

        let stored = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        // Two recorded failures; the successful attempt is not counted.
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_job() {
        let queue = test_queue("drain", QueueOptions::default());
        let handler: JobHandler = Arc::new(|_job: Job| {
            Box::pin(async move {
                sleep(Duration::from_millis(300)).await;
                Ok(JobResult::success())
            })
        });
        queue.add(&Job::new("drain", json!({}))).await.unwrap();

        let worker = Arc::new(Worker::new(
            queue.clone(),
            handler,
            test_dispatcher(),
            Some(1),
            5,
        ));
        worker.start().unwrap();

        let picked_up = {
            let worker = worker.clone();
            wait_until(Duration::from_secs(3), move || {
                worker.active_job_count() == 1
            })
            .await
        };
        assert!(picked_up, "job was never claimed");

        worker.stop().await.unwrap();
        assert_eq!(worker.active_job_count(), 0);
        assert_eq!(queue.stats().await.unwrap().completed_jobs, 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_records_error() {
        let queue = test_queue("doomed", QueueOptions::default());
        let handler: JobHandler = Arc::new(|_job: Job| {
            Box::pin(async move {
                Err(ConveyorError::Worker {
                    message: "boom".to_string(),
                })
            })
        });

        let job = Job::new("doomed", json!({})).with_max_attempts(1);
        let job_id = queue.add(&job).await.unwrap();

        let worker = Arc::new(Worker::new(
            queue.clone(),
            handler,
            test_dispatcher(),
            Some(1),
            5,
        ));
        worker.start().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.stats().await.unwrap().failed_jobs < 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "job did not fail in time"
            );
            sleep(Duration::from_millis(25)).await;
        }
        worker.stop().await.unwrap();

        let stored = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert_eq!(stored.attempts, 1);
    }
}
