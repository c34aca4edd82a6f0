//! Per-queue state and operations.
//!
//! Each queue owns a fixed set of keys under the prefix `queue:{name}:`:
//!
//! | Key         | Kind       | Role                                        |
//! |-------------|------------|---------------------------------------------|
//! | `waiting`   | list       | FIFO of ids ready to run                    |
//! | `active`    | list       | ids currently leased to a worker            |
//! | `completed` | list       | retained completed ids                      |
//! | `failed`    | list       | retained permanently-failed ids             |
//! | `delayed`   | sorted set | id scored by earliest-execution epoch ms    |
//! | `jobs`      | hash       | id → serialized job record                  |
//! | `stats`     | hash       | `totalJobs` / `completedJobs` / `failedJobs`|
//!
//! An id lives in at most one of `waiting`/`active`/`delayed` at a time; the
//! `completed` and `failed` lists are retention only. `next()` is not atomic
//! across pop → status flip → write back, which is acceptable because the id
//! has already left `waiting` and `active` serves observability, not
//! coordination.

use crate::{
    job::{Job, JobId, JobStatus},
    retry::{ExponentialBackoff, Jitter},
    stats::QueueStats,
    store::Store,
    ConveyorError, Result,
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const STATS_TOTAL: &str = "totalJobs";
const STATS_COMPLETED: &str = "completedJobs";
const STATS_FAILED: &str = "failedJobs";

/// How long `next()` blocks on an empty `waiting` list.
const DEQUEUE_BLOCK: Duration = Duration::from_secs(1);

const RETRY_CAP: Duration = Duration::from_secs(60);
const RETRY_JITTER: Jitter = Jitter::Bounded(0.1);

/// Options applied to a queue at creation time.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Consumer count for workers on this queue, when the caller doesn't
    /// specify one.
    pub concurrency: Option<usize>,
    /// Base delay for the retry backoff (doubles per failed attempt, capped
    /// at 60 s).
    pub retry_delay: Duration,
    /// When set, the worker sweeper reclaims `active` entries older than
    /// this back into `waiting`.
    pub reclaim_stalled_after: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            retry_delay: Duration::from_millis(1000),
            reclaim_stalled_after: None,
        }
    }
}

struct QueueKeys {
    waiting: String,
    active: String,
    completed: String,
    failed: String,
    delayed: String,
    jobs: String,
    stats: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        Self {
            waiting: format!("queue:{}:waiting", name),
            active: format!("queue:{}:active", name),
            completed: format!("queue:{}:completed", name),
            failed: format!("queue:{}:failed", name),
            delayed: format!("queue:{}:delayed", name),
            jobs: format!("queue:{}:jobs", name),
            stats: format!("queue:{}:stats", name),
        }
    }

    fn all(&self) -> Vec<String> {
        vec![
            self.waiting.clone(),
            self.active.clone(),
            self.completed.clone(),
            self.failed.clone(),
            self.delayed.clone(),
            self.jobs.clone(),
            self.stats.clone(),
        ]
    }
}

/// A named queue backed by one key prefix in the store.
///
/// Single consumer ⇒ strict FIFO among `waiting` entries. Multiple consumers
/// ⇒ claim order is FIFO but completion order is not.
pub struct Queue {
    name: String,
    store: Arc<dyn Store>,
    options: QueueOptions,
    keys: QueueKeys,
    backoff: ExponentialBackoff,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>, options: QueueOptions) -> Self {
        let name = name.into();
        let keys = QueueKeys::new(&name);
        let backoff = ExponentialBackoff::new(options.retry_delay, RETRY_CAP);
        Self {
            name,
            store,
            options,
            keys,
            backoff,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Persist a new job and make it claimable, either immediately (LPUSH
    /// onto `waiting`) or at its scheduled time (`delayed` sorted set).
    pub async fn add(&self, job: &Job) -> Result<JobId> {
        self.save(job).await?;

        let id = job.id.to_string();
        if job.status == JobStatus::Delayed {
            let score = job
                .scheduled_at
                .unwrap_or_else(Utc::now)
                .timestamp_millis();
            self.store.zset_add(&self.keys.delayed, &id, score).await?;
        } else {
            self.store.push_left(&self.keys.waiting, &id).await?;
        }
        self.store.hash_incr(&self.keys.stats, STATS_TOTAL, 1).await?;

        debug!(
            "queue {}: added job {} ({:?})",
            self.name, job.id, job.status
        );
        Ok(job.id)
    }

    /// Claim the next ready job, blocking up to a second when the queue is
    /// idle. Promotes due delayed jobs first.
    pub async fn next(&self) -> Result<Option<Job>> {
        self.promote_delayed().await?;

        let Some(id) = self
            .store
            .pop_right_blocking(&self.keys.waiting, DEQUEUE_BLOCK)
            .await?
        else {
            return Ok(None);
        };

        let Some(mut job) = self.load(&id).await? else {
            warn!("queue {}: dangling id {} popped from waiting", self.name, id);
            return Ok(None);
        };

        job.mark_active();
        self.store.push_left(&self.keys.active, &id).await?;
        self.save(&job).await?;
        Ok(Some(job))
    }

    /// Record a successful terminal outcome.
    pub async fn complete(&self, job: &mut Job, result: Option<serde_json::Value>) -> Result<()> {
        let id = job.id.to_string();
        self.store.remove_value(&self.keys.active, &id).await?;

        job.mark_completed(result);
        if job.options.remove_on_complete {
            self.store.hash_delete(&self.keys.jobs, &id).await?;
        } else {
            self.store.push_left(&self.keys.completed, &id).await?;
            self.save(job).await?;
        }
        self.store
            .hash_incr(&self.keys.stats, STATS_COMPLETED, 1)
            .await?;

        debug!("queue {}: job {} completed", self.name, job.id);
        Ok(())
    }

    /// Record a failed attempt. Retryable failures re-enter `delayed` with a
    /// backoff score; exhausted jobs land in `failed` (per retention).
    pub async fn fail(&self, job: &mut Job, error: &str) -> Result<()> {
        let id = job.id.to_string();
        self.store.remove_value(&self.keys.active, &id).await?;

        job.mark_failed(error);

        if job.can_retry() {
            let delay = self.backoff.delay_with_jitter(job.attempts, RETRY_JITTER);
            let at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            job.schedule_retry(at);
            self.store
                .zset_add(&self.keys.delayed, &id, at.timestamp_millis())
                .await?;
            self.save(job).await?;
            debug!(
                "queue {}: job {} failed (attempt {}/{}), retrying in {:?}: {}",
                self.name, job.id, job.attempts, job.max_attempts, delay, error
            );
        } else {
            self.store.hash_incr(&self.keys.stats, STATS_FAILED, 1).await?;
            if job.options.remove_on_fail {
                self.store.hash_delete(&self.keys.jobs, &id).await?;
            } else {
                self.store.push_left(&self.keys.failed, &id).await?;
                self.save(job).await?;
            }
            warn!(
                "queue {}: job {} failed permanently after {} attempt(s): {}",
                self.name, job.id, job.attempts, error
            );
        }
        Ok(())
    }

    /// Move every delayed job whose score has come due onto `waiting`,
    /// preserving score order. Returns the number promoted.
    pub async fn promote_delayed(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let due = self
            .store
            .zset_range_by_score(&self.keys.delayed, 0, now)
            .await?;

        let mut promoted = 0;
        for id in due {
            // ZREM is the claim; a concurrent promoter that loses it skips.
            if !self.store.zset_remove(&self.keys.delayed, &id).await? {
                continue;
            }
            let Some(mut job) = self.load(&id).await? else {
                continue;
            };
            job.mark_waiting();
            self.save(&job).await?;
            self.store.push_left(&self.keys.waiting, &id).await?;
            promoted += 1;
        }

        if promoted > 0 {
            debug!("queue {}: promoted {} delayed job(s)", self.name, promoted);
        }
        Ok(promoted)
    }

    /// Load a job record by id.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.load(&id.to_string()).await
    }

    /// Update a job's progress field in place.
    pub async fn update_progress(&self, id: JobId, progress: u8) -> Result<()> {
        let Some(mut job) = self.get(id).await? else {
            return Err(ConveyorError::JobNotFound { id: id.to_string() });
        };
        job.set_progress(progress);
        self.save(&job).await
    }

    /// Remove a job from every structural set and the record hash. Returns
    /// whether anything was actually removed.
    pub async fn remove(&self, id: JobId) -> Result<bool> {
        let id = id.to_string();
        let mut removed = false;

        for key in [
            &self.keys.waiting,
            &self.keys.active,
            &self.keys.completed,
            &self.keys.failed,
        ] {
            removed |= self.store.remove_value(key, &id).await? > 0;
        }
        removed |= self.store.zset_remove(&self.keys.delayed, &id).await?;
        removed |= self.store.hash_delete(&self.keys.jobs, &id).await?;

        Ok(removed)
    }

    /// Snapshot of per-bucket sizes and lifetime counters.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            queue_name: self.name.clone(),
            waiting: self.store.list_len(&self.keys.waiting).await?,
            active: self.store.list_len(&self.keys.active).await?,
            completed: self.store.list_len(&self.keys.completed).await?,
            failed: self.store.list_len(&self.keys.failed).await?,
            delayed: self.store.zset_len(&self.keys.delayed).await?,
            total_jobs: self.read_counter(STATS_TOTAL).await?,
            completed_jobs: self.read_counter(STATS_COMPLETED).await?,
            failed_jobs: self.read_counter(STATS_FAILED).await?,
        })
    }

    /// Delete every key under this queue's prefix.
    pub async fn clean(&self) -> Result<()> {
        self.store.delete_keys(&self.keys.all()).await?;
        info!("queue {}: cleaned", self.name);
        Ok(())
    }

    /// Move `active` entries whose attempt started more than `older_than`
    /// ago back into circulation: the interrupted attempt counts as failed,
    /// and the job either re-enters `waiting` or fails permanently.
    pub async fn reclaim_stalled(&self, older_than: Duration) -> Result<u64> {
        let entries = self.store.list_range(&self.keys.active, 0, -1).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let cutoff =
            Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut reclaimed = 0;

        for id in entries {
            let Some(mut job) = self.load(&id).await? else {
                self.store.remove_value(&self.keys.active, &id).await?;
                continue;
            };
            if job.status != JobStatus::Active {
                // Leftover entry; the record has already moved on.
                self.store.remove_value(&self.keys.active, &id).await?;
                continue;
            }
            let Some(started) = job.processed_at else {
                continue;
            };
            if started > cutoff {
                continue;
            }

            self.store.remove_value(&self.keys.active, &id).await?;
            job.mark_stalled();

            if job.has_exhausted_attempts() {
                job.status = JobStatus::Failed;
                job.failed_at = Some(Utc::now());
                self.store.hash_incr(&self.keys.stats, STATS_FAILED, 1).await?;
                if job.options.remove_on_fail {
                    self.store.hash_delete(&self.keys.jobs, &id).await?;
                } else {
                    self.store.push_left(&self.keys.failed, &id).await?;
                    self.save(&job).await?;
                }
                warn!(
                    "queue {}: stalled job {} exhausted its attempts",
                    self.name, job.id
                );
            } else {
                job.status = JobStatus::Waiting;
                job.processed_at = None;
                self.save(&job).await?;
                self.store.push_left(&self.keys.waiting, &id).await?;
                warn!(
                    "queue {}: reclaimed stalled job {} (attempt {}/{})",
                    self.name, job.id, job.attempts, job.max_attempts
                );
            }
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    async fn load(&self, id: &str) -> Result<Option<Job>> {
        match self.store.hash_get(&self.keys.jobs, id).await? {
            Some(raw) => Ok(Some(Job::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &Job) -> Result<()> {
        self.store
            .hash_set(&self.keys.jobs, &job.id.to_string(), &job.to_json()?)
            .await
    }

    async fn read_counter(&self, field: &str) -> Result<u64> {
        Ok(self
            .store
            .hash_get(&self.keys.stats, field)
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }
}
