//! Job types and lifecycle helpers.
//!
//! This module provides the core [`Job`] struct and [`JobStatus`] enum that
//! represent individual units of work. Jobs carry everything the engine needs
//! for scheduling, retry accounting, and post-completion notification; they
//! are persisted as JSON (ISO-8601 timestamps) in the owning queue's record
//! hash.

use crate::webhook::WebhookConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job.
pub type JobId = Uuid;

/// The current status of a job in its lifecycle.
///
/// # Examples
///
/// ```rust
/// use conveyor::JobStatus;
///
/// let status = JobStatus::Completed;
/// assert!(matches!(status, JobStatus::Completed | JobStatus::Failed));
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is queued and ready to be claimed by a worker.
    Waiting,
    /// Job is currently leased to a worker.
    Active,
    /// Job completed successfully.
    Completed,
    /// Job failed; terminal once retries are exhausted.
    Failed,
    /// Job is scheduled for a future time (initial delay or retry backoff).
    Delayed,
    /// Job was reclaimed from a worker that stopped reporting.
    Stalled,
}

/// Per-job scheduling and retention options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOptions {
    /// Maximum attempts before the job fails permanently; clamped to `[1, 10]`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial delay before the job becomes eligible to run.
    #[serde(default)]
    pub delay_ms: u64,
    /// Reserved for priority scheduling; carried but not interpreted.
    #[serde(default)]
    pub priority: i32,
    /// Drop the job record on successful completion instead of retaining it.
    #[serde(default)]
    pub remove_on_complete: bool,
    /// Drop the job record on permanent failure instead of retaining it.
    #[serde(default)]
    pub remove_on_fail: bool,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: 0,
            priority: 0,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

pub(crate) const STALL_ERROR: &str = "job stalled: reclaimed after worker loss";

/// A unit of work owned by one queue.
///
/// `attempts` counts *failed* attempts: it starts at 0, is incremented by
/// [`Job::mark_failed`], and is never incremented by a successful run. A job
/// that fails twice and then succeeds finishes with `attempts == 2`.
///
/// # Examples
///
/// ## Basic job
///
/// ```rust
/// use conveyor::{Job, JobStatus};
/// use serde_json::json;
///
/// let job = Job::new("email", json!({"to": "user@example.com"}));
/// assert_eq!(job.queue_name, "email");
/// assert_eq!(job.status, JobStatus::Waiting);
/// assert_eq!(job.max_attempts, 3);
/// ```
///
/// ## Delayed job with custom retry budget
///
/// ```rust
/// use conveyor::{Job, JobStatus};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let job = Job::new("reports", json!({"period": "monthly"}))
///     .with_delay(Duration::from_secs(3600))
///     .with_max_attempts(5);
///
/// assert_eq!(job.status, JobStatus::Delayed);
/// assert!(job.scheduled_at.unwrap() > job.created_at);
/// assert_eq!(job.max_attempts, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Name of the queue this job belongs to.
    pub queue_name: String,
    /// Opaque JSON payload.
    pub data: serde_json::Value,
    /// Scheduling and retention options.
    pub options: JobOptions,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Number of failed attempts so far.
    pub attempts: u32,
    /// Frozen copy of `options.max_attempts`.
    pub max_attempts: u32,
    /// Optional completion percentage, 0-100.
    pub progress: Option<u8>,
    /// Result recorded on successful completion.
    pub result: Option<serde_json::Value>,
    /// Error message from the most recent failure.
    pub error: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When a delayed job becomes eligible to run.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the current/most recent attempt started.
    pub processed_at: Option<DateTime<Utc>>,
    /// When the job completed successfully.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job last failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// Optional webhook notified on the job's terminal transition.
    pub webhook: Option<WebhookConfig>,
}

impl Job {
    /// Creates a new job in `Waiting` status with default options.
    pub fn new(queue_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            data,
            options: JobOptions::default(),
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: default_max_attempts(),
            progress: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            scheduled_at: None,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            webhook: None,
        }
    }

    /// Applies a full option set, clamping `max_attempts` into `[1, 10]` and
    /// deriving `Delayed` status when a delay is requested.
    pub fn with_options(mut self, mut options: JobOptions) -> Self {
        options.max_attempts = options.max_attempts.clamp(1, 10);
        self.max_attempts = options.max_attempts;
        if options.delay_ms > 0 {
            self.status = JobStatus::Delayed;
            self.scheduled_at =
                Some(self.created_at + chrono::Duration::milliseconds(options.delay_ms as i64));
        } else {
            self.status = JobStatus::Waiting;
            self.scheduled_at = None;
        }
        self.options = options;
        self
    }

    /// Sets the maximum number of attempts, clamped into `[1, 10]`.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        let clamped = max_attempts.clamp(1, 10);
        self.options.max_attempts = clamped;
        self.max_attempts = clamped;
        self
    }

    /// Delays the job's first execution by the given duration.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.options.delay_ms = delay.as_millis() as u64;
        if self.options.delay_ms > 0 {
            self.status = JobStatus::Delayed;
            self.scheduled_at =
                Some(self.created_at + chrono::Duration::milliseconds(self.options.delay_ms as i64));
        }
        self
    }

    /// Attaches a webhook to be notified when the job terminates.
    pub fn with_webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Drop the record on completion instead of retaining it.
    pub fn remove_on_complete(mut self) -> Self {
        self.options.remove_on_complete = true;
        self
    }

    /// Drop the record on permanent failure instead of retaining it.
    pub fn remove_on_fail(mut self) -> Self {
        self.options.remove_on_fail = true;
        self
    }

    /// Transition to `Active` and stamp the attempt start time.
    pub fn mark_active(&mut self) {
        self.status = JobStatus::Active;
        self.processed_at = Some(Utc::now());
    }

    /// Transition to `Completed` with an optional result.
    pub fn mark_completed(&mut self, result: Option<serde_json::Value>) {
        self.status = JobStatus::Completed;
        self.result = result;
        self.completed_at = Some(Utc::now());
    }

    /// Transition to `Failed`, record the error, and count the failed attempt.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.failed_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Transition to `Stalled` after the job was reclaimed from a lost
    /// worker; the interrupted attempt counts as failed.
    pub fn mark_stalled(&mut self) {
        self.status = JobStatus::Stalled;
        self.error = Some(STALL_ERROR.to_string());
        self.attempts += 1;
    }

    /// Re-schedule a failed job for a retry at the given time.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Delayed;
        self.scheduled_at = Some(at);
    }

    /// Transition back to `Waiting` (used when a delayed job is promoted).
    pub fn mark_waiting(&mut self) {
        self.status = JobStatus::Waiting;
        self.scheduled_at = None;
    }

    /// Whether the job may still be retried: it has failed, and attempts
    /// remain.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts < self.max_attempts
    }

    /// Reset a retryable job back to `Waiting`, clearing the failure state.
    ///
    /// Returns `false` (and leaves the job untouched) when the job is not
    /// currently retryable.
    pub fn reset_for_retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.status = JobStatus::Waiting;
        self.error = None;
        self.processed_at = None;
        true
    }

    /// Record completion progress, clamped to 100.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = Some(progress.min(100));
    }

    /// Whether the job has used up its attempt budget.
    pub fn has_exhausted_attempts(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether the job has reached a terminal state: completed, or failed
    /// with no retries left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => self.has_exhausted_attempts(),
            _ => false,
        }
    }

    /// Serialize the job for storage.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a job from its stored form.
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_new_defaults() {
        let job = Job::new("test_queue", json!({"key": "value"}));

        assert_eq!(job.queue_name, "test_queue");
        assert_eq!(job.data, json!({"key": "value"}));
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.scheduled_at.is_none());
        assert!(job.processed_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.failed_at.is_none());
        assert!(job.error.is_none());
        assert!(job.webhook.is_none());
    }

    #[test]
    fn test_with_delay_schedules_job() {
        let job = Job::new("test_queue", json!({})).with_delay(std::time::Duration::from_millis(500));

        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.options.delay_ms, 500);
        let scheduled = job.scheduled_at.expect("delayed job must have a schedule");
        assert_eq!(scheduled - job.created_at, chrono::Duration::milliseconds(500));
    }

    #[test]
    fn test_zero_delay_stays_waiting() {
        let job = Job::new("test_queue", json!({})).with_delay(std::time::Duration::ZERO);
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.scheduled_at.is_none());
    }

    #[test]
    fn test_max_attempts_clamped() {
        let low = Job::new("q", json!({})).with_max_attempts(0);
        assert_eq!(low.max_attempts, 1);

        let high = Job::new("q", json!({})).with_max_attempts(50);
        assert_eq!(high.max_attempts, 10);

        let opts = JobOptions {
            max_attempts: 99,
            ..Default::default()
        };
        let from_options = Job::new("q", json!({})).with_options(opts);
        assert_eq!(from_options.max_attempts, 10);
        assert_eq!(from_options.options.max_attempts, 10);
    }

    #[test]
    fn test_mark_failed_counts_attempts() {
        let mut job = Job::new("q", json!({}));

        job.mark_failed("first boom");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("first boom"));
        assert!(job.failed_at.is_some());
        assert!(job.can_retry());

        job.mark_failed("second boom");
        job.mark_failed("third boom");
        assert_eq!(job.attempts, 3);
        assert!(!job.can_retry());
        assert!(job.is_terminal());
    }

    #[test]
    fn test_reset_for_retry_requires_retryable_state() {
        let mut job = Job::new("q", json!({}));

        // Not failed yet: reset refused.
        assert!(!job.reset_for_retry());

        job.mark_active();
        job.mark_failed("boom");
        assert!(job.reset_for_retry());
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.error.is_none());
        assert!(job.processed_at.is_none());

        // A subsequent failure still counts an attempt.
        job.mark_failed("boom again");
        assert_eq!(job.attempts, 2);

        // Exhaust the budget: reset refused again.
        job.mark_failed("final boom");
        assert!(!job.reset_for_retry());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_mark_completed_records_result() {
        let mut job = Job::new("q", json!({}));
        job.mark_active();
        job.mark_completed(Some(json!({"ok": true})));

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert!(job.completed_at.is_some());
        assert_eq!(job.attempts, 0);
        assert!(job.is_terminal());
    }

    #[test]
    fn test_mark_stalled_counts_attempt() {
        let mut job = Job::new("q", json!({})).with_max_attempts(2);
        job.mark_active();
        job.mark_stalled();

        assert_eq!(job.status, JobStatus::Stalled);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some(STALL_ERROR));
    }

    #[test]
    fn test_schedule_retry() {
        let mut job = Job::new("q", json!({}));
        job.mark_failed("boom");

        let at = Utc::now() + chrono::Duration::seconds(2);
        job.schedule_retry(at);
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.scheduled_at, Some(at));
    }

    #[test]
    fn test_set_progress_clamps() {
        let mut job = Job::new("q", json!({}));
        job.set_progress(42);
        assert_eq!(job.progress, Some(42));
        job.set_progress(250);
        assert_eq!(job.progress, Some(100));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Waiting).unwrap(), "\"waiting\"");
        assert_eq!(serde_json::to_string(&JobStatus::Active).unwrap(), "\"active\"");
        assert_eq!(serde_json::to_string(&JobStatus::Delayed).unwrap(), "\"delayed\"");
        assert_eq!(serde_json::to_string(&JobStatus::Stalled).unwrap(), "\"stalled\"");
    }

    #[test]
    fn test_job_round_trips_through_json() {
        let mut job = Job::new("round_trip", json!({"n": 7}))
            .with_max_attempts(4)
            .with_delay(std::time::Duration::from_secs(1));
        job.set_progress(10);

        let raw = job.to_json().unwrap();
        let restored = Job::from_json(&raw).unwrap();

        assert_eq!(restored.id, job.id);
        assert_eq!(restored.queue_name, job.queue_name);
        assert_eq!(restored.data, job.data);
        assert_eq!(restored.status, job.status);
        assert_eq!(restored.max_attempts, 4);
        assert_eq!(restored.options, job.options);
        assert_eq!(restored.scheduled_at, job.scheduled_at);
        assert_eq!(restored.progress, Some(10));
    }

    #[test]
    fn test_timestamps_serialize_as_iso8601() {
        let job = Job::new("q", json!({}));
        let raw = job.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let created_at = value["created_at"].as_str().unwrap();
        assert!(created_at.contains('T'));
        assert!(chrono::DateTime::parse_from_rfc3339(created_at).is_ok());
    }
}
