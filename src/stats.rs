//! Statistics surfaces for queues and the whole process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of one queue.
///
/// Bucket sizes (`waiting`/`active`/...) come from the structural keys;
/// `total_jobs`/`completed_jobs`/`failed_jobs` are lifetime counters from the
/// queue's stats hash and survive retention-driven record removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
}

impl QueueStats {
    /// Jobs currently in flight or awaiting execution.
    pub fn backlog(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

/// Process-level overview reported by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub service: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub queues: Vec<String>,
    pub running_workers: Vec<String>,
    pub registered_processors: Vec<String>,
    pub default_concurrency: usize,
}
