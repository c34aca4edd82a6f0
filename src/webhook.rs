//! Webhook delivery for job terminal events.
//!
//! When a job completes, or fails with no retries left, the worker hands it
//! to the [`WebhookDispatcher`], which POSTs a structured event to the
//! caller-supplied URL with its own retry/backoff loop. Delivery is
//! fire-and-log: no webhook outcome ever alters job state.
//!
//! The payload shape is a stable external contract:
//!
//! ```json
//! { "event": "job.completed",
//!   "job": { "id": "...", "queueName": "...", "status": "completed",
//!            "data": {}, "result": {}, "attempts": 0, "maxAttempts": 3,
//!            "createdAt": "..." },
//!   "timestamp": "...",
//!   "webhook": { "attempt": 1, "maxAttempts": 3 } }
//! ```

use crate::{
    job::{Job, JobId, JobStatus},
    retry::{ExponentialBackoff, Jitter},
};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::time::sleep;
use tracing::{debug, error, warn};

const USER_AGENT: &str = "conveyor-Webhook/1.0";

const BACKOFF: ExponentialBackoff =
    ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_millis(30_000));
const BACKOFF_JITTER: Jitter = Jitter::Symmetric(0.25);

/// HTTP methods allowed for webhooks and HTTP tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Patch => write!(f, "PATCH"),
        }
    }
}

/// Caller-supplied webhook endpoint configuration, carried on the job.
///
/// `timeout_ms` and `retry_attempts` are optional; when omitted the
/// dispatcher's process-wide defaults apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL to deliver the event to; must be `http://` or `https://`.
    pub url: String,
    /// HTTP method, POST unless overridden.
    #[serde(default)]
    pub method: HttpMethod,
    /// Extra headers merged into the request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request timeout in milliseconds; valid range `[1000, 300000]`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Total delivery attempts; valid range `[0, 10]`. Zero disables delivery.
    #[serde(default)]
    pub retry_attempts: Option<u32>,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::default(),
            headers: HashMap::new(),
            timeout_ms: None,
            retry_attempts: None,
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = Some(retry_attempts);
        self
    }
}

/// Validate a webhook configuration, returning every problem found.
///
/// Used before dispatch and by the interactive "test webhook" path of the
/// REST collaborator. An empty result means the configuration is deliverable.
pub fn validate(config: &WebhookConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if config.url.is_empty() {
        problems.push("url is required".to_string());
    } else if !config.url.starts_with("http://") && !config.url.starts_with("https://") {
        problems.push("url must start with http:// or https://".to_string());
    }

    if let Some(timeout_ms) = config.timeout_ms {
        if !(1000..=300_000).contains(&timeout_ms) {
            problems.push("timeout_ms must be between 1000 and 300000".to_string());
        }
    }

    if let Some(retry_attempts) = config.retry_attempts {
        if retry_attempts > 10 {
            problems.push("retry_attempts must be between 0 and 10".to_string());
        }
    }

    problems
}

/// The terminal event a webhook reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "job.completed")]
    Completed,
    #[serde(rename = "job.failed")]
    Failed,
}

/// Job snapshot embedded in the webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookJobPayload {
    pub id: JobId,
    pub queue_name: String,
    pub status: JobStatus,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for WebhookJobPayload {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue_name: job.queue_name.clone(),
            status: job.status,
            data: job.data.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            processed_at: job.processed_at,
            completed_at: job.completed_at,
            failed_at: job.failed_at,
        }
    }
}

/// Full webhook request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub job: WebhookJobPayload,
    pub timestamp: DateTime<Utc>,
    pub webhook: WebhookAttempt,
}

/// Delivery-attempt counters included in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAttempt {
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Outcome of a webhook dispatch, after all retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempt: u32,
}

impl WebhookDelivery {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            response_data: None,
            error: Some(reason.into()),
            duration_ms: 0,
            attempt: 0,
        }
    }
}

/// Delivers terminal-event webhooks with bounded, jittered retries.
///
/// One dispatcher is shared across all workers; it holds the HTTP client and
/// the process-wide defaults for timeout and attempt count.
pub struct WebhookDispatcher {
    client: Client,
    default_timeout: Duration,
    default_retry_attempts: u32,
}

impl WebhookDispatcher {
    pub fn new(default_timeout: Duration, default_retry_attempts: u32) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            default_timeout,
            default_retry_attempts,
        }
    }

    /// Deliver `event` for `job` to its configured webhook.
    ///
    /// Never fails from the caller's perspective: configuration problems and
    /// exhausted retries are reported in the returned [`WebhookDelivery`] and
    /// logged, nothing more.
    pub async fn dispatch(&self, event: WebhookEvent, job: &Job) -> WebhookDelivery {
        let Some(config) = job.webhook.as_ref() else {
            return WebhookDelivery::skipped("job has no webhook configured");
        };

        let problems = validate(config);
        if !problems.is_empty() {
            warn!(
                "skipping webhook for job {}: {}",
                job.id,
                problems.join("; ")
            );
            return WebhookDelivery::skipped(problems.join("; "));
        }

        let max_attempts = config
            .retry_attempts
            .unwrap_or(self.default_retry_attempts);
        if max_attempts == 0 {
            debug!("webhook delivery disabled for job {}", job.id);
            return WebhookDelivery::skipped("webhook delivery disabled (0 attempts)");
        }

        let mut last = None;
        for attempt in 1..=max_attempts {
            let delivery = self
                .attempt_delivery(config, event, job, attempt, max_attempts)
                .await;

            if delivery.success {
                debug!(
                    "webhook delivered for job {} -> {} (attempt {})",
                    job.id, config.url, attempt
                );
                return delivery;
            }

            if attempt < max_attempts {
                let delay = BACKOFF.delay_with_jitter(attempt - 1, BACKOFF_JITTER);
                warn!(
                    "webhook delivery failed for job {} -> {}, retrying in {:?} (attempt {}/{}): {}",
                    job.id,
                    config.url,
                    delay,
                    attempt,
                    max_attempts,
                    delivery.error.as_deref().unwrap_or("unknown error")
                );
                sleep(delay).await;
            }
            last = Some(delivery);
        }

        error!(
            "webhook delivery failed after {} attempts for job {} -> {}",
            max_attempts, job.id, config.url
        );
        last.unwrap_or_else(|| WebhookDelivery::skipped("no delivery attempted"))
    }

    async fn attempt_delivery(
        &self,
        config: &WebhookConfig,
        event: WebhookEvent,
        job: &Job,
        attempt: u32,
        max_attempts: u32,
    ) -> WebhookDelivery {
        let started = Instant::now();
        let payload = WebhookPayload {
            event,
            job: WebhookJobPayload::from(job),
            timestamp: Utc::now(),
            webhook: WebhookAttempt {
                attempt,
                max_attempts,
            },
        };

        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut request = match config.method {
            HttpMethod::Post => self.client.post(&config.url),
            HttpMethod::Put => self.client.put(&config.url),
            HttpMethod::Patch => self.client.patch(&config.url),
        };

        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        let result = request
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let response_data = if body.is_empty() {
                    None
                } else {
                    Some(
                        serde_json::from_str(&body)
                            .unwrap_or(serde_json::Value::String(body)),
                    )
                };

                WebhookDelivery {
                    success: status.is_success(),
                    status_code: Some(status.as_u16()),
                    response_data,
                    error: if status.is_success() {
                        None
                    } else {
                        Some(format!("HTTP {}", status.as_u16()))
                    },
                    duration_ms,
                    attempt,
                }
            }
            Err(e) => WebhookDelivery {
                success: false,
                status_code: e.status().map(|s| s.as_u16()),
                response_data: None,
                error: Some(e.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
                attempt,
            },
        }
    }
}
