//! Built-in processor for HTTP-task queues.
//!
//! An HTTP-task queue uses the same worker shape as a generic queue, but its
//! processor is fixed: the job payload describes an outbound HTTP call, and
//! the dispatcher performs it on the caller's behalf. A 2xx response
//! completes the job with the response captured as its result; anything else
//! fails the job and the queue's normal retry/backoff applies.

use crate::{
    error::ConveyorError,
    job::Job,
    webhook::HttpMethod,
    worker::{JobHandler, JobResult},
    Result,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

const HTTP_WORKER_USER_AGENT: &str = "conveyor-HttpWorker/1.0";

/// Correlation headers stamped on every dispatched request. Caller headers
/// may override the defaults but never these.
pub const HEADER_JOB_ID: &str = "x-queue-service-job-id";
pub const HEADER_ATTEMPT: &str = "x-queue-service-attempt";
pub const HEADER_MAX_ATTEMPTS: &str = "x-queue-service-max-attempts";

fn default_timeout_ms() -> u64 {
    30_000
}

/// The shape an HTTP-task job's `data` payload must take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method, POST unless overridden.
    #[serde(default)]
    pub method: HttpMethod,
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON request body.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Stored as the job result on a successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskResult {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(rename = "responseData")]
    pub response_data: serde_json::Value,
    pub duration_ms: u64,
}

fn worker_error(message: impl Into<String>) -> ConveyorError {
    ConveyorError::Worker {
        message: message.into(),
    }
}

fn build_headers(request: &HttpTaskRequest, job: &Job) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(HTTP_WORKER_USER_AGENT));

    for (name, value) in &request.headers {
        let name: HeaderName = name
            .parse()
            .map_err(|_| worker_error(format!("invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| worker_error(format!("invalid value for header {}", name)))?;
        headers.insert(name, value);
    }

    headers.insert(
        HeaderName::from_static(HEADER_JOB_ID),
        HeaderValue::from_str(&job.id.to_string())
            .map_err(|_| worker_error("invalid job id header"))?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_ATTEMPT),
        HeaderValue::from(job.attempts),
    );
    headers.insert(
        HeaderName::from_static(HEADER_MAX_ATTEMPTS),
        HeaderValue::from(job.max_attempts),
    );

    Ok(headers)
}

/// Interpret `job.data` as an [`HttpTaskRequest`] and perform the call.
///
/// Success requires an HTTP status in `[200, 300)`; the job result then
/// carries `{statusCode, responseData, duration_ms}`. A non-2xx status fails
/// the job with `"HTTP <status>: <reason>"`; a transport error fails it with
/// the error's own text.
pub async fn dispatch_http_task(client: &reqwest::Client, job: &Job) -> Result<JobResult> {
    let request: HttpTaskRequest = serde_json::from_value(job.data.clone())
        .map_err(|e| worker_error(format!("invalid HTTP task payload: {}", e)))?;

    if request.url.is_empty() {
        return Err(worker_error("HTTP task url is required"));
    }

    let headers = build_headers(&request, job)?;

    let mut builder = match request.method {
        HttpMethod::Post => client.post(&request.url),
        HttpMethod::Put => client.put(&request.url),
        HttpMethod::Patch => client.patch(&request.url),
    };
    builder = builder
        .headers(headers)
        .timeout(Duration::from_millis(request.timeout_ms));
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }

    let started = Instant::now();
    let response = builder
        .send()
        .await
        .map_err(|e| worker_error(e.to_string()))?;
    let duration_ms = started.elapsed().as_millis() as u64;
    let status = response.status();

    if !status.is_success() {
        return Err(worker_error(format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("unknown")
        )));
    }

    let body = response.text().await.unwrap_or_default();
    let response_data = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body))
    };

    let result = HttpTaskResult {
        status_code: status.as_u16(),
        response_data,
        duration_ms,
    };
    Ok(JobResult::with_data(serde_json::to_value(result)?))
}

/// Build the fixed processor used by HTTP-task workers.
pub fn http_task_handler(client: reqwest::Client) -> JobHandler {
    Arc::new(move |job: Job| {
        let client = client.clone();
        Box::pin(async move { dispatch_http_task(&client, &job).await })
    })
}
