use crate::{Error, QueryParams};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Inputs for one status-polling cycle. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollParams {
    pub api_url: String,
    pub api_key: String,
    pub query: QueryParams,
    pub token: String,
    pub target_pages: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Terminal callbacks of a submission. Exactly one of them fires unless the
/// poll is cancelled first.
pub trait JobHandler: Send + Sync {
    fn on_success(&self, response: JobStatusResponse);
    fn on_error(&self, error: Error);
    fn on_timeout(&self);
}

#[derive(Debug)]
pub enum PollOutcome {
    Succeeded(JobStatusResponse),
    Failed(Error),
    TimedOut,
    Cancelled,
}

/// Payload-free summary of how a poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResolution {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl PollOutcome {
    pub fn resolution(&self) -> PollResolution {
        match self {
            PollOutcome::Succeeded(_) => PollResolution::Succeeded,
            PollOutcome::Failed(_) => PollResolution::Failed,
            PollOutcome::TimedOut => PollResolution::TimedOut,
            PollOutcome::Cancelled => PollResolution::Cancelled,
        }
    }

    /// Hands the outcome to its callback. Consumes self so it can fire once.
    pub fn dispatch(self, handler: &dyn JobHandler) -> PollResolution {
        let resolution = self.resolution();
        match self {
            PollOutcome::Succeeded(response) => handler.on_success(response),
            PollOutcome::Failed(err) => handler.on_error(err),
            PollOutcome::TimedOut => handler.on_timeout(),
            PollOutcome::Cancelled => debug!("Poll cancelled, no callback fired"),
        }
        resolution
    }
}

/// Repeatedly queries job status until success, failure or the time budget runs out.
#[async_trait]
pub trait Poller: Send + Sync {
    async fn poll(&self, params: PollParams, cancel_token: CancellationToken) -> PollOutcome;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: f64,
    /// Whole-cycle budget, counted from the first query.
    pub timeout: Duration,
    pub request_timeout: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            backoff_factor: 1.5,
            timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            max_consecutive_errors: 5,
        }
    }
}

/// Stand-in for budgets too large to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl PollerConfig {
    /// Factors below 1.0, NaN or infinite would shrink or overflow the
    /// interval; those jump straight to `max_interval`.
    fn next_interval(&self, current: Duration) -> Duration {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return self.max_interval.max(current);
        }
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    fn deadline(&self, start: Instant) -> Instant {
        start
            .checked_add(self.timeout)
            .unwrap_or_else(|| start + FAR_FUTURE)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery<'a> {
    #[serde(flatten)]
    query: &'a QueryParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_pages: Option<&'a [u32]>,
}

enum Attempt {
    Done(PollOutcome),
    Pending,
    Transient(Error),
}

/// Polls `POST {api_url}/query` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPoller {
    client: Client,
    config: PollerConfig,
}

impl HttpPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: PollerConfig) -> Self {
        HttpPoller { client, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    async fn query_once(&self, params: &PollParams) -> Attempt {
        let url = format!("{}/query", params.api_url.trim_end_matches('/'));
        let body = StatusQuery {
            query: &params.query,
            target_pages: params.target_pages.as_deref(),
        };

        let response = match self
            .client
            .post(&url)
            .timeout(self.config.request_timeout)
            .bearer_auth(&params.token)
            .header("x-api-key", &params.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Attempt::Transient(Error::PollTransport(err)),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // Backend has not registered the job yet.
            return Attempt::Pending;
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Attempt::Transient(Error::PollRejected {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Attempt::Done(PollOutcome::Failed(Error::PollRejected {
                status: status.as_u16(),
                body,
            }));
        }

        let parsed: JobStatusResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(err) => return Attempt::Transient(Error::PollTransport(err)),
        };

        match parsed.status {
            JobStatus::Succeeded => Attempt::Done(PollOutcome::Succeeded(parsed)),
            JobStatus::Failed => {
                let job_id = parsed
                    .job_id
                    .clone()
                    .unwrap_or_else(|| params.query.job_id.clone());
                let message = parsed
                    .message
                    .clone()
                    .unwrap_or_else(|| "job failed".to_string());
                Attempt::Done(PollOutcome::Failed(Error::JobFailed { job_id, message }))
            }
            JobStatus::Queued | JobStatus::Processing | JobStatus::Unknown => Attempt::Pending,
        }
    }
}

#[async_trait]
impl Poller for HttpPoller {
    #[instrument(skip_all, fields(file_id = %params.query.file_id, user_id = %params.query.user_id))]
    async fn poll(&self, params: PollParams, cancel_token: CancellationToken) -> PollOutcome {
        let deadline = self.config.deadline(Instant::now());
        let mut interval = self.config.interval;
        let mut consecutive_errors = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel_token.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return PollOutcome::TimedOut,
                result = self.query_once(&params) => result,
            };

            match result {
                Attempt::Done(outcome) => {
                    debug!(message = "Poll finished", attempt, resolution = ?outcome.resolution());
                    return outcome;
                }
                Attempt::Pending => {
                    consecutive_errors = 0;
                    trace!(message = "Job still pending", attempt);
                }
                Attempt::Transient(err) => {
                    consecutive_errors += 1;
                    warn!(message = "Job status query failed", attempt, consecutive_errors, error = %err);
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        return PollOutcome::Failed(err);
                    }
                }
            }

            let next_query = Instant::now().checked_add(interval);
            if next_query.map_or(true, |at| at >= deadline) {
                // Next query would land past the budget.
                tokio::select! {
                    _ = cancel_token.cancelled() => return PollOutcome::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => return PollOutcome::TimedOut,
                }
            }

            tokio::select! {
                _ = cancel_token.cancelled() => return PollOutcome::Cancelled,
                _ = sleep(interval) => {},
            }
            interval = self.config.next_interval(interval);
        }
    }
}
