//! Batching HTTP delivery of encrypted envelopes.
//!
//! Envelopes are buffered in arrival order and POSTed one at a time to
//! `<cloud_api_url>/envelopes` when the batch fills up, the flush interval
//! has passed, or the sender is disconnected. Failed envelopes are counted
//! and reported, never re-queued.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::envelope::EncryptedEnvelope;
use crate::error::{ReplicatorError, Result};

/// Header carrying a per-envelope id that stays the same across retries
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff between delivery attempts of a single envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: MAX_RETRY_DELAY,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry.saturating_sub(1))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Base URL of the cloud store; `None` means nowhere to deliver
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub dry_run: bool,
}

impl From<&Config> for SenderConfig {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.cloud_api_url.clone(),
            token: config.cloud_api_token.clone(),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            retry: RetryPolicy::new(config.retry_attempts, config.retry_delay),
            request_timeout: config.request_timeout,
            dry_run: config.dry_run,
        }
    }
}

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResult {
    pub sent_count: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
}

impl SendResult {
    pub fn success(&self) -> bool {
        self.failed_count == 0
    }

    pub fn total(&self) -> usize {
        self.sent_count + self.failed_count
    }
}

/// Running totals across flushes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub flushes: u64,
    pub sent: u64,
    pub failed: u64,
}

pub struct DeliverySender {
    config: SenderConfig,
    buffer: Vec<EncryptedEnvelope>,
    last_flush: Instant,
    connected: bool,
    client: Option<reqwest::Client>,
    stats: DeliveryStats,
}

impl DeliverySender {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            last_flush: Instant::now(),
            connected: false,
            client: None,
            stats: DeliveryStats::default(),
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Prepare the HTTP client. Dry-run and endpoint-less senders skip it.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        if !self.config.dry_run && self.config.endpoint.is_some() {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            if let Some(token) = &self.config.token {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ReplicatorError::Config(format!("Invalid CLOUD_API_TOKEN: {}", e)))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }

            let client = reqwest::Client::builder()
                .default_headers(headers)
                .timeout(self.config.request_timeout)
                .build()
                .map_err(|e| ReplicatorError::Delivery(format!("Failed to build HTTP client: {}", e)))?;
            self.client = Some(client);
        }

        self.connected = true;
        self.last_flush = Instant::now();
        info!(
            endpoint = self.config.endpoint.as_deref().unwrap_or("none"),
            dry_run = self.config.dry_run,
            batch_size = self.config.batch_size,
            "Delivery sender connected"
        );
        Ok(())
    }

    /// Buffer an envelope, flushing if the batch is full or the interval has passed.
    pub async fn send(&mut self, envelope: EncryptedEnvelope) -> Result<Option<SendResult>> {
        if !self.connected {
            return Err(ReplicatorError::NotConnected("delivery sender"));
        }

        self.buffer.push(envelope);
        if self.buffer.len() >= self.config.batch_size || self.interval_elapsed() {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    /// Flush only if something is buffered and the interval has passed.
    pub async fn flush_if_due(&mut self) -> Result<Option<SendResult>> {
        if self.buffer.is_empty() || !self.interval_elapsed() {
            return Ok(None);
        }
        self.flush().await.map(Some)
    }

    fn interval_elapsed(&self) -> bool {
        self.last_flush.elapsed() >= self.config.flush_interval
    }

    /// Deliver everything buffered. The buffer is empty afterwards whatever
    /// the outcome.
    pub async fn flush(&mut self) -> Result<SendResult> {
        if !self.connected {
            return Err(ReplicatorError::NotConnected("delivery sender"));
        }

        let batch = std::mem::take(&mut self.buffer);
        self.last_flush = Instant::now();
        if batch.is_empty() {
            return Ok(SendResult::default());
        }

        let result = if self.config.dry_run {
            info!(count = batch.len(), "Dry run, not sending envelopes");
            SendResult {
                sent_count: batch.len(),
                ..Default::default()
            }
        } else {
            match (&self.client, &self.config.endpoint) {
                (Some(client), Some(base)) => {
                    let url = format!("{}/envelopes", base.trim_end_matches('/'));
                    self.post_batch(client, &url, &batch).await
                }
                _ => {
                    warn!(count = batch.len(), "No cloud endpoint configured, dropping envelopes");
                    SendResult {
                        sent_count: 0,
                        failed_count: batch.len(),
                        errors: vec!["no cloud endpoint configured".to_string(); batch.len()],
                    }
                }
            }
        };

        self.stats.flushes += 1;
        self.stats.sent += result.sent_count as u64;
        self.stats.failed += result.failed_count as u64;

        if result.success() {
            info!(sent = result.sent_count, "Flushed envelopes");
        } else {
            warn!(
                sent = result.sent_count,
                failed = result.failed_count,
                "Flushed envelopes with failures"
            );
        }
        Ok(result)
    }

    async fn post_batch(&self, client: &reqwest::Client, url: &str, batch: &[EncryptedEnvelope]) -> SendResult {
        let mut result = SendResult::default();
        for envelope in batch {
            match self.post_one(client, url, envelope).await {
                Ok(()) => result.sent_count += 1,
                Err(e) => {
                    result.failed_count += 1;
                    result
                        .errors
                        .push(format!("{} {} ({}): {}", envelope.operation, envelope.table, envelope.key_id, e));
                }
            }
        }
        result
    }

    async fn post_one(&self, client: &reqwest::Client, url: &str, envelope: &EncryptedEnvelope) -> Result<()> {
        let body = envelope.serialize()?;
        let idempotency_key = Uuid::new_v4().to_string();
        let policy = &self.config.retry;

        let mut retry = 0;
        loop {
            let response = client
                .post(url)
                .header(IDEMPOTENCY_HEADER, idempotency_key.as_str())
                .body(body.clone())
                .send()
                .await;

            let (retryable, reason) = match response {
                Ok(response) if response.status().is_success() => {
                    debug!(table = %envelope.table, status = %response.status(), "Envelope delivered");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    (is_retryable(status), format!("HTTP {}", status))
                }
                Err(e) => (true, format!("request failed: {}", e)),
            };

            if !retryable || retry >= policy.max_retries {
                return Err(ReplicatorError::Delivery(reason));
            }

            retry += 1;
            let delay = policy.delay_for(retry);
            warn!(
                table = %envelope.table,
                reason = %reason,
                retry,
                delay_ms = delay.as_millis() as u64,
                "Delivery attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Flush whatever is left and release the client. Safe to call twice.
    pub async fn disconnect(&mut self) -> Result<SendResult> {
        if !self.connected {
            return Ok(SendResult::default());
        }

        let result = self.flush().await;
        self.connected = false;
        self.client = None;
        info!(
            sent = self.stats.sent,
            failed = self.stats.failed,
            "Delivery sender disconnected"
        );
        result
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
