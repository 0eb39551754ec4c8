use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::FetchError;

pub const DEFAULT_USER_AGENT: &str = concat!("worldbank-etl/", env!("CARGO_PKG_VERSION"));

/// One HTTP exchange. `attempts` is filled in by [`FetchClient`].
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Bytes,
    pub attempts: u32,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
            attempts: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A single GET with no retry logic. Network-level failures are errors; every HTTP status,
/// including 4xx/5xx, is a response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed transport with a fixed identifying user agent.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::network("client-builder", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(ACCEPT, "application/json, text/html;q=0.9, */*;q=0.8")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::network(url, e))?;
        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers(), Utc::now());
        let body = resp.bytes().await.map_err(|e| FetchError::network(url, e))?;
        Ok(FetchResponse {
            status,
            retry_after,
            body,
            attempts: 0,
        })
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date relative to `now`.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub timeout: Duration,
    /// Upper bound for any single wait, including server `Retry-After` hints.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): the server hint when given, otherwise
    /// `base * 2^retry`. Never more than `max_delay`.
    pub fn backoff(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let delay = hint.unwrap_or_else(|| {
            self.base_backoff
                .saturating_mul(2u32.saturating_pow(retry.min(16)))
        });
        if delay > self.max_delay {
            warn!(
                requested_ms = delay.as_millis() as u64,
                max_ms = self.max_delay.as_millis() as u64,
                server_hint = hint.is_some(),
                "backoff clamped"
            );
            return self.max_delay;
        }
        delay
    }
}

/// Rate-limit-aware GET. Only `429` is retried; any other status is handed back on the first
/// attempt so the caller can decide whether to skip the resource.
#[derive(Clone)]
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn http(user_agent: &str, policy: RetryPolicy) -> Result<Self, FetchError> {
        Ok(Self::new(Arc::new(HttpTransport::new(user_agent)?), policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// At most `max_attempts` calls. Backoff never shrinks between consecutive 429s. When the
    /// attempts run out the last (429) response is returned rather than an error.
    #[instrument(skip(self), fields(max_attempts = self.policy.max_attempts))]
    pub async fn fetch_with_retry(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut previous = Duration::ZERO;
        let mut attempt: u32 = 0;
        loop {
            let mut resp = self.transport.get(url, self.policy.timeout).await?;
            attempt += 1;
            resp.attempts = attempt;

            if !resp.is_rate_limited() {
                if !resp.is_success() {
                    debug!(status = resp.status, attempt, "non-success response; not retrying");
                }
                return Ok(resp);
            }
            if attempt >= max_attempts {
                warn!(attempt, "still rate limited; giving up and returning last response");
                return Ok(resp);
            }

            let delay = self.policy.backoff(attempt - 1, resp.retry_after).max(previous);
            previous = delay;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                server_hint = resp.retry_after.is_some(),
                "429 Too Many Requests; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
