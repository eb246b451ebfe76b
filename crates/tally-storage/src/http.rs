//! Rate-limited, retrying HTTP client for the remote messaging platform.
//!
//! Every request waits on a global concurrency permit, then a per-organization
//! one, then a token from the shared bucket. Server errors and transport
//! failures are retried with capped exponential backoff; a 429 is returned to
//! the caller immediately so a long results pull can pause instead of spinning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tally_core::OrgId;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// How many times a transient failure is retried and how long to wait between tries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero based): `initial * 2^retry`, capped.
    pub fn delay(&self, retry: usize) -> Duration {
        let doubling = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.initial.saturating_mul(doubling).min(self.ceiling)
    }
}

/// Request budget shared by every organization: `capacity` requests, one
/// more granted each `refill_every`.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_org: usize,
    pub retry: RetryPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(concat!("tally/", env!("CARGO_PKG_VERSION")).to_string()),
            max_in_flight: 8,
            max_in_flight_per_org: 2,
            retry: RetryPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("invalid response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Retry,
    Pause,
    Fail,
}

impl From<StatusCode> for Verdict {
    fn from(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Verdict::Pause,
            s if s.is_server_error() => Verdict::Retry,
            _ => Verdict::Fail,
        }
    }
}

impl From<&reqwest::Error> for Verdict {
    fn from(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Verdict::Retry
        } else {
            Verdict::Fail
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    refilled_at: Instant,
}

#[derive(Debug)]
struct RateLimiter {
    config: TokenBucketConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    fn new(config: TokenBucketConfig) -> Self {
        let config = TokenBucketConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            bucket: Mutex::new(Bucket {
                tokens: config.capacity,
                refilled_at: Instant::now(),
            }),
            config,
        }
    }

    /// Waits until a token is available and consumes it.
    async fn acquire(&self) {
        loop {
            {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if let Some(left) = bucket.tokens.checked_sub(1) {
                    bucket.tokens = left;
                    return;
                }
            }
            tokio::time::sleep(self.config.refill_every).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let period = self.config.refill_every;
        if period.is_zero() {
            bucket.tokens = self.config.capacity;
            return;
        }
        let earned = bucket.refilled_at.elapsed().as_millis() / period.as_millis().max(1);
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        let filled = bucket.tokens.saturating_add(earned);
        if filled >= self.config.capacity {
            bucket.tokens = self.config.capacity;
            bucket.refilled_at = Instant::now();
        } else {
            // Advance by whole periods only, so the partial one carries over.
            bucket.tokens = filled;
            bucket.refilled_at += period.saturating_mul(earned);
        }
    }
}

/// Shared HTTP client for every remote backend in the process.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_org_permits: usize,
    org_limits: Mutex<HashMap<OrgId, Arc<Semaphore>>>,
    limiter: Option<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_org_permits: config.max_in_flight_per_org.max(1),
            org_limits: Mutex::new(HashMap::new()),
            limiter: config.token_bucket.map(RateLimiter::new),
            retry: config.retry,
        })
    }

    async fn org_limit(&self, org: OrgId) -> Arc<Semaphore> {
        let mut limits = self.org_limits.lock().await;
        Arc::clone(
            limits
                .entry(org)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_org_permits))),
        )
    }

    /// GETs `url` with the organization's API token and decodes the JSON body.
    ///
    /// `run_id` tags the request span so every page of one pull can be
    /// correlated in the logs.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        org: OrgId,
        url: &str,
        token: Option<&str>,
    ) -> Result<T, FetchError> {
        let _global = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let org_limit = self.org_limit(org).await;
        let _org = org_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let span = info_span!("remote_request", %run_id, %org, url);
        async {
            let response = self.get_with_retries(url, request_headers(token)).await?;
            let final_url = response.url().to_string();
            let body = response.bytes().await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }

    async fn get_with_retries(&self, url: &str, headers: HeaderMap) -> Result<Response, FetchError> {
        let mut retry = 0;
        loop {
            match self.client.get(url).headers(headers.clone()).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    match Verdict::from(status) {
                        Verdict::Pause => return Err(rate_limited(&response)),
                        Verdict::Retry if retry < self.retry.retries => {
                            debug!(status = status.as_u16(), retry, "server error; retrying");
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: response.url().to_string(),
                            })
                        }
                    }
                }
                Err(err) => {
                    if Verdict::from(&err) != Verdict::Retry || retry >= self.retry.retries {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, retry, "request failed; retrying");
                }
            }
            tokio::time::sleep(self.retry.delay(retry)).await;
            retry += 1;
        }
    }
}

fn request_headers(token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(value) = token.and_then(|t| HeaderValue::from_str(&format!("Token {t}")).ok()) {
        headers.insert(AUTHORIZATION, value);
    }
    headers
}

fn rate_limited(response: &Response) -> FetchError {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    FetchError::RateLimited {
        url: response.url().to_string(),
        retry_after,
    }
}
