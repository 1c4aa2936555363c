//! HTTP transport with bounded retries, plus an immutable archive for raw API responses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use despesas_core::FiscalYear;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "despesas-storage";

/// Which request a response body answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseKey<'a> {
    pub api_name: &'a str,
    pub year: FiscalYear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedResponse {
    pub sha256: String,
    /// Relative to the archive root.
    pub path: PathBuf,
    pub bytes: usize,
    /// The same body was already archived for this key and day.
    pub reused: bool,
}

/// Write-once copies of API response bodies, laid out as
/// `<api_name>/<year>/<YYYY-MM-DD>/<sha256>.json`.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: ResponseKey<'_>, fetched_at: DateTime<Utc>, sha256: &str) -> PathBuf {
        PathBuf::from(key.api_name)
            .join(key.year.to_string())
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{sha256}.json"))
    }

    /// Stores `body` unless an identical one is already there. The file appears
    /// atomically: it is written under a hidden temp name and renamed.
    pub async fn archive(
        &self,
        key: ResponseKey<'_>,
        fetched_at: DateTime<Utc>,
        body: &[u8],
    ) -> anyhow::Result<ArchivedResponse> {
        let sha256 = sha256_hex(body);
        let path = self.path_for(key, fetched_at, &sha256);
        let target = self.root.join(&path);
        let mut archived = ArchivedResponse {
            sha256,
            path,
            bytes: body.len(),
            reused: true,
        };

        if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking {}", target.display()))?
        {
            return Ok(archived);
        }

        let dir = target.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let temp = dir.join(format!(".{}.{}.tmp", archived.sha256, Uuid::new_v4()));
        fs::write(&temp, body)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err).with_context(|| format!("renaming into {}", target.display()));
        }

        archived.reused = false;
        Ok(archived)
    }
}

/// Bounded exponential backoff between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31) as u32);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 2,
            retry: RetryPolicy::default(),
        }
    }
}

/// Transport shape of one request. Deployed API revisions accept one or the other.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestShape {
    Get {
        query: Vec<(String, String)>,
    },
    PostJson {
        query: Vec<(String, String)>,
        body: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub shape: RequestShape,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Worth another attempt: throttling, 5xx, and connection-level failures,
    /// including a body that broke off mid-read.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(status)
            }
            Self::Request(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
        }
    }
}

/// Shared HTTP client capping in-flight requests across all callers.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
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
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            retry: config.retry,
        })
    }

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let builder = match &request.shape {
            RequestShape::Get { query } => self.client.get(&request.url).query(query),
            RequestShape::PostJson { query, body } => {
                self.client.post(&request.url).query(query).json(body)
            }
        };
        builder.header(ACCEPT, "application/json")
    }

    /// Sends `request`, retrying transient failures per the retry policy.
    ///
    /// Only a 2xx response with a fully read body is returned as `Ok`.
    pub async fn fetch(
        &self,
        run_id: Uuid,
        label: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, label, url = %request.url);
        self.fetch_with_retries(request).instrument(span).await
    }

    async fn fetch_with_retries(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let mut retries = 0usize;
        loop {
            match self.attempt(request, retries + 1).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && retries < self.retry.max_retries => {
                    let delay = self.retry.delay(retries);
                    warn!(error = %err, retry = retries + 1, ?delay, "transient failure; retrying");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, request: &HttpRequest, attempts: usize) -> Result<FetchedResponse, FetchError> {
        let resp = self.build(request).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), attempts, "response received");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
            attempts,
        })
    }
}
