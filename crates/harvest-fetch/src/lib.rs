//! Record fetchers: the live registry API client plus fixture-first and
//! scripted fetchers for offline runs and tests.
//!
//! Every fetcher maps its transport onto [`FetchOutcome`]. Only a confirmed
//! "does not exist" answer becomes `NotFound`; anything else that is not a
//! usable payload is a `TransientError`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use harvest_core::{FetchOutcome, RecordKey, Status};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "harvest-fetch";

pub const DEFAULT_API_BASE: &str = "https://purchasing.alberta.ca/api/opportunity/public";

#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(&self, key: &RecordKey) -> FetchOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not JSON: {source}")]
    InvalidBody {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Client for the public registry endpoint `{api_base}/{partition}/{sequence_id}`.
#[derive(Debug)]
pub struct ApiFetcher {
    client: reqwest::Client,
    api_base: String,
    backoff: BackoffPolicy,
}

impl ApiFetcher {
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
            api_base: config.api_base.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    pub fn url_for(&self, key: &RecordKey) -> String {
        format!("{}/{}/{}", self.api_base, key.partition, key.sequence_id)
    }

    /// `Ok(None)` is a confirmed 404; every other failure is an error.
    pub async fn fetch_json(&self, key: &RecordKey) -> Result<Option<JsonValue>, FetchError> {
        let url = self.url_for(key);
        let mut attempt = 0usize;

        loop {
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body)
                            .map(Some)
                            .map_err(|source| FetchError::InvalidBody { url, source });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable registry status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable registry request failure");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl RecordFetcher for ApiFetcher {
    async fn fetch(&self, key: &RecordKey) -> FetchOutcome {
        let span = info_span!("registry_fetch", record = %key);
        async {
            match self.fetch_json(key).await {
                Ok(Some(payload)) => FetchOutcome::Found(payload),
                Ok(None) => FetchOutcome::NotFound,
                Err(err) => FetchOutcome::TransientError(err.to_string()),
            }
        }
        .instrument(span)
        .await
    }
}

/// Reads captured payloads from `<root>/<partition>/<sequence_id>.json`.
/// A missing file is a miss.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fixture_path(&self, key: &RecordKey) -> PathBuf {
        self.root
            .join(key.partition.to_string())
            .join(format!("{}.json", key.sequence_id))
    }
}

#[async_trait]
impl RecordFetcher for FixtureFetcher {
    async fn fetch(&self, key: &RecordKey) -> FetchOutcome {
        let path = self.fixture_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return FetchOutcome::NotFound
            }
            Err(err) => {
                return FetchOutcome::TransientError(format!("reading {}: {err}", path.display()))
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(payload) => FetchOutcome::Found(payload),
            Err(err) => {
                FetchOutcome::TransientError(format!("parsing {}: {err}", path.display()))
            }
        }
    }
}

/// Deterministic fetcher replaying scripted outcomes per id. The last
/// scripted outcome repeats; unscripted ids are misses.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<RecordKey, VecDeque<FetchOutcome>>>,
    calls: Mutex<Vec<RecordKey>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script(&self, key: RecordKey, outcomes: impl IntoIterator<Item = FetchOutcome>) {
        self.scripts
            .lock()
            .await
            .insert(key, outcomes.into_iter().collect());
    }

    pub async fn calls(&self) -> Vec<RecordKey> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl RecordFetcher for ScriptedFetcher {
    async fn fetch(&self, key: &RecordKey) -> FetchOutcome {
        self.calls.lock().await.push(*key);
        let mut scripts = self.scripts.lock().await;
        let outcome = match scripts.get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        let outcome = outcome.unwrap_or(FetchOutcome::NotFound);
        debug!(record = %key, outcome = outcome.kind(), "scripted fetch");
        outcome
    }
}

/// Minimal registry-shaped payload, handy for fixtures and tests.
pub fn registry_payload(key: &RecordKey, status: Status, awarded_on: Option<&str>) -> JsonValue {
    json!({
        "opportunity": {
            "referenceNumber": format!("AB-{}-{:05}", key.partition, key.sequence_id),
            "statusCode": status.as_str(),
            "shortTitle": format!("Posting {}", key),
            "awardedOnUtc": awarded_on,
        },
        "awards": [],
        "bidders": [],
    })
}
