//! HTTP fetch, fixed-interval retry and atomic file output for gamedex.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gamedex-storage";

/// Failure of a single fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// A failed attempt inside the retry loop: either the transport failed or the
/// fetched body did not pass the initial parse.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
#[error("failed to fetch {url} after {attempts} attempts: {last_error}")]
pub struct FetchExhaustedError {
    pub url: String,
    pub attempts: usize,
    pub last_error: AttemptError,
}

/// Fetch capability handed to the scraper. Implemented by [`HttpFetcher`] and by
/// in-memory stubs in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
}

/// Fixed-interval retry: no backoff, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Fetches `url` and runs `parse` on the body, retrying the pair on any failure
/// up to `policy.max_attempts` attempts with `policy.delay` between them.
pub async fn fetch_with_retry<F, P, T>(
    fetcher: &F,
    url: &str,
    policy: &RetryPolicy,
    parse: P,
) -> Result<T, FetchExhaustedError>
where
    F: PageFetcher + ?Sized,
    P: Fn(&str) -> Result<T, String>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let outcome = match fetcher.fetch_page(url).await {
            Ok(body) => parse(&body).map_err(AttemptError::Parse),
            Err(err) => Err(AttemptError::Fetch(err)),
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let retrying = attempt < attempts;
        if retrying {
            warn!(url, attempt, error = %err, "fetch attempt failed, retrying");
        }
        last_error = Some(err);
        if retrying {
            tokio::time::sleep(policy.delay).await;
        }
    }

    Err(FetchExhaustedError {
        url: url.to_string(),
        attempts,
        last_error: last_error
            .unwrap_or_else(|| AttemptError::Parse("no attempt was made".to_string())),
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-shot HTTP fetcher; retrying is the caller's concern.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    /// Fetches the raw body of `url`; a non-2xx status is an error naming the
    /// URL the request ended at after redirects.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url);
        let result: Result<Vec<u8>, FetchError> = async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            Ok(resp.bytes().await?.to_vec())
        }
        .instrument(span)
        .await;
        result
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let body = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Writes `bytes` to `path` through a temp file in the same directory and an
/// atomic rename, replacing any previous file. Parent directories are created.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
