use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use scraping_client::{ScrapingClient, ScrapingError};
use seshu_common::SeshuError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use scraping_client::RenderOptions;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network failure or non-success status from the fetch service. Retryable.
    #[error("fetch of {url} failed: {message}")]
    Transport { url: String, message: String },

    /// The page never passed content validation.
    #[error("content from {url} failed validation after {attempts} attempt(s)")]
    Rejected { url: String, attempts: u32 },

    /// The request itself is wrong (e.g. an already-escaped URL). Not retryable.
    #[error("invalid fetch request for {url}: {message}")]
    Invalid { url: String, message: String },

    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport { .. } | FetchError::Rejected { .. })
    }
}

impl From<FetchError> for SeshuError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled { .. } => SeshuError::Cancelled,
            FetchError::Invalid { message, .. } => SeshuError::Config(message),
            other => SeshuError::Fetch(other.to_string()),
        }
    }
}

// --- PageFetcher trait ---

/// One outbound render-and-fetch call. No caching.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &RenderOptions) -> Result<String, FetchError>;
}

/// Fetches through the ScrapingBee-style rendering service.
pub struct ScrapingBeeFetcher {
    client: ScrapingClient,
}

impl ScrapingBeeFetcher {
    pub fn new(client: ScrapingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for ScrapingBeeFetcher {
    async fn fetch(&self, url: &str, options: &RenderOptions) -> Result<String, FetchError> {
        self.client
            .content(url, options)
            .await
            .map_err(|e| match e {
                ScrapingError::EncodedUrl(_) | ScrapingError::Config(_) => FetchError::Invalid {
                    url: url.to_string(),
                    message: e.to_string(),
                },
                other => FetchError::Transport {
                    url: url.to_string(),
                    message: other.to_string(),
                },
            })
    }
}

// --- Retry ---

/// Bounded attempts with optional exponential backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each attempt. Zero disables waiting.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub const fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_base: Duration::ZERO,
        }
    }

    pub const fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn delay_before(&self, attempt: u32) -> Option<Duration> {
        if self.backoff_base.is_zero() || attempt <= 1 {
            return None;
        }
        let backoff = self.backoff_base * 2u32.saturating_pow(attempt - 2);
        let jitter = Duration::from_millis(rand::rng().random_range(0..250));
        Some(backoff + jitter)
    }
}

/// Fetch `url`, retrying while the fetch fails or `is_valid` rejects the body.
///
/// Performs at most `policy.max_attempts` fetches (minimum one) and returns
/// the last attempt's error when all of them fail. Cancellation aborts
/// immediately without starting another attempt.
pub async fn fetch_with_retry<F>(
    fetcher: &dyn PageFetcher,
    url: &str,
    options: &RenderOptions,
    policy: &RetryPolicy,
    is_valid: F,
    cancel: &CancellationToken,
) -> Result<String, FetchError>
where
    F: Fn(&str) -> bool + Send + Sync,
{
    let max_attempts = policy.max_attempts.max(1);
    let cancelled = || FetchError::Cancelled {
        url: url.to_string(),
    };

    let mut last_err = None;
    for attempt in 1..=max_attempts {
        if let Some(delay) = policy.delay_before(attempt) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            r = fetcher.fetch(url, options) => r,
        };

        let err = match result {
            Ok(html) if is_valid(&html) => {
                if attempt > 1 {
                    info!(url, attempt, "Fetch succeeded after retry");
                }
                return Ok(html);
            }
            Ok(_) => FetchError::Rejected {
                url: url.to_string(),
                attempts: attempt,
            },
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        warn!(
            url,
            attempt,
            max_attempts,
            error = %err,
            "Fetch attempt failed"
        );
        last_err = Some(err);
    }

    Err(last_err.unwrap_or_else(|| FetchError::Rejected {
        url: url.to_string(),
        attempts: max_attempts,
    }))
}
