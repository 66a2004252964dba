//! Source-specific event extraction.
//!
//! An [`ExtractorRegistry`] holds extractors in priority order. Source-specific
//! extractors are asked first via `can_handle`; the generic extractor sits at
//! the end and accepts every URL, so selection never fails.

pub mod facebook;
pub mod generic;

use std::sync::Arc;

use async_trait::async_trait;
use seshu_common::{CandidateEvent, ScrapeAction, ScrapeMode, ScrapeTarget, SeshuError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::fetch::{FetchError, PageFetcher};
use crate::timezone::TimezoneResolver;

pub use facebook::FacebookExtractor;
pub use generic::{EventInterpreter, GenericExtractor};

/// Everything an extractor needs for one call. Mode and action are explicit
/// parameters rather than values smuggled through the cancellation token.
#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub target: &'a ScrapeTarget,
    pub mode: ScrapeMode,
    pub action: ScrapeAction,
    pub cancel: &'a CancellationToken,
}

/// Candidates plus the HTML they came from, so a reviewer can fill gaps by hand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub events: Vec<CandidateEvent>,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("text understanding service failed: {0}")]
    Interpret(String),

    #[error("could not decode events: {0}")]
    Decode(String),

    #[error("extraction cancelled")]
    Cancelled,
}

impl From<ExtractError> for SeshuError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Fetch(e) => e.into(),
            ExtractError::Decode(msg) => SeshuError::Parse(msg),
            ExtractError::Interpret(msg) => SeshuError::Extraction(msg),
            ExtractError::Cancelled => SeshuError::Cancelled,
        }
    }
}

#[async_trait]
pub trait EventExtractor: Send + Sync {
    /// Known-source tag stored on jobs so re-scrapes skip URL matching.
    fn name(&self) -> &'static str;

    fn can_handle(&self, url: &str) -> bool;

    async fn extract(
        &self,
        req: &ExtractRequest<'_>,
        fetcher: &dyn PageFetcher,
    ) -> Result<Extraction, ExtractError>;
}

pub struct ExtractorRegistry {
    specific: Vec<Arc<dyn EventExtractor>>,
    fallback: Arc<dyn EventExtractor>,
}

impl ExtractorRegistry {
    pub fn new(specific: Vec<Arc<dyn EventExtractor>>, fallback: Arc<dyn EventExtractor>) -> Self {
        Self { specific, fallback }
    }

    /// Facebook first, the generic extractor last.
    pub fn standard(
        timezones: Arc<dyn TimezoneResolver>,
        interpreter: Arc<dyn EventInterpreter>,
    ) -> Self {
        Self::new(
            vec![Arc::new(FacebookExtractor::new(timezones))],
            Arc::new(GenericExtractor::new(interpreter)),
        )
    }

    /// First extractor in priority order that accepts `url`; the fallback otherwise.
    pub fn select(&self, url: &str) -> &dyn EventExtractor {
        self.specific
            .iter()
            .find(|e| e.can_handle(url))
            .unwrap_or(&self.fallback)
            .as_ref()
    }

    /// Prefer the extractor named by a job's known-source tag, then URL dispatch.
    pub fn select_for(&self, known_source: &str, url: &str) -> &dyn EventExtractor {
        if !known_source.is_empty() {
            if let Some(e) = self
                .specific
                .iter()
                .chain(std::iter::once(&self.fallback))
                .find(|e| e.name() == known_source)
            {
                return e.as_ref();
            }
        }
        self.select(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedTimezones, MockInterpreter};

    fn registry() -> ExtractorRegistry {
        ExtractorRegistry::standard(
            Arc::new(FixedTimezones::default()),
            Arc::new(MockInterpreter::new("[]")),
        )
    }

    #[test]
    fn facebook_event_urls_select_facebook() {
        let registry = registry();
        assert_eq!(
            registry.select("https://www.facebook.com/thedakotajazz/events").name(),
            facebook::SOURCE_NAME
        );
        assert_eq!(
            registry
                .select("https://www.facebook.com/people/Some-Venue/100083/?sk=events")
                .name(),
            facebook::SOURCE_NAME
        );
    }

    #[test]
    fn everything_else_selects_generic() {
        let registry = registry();
        for url in [
            "",
            "https://example.com/events",
            "https://www.facebook.com/thedakotajazz",
            "not a url",
        ] {
            assert_eq!(registry.select(url).name(), generic::SOURCE_NAME, "url: {url:?}");
        }
    }

    #[test]
    fn known_source_overrides_url_matching() {
        let registry = registry();
        assert_eq!(
            registry.select_for("facebook", "https://example.com/mirror").name(),
            facebook::SOURCE_NAME
        );
        assert_eq!(
            registry.select_for("unknown-tag", "https://example.com").name(),
            generic::SOURCE_NAME
        );
    }
}
