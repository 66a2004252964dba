//! Catch-all extractor backed by a text-understanding service.
//!
//! The rendered page is reduced to readable markdown, split into lines, and
//! handed to the service with a prompt describing the candidate JSON shape.

use std::sync::Arc;

use ai_client::{strip_code_blocks, OpenAi};
use async_trait::async_trait;
use seshu_common::{CandidateEvent, ScrapeAction, ScrapeMode};
use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};
use tracing::{debug, info, warn};

use super::{EventExtractor, ExtractError, ExtractRequest, Extraction};
use crate::fetch::{fetch_with_retry, PageFetcher, RenderOptions, RetryPolicy};

pub const SOURCE_NAME: &str = "generic";

const WAIT_MS: u32 = 4500;
const MAX_LINES: usize = 1500;

// --- Interpreter seam ---

/// Turns page text into a JSON array of candidate events.
#[async_trait]
pub trait EventInterpreter: Send + Sync {
    async fn interpret(&self, instructions: &str, page_lines_json: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl EventInterpreter for OpenAi {
    async fn interpret(&self, instructions: &str, page_lines_json: &str) -> anyhow::Result<String> {
        Ok(self.chat_completion(instructions, page_lines_json).await?)
    }
}

const CANDIDATE_SCHEMA: &str = r#"{
  "event_title": "string",
  "event_location": "string",
  "event_start_datetime": "string, as written on the page",
  "event_end_datetime": "string, as written on the page, or empty",
  "event_url": "string, absolute URL of the event's own page, or empty",
  "event_description": "string, or empty"
}"#;

fn listing_prompt() -> String {
    format!(
        "You read event listing pages. The user message is a JSON array of text lines \
         taken from one web page, in page order. Find every distinct upcoming event on \
         the page and return ONLY a JSON array of objects shaped like:\n{CANDIDATE_SCHEMA}\n\
         Copy dates and times exactly as they appear. Leave a field empty rather than \
         guessing. Return [] when the page lists no events."
    )
}

fn detail_prompt() -> String {
    format!(
        "You read the page of a single event. The user message is a JSON array of text \
         lines taken from that page, in page order. Return ONLY a JSON array holding one \
         object shaped like:\n{CANDIDATE_SCHEMA}\n\
         Copy dates and times exactly as they appear. Leave a field empty rather than \
         guessing. Return [] when the page does not describe an event."
    )
}

// --- Extractor ---

pub struct GenericExtractor {
    interpreter: Arc<dyn EventInterpreter>,
    policy: RetryPolicy,
}

impl GenericExtractor {
    pub fn new(interpreter: Arc<dyn EventInterpreter>) -> Self {
        Self {
            interpreter,
            policy: RetryPolicy::attempts(1),
        }
    }
}

#[async_trait]
impl EventExtractor for GenericExtractor {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn can_handle(&self, _url: &str) -> bool {
        true
    }

    async fn extract(
        &self,
        req: &ExtractRequest<'_>,
        fetcher: &dyn PageFetcher,
    ) -> Result<Extraction, ExtractError> {
        let url = req.target.url.as_str();
        let options = RenderOptions {
            wait_ms: WAIT_MS,
            render_js: true,
            wait_for: None,
        };
        let html = fetch_with_retry(
            fetcher,
            url,
            &options,
            &self.policy,
            |html| !html.is_empty(),
            req.cancel,
        )
        .await?;

        if req.mode != ScrapeMode::Onboard {
            // Recurring scrapes of arbitrary pages are not interpreted yet.
            debug!(url, "Generic extractor has no scrape-mode reader");
            return Ok(Extraction {
                events: Vec::new(),
                html,
            });
        }

        let lines = page_lines(&html, url);
        if lines.is_empty() {
            warn!(url, "Empty content after markdown conversion");
        }
        let page_json = serde_json::to_string(&lines)
            .map_err(|e| ExtractError::Decode(e.to_string()))?;

        let instructions = match req.action {
            ScrapeAction::Init => listing_prompt(),
            ScrapeAction::Recursive => detail_prompt(),
        };

        let response = tokio::select! {
            _ = req.cancel.cancelled() => return Err(ExtractError::Cancelled),
            r = self.interpreter.interpret(&instructions, &page_json) => {
                r.map_err(|e| ExtractError::Interpret(e.to_string()))?
            }
        };

        let mut events = decode_candidates(&response)?;
        for event in &mut events {
            event.source_url = url.to_string();
        }
        info!(url, lines = lines.len(), count = events.len(), "Interpreted page");

        Ok(Extraction { events, html })
    }
}

/// Readable markdown of the page as trimmed, non-empty lines, capped.
pub fn page_lines(html: &str, url: &str) -> Vec<String> {
    let parsed_url = url::Url::parse(url).ok();
    let config = TransformConfig {
        readability: true,
        main_content: true,
        return_format: ReturnFormat::Markdown,
        filter_images: true,
        filter_svg: true,
        clean_html: true,
    };
    let input = TransformInput {
        url: parsed_url.as_ref(),
        content: html.as_bytes(),
        screenshot_bytes: None,
        encoding: None,
        selector_config: None,
        ignore_tags: None,
    };

    transform_content_input(input, &config)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_LINES)
        .map(String::from)
        .collect()
}

fn decode_candidates(response: &str) -> Result<Vec<CandidateEvent>, ExtractError> {
    let cleaned = strip_code_blocks(response);
    serde_json::from_str(cleaned.trim()).map_err(|e| {
        ExtractError::Decode(format!("interpreter response is not a candidate array: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFetcher, MockInterpreter};
    use seshu_common::ScrapeTarget;
    use tokio_util::sync::CancellationToken;

    const URL: &str = "https://example.com/events";

    const PAGE: &str = r#"<html><body><main>
        <h1>Upcoming shows</h1>
        <article><h2>Jazz Night</h2><p>July 25, 2025 at 7:00 PM</p><p>The Dakota</p></article>
        <article><h2>Blues Brunch</h2><p>July 26, 2025 at 11:00 AM</p><p>Icehouse</p></article>
    </main></body></html>"#;

    const RESPONSE: &str = "```json\n[{\"event_title\":\"Jazz Night\",\"event_location\":\"The Dakota\",\"event_start_datetime\":\"July 25, 2025 at 7:00 PM\",\"event_url\":\"https://example.com/jazz\",\"event_description\":null}]\n```";

    fn request<'a>(
        target: &'a ScrapeTarget,
        mode: ScrapeMode,
        action: ScrapeAction,
        cancel: &'a CancellationToken,
    ) -> ExtractRequest<'a> {
        ExtractRequest {
            target,
            mode,
            action,
            cancel,
        }
    }

    #[tokio::test]
    async fn onboard_mode_interprets_page_lines() {
        let fetcher = MockFetcher::new().on_page(URL, PAGE);
        let interpreter = Arc::new(MockInterpreter::new(RESPONSE));
        let extractor = GenericExtractor::new(interpreter.clone());
        let target = ScrapeTarget::from_url(URL);
        let cancel = CancellationToken::new();

        let extraction = extractor
            .extract(
                &request(&target, ScrapeMode::Onboard, ScrapeAction::Init, &cancel),
                &fetcher,
            )
            .await
            .unwrap();

        assert_eq!(extraction.html, PAGE);
        assert_eq!(extraction.events.len(), 1);
        assert_eq!(extraction.events[0].title, "Jazz Night");
        assert_eq!(extraction.events[0].description, "");
        assert_eq!(extraction.events[0].source_url, URL);

        let calls = interpreter.calls();
        assert_eq!(calls.len(), 1);
        let (instructions, page_json) = &calls[0];
        assert!(instructions.contains("every distinct upcoming event"));
        let lines: Vec<String> = serde_json::from_str(page_json).unwrap();
        assert!(lines.iter().all(|l| !l.is_empty() && l.trim() == l));
    }

    #[tokio::test]
    async fn recursive_action_uses_single_event_prompt() {
        let fetcher = MockFetcher::new().on_page(URL, PAGE);
        let interpreter = Arc::new(MockInterpreter::new("[]"));
        let extractor = GenericExtractor::new(interpreter.clone());
        let target = ScrapeTarget::from_url(URL);
        let cancel = CancellationToken::new();

        let extraction = extractor
            .extract(
                &request(&target, ScrapeMode::Onboard, ScrapeAction::Recursive, &cancel),
                &fetcher,
            )
            .await
            .unwrap();

        assert!(extraction.events.is_empty());
        assert!(interpreter.calls()[0].0.contains("single event"));
    }

    #[tokio::test]
    async fn scrape_mode_returns_html_without_interpreting() {
        let fetcher = MockFetcher::new().on_page(URL, PAGE);
        let interpreter = Arc::new(MockInterpreter::new(RESPONSE));
        let extractor = GenericExtractor::new(interpreter.clone());
        let target = ScrapeTarget::from_url(URL);
        let cancel = CancellationToken::new();

        let extraction = extractor
            .extract(
                &request(&target, ScrapeMode::Scrape, ScrapeAction::Init, &cancel),
                &fetcher,
            )
            .await
            .unwrap();

        assert!(extraction.events.is_empty());
        assert_eq!(extraction.html, PAGE);
        assert!(interpreter.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_response_is_a_decode_error() {
        let fetcher = MockFetcher::new().on_page(URL, PAGE);
        let extractor = GenericExtractor::new(Arc::new(MockInterpreter::new("Sorry, no events.")));
        let target = ScrapeTarget::from_url(URL);
        let cancel = CancellationToken::new();

        let err = extractor
            .extract(
                &request(&target, ScrapeMode::Onboard, ScrapeAction::Init, &cancel),
                &fetcher,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractError::Decode(_)));
    }

    #[tokio::test]
    async fn interpreter_failure_is_reported() {
        let fetcher = MockFetcher::new().on_page(URL, PAGE);
        let extractor = GenericExtractor::new(Arc::new(MockInterpreter::failing("rate limited")));
        let target = ScrapeTarget::from_url(URL);
        let cancel = CancellationToken::new();

        let err = extractor
            .extract(
                &request(&target, ScrapeMode::Onboard, ScrapeAction::Init, &cancel),
                &fetcher,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractError::Interpret(msg) if msg.contains("rate limited")));
    }

    #[tokio::test]
    async fn fetch_failure_aborts_extraction() {
        let fetcher = MockFetcher::new();
        let extractor = GenericExtractor::new(Arc::new(MockInterpreter::new("[]")));
        let target = ScrapeTarget::from_url(URL);
        let cancel = CancellationToken::new();

        let err = extractor
            .extract(
                &request(&target, ScrapeMode::Onboard, ScrapeAction::Init, &cancel),
                &fetcher,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractError::Fetch(_)));
        assert_eq!(fetcher.attempts(URL), 1);
    }
}
