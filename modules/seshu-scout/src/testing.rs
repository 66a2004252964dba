// Test mocks for the extraction pipeline.
//
// One mock per trait boundary:
// - MockFetcher (PageFetcher): URL -> scripted responses, counts attempts
// - MockInterpreter (EventInterpreter): canned reply, records prompts
// - FixedTimezones (TimezoneResolver): one zone for every usable coordinate
// - RecordingSink (ConfirmedEventSink): keeps everything published
//
// Stores and the queue have in-memory implementations of their own.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use seshu_common::CandidateEvent;

use crate::extractors::EventInterpreter;
use crate::fetch::{FetchError, PageFetcher, RenderOptions};
use crate::pipeline::ConfirmedEventSink;
use crate::timezone::{coordinates_usable, TimezoneResolver};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Scripted fetcher. Returns a transport error for unregistered URLs.
///
/// A URL registered with several responses serves them in order and then
/// keeps repeating the last one.
#[derive(Default)]
pub struct MockFetcher {
    responses: HashMap<String, Vec<Result<String, FetchError>>>,
    attempts: Mutex<HashMap<String, usize>>,
    last_options: Mutex<HashMap<String, RenderOptions>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_page(mut self, url: &str, html: &str) -> Self {
        self.responses
            .insert(url.to_string(), vec![Ok(html.to_string())]);
        self
    }

    pub fn on_pages(mut self, url: &str, pages: Vec<&str>) -> Self {
        self.responses.insert(
            url.to_string(),
            pages.into_iter().map(|p| Ok(p.to_string())).collect(),
        );
        self
    }

    pub fn on_error(mut self, url: &str, error: FetchError) -> Self {
        self.responses.insert(url.to_string(), vec![Err(error)]);
        self
    }

    /// How many times `url` was fetched.
    pub fn attempts(&self, url: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn last_options(&self, url: &str) -> Option<RenderOptions> {
        self.last_options.lock().unwrap().get(url).cloned()
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str, options: &RenderOptions) -> Result<String, FetchError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.last_options
            .lock()
            .unwrap()
            .insert(url.to_string(), options.clone());

        let Some(responses) = self.responses.get(url).filter(|r| !r.is_empty()) else {
            return Err(FetchError::Transport {
                url: url.to_string(),
                message: "MockFetcher: no page registered".to_string(),
            });
        };
        responses[(attempt - 1).min(responses.len() - 1)].clone()
    }
}

// ---------------------------------------------------------------------------
// MockInterpreter
// ---------------------------------------------------------------------------

pub struct MockInterpreter {
    reply: Result<String, String>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockInterpreter {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(instructions, page_lines_json)` for every call so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventInterpreter for MockInterpreter {
    async fn interpret(&self, instructions: &str, page_lines_json: &str) -> anyhow::Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((instructions.to_string(), page_lines_json.to_string()));
        self.reply.clone().map_err(|msg| anyhow::anyhow!(msg))
    }
}

// ---------------------------------------------------------------------------
// FixedTimezones
// ---------------------------------------------------------------------------

/// Resolves every usable coordinate to the same zone. The default resolves
/// nothing.
#[derive(Default)]
pub struct FixedTimezones {
    zone: String,
}

impl FixedTimezones {
    pub fn new(zone: &str) -> Self {
        Self {
            zone: zone.to_string(),
        }
    }
}

impl TimezoneResolver for FixedTimezones {
    fn timezone_for(&self, lat: f64, lon: f64) -> String {
        if coordinates_usable(lat, lon) {
            self.zone.clone()
        } else {
            String::new()
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<(String, Vec<CandidateEvent>)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(source_url, events)` per publish call.
    pub fn batches(&self) -> Vec<(String, Vec<CandidateEvent>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<CandidateEvent> {
        self.batches()
            .into_iter()
            .flat_map(|(_, events)| events)
            .collect()
    }
}

#[async_trait]
impl ConfirmedEventSink for RecordingSink {
    async fn publish(&self, source_url: &str, events: &[CandidateEvent]) -> seshu_common::error::Result<()> {
        self.batches
            .lock()
            .unwrap()
            .push((source_url.to_string(), events.to_vec()));
        Ok(())
    }
}
