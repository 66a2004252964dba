//! Facebook event pages.
//!
//! Facebook ships event data as JSON inside `<script data-sjs>` tags once the
//! page has rendered. We wait for those scripts, decode every one that mentions
//! an `Event` object, and walk the JSON for event-shaped objects.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{Html, Selector};
use seshu_common::{CandidateEvent, ScrapeAction, ScrapeMode};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventExtractor, ExtractError, ExtractRequest, Extraction};
use crate::fetch::{fetch_with_retry, FetchError, PageFetcher, RenderOptions, RetryPolicy};
use crate::fuzzytime;
use crate::timezone::TimezoneResolver;

pub const SOURCE_NAME: &str = "facebook";

const EVENT_MARKER: &str = r#""__typename":"Event""#;
const WAIT_FOR: &str = "script[data-sjs][data-content-len]";
const WAIT_MS: u32 = 7500;
const FETCH_ATTEMPTS: u32 = 7;
const CHILD_CONCURRENCY: usize = 4;

/// Abbreviations that may trail Facebook's date sentence, with the zone each
/// most commonly means.
const TZ_ABBREVIATIONS: &[(&str, &str)] = &[
    ("CDT", "America/Chicago"),
    ("CST", "America/Chicago"),
    ("EDT", "America/New_York"),
    ("EST", "America/New_York"),
    ("PDT", "America/Los_Angeles"),
    ("PST", "America/Los_Angeles"),
    ("MDT", "America/Denver"),
    ("MST", "America/Denver"),
    ("AKDT", "America/Anchorage"),
    ("AKST", "America/Anchorage"),
    ("HDT", "America/Adak"),
    ("HST", "Pacific/Honolulu"),
    ("ADT", "America/Halifax"),
    ("AST", "America/Halifax"),
    ("NDT", "America/St_Johns"),
    ("NST", "America/St_Johns"),
    ("CET", "Europe/Paris"),
    ("CEST", "Europe/Paris"),
    ("EET", "Europe/Athens"),
    ("EEST", "Europe/Athens"),
    ("WET", "Europe/Lisbon"),
    ("WEST", "Europe/Lisbon"),
    ("GMT", "Europe/London"),
    ("BST", "Europe/London"),
    ("IST", "Asia/Kolkata"),
    ("MSK", "Europe/Moscow"),
    ("JST", "Asia/Tokyo"),
    ("KST", "Asia/Seoul"),
    ("HKT", "Asia/Hong_Kong"),
    ("PKT", "Asia/Karachi"),
    ("NPT", "Asia/Kathmandu"),
    ("ICT", "Asia/Bangkok"),
    ("AEST", "Australia/Sydney"),
    ("AEDT", "Australia/Sydney"),
    ("NZST", "Pacific/Auckland"),
    ("NZDT", "Pacific/Auckland"),
];

static RE_EVENTS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"facebook\.com/[^/]+/events|facebook\.com/people/(.*)sk=events").unwrap()
});
static RE_AND_MORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\band\s+\d+\s+more\b.*$").unwrap());
static RE_TZ_ABBREVIATION: LazyLock<Regex> = LazyLock::new(|| {
    let names: Vec<&str> = TZ_ABBREVIATIONS.iter().map(|(abbr, _)| *abbr).collect();
    Regex::new(&format!(r"\b({})\b", names.join("|"))).unwrap()
});
static SCRIPT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("script").unwrap());

pub struct FacebookExtractor {
    timezones: Arc<dyn TimezoneResolver>,
    policy: RetryPolicy,
}

impl FacebookExtractor {
    pub fn new(timezones: Arc<dyn TimezoneResolver>) -> Self {
        Self {
            timezones,
            policy: RetryPolicy::attempts(FETCH_ATTEMPTS),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn fetch_page(
        &self,
        url: &str,
        fetcher: &dyn PageFetcher,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let options = RenderOptions {
            wait_ms: WAIT_MS,
            render_js: true,
            wait_for: Some(WAIT_FOR.to_string()),
        };
        fetch_with_retry(
            fetcher,
            url,
            &options,
            &self.policy,
            |html| html.contains(EVENT_MARKER),
            cancel,
        )
        .await
    }

    /// Fetch each incomplete event's own page and fill only the fields that
    /// are still empty. A failed child fetch leaves its event as it was.
    async fn resolve_children(
        &self,
        events: &mut [CandidateEvent],
        fetcher: &dyn PageFetcher,
        cancel: &CancellationToken,
    ) -> Result<(), ExtractError> {
        let pending: Vec<(usize, String)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.needs_child_fetch && !e.url.is_empty())
            .map(|(i, e)| (i, e.url.clone()))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "Resolving event detail pages");

        let results: Vec<(usize, String, Result<String, FetchError>)> = stream::iter(pending)
            .map(|(i, url)| async move {
                let result = self.fetch_page(&url, fetcher, cancel).await;
                (i, url, result)
            })
            .buffer_unordered(CHILD_CONCURRENCY)
            .collect()
            .await;

        for (i, url, result) in results {
            let html = match result {
                Ok(html) => html,
                Err(FetchError::Cancelled { .. }) => return Err(ExtractError::Cancelled),
                Err(e) => {
                    warn!(url = %url, error = %e, "Skipping event detail page");
                    continue;
                }
            };
            match parse_single_event(&html) {
                Some(child) => self.backfill(&mut events[i], child, url),
                None => warn!(url = %url, "Event detail page had no event data"),
            }
        }
        Ok(())
    }

    fn backfill(&self, event: &mut CandidateEvent, child: CandidateEvent, child_url: String) {
        if event.description.is_empty() {
            event.description = child.description;
        }
        if event.location.is_empty() {
            event.location = child.location;
        }
        if event.latitude.is_none() {
            event.latitude = child.latitude;
        }
        if event.longitude.is_none() {
            event.longitude = child.longitude;
        }
        if event.timezone.is_empty() {
            if let Some((lat, lon)) = event.coordinates() {
                event.timezone = self.timezones.timezone_for(lat, lon);
            }
            if event.timezone.is_empty() {
                event.timezone = child.timezone;
            }
        }
        if event.source_url.is_empty() {
            event.source_url = child_url;
        }
        event.needs_child_fetch = event.is_missing_detail();
    }
}

#[async_trait]
impl EventExtractor for FacebookExtractor {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn can_handle(&self, url: &str) -> bool {
        RE_EVENTS_URL.is_match(url)
    }

    async fn extract(
        &self,
        req: &ExtractRequest<'_>,
        fetcher: &dyn PageFetcher,
    ) -> Result<Extraction, ExtractError> {
        let url = req.target.url.as_str();
        let html = self.fetch_page(url, fetcher, req.cancel).await?;

        let mut events = match req.action {
            ScrapeAction::Recursive => parse_single_event(&html).into_iter().collect(),
            ScrapeAction::Init => parse_event_list(&html),
        };
        for event in &mut events {
            event.known_scrape_source = SOURCE_NAME.to_string();
            event.source_url = url.to_string();
        }
        debug!(url, count = events.len(), mode = %req.mode, "Parsed Facebook events");

        if req.mode == ScrapeMode::Scrape {
            for event in &mut events {
                if let Some(location) = &req.target.location {
                    event.apply_location(location);
                }
                if let Some(tz) = &req.target.timezone {
                    if event.timezone.is_empty() {
                        event.timezone = tz.clone();
                    }
                }
                event.needs_child_fetch = event.is_missing_detail();
            }
            self.resolve_children(&mut events, fetcher, req.cancel).await?;
        }

        Ok(Extraction { events, html })
    }
}

// --- Parsing ---

/// Every distinct event on a listing page, in document order.
pub fn parse_event_list(html: &str) -> Vec<CandidateEvent> {
    let mut seen = HashSet::new();
    let mut events = Vec::new();
    for payload in event_payloads(html) {
        collect_events(&payload, &mut seen, &mut events);
    }
    events
}

/// The featured event of a detail page, falling back to the first event found.
pub fn parse_single_event(html: &str) -> Option<CandidateEvent> {
    let payloads = event_payloads(html);
    payloads
        .iter()
        .find_map(find_featured_event)
        .or_else(|| {
            let mut seen = HashSet::new();
            let mut events = Vec::new();
            for payload in &payloads {
                collect_events(payload, &mut seen, &mut events);
            }
            events.into_iter().next()
        })
}

fn event_payloads(html: &str) -> Vec<Value> {
    if !html.contains(EVENT_MARKER) {
        return Vec::new();
    }
    let document = Html::parse_document(html);
    document
        .select(&SCRIPT)
        .filter_map(|script| {
            let text: String = script.text().collect();
            if !text.contains(EVENT_MARKER) {
                return None;
            }
            match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable event script");
                    None
                }
            }
        })
        .collect()
}

fn is_event(obj: &Map<String, Value>) -> bool {
    obj.get("__typename").and_then(Value::as_str) == Some("Event")
}

fn collect_events(value: &Value, seen: &mut HashSet<String>, out: &mut Vec<CandidateEvent>) {
    match value {
        Value::Object(obj) => {
            if is_event(obj) {
                if let Some(event) = event_from_object(obj) {
                    if seen.insert(event.url.clone()) {
                        out.push(event);
                    }
                    return;
                }
            }
            for child in obj.values() {
                collect_events(child, seen, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_events(item, seen, out);
            }
        }
        _ => {}
    }
}

/// An event hung under `data.event`, at any depth.
fn find_featured_event(value: &Value) -> Option<CandidateEvent> {
    match value {
        Value::Object(obj) => obj
            .get("data")
            .and_then(|data| data.get("event"))
            .and_then(Value::as_object)
            .filter(|event| is_event(event))
            .and_then(event_from_object)
            .or_else(|| obj.values().find_map(find_featured_event)),
        Value::Array(items) => items.iter().find_map(find_featured_event),
        _ => None,
    }
}

fn event_from_object(obj: &Map<String, Value>) -> Option<CandidateEvent> {
    let title = text_at(obj, &["name"])?;
    let url = text_at(obj, &["url"])?;

    let (start_time, timezone) = match text_at(obj, &["day_time_sentence"]) {
        Some(sentence) => clean_date_text(&sentence),
        None => {
            let ts = obj.get("start_timestamp").and_then(Value::as_i64)?;
            let start = Utc.timestamp_opt(ts, 0).single()?;
            (start.format("%Y-%m-%dT%H:%M:%SZ").to_string(), String::new())
        }
    };
    if fuzzytime::normalize(&start_time).is_err() {
        debug!(url = %url, start_time = %start_time, "Dropping event with unreadable date");
        return None;
    }

    let location = [
        &["contextual_name"][..],
        &["location"],
        &["place", "name"],
        &["venue", "name"],
        &["event_place", "contextual_name"],
        &["location", "name"],
    ]
    .iter()
    .find_map(|path| text_at(obj, path))
    .unwrap_or_default();

    let description = [
        &["description"][..],
        &["description", "text"],
        &["event_description", "text"],
    ]
    .iter()
    .find_map(|path| text_at(obj, path))
    .unwrap_or_default();

    let (latitude, longitude) = [
        &["place"][..],
        &["place", "location"],
        &["venue"],
        &["location"],
    ]
    .iter()
    .find_map(|prefix| coordinates_at(obj, prefix))
    .map_or((None, None), |(lat, lon)| (Some(lat), Some(lon)));

    Some(CandidateEvent {
        title,
        url,
        start_time,
        timezone,
        location,
        description,
        host_name: text_at(obj, &["event_creator", "name"]).unwrap_or_default(),
        latitude,
        longitude,
        ..Default::default()
    })
}

fn object_at<'a>(obj: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Map<String, Value>> {
    path.iter()
        .try_fold(obj, |cur, key| cur.get(*key).and_then(Value::as_object))
}

fn text_at(obj: &Map<String, Value>, path: &[&str]) -> Option<String> {
    let (last, parents) = path.split_last()?;
    let text = clean_text(object_at(obj, parents)?.get(*last)?.as_str()?);
    (!text.is_empty()).then_some(text)
}

fn coordinates_at(obj: &Map<String, Value>, prefix: &[&str]) -> Option<(f64, f64)> {
    let parent = object_at(obj, prefix)?;
    let lat = parent.get("latitude").and_then(Value::as_f64)?;
    let lon = parent.get("longitude").and_then(Value::as_f64)?;
    (lat != 0.0 || lon != 0.0).then_some((lat, lon))
}

fn clean_text(text: &str) -> String {
    text.replace(['\u{202F}', '\u{00A0}'], " ").trim().to_string()
}

/// Drop a trailing "and N more" clause and anything after a timezone
/// abbreviation. Returns the date text and the IANA zone the abbreviation
/// names, if any.
fn clean_date_text(text: &str) -> (String, String) {
    let text = RE_AND_MORE.replace(text, "");
    match RE_TZ_ABBREVIATION.find(&text) {
        Some(m) => {
            let zone = TZ_ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == m.as_str())
                .map(|(_, zone)| zone.to_string())
                .unwrap_or_default();
            (text[..m.end()].trim().to_string(), zone)
        }
        None => (text.trim().to_string(), String::new()),
    }
}
