//! Onboarding, promotion, and re-scraping, wired over the stores and queue.
//!
//! ```text
//! onboard:        extract (ONBOARD) -> normalize dates -> draft session
//! commit_session: draft -> scheduled job + confirmed events -> session deleted
//! process_next:   queue head -> extract (SCRAPE) -> confirmed events -> job health
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seshu_common::error::Result;
use seshu_common::{
    filter_valid_events, CandidateEvent, GeoLocation, JobStatus, NewSession, ScrapeAction,
    ScrapeMode, ScrapeTarget, SeshuError, SeshuJob, SeshuSession, SessionStatus, SessionUpdate,
    TargetSelectors,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::extractors::{ExtractRequest, ExtractorRegistry};
use crate::fetch::PageFetcher;
use crate::fuzzytime;
use crate::queue::WorkQueue;
use crate::store::{JobStore, SessionStore};
use crate::timezone::TimezoneResolver;

/// Receives human-confirmed or re-scraped events. The store behind it owns
/// its own schema.
#[async_trait]
pub trait ConfirmedEventSink: Send + Sync {
    async fn publish(&self, source_url: &str, events: &[CandidateEvent]) -> Result<()>;
}

/// Writes confirmed events to the log. Used when no event store is attached.
pub struct TracingSink;

#[async_trait]
impl ConfirmedEventSink for TracingSink {
    async fn publish(&self, source_url: &str, events: &[CandidateEvent]) -> Result<()> {
        for event in events {
            info!(
                source_url,
                title = %event.title,
                start = %event.start_time,
                location = %event.location,
                url = %event.url,
                "Confirmed event"
            );
        }
        Ok(())
    }
}

/// Scheduling choices made by the reviewer when promoting a draft.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSpec {
    pub scheduled_hour: i32,
    pub targets: TargetSelectors,
    pub is_recursive: bool,
    /// Overrides the draft's shared location when set.
    pub location: Option<GeoLocation>,
}

/// What one `process_next` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// Queue was empty.
    Idle,
    /// Head was not a job, or its job no longer exists; it was dropped.
    Discarded,
    Scraped { url: String, published: usize },
    Failed { url: String, error: String },
}

#[derive(Clone, TypedBuilder)]
pub struct Seshu {
    pub registry: Arc<ExtractorRegistry>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub sessions: Arc<dyn SessionStore>,
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub sink: Arc<dyn ConfirmedEventSink>,
    pub timezones: Arc<dyn TimezoneResolver>,
}

impl Seshu {
    /// Extract candidates from `url` and store them as a draft for review.
    ///
    /// A candidate whose date text cannot be normalized keeps the raw text so
    /// the reviewer can correct it.
    pub async fn onboard(
        &self,
        owner_id: &str,
        url: &str,
        action: ScrapeAction,
        location: Option<GeoLocation>,
        cancel: &CancellationToken,
    ) -> Result<SeshuSession> {
        let target = ScrapeTarget {
            url: url.to_string(),
            timezone: location.as_ref().and_then(|l| self.zone_for(l)),
            location: location.clone(),
        };
        let extractor = self.registry.select(url);
        info!(url, extractor = extractor.name(), action = action.as_str(), "Onboarding source");

        let request = ExtractRequest {
            target: &target,
            mode: ScrapeMode::Onboard,
            action,
            cancel,
        };
        let extraction = extractor.extract(&request, self.fetcher.as_ref()).await?;

        let now = Utc::now();
        let mut events = extraction.events;
        for event in &mut events {
            if !normalize_times(event, now) {
                warn!(url, title = %event.title, start = %event.start_time, "Leaving unparsed start time for review");
            }
        }

        let new = NewSession {
            owner_id: owner_id.to_string(),
            url: url.to_string(),
            location,
            html: extraction.html,
            child_id: None,
            event_candidates: events,
            event_validations: Vec::new(),
        };
        let session = guarded(cancel, self.sessions.insert(new, now)).await?;
        info!(url, candidates = session.event_candidates.len(), "Draft session stored");
        Ok(session)
    }

    /// Promote a reviewed draft into a scheduled job.
    ///
    /// Candidates whose required fields were all confirmed go to the sink.
    /// The draft is deleted once the job exists.
    pub async fn commit_session(
        &self,
        url: &str,
        spec: JobSpec,
        cancel: &CancellationToken,
    ) -> Result<SeshuJob> {
        let now = Utc::now();
        let session = guarded(cancel, self.sessions.get(url, now))
            .await?
            .ok_or_else(|| SeshuError::Validation(format!("no draft session for {url}")))?;
        if session.status != SessionStatus::Draft {
            return Err(SeshuError::Validation(format!("session for {url} is already committed")));
        }
        if session.event_validations.len() != session.event_candidates.len() {
            return Err(SeshuError::Validation(format!(
                "{} validations for {} candidates",
                session.event_validations.len(),
                session.event_candidates.len()
            )));
        }

        let location = spec.location.or_else(|| session.location.clone());
        let job = SeshuJob {
            normalized_url_key: session.url.clone(),
            location_timezone: location
                .as_ref()
                .and_then(|l| self.zone_for(l))
                .unwrap_or_default(),
            location,
            scheduled_hour: spec.scheduled_hour,
            targets: spec.targets,
            is_recursive: spec.is_recursive,
            status: JobStatus::Healthy,
            last_scrape_success: None,
            last_scrape_failure: None,
            last_scrape_failure_count: 0,
            owner_id: session.owner_id.clone(),
            known_scrape_source: self.registry.select(&session.url).name().to_string(),
        };
        job.validate()?;

        let key = seshu_common::urls::normalize_url_key(&job.normalized_url_key)?;
        if let Some(existing) = guarded(cancel, self.jobs.get(&key)).await? {
            if existing.owner_id != session.owner_id {
                return Err(SeshuError::OwnershipConflict { url: key });
            }
        }
        let job = guarded(cancel, self.jobs.create(job)).await?;

        let committed = SessionUpdate {
            status: Some(SessionStatus::Committed),
            ..Default::default()
        };
        guarded(cancel, self.sessions.update(url, &committed, now)).await?;

        let confirmed: Vec<CandidateEvent> = session
            .event_candidates
            .into_iter()
            .zip(&session.event_validations)
            .filter(|(_, v)| v.confirms_required())
            .map(|(e, _)| e)
            .collect();
        let confirmed = filter_valid_events(confirmed);
        if !confirmed.is_empty() {
            guarded(cancel, self.sink.publish(url, &confirmed)).await?;
        }

        guarded(cancel, self.sessions.delete(url)).await?;
        info!(
            url = %job.normalized_url_key,
            hour = job.scheduled_hour,
            confirmed = confirmed.len(),
            "Session committed"
        );
        Ok(job)
    }

    /// Re-scrape the job at the head of the queue.
    ///
    /// The head is consumed whether the scrape succeeds or fails; the next
    /// gather re-publishes the job. An entry whose job was deleted after it
    /// was queued is dropped unscraped. Cancellation leaves the head in place.
    pub async fn process_next(&self, cancel: &CancellationToken) -> Result<WorkOutcome> {
        let Some(payload) = guarded(cancel, self.queue.peek_top()).await? else {
            return Ok(WorkOutcome::Idle);
        };
        let queued: SeshuJob = match serde_json::from_value(payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Dropping queue entry that is not a job");
                guarded(cancel, self.queue.consume()).await?;
                return Ok(WorkOutcome::Discarded);
            }
        };
        let Some(job) = guarded(cancel, self.jobs.get(&queued.normalized_url_key)).await? else {
            warn!(url = %queued.normalized_url_key, "Dropping queue entry for a deleted job");
            guarded(cancel, self.queue.consume()).await?;
            return Ok(WorkOutcome::Discarded);
        };
        let url = job.normalized_url_key.clone();

        let outcome = match self.scrape(&job, cancel).await {
            Ok(published) => {
                info!(url = %url, published, "Scrape succeeded");
                let recorded = guarded(cancel, self.jobs.record_success(&url, Utc::now())).await;
                note_health(&url, recorded)?;
                WorkOutcome::Scraped { url, published }
            }
            Err(SeshuError::Cancelled) => return Err(SeshuError::Cancelled),
            Err(e) => {
                warn!(url = %url, error = %e, "Scrape failed");
                let recorded = guarded(cancel, self.jobs.record_failure(&url, Utc::now())).await;
                note_health(&url, recorded)?;
                WorkOutcome::Failed { url, error: e.to_string() }
            }
        };

        guarded(cancel, self.queue.consume()).await?;
        Ok(outcome)
    }

    async fn scrape(&self, job: &SeshuJob, cancel: &CancellationToken) -> Result<usize> {
        let target = ScrapeTarget::from(job);
        let extractor = self
            .registry
            .select_for(&job.known_scrape_source, &job.normalized_url_key);
        let request = ExtractRequest {
            target: &target,
            mode: ScrapeMode::Scrape,
            action: ScrapeAction::Init,
            cancel,
        };
        let extraction = extractor.extract(&request, self.fetcher.as_ref()).await?;

        let now = Utc::now();
        let events: Vec<CandidateEvent> = extraction
            .events
            .into_iter()
            .filter_map(|mut e| normalize_times(&mut e, now).then_some(e))
            .collect();
        let events = filter_valid_events(events);
        if events.is_empty() {
            return Ok(0);
        }

        guarded(cancel, self.sink.publish(&job.normalized_url_key, &events)).await?;
        Ok(events.len())
    }

    fn zone_for(&self, location: &GeoLocation) -> Option<String> {
        Some(self.timezones.timezone_for(location.latitude, location.longitude))
            .filter(|tz| !tz.is_empty())
    }
}

/// Rewrite start and end text as RFC3339 UTC. Returns false when the start
/// time could not be parsed; an unparseable end time is cleared.
fn normalize_times(event: &mut CandidateEvent, now: DateTime<Utc>) -> bool {
    if !event.end_time.is_empty() {
        event.end_time = fuzzytime::normalize_at(&event.end_time, now).unwrap_or_default();
    }
    match fuzzytime::normalize_at(&event.start_time, now) {
        Ok(start) => {
            event.start_time = start;
            true
        }
        Err(_) => false,
    }
}

/// A health write that fails is logged; only cancellation stops the worker
/// from consuming the head.
fn note_health(url: &str, recorded: Result<()>) -> Result<()> {
    match recorded {
        Ok(()) => Ok(()),
        Err(SeshuError::Cancelled) => Err(SeshuError::Cancelled),
        Err(e) => {
            warn!(url, error = %e, "Job health not recorded");
            Ok(())
        }
    }
}

/// Run a store or queue call, giving up as soon as `cancel` fires.
async fn guarded<T>(cancel: &CancellationToken, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SeshuError::Cancelled),
        r = call => r,
    }
}
