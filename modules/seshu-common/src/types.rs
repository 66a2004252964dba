use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SeshuError;

// --- Geo ---

/// A fixed location shared by every event on a source page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: String,
}

// --- Enums ---

/// Whether an extraction is a recurring scrape of a committed source or the
/// first look at a page during onboarding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScrapeMode {
    #[default]
    Scrape,
    Onboard,
}

/// Onboarding action: `init` reads a listing page, `rs` (recursive) reads a
/// single event detail page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScrapeAction {
    #[default]
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "rs")]
    Recursive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Draft,
    Committed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    #[default]
    Healthy,
    Unhealthy,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = SeshuError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(SeshuError::Parse(format!(
                        "unknown {} value: {other}",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

text_enum!(ScrapeMode { Scrape => "SCRAPE", Onboard => "ONBOARD" });
text_enum!(ScrapeAction { Init => "init", Recursive => "rs" });
text_enum!(SessionStatus { Draft => "draft", Committed => "committed" });
text_enum!(JobStatus { Healthy => "HEALTHY", Unhealthy => "UNHEALTHY" });

// --- Candidate events ---

/// One unconfirmed event proposal produced by extraction.
///
/// Wire names match the JSON the text-understanding service is asked to
/// produce, so model output decodes directly into this type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    #[serde(rename = "event_title", default, deserialize_with = "nullable_string")]
    pub title: String,
    #[serde(rename = "event_location", default, deserialize_with = "nullable_string")]
    pub location: String,
    #[serde(rename = "event_start_datetime", default, deserialize_with = "nullable_string")]
    pub start_time: String,
    #[serde(rename = "event_end_datetime", default, deserialize_with = "nullable_string")]
    pub end_time: String,
    #[serde(rename = "event_timezone", default, deserialize_with = "nullable_string")]
    pub timezone: String,
    #[serde(rename = "event_url", default, deserialize_with = "nullable_string")]
    pub url: String,
    #[serde(rename = "event_description", default, deserialize_with = "nullable_string")]
    pub description: String,
    #[serde(rename = "event_host_name", default, deserialize_with = "nullable_string")]
    pub host_name: String,
    #[serde(rename = "event_latitude", default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(rename = "event_longitude", default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub known_scrape_source: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub source_url: String,
    /// Set when the listing page lacked detail that the event's own page may carry.
    #[serde(default)]
    pub needs_child_fetch: bool,
}

impl CandidateEvent {
    /// Detail fields that a follow-up fetch of the event page can fill.
    pub fn is_missing_detail(&self) -> bool {
        self.description.is_empty() || self.location.is_empty() || self.timezone.is_empty()
    }

    /// Coordinates usable for timezone lookup: both present and neither zero.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0 => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn apply_location(&mut self, location: &GeoLocation) {
        self.latitude = Some(location.latitude);
        self.longitude = Some(location.longitude);
        if !location.address.is_empty() {
            self.location = location.address.clone();
        }
    }
}

/// Drop candidates that cannot become confirmed events and default an empty
/// description to the title.
pub fn filter_valid_events(events: Vec<CandidateEvent>) -> Vec<CandidateEvent> {
    events
        .into_iter()
        .filter(|e| {
            !e.title.is_empty()
                && !e.url.is_empty()
                && !e.location.is_empty()
                && !e.start_time.is_empty()
        })
        .map(|mut e| {
            if e.description.is_empty() {
                e.description = e.title.clone();
            }
            e
        })
        .collect()
}

/// Reviewer verdicts for one candidate, paired with it by array position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValidation {
    #[serde(rename = "event_title", default)]
    pub title: bool,
    #[serde(rename = "event_location", default)]
    pub location: bool,
    #[serde(rename = "event_start_datetime", default)]
    pub start_time: bool,
    #[serde(rename = "event_end_datetime", default)]
    pub end_time: bool,
    #[serde(rename = "event_url", default)]
    pub url: bool,
    #[serde(rename = "event_description", default)]
    pub description: bool,
}

impl FieldValidation {
    /// The reviewer confirmed every field a published event requires.
    pub fn confirms_required(&self) -> bool {
        self.title && self.location && self.start_time
    }
}

// --- Sessions ---

/// A draft extraction attempt, keyed by source URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeshuSession {
    pub owner_id: String,
    pub url: String,
    pub url_domain: String,
    pub url_path: String,
    pub url_query_params: BTreeMap<String, Vec<String>>,
    pub location: Option<GeoLocation>,
    pub html: String,
    pub child_id: Option<String>,
    pub event_candidates: Vec<CandidateEvent>,
    pub event_validations: Vec<FieldValidation>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

impl SeshuSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }
}

/// Insert payload for a new draft. Arrays default to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewSession {
    pub owner_id: String,
    pub url: String,
    pub location: Option<GeoLocation>,
    pub html: String,
    pub child_id: Option<String>,
    pub event_candidates: Vec<CandidateEvent>,
    pub event_validations: Vec<FieldValidation>,
}

/// Sparse patch for a session. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionUpdate {
    pub owner_id: Option<String>,
    pub url_domain: Option<String>,
    pub url_path: Option<String>,
    pub url_query_params: Option<BTreeMap<String, Vec<String>>>,
    pub location: Option<GeoLocation>,
    pub html: Option<String>,
    pub child_id: Option<String>,
    pub event_candidates: Option<Vec<CandidateEvent>>,
    pub event_validations: Option<Vec<FieldValidation>>,
    pub status: Option<SessionStatus>,
}

impl SessionUpdate {
    /// Apply the present fields onto `session`.
    pub fn apply_to(&self, session: &mut SeshuSession) {
        if let Some(v) = &self.owner_id {
            session.owner_id = v.clone();
        }
        if let Some(v) = &self.url_domain {
            session.url_domain = v.clone();
        }
        if let Some(v) = &self.url_path {
            session.url_path = v.clone();
        }
        if let Some(v) = &self.url_query_params {
            session.url_query_params = v.clone();
        }
        if let Some(v) = &self.location {
            session.location = Some(v.clone());
        }
        if let Some(v) = &self.html {
            session.html = v.clone();
        }
        if let Some(v) = &self.child_id {
            session.child_id = Some(v.clone());
        }
        if let Some(v) = &self.event_candidates {
            session.event_candidates = v.clone();
        }
        if let Some(v) = &self.event_validations {
            session.event_validations = v.clone();
        }
        if let Some(v) = self.status {
            session.status = v;
        }
    }
}

// --- Scheduled jobs ---

/// CSS selectors recorded at onboarding for each event field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSelectors {
    pub name: String,
    pub location: String,
    pub start_time: String,
    pub end_time: String,
    pub description: String,
    pub href: String,
    pub child_name: String,
    pub child_location: String,
    pub child_start_time: String,
    pub child_end_time: String,
    pub child_description: String,
}

/// A confirmed source re-scraped once a day in its hour bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeshuJob {
    pub normalized_url_key: String,
    pub location: Option<GeoLocation>,
    #[serde(default)]
    pub location_timezone: String,
    pub scheduled_hour: i32,
    #[serde(default)]
    pub targets: TargetSelectors,
    #[serde(default)]
    pub is_recursive: bool,
    #[serde(default)]
    pub status: JobStatus,
    pub last_scrape_success: Option<DateTime<Utc>>,
    pub last_scrape_failure: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_scrape_failure_count: i32,
    pub owner_id: String,
    #[serde(default)]
    pub known_scrape_source: String,
}

impl SeshuJob {
    pub fn validate(&self) -> Result<(), SeshuError> {
        if self.normalized_url_key.is_empty() {
            return Err(SeshuError::Validation("job URL is empty".into()));
        }
        if self.owner_id.is_empty() {
            return Err(SeshuError::Validation("job owner is empty".into()));
        }
        if !(0..24).contains(&self.scheduled_hour) {
            return Err(SeshuError::Validation(format!(
                "scheduled hour {} is outside 0-23",
                self.scheduled_hour
            )));
        }
        Ok(())
    }
}

/// Sparse patch for a job. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobUpdate {
    pub location: Option<GeoLocation>,
    pub location_timezone: Option<String>,
    pub scheduled_hour: Option<i32>,
    pub targets: Option<TargetSelectors>,
    pub is_recursive: Option<bool>,
    pub status: Option<JobStatus>,
    pub owner_id: Option<String>,
    pub known_scrape_source: Option<String>,
}

impl JobUpdate {
    pub fn apply_to(&self, job: &mut SeshuJob) {
        if let Some(v) = &self.location {
            job.location = Some(v.clone());
        }
        if let Some(v) = &self.location_timezone {
            job.location_timezone = v.clone();
        }
        if let Some(v) = self.scheduled_hour {
            job.scheduled_hour = v;
        }
        if let Some(v) = &self.targets {
            job.targets = v.clone();
        }
        if let Some(v) = self.is_recursive {
            job.is_recursive = v;
        }
        if let Some(v) = self.status {
            job.status = v;
        }
        if let Some(v) = &self.owner_id {
            job.owner_id = v.clone();
        }
        if let Some(v) = &self.known_scrape_source {
            job.known_scrape_source = v.clone();
        }
    }
}

/// What an extractor needs to know about the page it is reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeTarget {
    pub url: String,
    pub location: Option<GeoLocation>,
    pub timezone: Option<String>,
}

impl ScrapeTarget {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl From<&SeshuJob> for ScrapeTarget {
    fn from(job: &SeshuJob) -> Self {
        Self {
            url: job.normalized_url_key.clone(),
            location: job.location.clone(),
            timezone: Some(job.location_timezone.clone()).filter(|tz| !tz.is_empty()),
        }
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(title: &str, url: &str, location: &str, start: &str) -> CandidateEvent {
        CandidateEvent {
            title: title.into(),
            url: url.into(),
            location: location.into(),
            start_time: start.into(),
            ..Default::default()
        }
    }

    #[test]
    fn candidate_decodes_model_output_with_nulls() {
        let json = r#"[{"event_title":"Jazz Night","event_location":null,"event_start_datetime":"July 25, 2024 7pm","event_url":"https://example.com/jazz"}]"#;
        let events: Vec<CandidateEvent> = serde_json::from_str(json).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Jazz Night");
        assert_eq!(events[0].location, "");
        assert_eq!(events[0].latitude, None);
    }

    #[test]
    fn filter_drops_incomplete_and_defaults_description() {
        let events = vec![
            event("Jazz Night", "https://e.com/1", "The Dakota", "2024-07-25T19:00:00Z"),
            event("", "https://e.com/2", "Somewhere", "2024-07-25T19:00:00Z"),
            event("No Place", "https://e.com/3", "", "2024-07-25T19:00:00Z"),
            event("No Time", "https://e.com/4", "Somewhere", ""),
        ];

        let valid = filter_valid_events(events);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].description, "Jazz Night");
    }

    #[test]
    fn zero_coordinates_are_not_usable() {
        let mut e = CandidateEvent::default();
        assert_eq!(e.coordinates(), None);
        e.latitude = Some(0.0);
        e.longitude = Some(-93.1);
        assert_eq!(e.coordinates(), None);
        e.latitude = Some(44.95);
        assert_eq!(e.coordinates(), Some((44.95, -93.1)));
    }

    #[test]
    fn session_update_only_touches_present_fields() {
        let now = Utc::now();
        let mut session = SeshuSession {
            owner_id: "owner-1".into(),
            url: "https://example.com/events".into(),
            url_domain: "example.com".into(),
            url_path: "/events".into(),
            url_query_params: BTreeMap::new(),
            location: None,
            html: "<html></html>".into(),
            child_id: None,
            event_candidates: vec![],
            event_validations: vec![],
            status: SessionStatus::Draft,
            created_at: now,
            updated_at: now,
            expire_at: now,
        };
        let before = session.clone();

        let patch = SessionUpdate {
            html: Some("<html>new</html>".into()),
            ..Default::default()
        };
        patch.apply_to(&mut session);
        patch.apply_to(&mut session);

        assert_eq!(session.html, "<html>new</html>");
        assert_eq!(session.owner_id, before.owner_id);
        assert_eq!(session.url_domain, before.url_domain);
        assert_eq!(session.status, before.status);
        assert_eq!(session.location, None);
    }

    #[test]
    fn text_enums_round_trip_through_strings() {
        assert_eq!("ONBOARD".parse::<ScrapeMode>().unwrap(), ScrapeMode::Onboard);
        assert_eq!(ScrapeAction::Recursive.as_str(), "rs");
        assert_eq!(JobStatus::Unhealthy.to_string(), "UNHEALTHY");
        assert!("archived".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn job_hour_must_be_in_range() {
        let job = SeshuJob {
            normalized_url_key: "https://example.com/events".into(),
            location: None,
            location_timezone: String::new(),
            scheduled_hour: 24,
            targets: TargetSelectors::default(),
            is_recursive: false,
            status: JobStatus::Healthy,
            last_scrape_success: None,
            last_scrape_failure: None,
            last_scrape_failure_count: 0,
            owner_id: "owner-1".into(),
            known_scrape_source: String::new(),
        };
        assert!(matches!(job.validate(), Err(SeshuError::Validation(_))));
    }
}
