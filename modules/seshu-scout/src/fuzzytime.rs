//! Free-text event date/time normalization.
//!
//! Turns scraped fragments such as "Saturday, July 26, 2025 at 6:30PM – 9:30PM"
//! or "Jul 25 - Jul 26, 2024" into a single RFC3339 UTC timestamp for the
//! start of the event. Timezone abbreviations and numeric offsets in the text
//! are discarded: the wall-clock numbers are taken literally as UTC, and the
//! event's real timezone is resolved from its coordinates elsewhere.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::{Captures, Regex};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("date text is empty")]
    Empty,
    #[error("could not parse date text {0:?}")]
    Unparseable(String),
}

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Range separators in split priority order. Multi-character separators come
/// first so a plain hyphen never fragments " - " or an en dash.
const RANGE_SEPARATORS: [&str; 5] = [" – ", "–", " - ", "-", " | "];
const DATE_RANGE_SEPARATORS: [&str; 3] = [" - ", "–", " | "];

static RE_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2}|2100)\b").unwrap());
static RE_ANY_FOUR_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}\b").unwrap());
static RE_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z]+").unwrap());
static RE_TIME_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i):|\d\s*[ap]\.?m\b").unwrap());
static RE_CONNECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+(?:from|at|@)\s+").unwrap());
static RE_DAY_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)?,\s*").unwrap());
static RE_AND_MORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\band\s+\d+\s+more\b.*$").unwrap());

/// One pass over the cleaned text, leftmost match first.
static RE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)
        (?P<iso_y>\d{4})[-/](?P<iso_m>\d{1,2})[-/](?P<iso_d>\d{1,2})
        | (?P<us_m>\d{1,2})/(?P<us_d>\d{1,2})/(?P<us_y>\d{4})
        | (?P<hour>\d{1,2}):(?P<minute>\d{2})(?::(?P<second>\d{2}))?(?:\.\d+)?\s*(?P<meridiem>[ap]\.?m\b\.?)?
        | \b(?P<h12>\d{1,2})\s*(?P<meridiem12>[ap]\.?m\b\.?)
        | (?P<offset>[+-]\d{2}:?\d{2})
        | \b(?P<num>\d{1,4})(?:st|nd|rd|th)?\b
        | (?P<word>[a-z]+)
        ",
    )
    .unwrap()
});

/// Normalize against the current wall clock.
pub fn normalize(text: &str) -> Result<String, NormalizeError> {
    normalize_at(text, Utc::now())
}

/// Normalize with an explicit "now", used by the next-future-occurrence rule.
///
/// Output has whole-second precision: fractional seconds in the input are
/// truncated, so `15:00:00.500Z` becomes `15:00:00Z`.
pub fn normalize_at(text: &str, now: DateTime<Utc>) -> Result<String, NormalizeError> {
    let text = text.replace(['\u{00A0}', '\u{202F}'], " ");
    let text = text.trim();
    if text.is_empty() {
        return Err(NormalizeError::Empty);
    }

    let (start, range_year) = split_range(text);
    let cleaned = strip_connectives(&start);
    let unparseable = || NormalizeError::Unparseable(text.to_string());

    if let Some(year) = range_year {
        let parts = parse_parts(&abbreviate_months(&cleaned)).ok_or_else(unparseable)?;
        return parts.at_year(year).map(format_utc).ok_or_else(unparseable);
    }

    let parts = parse_parts(&cleaned).ok_or_else(unparseable)?;

    if !RE_ANY_FOUR_DIGITS.is_match(&cleaned) && contains_month(&cleaned) && parts.year.is_none() {
        let now = now.naive_utc();
        let this_year = parts.at_year(now.year());
        let resolved = match this_year {
            Some(dt) if dt >= now => Some(dt),
            _ => parts.at_year(now.year() + 1),
        };
        return resolved.map(format_utc).ok_or_else(unparseable);
    }

    let year = parts.year.ok_or_else(unparseable)?;
    parts.at_year(year).map(format_utc).ok_or_else(unparseable)
}

/// RFC3339 UTC at second precision.
fn format_utc(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// --- Range handling ---

/// Keep the start side of a date or time range and any year named on the end side.
fn split_range(text: &str) -> (String, Option<i32>) {
    if !looks_like_date_range(text) && !looks_like_time_range(text) {
        return (text.to_string(), None);
    }

    for sep in RANGE_SEPARATORS {
        if let Some((left, right)) = text.split_once(sep) {
            let year = RE_YEAR
                .captures(right)
                .and_then(|c| c[1].parse::<i32>().ok());
            return (left.trim().to_string(), year);
        }
    }
    (text.to_string(), None)
}

fn looks_like_date_range(text: &str) -> bool {
    DATE_RANGE_SEPARATORS.iter().any(|sep| {
        text.split_once(sep)
            .is_some_and(|(l, r)| contains_month(l) && contains_month(r))
    })
}

fn looks_like_time_range(text: &str) -> bool {
    RANGE_SEPARATORS.iter().any(|sep| {
        text.split_once(sep)
            .is_some_and(|(l, r)| RE_TIME_MARKER.is_match(l) && RE_TIME_MARKER.is_match(r))
    })
}

// --- Cleanup ---

fn strip_connectives(text: &str) -> String {
    let text = RE_AND_MORE.replace(text, "");
    let text = RE_CONNECTIVE.replace_all(&text, " ");
    let text = RE_DAY_COMMA.replace_all(&text, |c: &Captures| format!("{} ", &c[1]));
    text.trim().to_string()
}

fn month_number(word: &str) -> Option<u32> {
    let word = word.to_ascii_lowercase();
    if word.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.starts_with(&word))
        .map(|i| i as u32 + 1)
}

fn contains_month(text: &str) -> bool {
    RE_WORD.find_iter(text).any(|w| month_number(w.as_str()).is_some())
}

/// "September 10" -> "Sep 10".
fn abbreviate_months(text: &str) -> String {
    RE_WORD
        .replace_all(text, |c: &Captures| {
            let word = &c[0];
            match month_number(word) {
                Some(m) if word.len() > 3 => {
                    let abbr = &MONTHS[m as usize - 1][..3];
                    let mut out = abbr[..1].to_ascii_uppercase();
                    out.push_str(&abbr[1..]);
                    out
                }
                _ => word.to_string(),
            }
        })
        .into_owned()
}

// --- General parser ---

/// Calendar pieces found in a fragment. Month and day are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateParts {
    year: Option<i32>,
    month: u32,
    day: u32,
    time: NaiveTime,
}

impl DateParts {
    fn at_year(&self, year: i32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(year, self.month, self.day).map(|d| d.and_time(self.time))
    }
}

fn to_24_hour(hour: u32, meridiem: Option<&str>) -> Option<u32> {
    match meridiem.map(|m| m.to_ascii_lowercase().starts_with('p')) {
        None if hour < 24 => Some(hour),
        Some(false) if (1..=12).contains(&hour) => Some(hour % 12),
        Some(true) if (1..=12).contains(&hour) => Some(hour % 12 + 12),
        _ => None,
    }
}

fn parse_parts(text: &str) -> Option<DateParts> {
    let mut year: Option<i32> = None;
    let mut month: Option<u32> = None;
    let mut day: Option<u32> = None;
    let mut time: Option<NaiveTime> = None;

    let num = |c: &Captures, name: &str| c.name(name).and_then(|m| m.as_str().parse::<u32>().ok());

    for c in RE_TOKEN.captures_iter(text) {
        if c.name("iso_y").is_some() {
            year = year.or(num(&c, "iso_y").map(|y| y as i32));
            month = month.or(num(&c, "iso_m"));
            day = day.or(num(&c, "iso_d"));
        } else if c.name("us_y").is_some() {
            year = year.or(num(&c, "us_y").map(|y| y as i32));
            month = month.or(num(&c, "us_m"));
            day = day.or(num(&c, "us_d"));
        } else if c.name("hour").is_some() {
            if time.is_none() {
                let meridiem = c.name("meridiem").map(|m| m.as_str());
                let hour = to_24_hour(num(&c, "hour")?, meridiem)?;
                let minute = num(&c, "minute")?;
                let second = num(&c, "second").unwrap_or(0);
                time = Some(NaiveTime::from_hms_opt(hour, minute, second)?);
            }
        } else if c.name("h12").is_some() {
            if time.is_none() {
                let meridiem = c.name("meridiem12").map(|m| m.as_str());
                let hour = to_24_hour(num(&c, "h12")?, meridiem)?;
                time = Some(NaiveTime::from_hms_opt(hour, 0, 0)?);
            }
        } else if c.name("offset").is_some() {
            // Literal wall-clock time is kept; offsets are dropped.
        } else if let Some(n) = num(&c, "num") {
            let digits = c.name("num").map_or(0, |m| m.as_str().len());
            if digits == 4 {
                year = year.or(Some(n as i32));
            } else if (1..=31).contains(&n) && day.is_none() {
                day = Some(n);
            }
        } else if let Some(word) = c.name("word") {
            if month.is_none() {
                month = month_number(word.as_str());
            }
        }
    }

    Some(DateParts {
        year,
        month: month?,
        day: day?,
        time: time.unwrap_or(NaiveTime::MIN),
    })
}
