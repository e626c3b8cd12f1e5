//! Core domain model for CAQF: source identifiers, question records and catalog naming.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "caqf-core";

pub const DEFAULT_SOURCE_BASE_URL: &str = "https://www.indiabix.com/current-affairs";

/// Catalog section every current-affairs skill is filed under.
pub const SECTION_ID: i64 = 8;
pub const DIFFICULTY_LEVEL_ID: i64 = 1;
pub const QUESTION_TYPE_ID: i64 = 1;
pub const PRACTICE_SET_SUB_CATEGORY_ID: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("invalid month {0}")]
    InvalidMonth(u32),
    #[error("invalid date {year}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },
    #[error("start date {start} is after end date {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("trailing window of {0} days reaches outside the calendar")]
    InvalidTrailingDays(u32),
    #[error("no YYYY-MM-DD segment in url {0}")]
    UnrecognizedUrl(String),
}

/// One calendar day of source content. Maps to exactly one source page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceIdentifier {
    date: NaiveDate,
}

impl SourceIdentifier {
    pub fn new(date: NaiveDate) -> Self {
        Self { date }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn path_segment(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// Canonical page URL: `<base>/<YYYY-MM-DD>`, never with a trailing slash.
    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim().trim_end_matches('/'), self.path_segment())
    }

    pub fn from_url(url: &str) -> Result<Self, IdentifierError> {
        let normalized = normalize_source_url(url);
        let segment = normalized
            .rsplit('/')
            .next()
            .ok_or_else(|| IdentifierError::UnrecognizedUrl(url.to_string()))?;
        NaiveDate::parse_from_str(segment, "%Y-%m-%d")
            .map(Self::new)
            .map_err(|_| IdentifierError::UnrecognizedUrl(url.to_string()))
    }

    /// "15 March 2024"
    pub fn display_date(&self) -> String {
        self.date.format("%d %B %Y").to_string()
    }

    /// Month-level grouping name, e.g. "March 2024".
    pub fn skill_name(&self) -> String {
        self.date.format("%B %Y").to_string()
    }

    /// Day-level grouping name, e.g. "15 March 2024 Current Affairs".
    pub fn topic_name(&self) -> String {
        format!("{} Current Affairs", self.display_date())
    }
}

impl fmt::Display for SourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path_segment())
    }
}

/// Strips surrounding whitespace and trailing slashes so URLs compare and store consistently.
pub fn normalize_source_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

pub fn days_in_month(year: i32, month: u32) -> Result<u32, IdentifierError> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(IdentifierError::InvalidMonth(month))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or(IdentifierError::InvalidMonth(month))?;
    Ok(next.signed_duration_since(first).num_days() as u32)
}

pub fn identifier_for_date(year: i32, month: u32, day: u32) -> Result<SourceIdentifier, IdentifierError> {
    NaiveDate::from_ymd_opt(year, month, day)
        .map(SourceIdentifier::new)
        .ok_or(IdentifierError::InvalidDate { year, month, day })
}

pub fn identifiers_for_month(year: i32, month: u32) -> Result<Vec<SourceIdentifier>, IdentifierError> {
    let days = days_in_month(year, month)?;
    (1..=days)
        .map(|day| identifier_for_date(year, month, day))
        .collect()
}

pub fn identifiers_for_range(
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<SourceIdentifier>, IdentifierError> {
    if start > end {
        return Err(IdentifierError::InvalidRange { start, end });
    }
    Ok(start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(SourceIdentifier::new)
        .collect())
}

/// "March 2024"
pub fn month_label(year: i32, month: u32) -> Result<String, IdentifierError> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(|d| d.format("%B %Y").to_string())
        .ok_or(IdentifierError::InvalidMonth(month))
}

pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase().replace(' ', "-");
    let mut slug = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-') {
            continue;
        }
        if ch == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(ch);
    }
    slug
}

/// Letter marker from the source page (`a`..`e`) to a 1-based option index.
pub fn option_index_from_marker(marker: &str) -> Option<usize> {
    match marker.trim().to_ascii_lowercase().as_str() {
        "a" => Some(1),
        "b" => Some(2),
        "c" => Some(3),
        "d" => Some(4),
        "e" => Some(5),
        _ => None,
    }
}

/// Stored correct-answer marker, `i:<1-based index>;`.
pub fn encode_answer_marker(option_index: usize) -> String {
    format!("i:{option_index};")
}

pub fn decode_answer_marker(marker: &str) -> Option<usize> {
    marker
        .trim()
        .strip_prefix("i:")?
        .strip_suffix(';')?
        .parse()
        .ok()
}

/// Question block as parsed from a source page. `correct_option` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_option: usize,
    pub explanation: String,
    pub source: SourceIdentifier,
}

impl RawQuestion {
    pub fn is_well_formed(&self) -> bool {
        !self.question.is_empty()
            && !self.options.is_empty()
            && self.correct_option >= 1
            && self.correct_option <= self.options.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_option: usize,
    pub explanation: String,
    pub source: SourceIdentifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub url: String,
    pub source_date: NaiveDate,
    pub processed: bool,
    pub scraped_at: DateTime<Utc>,
}

/// Denormalized mirror of a persisted question, queried by skill/topic/created-at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionIndexEntry {
    pub question_id: i64,
    pub section_id: i64,
    pub skill_id: i64,
    pub topic_id: i64,
    pub created_at: DateTime<Utc>,
    pub question: String,
    pub options: Vec<String>,
    pub correct_option: usize,
    pub solution: String,
}

/// Temporal scope shared by ingestion and practice-set assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Date(NaiveDate),
    Month { year: i32, month: u32 },
    TrailingDays(u32),
    Range { start: NaiveDate, end: NaiveDate },
}

impl Scope {
    pub fn week() -> Self {
        Scope::TrailingDays(7)
    }

    /// Identifiers covered by this scope; trailing windows are anchored on `today`.
    pub fn identifiers(&self, today: NaiveDate) -> Result<Vec<SourceIdentifier>, IdentifierError> {
        match *self {
            Scope::Date(date) => Ok(vec![SourceIdentifier::new(date)]),
            Scope::Month { year, month } => identifiers_for_month(year, month),
            Scope::TrailingDays(days) => {
                let start = today
                    .checked_sub_signed(Duration::days(i64::from(days)))
                    .ok_or(IdentifierError::InvalidTrailingDays(days))?;
                identifiers_for_range(start, today)
            }
            Scope::Range { start, end } => identifiers_for_range(start, end),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Date(date) => write!(f, "date {date}"),
            Scope::Month { year, month } => write!(f, "month {year}-{month:02}"),
            Scope::TrailingDays(days) => write!(f, "last {days} days"),
            Scope::Range { start, end } => write!(f, "range {start}..={end}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn month_identifiers_cover_every_calendar_day() {
        assert_eq!(identifiers_for_month(2024, 2).unwrap().len(), 29);
        assert_eq!(identifiers_for_month(2023, 2).unwrap().len(), 28);
        assert_eq!(identifiers_for_month(1900, 2).unwrap().len(), 28);
        assert_eq!(identifiers_for_month(2000, 2).unwrap().len(), 29);
        assert_eq!(identifiers_for_month(2024, 4).unwrap().len(), 30);
        assert_eq!(identifiers_for_month(2024, 12).unwrap().len(), 31);
        assert_eq!(identifiers_for_month(2024, 13), Err(IdentifierError::InvalidMonth(13)));
    }

    #[test]
    fn identifier_urls_round_trip_to_the_same_day() {
        for year in [2023, 2024] {
            for month in 1..=12 {
                for id in identifiers_for_month(year, month).unwrap() {
                    let url = id.url(DEFAULT_SOURCE_BASE_URL);
                    assert!(!url.ends_with('/'));
                    let parsed = SourceIdentifier::from_url(&url).unwrap();
                    assert_eq!(parsed, id);
                    assert_eq!((parsed.date().year(), parsed.date().month()), (year, month));
                }
            }
        }
    }

    #[test]
    fn url_building_normalizes_trailing_slashes() {
        let id = SourceIdentifier::new(ymd(2024, 3, 5));
        assert_eq!(
            id.url("https://www.indiabix.com/current-affairs/"),
            "https://www.indiabix.com/current-affairs/2024-03-05"
        );
        assert_eq!(
            SourceIdentifier::from_url("https://www.indiabix.com/current-affairs/2024-03-05/").unwrap(),
            id
        );
        assert!(SourceIdentifier::from_url("https://www.indiabix.com/current-affairs/").is_err());
    }

    #[test]
    fn range_is_inclusive_and_rejects_reversed_bounds() {
        let ids = identifiers_for_range(ymd(2024, 2, 27), ymd(2024, 3, 2)).unwrap();
        let days: Vec<_> = ids.iter().map(|i| i.path_segment()).collect();
        assert_eq!(
            days,
            vec!["2024-02-27", "2024-02-28", "2024-02-29", "2024-03-01", "2024-03-02"]
        );
        assert_eq!(identifiers_for_range(ymd(2024, 3, 1), ymd(2024, 3, 1)).unwrap().len(), 1);
        assert!(matches!(
            identifiers_for_range(ymd(2024, 3, 2), ymd(2024, 3, 1)),
            Err(IdentifierError::InvalidRange { .. })
        ));
    }

    #[test]
    fn catalog_names_follow_month_and_day_format() {
        let id = SourceIdentifier::new(ymd(2024, 3, 5));
        assert_eq!(id.skill_name(), "March 2024");
        assert_eq!(id.topic_name(), "05 March 2024 Current Affairs");
        assert_eq!(month_label(2024, 3).unwrap(), "March 2024");
        assert_eq!(slugify("05 March 2024 Current Affairs"), "05-march-2024-current-affairs");
        assert_eq!(slugify("Weekly  (01 March 2024 to 07 March 2024)"), "weekly-01-march-2024-to-07-march-2024");
    }

    #[test]
    fn answer_markers_are_one_based() {
        assert_eq!(option_index_from_marker("a"), Some(1));
        assert_eq!(option_index_from_marker(" D "), Some(4));
        assert_eq!(option_index_from_marker("z"), None);
        assert_eq!(option_index_from_marker(""), None);
        assert_eq!(encode_answer_marker(3), "i:3;");
        assert_eq!(decode_answer_marker("i:3;"), Some(3));
        assert_eq!(decode_answer_marker("3"), None);
    }

    #[test]
    fn raw_question_rejects_out_of_range_answers() {
        let mut q = RawQuestion {
            question: "Capital of France?".into(),
            options: vec!["Paris".into(), "Lyon".into()],
            correct_option: 2,
            explanation: String::new(),
            source: SourceIdentifier::new(ymd(2024, 3, 5)),
        };
        assert!(q.is_well_formed());
        q.correct_option = 3;
        assert!(!q.is_well_formed());
        q.correct_option = 0;
        assert!(!q.is_well_formed());
    }

    #[test]
    fn trailing_scope_is_anchored_on_today() {
        let ids = Scope::TrailingDays(2).identifiers(ymd(2024, 3, 1)).unwrap();
        assert_eq!(ids.first().unwrap().date(), ymd(2024, 2, 28));
        assert_eq!(ids.last().unwrap().date(), ymd(2024, 3, 1));
    }

    #[test]
    fn oversized_trailing_scope_is_rejected() {
        assert_eq!(
            Scope::TrailingDays(u32::MAX).identifiers(ymd(2026, 10, 19)),
            Err(IdentifierError::InvalidTrailingDays(u32::MAX))
        );
    }
}
