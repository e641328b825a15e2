//! Date normalization for entity date strings.
//!
//! Analysis payloads carry dates exactly as they were read off the page:
//! `"21 May 1982"`, `"June 1963"`, `"1959-61"`, `"11/22/1963"`, or plain
//! noise. [`normalize`] turns such a list into a sorted timeline of
//! calendar dates plus its earliest and latest bound.
//!
//! Each string is tried against these shapes in order, first match wins:
//!
//! | # | Shape | Example | Result |
//! |---|-------|---------|--------|
//! | 1 | machine-parseable date | `1963-11-22`, `11/22/1963` | that date |
//! | 2 | day, month name, year | `21 May 1982` | that date |
//! | 3 | month name, year | `June 1963` | 1st of the month |
//! | 4 | year range `YYYY-YY` | `1959-61` | Jan 1 of start, Dec 31 of end |
//! | 5 | bare year | `1963` | Jan 1 |
//!
//! Only years in `[1900, 2100)` are accepted. Anything else is dropped and
//! counted, never reported as an error.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::models::TimelineEntry;

/// Lowest accepted year (inclusive).
pub const MIN_YEAR: i32 = 1900;
/// Highest accepted year (exclusive).
pub const MAX_YEAR: i32 = 2100;

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

const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%b %d %Y",
];

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Result of [`normalize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedDates {
    /// One entry per distinct original string, ascending by date.
    pub entries: Vec<TimelineEntry>,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
    /// Number of input strings that matched no supported shape.
    pub dropped: usize,
}

/// Normalize a list of raw date strings into a deduplicated timeline.
///
/// Deduplication is keyed by the (trimmed) original text, so `"1963"` and
/// `"June 1963"` both survive while a repeated `"1963"` collapses. Year
/// ranges contribute two entries keyed by their four-digit years.
pub fn normalize<S: AsRef<str>>(raw_dates: &[S]) -> NormalizedDates {
    let mut seen: HashSet<String> = HashSet::new();
    let mut entries: Vec<TimelineEntry> = Vec::new();
    let mut dropped = 0usize;

    for raw in raw_dates {
        let text = raw.as_ref().trim();
        match parse_date_text(text) {
            Some(parsed) => {
                for (key, date) in parsed {
                    if seen.insert(key.clone()) {
                        entries.push(TimelineEntry {
                            original_text: key,
                            normalized_date: date,
                        });
                    }
                }
            }
            None => dropped += 1,
        }
    }

    // Stable: equal dates keep input order.
    entries.sort_by_key(|e| e.normalized_date);

    NormalizedDates {
        earliest: entries.first().map(|e| e.normalized_date),
        latest: entries.last().map(|e| e.normalized_date),
        entries,
        dropped,
    }
}

/// Parse one trimmed date string into its keyed entries.
///
/// Returns `None` when nothing usable was found. A year range yields two
/// entries; every other shape yields one.
fn parse_date_text(text: &str) -> Option<Vec<(String, NaiveDate)>> {
    if text.is_empty() {
        return None;
    }

    // A date outside the accepted years is not a match; later shapes may
    // still find one.
    let single = parse_machine_date(text)
        .and_then(in_range)
        .or_else(|| parse_day_month_year(text))
        .or_else(|| parse_month_year(text));
    if let Some(date) = single {
        return Some(vec![(text.to_string(), date)]);
    }

    if let Some(caps) = year_range_re().captures(text) {
        // A matched range that does not move forward is discarded outright
        // rather than read as a bare year.
        return parse_year_range(&caps[1], &caps[2]);
    }

    if let Some(caps) = bare_year_re().captures(text) {
        let year: i32 = caps[1].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, 1, 1)
            .and_then(in_range)
            .map(|d| vec![(text.to_string(), d)]);
    }

    None
}

fn in_range(date: NaiveDate) -> Option<NaiveDate> {
    (MIN_YEAR..MAX_YEAR).contains(&date.year()).then_some(date)
}

fn parse_machine_date(text: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.date());
        }
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return Some(date);
        }
    }

    // ISO year-month, e.g. "1963-11"
    if year_month_re().is_match(text) {
        return NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d").ok();
    }

    None
}

fn parse_day_month_year(text: &str) -> Option<NaiveDate> {
    day_month_year_re().captures_iter(text).find_map(|caps| {
        let day: u32 = caps[1].parse().ok()?;
        let month = month_number(&caps[2])?;
        let year: i32 = caps[3].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day).and_then(in_range)
    })
}

fn parse_month_year(text: &str) -> Option<NaiveDate> {
    month_year_re().captures_iter(text).find_map(|caps| {
        let month = month_number(&caps[1])?;
        let year: i32 = caps[2].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, 1).and_then(in_range)
    })
}

fn parse_year_range(start: &str, suffix: &str) -> Option<Vec<(String, NaiveDate)>> {
    let start_year: i32 = start.parse().ok()?;
    let suffix: i32 = suffix.parse().ok()?;
    let end_year = (start_year / 100) * 100 + suffix;
    if end_year <= start_year {
        return None;
    }

    let first = NaiveDate::from_ymd_opt(start_year, 1, 1).and_then(in_range)?;
    let last = NaiveDate::from_ymd_opt(end_year, 12, 31).and_then(in_range)?;
    Some(vec![
        (start_year.to_string(), first),
        (end_year.to_string(), last),
    ])
}

/// Month number for a full name or an abbreviation of at least 3 letters.
fn month_number(name: &str) -> Option<u32> {
    let name = name.to_ascii_lowercase();
    if name.len() < 3 {
        return None;
    }
    if name == "sept" {
        return Some(9);
    }
    MONTHS
        .iter()
        .position(|full| full.starts_with(&name))
        .map(|i| i as u32 + 1)
}

fn day_month_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?\s+([a-z]+)\.?,?\s+(\d{4})\b")
            .expect("valid regex")
    })
}

fn month_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b([a-z]+)\.?,?\s+(\d{4})\b").expect("valid regex"))
}

fn year_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})-(\d{2})\b").expect("valid regex"))
}

fn bare_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})\b").expect("valid regex"))
}

fn year_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}$").expect("valid regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn keys(result: &NormalizedDates) -> Vec<&str> {
        result
            .entries
            .iter()
            .map(|e| e.original_text.as_str())
            .collect()
    }

    #[test]
    fn test_empty_input() {
        let result = normalize::<&str>(&[]);
        assert!(result.entries.is_empty());
        assert_eq!(result.earliest, None);
        assert_eq!(result.latest, None);
        assert_eq!(result.dropped, 0);
    }

    #[test]
    fn test_identical_strings_collapse() {
        let result = normalize(&["1963", "1963"]);
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].normalized_date, ymd(1963, 1, 1));
    }

    #[test]
    fn test_dedup_is_by_text_not_date() {
        let result = normalize(&["1963", "June 1963"]);
        assert_eq!(result.entries.len(), 2);
        assert_eq!(keys(&result), vec!["1963", "June 1963"]);
        assert_eq!(result.entries[1].normalized_date, ymd(1963, 6, 1));
    }

    #[test]
    fn test_year_range_emits_both_ends() {
        let result = normalize(&["1959-61"]);
        assert_eq!(keys(&result), vec!["1959", "1961"]);
        assert_eq!(result.earliest, Some(ymd(1959, 1, 1)));
        assert_eq!(result.latest, Some(ymd(1961, 12, 31)));
    }

    #[test]
    fn test_backwards_range_is_discarded() {
        let result = normalize(&["1959-52"]);
        assert!(result.entries.is_empty());
        assert_eq!(result.dropped, 1);
    }

    #[test]
    fn test_day_month_year() {
        let result = normalize(&["21 May 1982", "3rd Sept. 1971"]);
        assert_eq!(result.entries[0].normalized_date, ymd(1971, 9, 3));
        assert_eq!(result.entries[1].normalized_date, ymd(1982, 5, 21));
    }

    #[test]
    fn test_month_year_abbreviation() {
        let result = normalize(&["Nov 1963", "circa December 1962"]);
        assert_eq!(result.entries[0].normalized_date, ymd(1962, 12, 1));
        assert_eq!(result.entries[1].normalized_date, ymd(1963, 11, 1));
    }

    #[test]
    fn test_machine_formats() {
        let result = normalize(&[
            "1963-11-22",
            "11/24/1963",
            "1964-09",
            "November 25, 1963",
            "1963-11-23T12:30:00Z",
        ]);
        let dates: Vec<NaiveDate> = result.entries.iter().map(|e| e.normalized_date).collect();
        assert_eq!(
            dates,
            vec![
                ymd(1963, 11, 22),
                ymd(1963, 11, 23),
                ymd(1963, 11, 24),
                ymd(1963, 11, 25),
                ymd(1964, 9, 1),
            ]
        );
    }

    #[test]
    fn test_out_of_range_years_dropped() {
        let result = normalize(&["1850", "21 May 2150", "1899-12-31", "2099"]);
        assert_eq!(keys(&result), vec!["2099"]);
        assert_eq!(result.dropped, 3);
    }

    #[test]
    fn test_out_of_range_match_falls_through() {
        let result = normalize(&["21 May 1850, refiled 3 June 1963", "Jan 1850 / Mar 1964"]);
        assert_eq!(result.entries[0].normalized_date, ymd(1963, 6, 3));
        assert_eq!(result.entries[1].normalized_date, ymd(1964, 3, 1));
        assert_eq!(result.dropped, 0);
    }

    #[test]
    fn test_noise_is_dropped_not_fatal() {
        let result = normalize(&["bogus", "", "   ", "12/45", "21 May 1982"]);
        assert_eq!(keys(&result), vec!["21 May 1982"]);
        assert_eq!(result.dropped, 4);
    }

    #[test]
    fn test_all_years_within_bounds() {
        let inputs = [
            "1900",
            "2099-12-31",
            "January 1900",
            "31 Dec 2099",
            "1998-99",
            "01/01/1950",
        ];
        let result = normalize(&inputs);
        assert!(!result.entries.is_empty());
        for entry in &result.entries {
            let year = entry.normalized_date.year();
            assert!((MIN_YEAR..MAX_YEAR).contains(&year), "{:?}", entry);
        }
    }

    #[test]
    fn test_sorted_ascending_with_bounds() {
        let result = normalize(&["1975", "1961", "June 1968"]);
        assert_eq!(keys(&result), vec!["1961", "June 1968", "1975"]);
        assert_eq!(result.earliest, Some(ymd(1961, 1, 1)));
        assert_eq!(result.latest, Some(ymd(1975, 1, 1)));
    }

    #[test]
    fn test_month_name_needs_three_letters() {
        assert_eq!(month_number("Ju"), None);
        assert_eq!(month_number("Jun"), Some(6));
        assert_eq!(month_number("SEPT"), Some(9));
        assert_eq!(month_number("circa"), None);
    }
}
