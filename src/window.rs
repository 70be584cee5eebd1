//! Target window resolution.
//!
//! Derives the time interval the poller watches closely around a guessed or
//! known registration-open instant. Resolution order is fixed: an explicit
//! open instant beats a date parsed from the detection URL, which beats the
//! seasonal fallback. The fallback exists only so every plan has *some*
//! window; it never replaces known data.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;

use crate::plan::RegistrationPlan;

/// Hour (UTC) assumed for date-only hints that carry no time of day.
const DATE_HINT_OPEN_HOUR: u32 = 9;

/// How the window center was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowConfidence {
    /// Provider published the exact instant.
    Explicit,
    /// Parsed from structured hints in the detection URL.
    Parsed,
    /// Low-confidence seasonal guess.
    Heuristic,
}

/// The interval the poller treats as "watch closely".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TargetWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub confidence: WindowConfidence,
}

impl TargetWindow {
    fn around(center: DateTime<Utc>, tolerance: Duration, confidence: WindowConfidence) -> Self {
        Self {
            start: center - tolerance,
            end: center + tolerance,
            confidence,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Pluggable source for the last-resort window guess.
///
/// The default maps the current month to the next seasonal boundary. Deployments
/// with provider-specific calendars inject their own.
pub trait SeasonFallback: Send + Sync {
    /// Best-effort guess at the next plausible registration-open instant.
    fn guess(&self, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// Default fallback: the first day of the next season quarter
/// (Mar 1 / Jun 1 / Sep 1 / Dec 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct QuarterSeasonFallback;

impl SeasonFallback for QuarterSeasonFallback {
    fn guess(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let boundaries = [3u32, 6, 9, 12];
        boundaries
            .iter()
            .filter_map(|&month| season_open(now.year(), month))
            .find(|&candidate| candidate > now)
            .or_else(|| season_open(now.year() + 1, 3))
            .unwrap_or_else(|| now + Duration::days(90))
    }
}

fn season_open(year: i32, month: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, 1, DATE_HINT_OPEN_HOUR, 0, 0)
        .single()
}

/// Resolve the watch window for a plan.
pub fn resolve_window(
    plan: &RegistrationPlan,
    now: DateTime<Utc>,
    fallback: &dyn SeasonFallback,
) -> TargetWindow {
    if let Some(at) = plan.manual_open_at {
        return TargetWindow::around(at, Duration::hours(1), WindowConfidence::Explicit);
    }

    if let Some(url) = plan.detection_url.as_deref()
        && let Some(hint) = parse_date_hint(url)
    {
        return TargetWindow::around(hint, Duration::hours(1), WindowConfidence::Parsed);
    }

    TargetWindow::around(fallback.guess(now), Duration::days(1), WindowConfidence::Heuristic)
}

/// Extract a target date from structured hints in a detection URL.
///
/// Recognized, in order: ISO dates (`2026-03-01`), US dates (`3/1/2026`),
/// and year+season tokens (`summer2026`, `fall-2026`, `2026-summer`).
pub fn parse_date_hint(url: &str) -> Option<DateTime<Utc>> {
    static ISO: OnceLock<Regex> = OnceLock::new();
    static US: OnceLock<Regex> = OnceLock::new();
    static SEASON: OnceLock<Regex> = OnceLock::new();

    let iso = ISO.get_or_init(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("valid regex"));
    if let Some(caps) = iso.captures(url)
        && let Some(dt) = ymd_to_open_instant(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        )
    {
        return Some(dt);
    }

    let us = US.get_or_init(|| {
        Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("valid regex")
    });
    if let Some(caps) = us.captures(url)
        && let Some(dt) = ymd_to_open_instant(
            caps[3].parse().ok()?,
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
        )
    {
        return Some(dt);
    }

    let season = SEASON.get_or_init(|| {
        Regex::new(r"(?i)\b(?:(spring|summer|fall|autumn|winter)[-_]?(\d{4})|(\d{4})[-_]?(spring|summer|fall|autumn|winter))\b")
            .expect("valid regex")
    });
    if let Some(caps) = season.captures(url) {
        let (name, year) = match (caps.get(1), caps.get(2), caps.get(3), caps.get(4)) {
            (Some(name), Some(year), _, _) => (name.as_str(), year.as_str()),
            (_, _, Some(year), Some(name)) => (name.as_str(), year.as_str()),
            _ => return None,
        };
        let month = match name.to_ascii_lowercase().as_str() {
            "spring" => 3,
            "summer" => 6,
            "fall" | "autumn" => 9,
            "winter" => 12,
            _ => return None,
        };
        return ymd_to_open_instant(year.parse().ok()?, month, 1);
    }

    None
}

fn ymd_to_open_instant(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    // Reject implausible years so path segments like /v2/1/2/ don't parse.
    if !(2000..=2100).contains(&year) {
        return None;
    }
    Utc.with_ymd_and_hms(year, month, day, DATE_HINT_OPEN_HOUR, 0, 0)
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plan_with(url: Option<&str>, manual: Option<DateTime<Utc>>) -> RegistrationPlan {
        let mut plan = RegistrationPlan::new("u1", "camp-42");
        plan.detection_url = url.map(str::to_string);
        plan.manual_open_at = manual;
        plan
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    #[test]
    fn explicit_instant_wins_over_url_hint() {
        let open_at = ts("2026-08-15T16:00:00Z");
        let plan = plan_with(Some("https://camps.example/register/2026-06-01"), Some(open_at));
        let window = resolve_window(&plan, ts("2026-08-01T00:00:00Z"), &QuarterSeasonFallback);

        assert_eq!(window.confidence, WindowConfidence::Explicit);
        assert_eq!(window.start, open_at - Duration::hours(1));
        assert_eq!(window.end, open_at + Duration::hours(1));
    }

    #[test]
    fn iso_date_parsed_from_url() {
        let plan = plan_with(Some("https://camps.example/signup/2026-06-01/cabins"), None);
        let window = resolve_window(&plan, ts("2026-05-01T00:00:00Z"), &QuarterSeasonFallback);

        assert_eq!(window.confidence, WindowConfidence::Parsed);
        assert!(window.contains(ts("2026-06-01T09:30:00Z")));
    }

    #[test]
    fn us_date_parsed_from_url() {
        let hint = parse_date_hint("https://camps.example/open/6/1/2026");
        assert_eq!(hint, Some(ts("2026-06-01T09:00:00Z")));
    }

    #[test]
    fn season_tokens_parse_both_orders() {
        assert_eq!(
            parse_date_hint("https://camps.example/summer2026"),
            Some(ts("2026-06-01T09:00:00Z"))
        );
        assert_eq!(
            parse_date_hint("https://camps.example/2026-fall/session"),
            Some(ts("2026-09-01T09:00:00Z"))
        );
    }

    #[test]
    fn implausible_years_are_rejected() {
        assert_eq!(parse_date_hint("https://camps.example/v2/1/2/1999"), None);
    }

    #[test]
    fn heuristic_fallback_gets_day_tolerance() {
        let plan = plan_with(Some("https://camps.example/register"), None);
        let now = ts("2026-04-10T12:00:00Z");
        let window = resolve_window(&plan, now, &QuarterSeasonFallback);

        assert_eq!(window.confidence, WindowConfidence::Heuristic);
        // Next quarter boundary after April 10 is June 1.
        assert_eq!(window.start, ts("2026-06-01T09:00:00Z") - Duration::days(1));
        assert_eq!(window.end, ts("2026-06-01T09:00:00Z") + Duration::days(1));
    }

    #[test]
    fn fallback_rolls_into_next_year() {
        let guess = QuarterSeasonFallback.guess(ts("2026-12-15T00:00:00Z"));
        assert_eq!(guess, ts("2027-03-01T09:00:00Z"));
    }
}
