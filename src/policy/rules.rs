//! Retention policy language: clause grammar, parsing, and matching.
//!
//! A policy string is a list of clauses joined by the literal connective
//! `" and "`. Any single matching clause satisfies the policy.
//!
//! | clause                                   | matches when                                        |
//! |------------------------------------------|-----------------------------------------------------|
//! | `all` / `none`                           | always / never                                      |
//! | `<n> hour(s)`                            | created within the last n hours                     |
//! | `<n> day(s)` / `<n> week(s)`             | creation date within the last n / 7n days           |
//! | `<n> <weekday>(s)`                       | on that weekday, within the last n weeks            |
//! | `<n> <k>th <weekday> of the month`       | k-th such weekday of its month, within n months     |
//! | `<n> <k>th day of the month`             | day-of-month k, within n months                     |
//! | `<n> <k>th day of the quarter`           | day k of a quarter's first month, within n quarters |
//! | `@<suffix>`                              | snapshot name after `@` equals suffix               |

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta, Weekday};
use regex::{Captures, Regex};

use crate::core::errors::{Result, ZscError};
use crate::policy::calendar::{
    days_back, first_of_month, months_back, occurrence_has_passed, ordinal_suffix, parse_weekday,
    week_of_month, weekday_name,
};

/// Connective joining clauses in a policy string.
pub const CLAUSE_SEPARATOR: &str = " and ";

const WEEKDAYS: &str = "monday|tuesday|wednesday|thursday|friday|saturday|sunday";

type Grammar = LazyLock<std::result::Result<Regex, regex::Error>>;

static HOURS: Grammar = LazyLock::new(|| Regex::new(r"^(\d+) hours?$"));
static DAYS: Grammar = LazyLock::new(|| Regex::new(r"^(\d+) days?$"));
static WEEKS: Grammar = LazyLock::new(|| Regex::new(r"^(\d+) weeks?$"));
static WEEKDAY: Grammar = LazyLock::new(|| Regex::new(&format!(r"^(\d+) ({WEEKDAYS})s?$")));
static WEEKDAY_OF_MONTH: Grammar = LazyLock::new(|| {
    Regex::new(&format!(
        r"^(\d+) (\d+)(?:st|nd|rd|th) ({WEEKDAYS}) of the month$"
    ))
});
static DAY_OF_MONTH: Grammar =
    LazyLock::new(|| Regex::new(r"^(\d+) (\d+)(?:st|nd|rd|th) day of the month$"));
static DAY_OF_QUARTER: Grammar =
    LazyLock::new(|| Regex::new(r"^(\d+) (\d+)(?:st|nd|rd|th) day of the quarter$"));
static SNAPSHOT_NAME: Grammar = LazyLock::new(|| Regex::new(r"^@(\S*)$"));

fn captures<'t>(grammar: &'static Grammar, text: &'t str) -> Option<Captures<'t>> {
    (**grammar).as_ref().ok()?.captures(text)
}

// ──────────────────── clause ────────────────────

/// One parsed retention clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionRule {
    All,
    Nothing,
    WithinHours(u32),
    WithinDays(u32),
    WithinWeeks(u32),
    Weekday {
        weeks: u32,
        weekday: Weekday,
    },
    WeekdayOfMonth {
        months: u32,
        nth: u8,
        weekday: Weekday,
    },
    DayOfMonth {
        months: u32,
        day: u32,
    },
    DayOfQuarter {
        quarters: u32,
        day: u32,
    },
    SnapshotName(String),
}

impl RetentionRule {
    /// Evaluate the clause against a snapshot.
    ///
    /// `name` is the full `dataset@suffix` snapshot name; `created` is its local
    /// creation time when known. Time-based clauses never match an unknown
    /// creation time.
    #[must_use]
    pub fn matches(&self, name: &str, created: Option<NaiveDateTime>, now: NaiveDateTime) -> bool {
        match self {
            Self::All => true,
            Self::Nothing => false,
            Self::SnapshotName(wanted) => name
                .split_once('@')
                .is_some_and(|(_, suffix)| suffix == wanted),
            _ => created.is_some_and(|created| self.matches_time(created, now)),
        }
    }

    fn matches_time(&self, created: NaiveDateTime, now: NaiveDateTime) -> bool {
        let today = now.date();
        let day = created.date();
        match *self {
            Self::WithinHours(hours) => {
                let horizon = TimeDelta::try_hours(i64::from(hours))
                    .and_then(|span| now.checked_sub_signed(span))
                    .unwrap_or(NaiveDateTime::MIN);
                created >= horizon
            }
            Self::WithinDays(days) => day >= days_back(today, u64::from(days)),
            Self::WithinWeeks(weeks) => day >= days_back(today, u64::from(weeks) * 7),
            Self::Weekday { weeks, weekday } => {
                created.weekday() == weekday && day >= days_back(today, u64::from(weeks) * 7)
            }
            Self::WeekdayOfMonth {
                months,
                nth,
                weekday,
            } => {
                if created.weekday() != weekday || week_of_month(day.day()) != u32::from(nth) {
                    return false;
                }
                // This month's occurrence counts toward the n months only once it happened.
                let span = if occurrence_has_passed(today, weekday, nth) {
                    i64::from(months) - 1
                } else {
                    i64::from(months)
                };
                day >= months_back(first_of_month(today), span)
            }
            Self::DayOfMonth { months, day: dom } => {
                day.day() == dom
                    && day >= months_back(first_of_month(today), i64::from(months) - 1)
            }
            Self::DayOfQuarter { quarters, day: dom } => {
                day.day() == dom
                    && day.month() % 3 == 1
                    && day >= months_back(first_of_month(today), i64::from(quarters) * 3)
            }
            Self::All | Self::Nothing | Self::SnapshotName(_) => false,
        }
    }

    /// Earliest local date the clause can still match, for diagnostics.
    ///
    /// `None` for clauses that are not bounded by time.
    #[must_use]
    pub fn horizon(&self, now: NaiveDateTime) -> Option<NaiveDate> {
        let today = now.date();
        match *self {
            Self::WithinHours(hours) => Some(
                TimeDelta::try_hours(i64::from(hours))
                    .and_then(|span| now.checked_sub_signed(span))
                    .map_or(NaiveDate::MIN, |t| t.date()),
            ),
            Self::WithinDays(days) => Some(days_back(today, u64::from(days))),
            Self::WithinWeeks(weeks) | Self::Weekday { weeks, .. } => {
                Some(days_back(today, u64::from(weeks) * 7))
            }
            Self::WeekdayOfMonth {
                months,
                nth,
                weekday,
            } => {
                let span = if occurrence_has_passed(today, weekday, nth) {
                    i64::from(months) - 1
                } else {
                    i64::from(months)
                };
                Some(months_back(first_of_month(today), span))
            }
            Self::DayOfMonth { months, .. } => Some(months_back(
                first_of_month(today),
                i64::from(months) - 1,
            )),
            Self::DayOfQuarter { quarters, .. } => Some(months_back(
                first_of_month(today),
                i64::from(quarters) * 3,
            )),
            Self::All | Self::Nothing | Self::SnapshotName(_) => None,
        }
    }
}

fn plural(n: u32) -> &'static str {
    if n == 1 { "" } else { "s" }
}

impl fmt::Display for RetentionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Nothing => write!(f, "none"),
            Self::WithinHours(n) => write!(f, "{n} hour{}", plural(*n)),
            Self::WithinDays(n) => write!(f, "{n} day{}", plural(*n)),
            Self::WithinWeeks(n) => write!(f, "{n} week{}", plural(*n)),
            Self::Weekday { weeks, weekday } => {
                write!(f, "{weeks} {}{}", weekday_name(*weekday), plural(*weeks))
            }
            Self::WeekdayOfMonth {
                months,
                nth,
                weekday,
            } => write!(
                f,
                "{months} {nth}{} {} of the month",
                ordinal_suffix(u32::from(*nth)),
                weekday_name(*weekday)
            ),
            Self::DayOfMonth { months, day } => {
                write!(f, "{months} {day}{} day of the month", ordinal_suffix(*day))
            }
            Self::DayOfQuarter { quarters, day } => {
                write!(f, "{quarters} {day}{} day of the quarter", ordinal_suffix(*day))
            }
            Self::SnapshotName(suffix) => write!(f, "@{suffix}"),
        }
    }
}

impl FromStr for RetentionRule {
    type Err = ZscError;

    fn from_str(raw: &str) -> Result<Self> {
        let clause = raw.trim();
        let unknown = || ZscError::UnknownClause {
            clause: clause.to_string(),
        };
        let number = |caps: &Captures<'_>, idx: usize| -> Result<u32> {
            caps[idx].parse::<u32>().map_err(|_| unknown())
        };

        match clause {
            "all" => return Ok(Self::All),
            "none" => return Ok(Self::Nothing),
            _ => {}
        }

        if let Some(caps) = captures(&HOURS, clause) {
            return Ok(Self::WithinHours(number(&caps, 1)?));
        }
        if let Some(caps) = captures(&DAYS, clause) {
            return Ok(Self::WithinDays(number(&caps, 1)?));
        }
        if let Some(caps) = captures(&WEEKS, clause) {
            return Ok(Self::WithinWeeks(number(&caps, 1)?));
        }
        if let Some(caps) = captures(&WEEKDAY, clause) {
            let weekday = parse_weekday(&caps[2]).ok_or_else(unknown)?;
            return Ok(Self::Weekday {
                weeks: number(&caps, 1)?,
                weekday,
            });
        }
        if let Some(caps) = captures(&WEEKDAY_OF_MONTH, clause) {
            let nth = number(&caps, 2)?;
            if !(1..=5).contains(&nth) {
                return Err(unknown());
            }
            let weekday = parse_weekday(&caps[3]).ok_or_else(unknown)?;
            return Ok(Self::WeekdayOfMonth {
                months: number(&caps, 1)?,
                nth: u8::try_from(nth).map_err(|_| unknown())?,
                weekday,
            });
        }
        if let Some(caps) = captures(&DAY_OF_MONTH, clause) {
            let day = number(&caps, 2)?;
            if !(1..=31).contains(&day) {
                return Err(unknown());
            }
            return Ok(Self::DayOfMonth {
                months: number(&caps, 1)?,
                day,
            });
        }
        if let Some(caps) = captures(&DAY_OF_QUARTER, clause) {
            let day = number(&caps, 2)?;
            if !(1..=31).contains(&day) {
                return Err(unknown());
            }
            return Ok(Self::DayOfQuarter {
                quarters: number(&caps, 1)?,
                day,
            });
        }
        if let Some(caps) = captures(&SNAPSHOT_NAME, clause) {
            return Ok(Self::SnapshotName(caps[1].to_string()));
        }

        Err(unknown())
    }
}

// ──────────────────── rule set ────────────────────

/// An ordered list of clauses; matching is first-match-wins across clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<RetentionRule>,
}

/// Shared empty rule set ("no limit").
pub static EMPTY_RULES: RuleSet = RuleSet { rules: Vec::new() };

impl RuleSet {
    /// Parse a policy string. A blank string is an explicit empty set.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let rules = raw
            .split(CLAUSE_SEPARATOR)
            .map(str::parse::<RetentionRule>)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    #[must_use]
    pub fn from_rules(rules: Vec<RetentionRule>) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetentionRule> {
        self.rules.iter()
    }

    /// First clause, in declaration order, that matches the snapshot.
    #[must_use]
    pub fn first_match(
        &self,
        name: &str,
        created: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Option<&RetentionRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(name, created, now))
    }
}

impl FromStr for RuleSet {
    type Err = ZscError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, rule) in self.rules.iter().enumerate() {
            if idx > 0 {
                f.write_str(CLAUSE_SEPARATOR)?;
            }
            write!(f, "{rule}")?;
        }
        Ok(())
    }
}

// ──────────────────── file age ────────────────────

/// Maximum file age for the pruner: `<n> day(s)` or `<n> week(s)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxFileAge {
    days: u32,
}

impl MaxFileAge {
    #[must_use]
    pub const fn from_days(days: u32) -> Self {
        Self { days }
    }

    #[must_use]
    pub const fn days(self) -> u32 {
        self.days
    }
}

impl FromStr for MaxFileAge {
    type Err = ZscError;

    fn from_str(raw: &str) -> Result<Self> {
        let expr = raw.trim();
        let unknown = || ZscError::UnknownFileAge {
            expr: expr.to_string(),
        };
        if let Some(caps) = captures(&DAYS, expr) {
            let days = caps[1].parse::<u32>().map_err(|_| unknown())?;
            return Ok(Self { days });
        }
        if let Some(caps) = captures(&WEEKS, expr) {
            let weeks = caps[1].parse::<u32>().map_err(|_| unknown())?;
            let days = weeks.checked_mul(7).ok_or_else(unknown)?;
            return Ok(Self { days });
        }
        Err(unknown())
    }
}

impl fmt::Display for MaxFileAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} day{}", self.days, plural(self.days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// Saturday 2026-10-17, 12:00 local.
    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 17)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn at(y: i32, m: u32, d: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(3, 0, 0)
    }

    fn rule(s: &str) -> RetentionRule {
        s.parse().unwrap()
    }

    #[test]
    fn parses_every_grammar() {
        assert_eq!(rule("all"), RetentionRule::All);
        assert_eq!(rule("none"), RetentionRule::Nothing);
        assert_eq!(rule("6 hours"), RetentionRule::WithinHours(6));
        assert_eq!(rule("1 hour"), RetentionRule::WithinHours(1));
        assert_eq!(rule("7 days"), RetentionRule::WithinDays(7));
        assert_eq!(rule("2 week"), RetentionRule::WithinWeeks(2));
        assert_eq!(
            rule("4 sundays"),
            RetentionRule::Weekday {
                weeks: 4,
                weekday: Weekday::Sun
            }
        );
        assert_eq!(
            rule("12 1st monday of the month"),
            RetentionRule::WeekdayOfMonth {
                months: 12,
                nth: 1,
                weekday: Weekday::Mon
            }
        );
        assert_eq!(
            rule("6 1st day of the month"),
            RetentionRule::DayOfMonth { months: 6, day: 1 }
        );
        assert_eq!(
            rule("8 1st day of the quarter"),
            RetentionRule::DayOfQuarter {
                quarters: 8,
                day: 1
            }
        );
        assert_eq!(
            rule("@before-upgrade"),
            RetentionRule::SnapshotName("before-upgrade".to_string())
        );
    }

    #[test]
    fn unknown_clauses_are_rejected() {
        for bad in [
            "3 fortnights",
            "seven days",
            "2 mondays of the month",
            "1 6th friday of the month",
            "1 0th day of the month",
            "1 32nd day of the month",
            "@two words",
            "ALL",
            "99999999999 days",
        ] {
            let err = bad.parse::<RetentionRule>().unwrap_err();
            assert_eq!(err.code(), "ZSC-1101", "{bad} should be rejected");
        }
    }

    #[test]
    fn policy_with_one_bad_clause_is_rejected() {
        let err = RuleSet::parse("7 days and 2 eons").unwrap_err();
        assert!(err.to_string().contains("2 eons"));
    }

    #[test]
    fn display_round_trips_clause_order_and_count() {
        let raw = "24 hours and 7 days and 4 sundays and 12 1st monday of the month and @keepme";
        let set = RuleSet::parse(raw).unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.to_string(), raw);
        assert_eq!(RuleSet::parse(&set.to_string()).unwrap(), set);
    }

    #[test]
    fn blank_policy_is_explicitly_empty() {
        let set = RuleSet::parse("  ").unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }

    #[test]
    fn hours_compare_full_timestamps() {
        let r = rule("6 hours");
        let fresh = NaiveDate::from_ymd_opt(2026, 10, 17)
            .unwrap()
            .and_hms_opt(7, 0, 0);
        let stale = NaiveDate::from_ymd_opt(2026, 10, 17)
            .unwrap()
            .and_hms_opt(5, 59, 59);
        assert!(r.matches("tank@a", fresh, now()));
        assert!(!r.matches("tank@a", stale, now()));
    }

    #[test]
    fn days_compare_dates_only() {
        let r = rule("2 days");
        // 2026-10-15 at 00:00 is more than 48h ago but the date is in range.
        let midnight = NaiveDate::from_ymd_opt(2026, 10, 15)
            .unwrap()
            .and_hms_opt(0, 0, 0);
        assert!(r.matches("tank@a", midnight, now()));
        assert!(!r.matches("tank@a", at(2026, 10, 14), now()));
    }

    #[test]
    fn weeks_span_seven_days_each() {
        let r = rule("1 week");
        assert!(r.matches("tank@a", at(2026, 10, 10), now()));
        assert!(!r.matches("tank@a", at(2026, 10, 9), now()));
    }

    #[test]
    fn weekday_clause_requires_day_and_window() {
        let r = rule("2 monday");
        // Mondays: 2026-10-12, 2026-10-05, 2026-09-28.
        assert!(r.matches("tank@a", at(2026, 10, 12), now()));
        assert!(r.matches("tank@a", at(2026, 10, 5), now()));
        assert!(!r.matches("tank@a", at(2026, 10, 13), now()), "tuesday");
        assert!(!r.matches("tank@a", at(2026, 9, 28), now()), "three weeks ago");
    }

    #[test]
    fn first_monday_of_the_month() {
        let r = rule("1 1st monday of the month");
        assert!(r.matches("tank@a", at(2026, 10, 5), now()));
        assert!(!r.matches("tank@a", at(2026, 10, 12), now()), "second monday");
        // September's first Monday is outside a one-month window once October's passed.
        assert!(!r.matches("tank@a", at(2026, 9, 7), now()));
    }

    #[test]
    fn weekday_of_month_shifts_back_until_occurrence() {
        // 2026-10-03 is a Saturday before October's first Monday (10-05).
        let early = NaiveDate::from_ymd_opt(2026, 10, 3)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let r = rule("1 1st monday of the month");
        assert!(r.matches("tank@a", at(2026, 9, 7), early));
        assert!(!r.matches("tank@a", at(2026, 8, 3), early));
    }

    #[test]
    fn day_of_month_window() {
        let r = rule("2 1st day of the month");
        assert!(r.matches("tank@a", at(2026, 10, 1), now()));
        assert!(r.matches("tank@a", at(2026, 9, 1), now()));
        assert!(!r.matches("tank@a", at(2026, 8, 1), now()));
        assert!(!r.matches("tank@a", at(2026, 10, 2), now()));
    }

    #[test]
    fn day_of_quarter_window() {
        let r = rule("1 1st day of the quarter");
        // Window starts 2026-07-01; quarter starts are Jan/Apr/Jul/Oct.
        assert!(r.matches("tank@a", at(2026, 10, 1), now()));
        assert!(r.matches("tank@a", at(2026, 7, 1), now()));
        assert!(!r.matches("tank@a", at(2026, 8, 1), now()), "not a quarter start");
        assert!(!r.matches("tank@a", at(2026, 4, 1), now()), "outside window");
    }

    #[test]
    fn snapshot_name_clause_matches_suffix_exactly() {
        let r = rule("@golden");
        assert!(r.matches("tank/db@golden", None, now()));
        assert!(!r.matches("tank/db@golden-2", None, now()));
        assert!(!r.matches("tank/golden", None, now()));
    }

    #[test]
    fn unknown_creation_never_matches_time_clauses() {
        assert!(!rule("9999 days").matches("tank@a", None, now()));
        assert!(rule("all").matches("tank@a", None, now()));
    }

    #[test]
    fn first_match_respects_declaration_order() {
        let set = RuleSet::parse("@x and all").unwrap();
        assert_eq!(
            set.first_match("tank@x", None, now()),
            Some(&RetentionRule::SnapshotName("x".to_string()))
        );
        assert_eq!(set.first_match("tank@y", None, now()), Some(&RetentionRule::All));
        assert_eq!(RuleSet::parse("none").unwrap().first_match("tank@y", None, now()), None);
    }

    #[test]
    fn horizon_reports_window_start() {
        assert_eq!(
            rule("2 weeks").horizon(now()),
            NaiveDate::from_ymd_opt(2026, 10, 3)
        );
        assert_eq!(rule("all").horizon(now()), None);
    }

    #[test]
    fn file_age_expressions() {
        assert_eq!("30 days".parse::<MaxFileAge>().unwrap().days(), 30);
        assert_eq!("1 day".parse::<MaxFileAge>().unwrap().days(), 1);
        assert_eq!("2 weeks".parse::<MaxFileAge>().unwrap().days(), 14);
        let err = "3 months".parse::<MaxFileAge>().unwrap_err();
        assert_eq!(err.code(), "ZSC-1103");
    }
}
