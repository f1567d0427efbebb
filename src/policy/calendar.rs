//! Calendar arithmetic used by the retention clause matcher.
//!
//! All dates are local calendar dates; the matcher never reasons in UTC.

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};

/// First day of the month containing `date`.
#[must_use]
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Shift a first-of-month date `months` back, wrapping across years.
///
/// Negative values shift forward. Shifts that leave chrono's supported range
/// clamp to `NaiveDate::MIN` / `NaiveDate::MAX`, which only makes absurdly
/// large counts behave as "everything".
#[must_use]
pub fn months_back(first: NaiveDate, months: i64) -> NaiveDate {
    let magnitude = u32::try_from(months.unsigned_abs()).unwrap_or(u32::MAX);
    if months >= 0 {
        first
            .checked_sub_months(Months::new(magnitude))
            .unwrap_or(NaiveDate::MIN)
    } else {
        first
            .checked_add_months(Months::new(magnitude))
            .unwrap_or(NaiveDate::MAX)
    }
}

/// `date` minus `days` calendar days, clamped at `NaiveDate::MIN`.
#[must_use]
pub fn days_back(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(days))
        .unwrap_or(NaiveDate::MIN)
}

/// Occurrence bucket of a day-of-month: 1–7 → 1, 8–14 → 2, …, 29+ → 5.
#[must_use]
pub fn week_of_month(day_of_month: u32) -> u32 {
    (day_of_month.saturating_sub(1) / 7 + 1).min(5)
}

/// Date of the `nth` occurrence of `weekday` in the given month, if the month has one.
#[must_use]
pub fn nth_weekday_of_month(year: i32, month: u32, weekday: Weekday, nth: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, nth)
}

/// Whether the `nth` `weekday` of `today`'s month falls on or before `today`.
///
/// Months without such an occurrence (a fifth Friday, say) report `false`.
#[must_use]
pub fn occurrence_has_passed(today: NaiveDate, weekday: Weekday, nth: u8) -> bool {
    nth_weekday_of_month(today.year(), today.month(), weekday, nth)
        .is_some_and(|occurrence| occurrence <= today)
}

/// Lowercase English weekday name as written in policy strings.
#[must_use]
pub const fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Parse a lowercase English weekday name.
#[must_use]
pub fn parse_weekday(name: &str) -> Option<Weekday> {
    match name {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// English ordinal suffix for `n` (1st, 2nd, 3rd, 4th, 11th, 21st, …).
#[must_use]
pub const fn ordinal_suffix(n: u32) -> &'static str {
    match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    }
}
