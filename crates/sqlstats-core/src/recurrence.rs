//! Recurrence expressions for scheduled jobs.
//!
//! Accepts the `@hourly`-style keywords and cron expressions with 5 fields
//! (`min hour dom month dow`), 6 fields (leading seconds) or 7 fields
//! (leading seconds, trailing year). All evaluation happens in UTC.
//!
//! Field syntax: `*`, `?` (day-of-month / day-of-week only), `n`, `a-b`,
//! `a,b,c`, `*/n` and `a-b/n`. Day-of-week accepts 0-7 with both 0 and 7
//! meaning Sunday. When day-of-month and day-of-week are both restricted a
//! day matches if either does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, Timelike, Utc};

use crate::error::ScheduleError;

/// Default recurrence for the compaction schedule.
pub const HOURLY: &str = "@hourly";

/// Upper bound on the number of days scanned for a matching date. Covers
/// the eight-year gap between some leap days.
const MAX_DAY_SCAN: u32 = 366 * 9;

const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 2999;

/// A parsed recurrence expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    raw: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
    /// Sorted allowed years; `None` means every year.
    years: Option<Vec<i32>>,
}

/// Bitmask of allowed values for one cron field (all fields fit in 0..64).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn first_at_or_after(self, floor: u32, max: u32) -> Option<u32> {
        (floor..=max).find(|v| self.contains(*v))
    }
}

impl Recurrence {
    /// Parse a recurrence expression.
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let trimmed = raw.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@hourly" => "0 0 * * * *".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@weekly" => "0 0 0 * * 0".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            other if other.starts_with('@') => {
                return Err(invalid(trimmed, "unknown keyword"));
            }
            _ => trimmed.to_string(),
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        let (fields, year) = match parts.len() {
            5 => {
                let mut fields = vec!["0"];
                fields.extend_from_slice(&parts);
                (fields, None)
            }
            6 => (parts.clone(), None),
            7 => (parts[..6].to_vec(), Some(parts[6])),
            n => {
                return Err(invalid(
                    trimmed,
                    &format!("expected a keyword or 5, 6 or 7 fields, found {n}"),
                ));
            }
        };

        let (seconds, _) = parse_field(trimmed, fields[0], 0, 59, false)?;
        let (minutes, _) = parse_field(trimmed, fields[1], 0, 59, false)?;
        let (hours, _) = parse_field(trimmed, fields[2], 0, 23, false)?;
        let (days_of_month, dom_restricted) = parse_field(trimmed, fields[3], 1, 31, true)?;
        let (months, _) = parse_field(trimmed, fields[4], 1, 12, false)?;
        let (mut days_of_week, dow_restricted) = parse_field(trimmed, fields[5], 0, 7, true)?;
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 & !(1 << 7)) | 1);
        }
        let years = year.map(|y| parse_years(trimmed, y)).transpose()?.flatten();

        Ok(Self {
            raw: trimmed.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
            years,
        })
    }

    /// The expression as written (trimmed).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// First occurrence strictly after `after`, or `None` if the expression
    /// never fires again.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_nanosecond(0)? + ChronoDuration::seconds(1);
        let mut date = start.date_naive();
        let mut first_day = true;

        for _ in 0..MAX_DAY_SCAN {
            if let Some(years) = &self.years {
                let year = date.year();
                if !years.contains(&year) {
                    let next_year = years.iter().copied().find(|y| *y > year)?;
                    date = NaiveDate::from_ymd_opt(next_year, 1, 1)?;
                    first_day = false;
                    continue;
                }
            }

            if self.day_matches(date) {
                let floor = if first_day { start.time() } else { NaiveTime::MIN };
                if let Some(time) = self.first_time_at_or_after(floor) {
                    return Some(date.and_time(time).and_utc());
                }
            }

            date = date.succ_opt()?;
            first_day = false;
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom_matches = self.days_of_month.contains(date.day());
        let dow_matches = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_matches || dow_matches,
            _ => dom_matches && dow_matches,
        }
    }

    fn first_time_at_or_after(&self, floor: NaiveTime) -> Option<NaiveTime> {
        let (floor_h, floor_m, floor_s) = (floor.hour(), floor.minute(), floor.second());
        for hour in floor_h..24 {
            if !self.hours.contains(hour) {
                continue;
            }
            let minute_floor = if hour == floor_h { floor_m } else { 0 };
            for minute in minute_floor..60 {
                if !self.minutes.contains(minute) {
                    continue;
                }
                let second_floor = if hour == floor_h && minute == floor_m {
                    floor_s
                } else {
                    0
                };
                if let Some(second) = self.seconds.first_at_or_after(second_floor, 59) {
                    return NaiveTime::from_hms_opt(hour, minute, second);
                }
            }
        }
        None
    }
}

impl FromStr for Recurrence {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn invalid(expr: &str, reason: &str) -> ScheduleError {
    ScheduleError::InvalidRecurrence {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse one cron field. Returns the allowed set and whether the field
/// restricts anything (i.e. is not `*` / `?`).
fn parse_field(
    expr: &str,
    raw: &str,
    min: u32,
    max: u32,
    allow_question: bool,
) -> Result<(FieldSet, bool), ScheduleError> {
    if raw == "*" || (allow_question && raw == "?") {
        return Ok((range_set(min, max, 1), false));
    }
    if raw == "?" {
        return Err(invalid(expr, "'?' is only allowed for day-of-month and day-of-week"));
    }

    let mut set = FieldSet(0);
    for part in raw.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(expr, &format!("invalid step in '{part}'")))?;
                if step == 0 {
                    return Err(invalid(expr, &format!("step must be positive in '{part}'")));
                }
                (base, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            let lo = parse_value(expr, a, min, max)?;
            let hi = parse_value(expr, b, min, max)?;
            if lo > hi {
                return Err(invalid(expr, &format!("descending range '{base}'")));
            }
            (lo, hi)
        } else {
            let value = parse_value(expr, base, min, max)?;
            if step.is_some() { (value, max) } else { (value, value) }
        };

        set = FieldSet(set.0 | range_set(lo, hi, step.unwrap_or(1)).0);
    }
    Ok((set, true))
}

fn parse_value(expr: &str, raw: &str, min: u32, max: u32) -> Result<u32, ScheduleError> {
    let value: u32 = raw
        .parse()
        .map_err(|_| invalid(expr, &format!("invalid field value '{raw}'")))?;
    if value < min || value > max {
        return Err(invalid(
            expr,
            &format!("field value '{raw}' out of range ({min}-{max})"),
        ));
    }
    Ok(value)
}

fn range_set(lo: u32, hi: u32, step: u32) -> FieldSet {
    let mut bits = 0u64;
    let mut value = lo;
    while value <= hi {
        bits |= 1 << value;
        match value.checked_add(step) {
            Some(next) => value = next,
            None => break,
        }
    }
    FieldSet(bits)
}

fn parse_years(expr: &str, raw: &str) -> Result<Option<Vec<i32>>, ScheduleError> {
    if raw == "*" || raw == "?" {
        return Ok(None);
    }
    let parse_year = |s: &str| -> Result<i32, ScheduleError> {
        let year: i32 = s
            .parse()
            .map_err(|_| invalid(expr, &format!("invalid year '{s}'")))?;
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(invalid(
                expr,
                &format!("year '{s}' out of range ({MIN_YEAR}-{MAX_YEAR})"),
            ));
        }
        Ok(year)
    };

    let mut years = Vec::new();
    for part in raw.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: i32 = step
                    .parse()
                    .map_err(|_| invalid(expr, &format!("invalid step in '{part}'")))?;
                if step <= 0 {
                    return Err(invalid(expr, &format!("step must be positive in '{part}'")));
                }
                (base, Some(step))
            }
            None => (part, None),
        };
        let (lo, hi) = if base == "*" {
            (MIN_YEAR, MAX_YEAR)
        } else if let Some((a, b)) = base.split_once('-') {
            (parse_year(a)?, parse_year(b)?)
        } else {
            let year = parse_year(base)?;
            if step.is_some() { (year, MAX_YEAR) } else { (year, year) }
        };
        if lo > hi {
            return Err(invalid(expr, &format!("descending range '{base}'")));
        }
        years.extend((lo..=hi).step_by(step.unwrap_or(1) as usize));
    }
    years.sort_unstable();
    years.dedup();
    Ok(Some(years))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn hourly_keyword_fires_on_the_hour() {
        let rec = Recurrence::parse("@hourly").unwrap();
        assert_eq!(
            rec.next_after(utc(2026, 3, 1, 10, 15, 30)),
            Some(utc(2026, 3, 1, 11, 0, 0))
        );
        // Strictly after: exactly on the hour moves to the next hour.
        assert_eq!(
            rec.next_after(utc(2026, 3, 1, 11, 0, 0)),
            Some(utc(2026, 3, 1, 12, 0, 0))
        );
        let first = rec.next_after(utc(2026, 3, 1, 10, 0, 0)).unwrap();
        assert_eq!(rec.next_after(first).unwrap() - first, ChronoDuration::hours(1));
    }

    #[test]
    fn weekly_keyword_fires_sunday_midnight() {
        let rec = Recurrence::parse("@weekly").unwrap();
        // 2026-03-04 is a Wednesday.
        let next = rec.next_after(utc(2026, 3, 4, 12, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 3, 8, 0, 0, 0));
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
        assert_eq!(rec.next_after(next).unwrap() - next, ChronoDuration::days(7));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert!(Recurrence::parse("@HOURLY").is_ok());
        assert!(Recurrence::parse("  @Daily ").is_ok());
        assert!(Recurrence::parse("@fortnightly").is_err());
    }

    #[test]
    fn five_field_cron() {
        let rec = Recurrence::parse("*/15 * * * *").unwrap();
        assert_eq!(
            rec.next_after(utc(2026, 1, 1, 0, 7, 0)),
            Some(utc(2026, 1, 1, 0, 15, 0))
        );
        assert_eq!(
            rec.next_after(utc(2026, 1, 1, 0, 15, 0)),
            Some(utc(2026, 1, 1, 0, 30, 0))
        );
    }

    #[test]
    fn six_field_cron_with_seconds() {
        let rec = Recurrence::parse("30 0 12 * * *").unwrap();
        assert_eq!(
            rec.next_after(utc(2026, 5, 5, 12, 0, 30)),
            Some(utc(2026, 5, 6, 12, 0, 30))
        );
    }

    #[test]
    fn seven_field_cron_with_year() {
        let rec = Recurrence::parse("0 59 23 24 12 ? 2099").unwrap();
        let next = rec.next_after(utc(2026, 10, 17, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2099, 12, 24, 23, 59, 0));
        assert_eq!(rec.next_after(next), None);
    }

    #[test]
    fn past_year_never_fires() {
        let rec = Recurrence::parse("0 0 0 1 1 ? 2001").unwrap();
        assert_eq!(rec.next_after(utc(2026, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn day_of_month_or_day_of_week() {
        // 1st of the month OR any Monday.
        let rec = Recurrence::parse("0 0 1 * 1").unwrap();
        // 2026-03-02 is a Monday.
        assert_eq!(
            rec.next_after(utc(2026, 2, 27, 0, 0, 0)),
            Some(utc(2026, 3, 1, 0, 0, 0))
        );
        assert_eq!(
            rec.next_after(utc(2026, 3, 1, 0, 0, 0)),
            Some(utc(2026, 3, 2, 0, 0, 0))
        );
    }

    #[test]
    fn sunday_as_seven() {
        let rec = Recurrence::parse("0 0 * * 7").unwrap();
        let next = rec.next_after(utc(2026, 3, 4, 0, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
    }

    #[test]
    fn leap_day_is_found() {
        let rec = Recurrence::parse("0 0 29 2 *").unwrap();
        assert_eq!(
            rec.next_after(utc(2026, 3, 1, 0, 0, 0)),
            Some(utc(2028, 2, 29, 0, 0, 0))
        );
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for raw in [
            "",
            "* * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "? * * * *",
            "*/0 * * * *",
            "5-1 * * * *",
            "0 0 0 1 1 ? 1800",
            "a * * * *",
        ] {
            let err = Recurrence::parse(raw).unwrap_err();
            assert!(
                matches!(err, ScheduleError::InvalidRecurrence { .. }),
                "expected rejection for {raw:?}"
            );
        }
    }

    #[test]
    fn display_round_trips_raw_text() {
        let rec: Recurrence = " 0 59 23 24 12 ? 2099 ".parse().unwrap();
        assert_eq!(rec.to_string(), "0 59 23 24 12 ? 2099");
        assert_eq!(rec.as_str(), "0 59 23 24 12 ? 2099");
    }

    proptest! {
        #[test]
        fn next_after_is_strictly_later(
            offset_secs in 0_i64..(10 * 365 * 86_400),
            expr in prop_oneof![
                Just("@hourly"),
                Just("@daily"),
                Just("@weekly"),
                Just("*/7 3-9 * * *"),
                Just("15 10 1,15 * *"),
                Just("0 0 12 * * 1-5"),
            ],
        ) {
            let rec = Recurrence::parse(expr).unwrap();
            let base = utc(2020, 1, 1, 0, 0, 0) + ChronoDuration::seconds(offset_secs);
            let next = rec.next_after(base).unwrap();
            prop_assert!(next > base);
            let again = rec.next_after(next).unwrap();
            prop_assert!(again > next);
        }
    }
}
