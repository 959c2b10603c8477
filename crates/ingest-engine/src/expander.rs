//! Weekly recurrence expansion -- converts a master event into concrete instances.
//!
//! Supports `FREQ=WEEKLY` with `INTERVAL`, `BYDAY`, `WKST`, and an `UNTIL` or
//! `COUNT` terminator. Expansion is window-anchored: unbounded and
//! UNTIL-terminated series jump straight to the period containing the window
//! start, so a series authored years ago costs no more than a new one.
//!
//! All arithmetic is done on wall-clock time in the master's zone and each
//! occurrence is pinned to an instant afterwards, so 09:00 stays 09:00 across
//! DST transitions.

use std::collections::HashSet;
use std::fmt;

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc, Weekday,
};
use chrono_tz::Tz;

use crate::dst::DstPolicy;
use crate::error::{IngestError, Result};
use crate::model::{MasterEvent, OccurrenceInstance, Window};
use crate::timezone::DateValue;

/// Largest accepted `COUNT`.
pub const MAX_COUNT: i64 = 999;

/// Largest accepted `INTERVAL` (ten years of weeks).
pub const MAX_INTERVAL: i64 = 520;

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frequency {
    Weekly,
    /// Any other FREQ value; rejected at expansion time.
    Unsupported(String),
}

/// An order-independent set of weekdays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Day offsets from `week_start`, ascending.
    fn offsets_from(&self, week_start: Weekday) -> Vec<i64> {
        let mut offsets: Vec<i64> = WEEKDAYS
            .iter()
            .filter(|d| self.contains(**d))
            .map(|d| days_after(week_start, *d))
            .collect();
        offsets.sort_unstable();
        offsets
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = WeekdaySet::default();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

/// A parsed, not yet validated RRULE.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: i64,
    /// Empty when the rule carries no BYDAY.
    pub weekdays: WeekdaySet,
    pub week_start: Weekday,
    pub until: Option<DateValue>,
    pub count: Option<i64>,
}

/// How a validated series ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// Inclusive end instant.
    Until(DateTime<Utc>),
    Count(u32),
    /// Clamped by the expansion window.
    Unbounded,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Weekly => f.write_str("WEEKLY"),
            Frequency::Unsupported(other) => f.write_str(other),
        }
    }
}

impl RecurrenceRule {
    /// Parse the value of an RRULE property (e.g. `FREQ=WEEKLY;BYDAY=MO,WE`).
    ///
    /// Only syntax is checked here; parameter ranges are checked by
    /// [`RecurrenceRule::validate`] so the failure surfaces with the master's
    /// expansion.
    ///
    /// # Errors
    /// Returns a description of the first malformed part.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let mut rule = RecurrenceRule {
            frequency: Frequency::Unsupported(String::new()),
            interval: 1,
            weekdays: WeekdaySet::default(),
            week_start: Weekday::Mon,
            until: None,
            count: None,
        };
        let mut saw_freq = false;

        for part in raw.trim().split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| format!("malformed rule part {part:?}"))?;
            let value = value.trim().to_ascii_uppercase();
            match key.trim().to_ascii_uppercase().as_str() {
                "FREQ" => {
                    saw_freq = true;
                    rule.frequency = if value == "WEEKLY" {
                        Frequency::Weekly
                    } else {
                        Frequency::Unsupported(value)
                    };
                }
                "INTERVAL" => {
                    rule.interval = value
                        .parse()
                        .map_err(|_| format!("INTERVAL is not an integer: {value:?}"))?;
                }
                "COUNT" => {
                    rule.count = Some(
                        value
                            .parse()
                            .map_err(|_| format!("COUNT is not an integer: {value:?}"))?,
                    );
                }
                "UNTIL" => {
                    rule.until =
                        Some(DateValue::parse("UNTIL", &value).map_err(|e| e.to_string())?);
                }
                "BYDAY" => {
                    for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                        rule.weekdays.insert(parse_weekday(token)?);
                    }
                }
                "WKST" => rule.week_start = parse_weekday(&value)?,
                // Other parts (BYHOUR, BYSETPOS, ...) do not narrow a weekly
                // rule in the feeds we ingest.
                _ => {}
            }
        }

        if !saw_freq {
            return Err("rule has no FREQ".to_string());
        }
        Ok(rule)
    }

    /// Check parameter ranges and resolve the terminator in `tz`.
    ///
    /// # Errors
    /// Returns a description of the violated constraint.
    pub fn validate(&self, tz: &Tz, policy: DstPolicy) -> std::result::Result<Terminator, String> {
        if let Frequency::Unsupported(freq) = &self.frequency {
            return Err(format!("unsupported frequency {freq}"));
        }
        if !(1..=MAX_INTERVAL).contains(&self.interval) {
            return Err(format!(
                "INTERVAL must be within 1..={MAX_INTERVAL}, got {}",
                self.interval
            ));
        }
        match (self.count, self.until) {
            (Some(_), Some(_)) => Err("COUNT and UNTIL are mutually exclusive".to_string()),
            (Some(count), None) => {
                if !(1..=MAX_COUNT).contains(&count) {
                    return Err(format!("COUNT must be within 1..={MAX_COUNT}, got {count}"));
                }
                Ok(Terminator::Count(count as u32))
            }
            (None, Some(until)) => {
                let instant = match until {
                    DateValue::Utc(dt) => Some(dt),
                    DateValue::Local(ndt) => {
                        policy.localize(tz, ndt).map(|dt| dt.with_timezone(&Utc))
                    }
                    // A DATE until includes the whole day.
                    DateValue::Date(d) => d
                        .succ_opt()
                        .and_then(|next| policy.localize(tz, next.and_time(NaiveTime::MIN)))
                        .map(|dt| dt.with_timezone(&Utc) - Duration::seconds(1)),
                };
                instant
                    .map(Terminator::Until)
                    .ok_or_else(|| "UNTIL is not a representable local time".to_string())
            }
            (None, None) => Ok(Terminator::Unbounded),
        }
    }
}

fn parse_weekday(token: &str) -> std::result::Result<Weekday, String> {
    match token {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        t if t.len() > 2
            && t[..t.len() - 2]
                .chars()
                .all(|c| c.is_ascii_digit() || c == '+' || c == '-') =>
        {
            Err(format!("ordinal weekday {t:?} is not valid in a weekly rule"))
        }
        t => Err(format!("unknown weekday {t:?}")),
    }
}

fn days_after(week_start: Weekday, day: Weekday) -> i64 {
    (i64::from(day.num_days_from_monday()) - i64::from(week_start.num_days_from_monday()))
        .rem_euclid(7)
}

/// Lazy, time-ordered occurrences of one master inside a window.
///
/// Pure: driving the iterator touches nothing but its own state, so many
/// can run side by side. Returning `None` means the series is exhausted for
/// this window.
#[derive(Debug, Clone)]
pub struct Occurrences<'a> {
    master: &'a MasterEvent,
    window: Window,
    policy: DstPolicy,
    first_local: NaiveDateTime,
    time_of_day: NaiveTime,
    anchor_week: NaiveDate,
    last_date: NaiveDate,
    period_days: i64,
    offsets: Vec<i64>,
    period: i64,
    slot: usize,
    terminator: Terminator,
    generated: u32,
    excluded: HashSet<NaiveDate>,
    done: bool,
}

impl<'a> Occurrences<'a> {
    /// Validate the master's rule and prepare iteration over `window`.
    ///
    /// # Errors
    /// Returns `IngestError::RecurrenceValidation` if the rule cannot be expanded.
    pub fn new(master: &'a MasterEvent, window: Window, policy: DstPolicy) -> Result<Self> {
        let rule = &master.rule;
        let tz = master.tz;
        let terminator =
            rule.validate(&tz, policy)
                .map_err(|reason| IngestError::RecurrenceValidation {
                    uid: master.uid.to_string(),
                    reason,
                })?;

        let first_local = master.start.naive_local();
        let weekdays = if rule.weekdays.is_empty() {
            std::iter::once(first_local.weekday()).collect()
        } else {
            rule.weekdays
        };
        let anchor_week = first_local.date()
            - Duration::days(days_after(rule.week_start, first_local.weekday()));
        let period_days = rule.interval * 7;

        // COUNT is measured from the series start, so only uncounted rules
        // may skip ahead to the window.
        let window_first = window.start.with_timezone(&tz).date_naive();
        let period = match terminator {
            Terminator::Count(_) => 0,
            _ => ((window_first - anchor_week).num_days() / period_days).max(0),
        };

        Ok(Self {
            master,
            window,
            policy,
            first_local,
            time_of_day: first_local.time(),
            anchor_week,
            last_date: window.end.with_timezone(&tz).date_naive(),
            period_days,
            offsets: weekdays.offsets_from(rule.week_start),
            period,
            slot: 0,
            terminator,
            generated: 0,
            excluded: master
                .exdates
                .iter()
                .map(|d| d.date_in(&tz, policy))
                .collect(),
            done: false,
        })
    }

    fn finish(&mut self) -> Option<OccurrenceInstance> {
        self.done = true;
        None
    }
}

impl Iterator for Occurrences<'_> {
    type Item = OccurrenceInstance;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.offsets.is_empty() {
                return self.finish();
            }
            if self.slot == self.offsets.len() {
                self.period += 1;
                self.slot = 0;
            }

            let Some(week) = self
                .period
                .checked_mul(self.period_days)
                .and_then(TimeDelta::try_days)
                .and_then(|span| self.anchor_week.checked_add_signed(span))
            else {
                return self.finish();
            };
            if week > self.last_date {
                return self.finish();
            }
            let offset = Duration::days(self.offsets[self.slot]);
            let Some(date) = week.checked_add_signed(offset) else {
                return self.finish();
            };
            self.slot += 1;

            let local = date.and_time(self.time_of_day);
            if local < self.first_local {
                continue;
            }
            let Some(start) = self.policy.localize(&self.master.tz, local) else {
                continue;
            };
            let start_utc = start.with_timezone(&Utc);

            match self.terminator {
                Terminator::Until(until) if start_utc > until => return self.finish(),
                Terminator::Count(limit) => {
                    if self.generated == limit {
                        return self.finish();
                    }
                    self.generated += 1;
                }
                _ => {}
            }

            if start_utc < self.window.start {
                continue;
            }
            if start_utc > self.window.end {
                return self.finish();
            }
            if self.excluded.contains(&start.date_naive()) {
                continue;
            }

            let Some(end) = start.checked_add_signed(self.master.duration) else {
                return self.finish();
            };
            return Some(OccurrenceInstance {
                uid: self.master.uid.clone(),
                start,
                end,
                all_day: self.master.all_day,
                record: self.master.record.clone(),
            });
        }
    }
}

/// Expand a master into every occurrence inside `window`.
///
/// # Errors
/// Returns `IngestError::RecurrenceValidation` if the rule cannot be expanded.
pub fn expand(
    master: &MasterEvent,
    window: Window,
    policy: DstPolicy,
) -> Result<Vec<OccurrenceInstance>> {
    Ok(Occurrences::new(master, window, policy)?.collect())
}
