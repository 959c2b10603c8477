//! Data model for parsed components, recurring templates, and output instances.
//!
//! Raw [`CalendarComponent`]s come out of the parser; [`classify`] turns each
//! VEVENT into a [`Classified`] record. Event-like data is normalized into the
//! tagged [`EventRecord`] so downstream code matches on the variant instead of
//! probing optional fields.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{IngestError, Result};
use crate::expander::RecurrenceRule;
use crate::timezone::{parse_date_list, parse_zoned, TimezoneResolver, ZonedValue};

/// Subject rendered for placeholder records.
pub const UNTITLED: &str = "(untitled)";

/// One `NAME;PARAM=VALUE:value` content line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub params: Vec<(String, String)>,
    pub value: String,
}

impl Property {
    /// First value of the named parameter (names are stored upper-cased).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Component type tag from `BEGIN:<kind>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Event,
    Todo,
    Journal,
    FreeBusy,
    Timezone,
    Other(String),
}

impl ComponentKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "VEVENT" => ComponentKind::Event,
            "VTODO" => ComponentKind::Todo,
            "VJOURNAL" => ComponentKind::Journal,
            "VFREEBUSY" => ComponentKind::FreeBusy,
            "VTIMEZONE" => ComponentKind::Timezone,
            other => ComponentKind::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ComponentKind::Event => "VEVENT",
            ComponentKind::Todo => "VTODO",
            ComponentKind::Journal => "VJOURNAL",
            ComponentKind::FreeBusy => "VFREEBUSY",
            ComponentKind::Timezone => "VTIMEZONE",
            ComponentKind::Other(name) => name,
        }
    }
}

/// A raw parsed block.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarComponent {
    pub kind: ComponentKind,
    pub properties: Vec<Property>,
    /// Name of the feed this block came from.
    pub source: Arc<str>,
    /// 1-based line number of the `BEGIN` line.
    pub line: usize,
}

impl CalendarComponent {
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Property> + 'a {
        self.properties.iter().filter(move |p| p.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|p| p.value.as_str())
    }

    pub fn uid(&self) -> Option<&str> {
        self.value("UID").map(str::trim).filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

/// Non-time properties of a complete event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventDetails {
    pub subject: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub attendees: Vec<String>,
    pub status: EventStatus,
    pub sequence: u32,
}

impl EventDetails {
    /// Ranking used when two instances share an identity.
    pub fn richness(&self) -> usize {
        usize::from(self.location.is_some())
            + usize::from(self.description.is_some())
            + self.attendees.len()
    }
}

/// Normalized event-like data: a full record or a placeholder for blocks
/// that carried too little to describe (no SUMMARY).
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Full(EventDetails),
    Placeholder { status: EventStatus },
}

impl EventRecord {
    pub fn subject(&self) -> &str {
        match self {
            EventRecord::Full(details) => &details.subject,
            EventRecord::Placeholder { .. } => UNTITLED,
        }
    }

    pub fn status(&self) -> EventStatus {
        match self {
            EventRecord::Full(details) => details.status,
            EventRecord::Placeholder { status } => *status,
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            EventRecord::Full(details) => details.sequence,
            EventRecord::Placeholder { .. } => 0,
        }
    }

    /// Placeholders always rank below any full record.
    pub fn richness(&self) -> usize {
        match self {
            EventRecord::Full(details) => 1 + details.richness(),
            EventRecord::Placeholder { .. } => 0,
        }
    }
}

/// The materialization window, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Saturates at the latest representable instant.
    pub fn from_days(start: DateTime<Utc>, days: u32) -> Self {
        let end = TimeDelta::try_days(i64::from(days))
            .and_then(|span| start.checked_add_signed(span))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { start, end }
    }

    pub fn contains<T: chrono::TimeZone>(&self, instant: &DateTime<T>) -> bool {
        let utc = instant.with_timezone(&Utc);
        self.start <= utc && utc <= self.end
    }
}

/// A recurring template.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterEvent {
    pub uid: Arc<str>,
    pub start: DateTime<Tz>,
    pub duration: Duration,
    pub tz: Tz,
    pub all_day: bool,
    pub rule: RecurrenceRule,
    /// Each resolved against its own TZID; compared by date in `tz`.
    pub exdates: Vec<ZonedValue>,
    pub record: Arc<EventRecord>,
}

/// A concrete instance generated from a master.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceInstance {
    pub uid: Arc<str>,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    pub all_day: bool,
    pub record: Arc<EventRecord>,
}

/// An explicit replacement for one occurrence of a master.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideInstance {
    pub uid: Arc<str>,
    /// The occurrence start this override replaces, normalized to UTC.
    pub original_start: DateTime<Utc>,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    pub all_day: bool,
    pub record: Arc<EventRecord>,
}

/// A non-recurring event.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleEvent {
    pub uid: Arc<str>,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    pub all_day: bool,
    pub record: Arc<EventRecord>,
}

/// Result of classifying one component.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Master(MasterEvent),
    Override(OverrideInstance),
    Single(SingleEvent),
    /// A component the pipeline does not materialize (VTODO, VTIMEZONE, ...).
    Other(ComponentKind),
}

/// A classified component plus any recoverable warnings raised on the way.
#[derive(Debug, Clone)]
pub struct Classification {
    pub item: Classified,
    pub warnings: Vec<String>,
}

/// A reconciled event handed to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventInstance {
    pub uid: String,
    pub subject: String,
    #[serde(serialize_with = "serialize_zoned")]
    pub start: DateTime<Tz>,
    #[serde(serialize_with = "serialize_zoned")]
    pub end: DateTime<Tz>,
    pub timezone: String,
    pub all_day: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<String>,
    pub is_override: bool,
}

fn serialize_zoned<S: serde::Serializer>(
    dt: &DateTime<Tz>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&dt.to_rfc3339())
}

/// Classify a parsed component into a master, override, single, or other.
///
/// # Errors
/// Returns `IngestError::Structural` for a VEVENT without UID or DTSTART,
/// `IngestError::InvalidValue` for unparseable date values, and
/// `IngestError::RecurrenceValidation` for a syntactically broken RRULE.
pub fn classify(
    component: &CalendarComponent,
    resolver: &mut TimezoneResolver,
) -> Result<Classification> {
    if component.kind != ComponentKind::Event {
        return Ok(Classification {
            item: Classified::Other(component.kind.clone()),
            warnings: Vec::new(),
        });
    }

    let mut warnings = Vec::new();
    let uid: Arc<str> = component
        .uid()
        .ok_or_else(|| IngestError::Structural {
            line: component.line,
            message: "VEVENT without UID".to_string(),
        })?
        .into();

    let dtstart = component.get("DTSTART").ok_or_else(|| IngestError::Structural {
        line: component.line,
        message: format!("VEVENT {uid} without DTSTART"),
    })?;
    let start_value = parse_zoned(dtstart, resolver)?;
    if start_value.fell_back {
        warnings.push(format!(
            "{uid}: unknown timezone {:?}, using {}",
            dtstart.param("TZID").unwrap_or_default(),
            resolver.fallback().name()
        ));
    }
    let tz = start_value.tz;
    let policy = resolver.dst_policy();
    let all_day = start_value.value.is_date();
    let start = start_value
        .instant(policy)
        .ok_or_else(|| IngestError::InvalidValue {
            property: "DTSTART".to_string(),
            value: dtstart.value.clone(),
        })?;

    let duration = event_duration(component, resolver, &start, all_day)?;
    let end = start
        .checked_add_signed(duration)
        .ok_or_else(|| IngestError::InvalidValue {
            property: "DURATION".to_string(),
            value: duration.to_string(),
        })?;
    let record = Arc::new(event_record(component));

    if let Some(recurrence_id) = component.get("RECURRENCE-ID") {
        let original = parse_zoned(recurrence_id, resolver)?;
        let original_start = original
            .instant(policy)
            .ok_or_else(|| IngestError::InvalidValue {
                property: "RECURRENCE-ID".to_string(),
                value: recurrence_id.value.clone(),
            })?
            .with_timezone(&Utc);
        return Ok(Classification {
            item: Classified::Override(OverrideInstance {
                uid,
                original_start,
                start,
                end,
                all_day,
                record,
            }),
            warnings,
        });
    }

    if let Some(rrule) = component.get("RRULE") {
        let rule = RecurrenceRule::parse(&rrule.value).map_err(|reason| {
            IngestError::RecurrenceValidation {
                uid: uid.to_string(),
                reason,
            }
        })?;
        let mut exdates = Vec::new();
        for prop in component.get_all("EXDATE") {
            match parse_date_list(prop, resolver, tz) {
                Ok(values) => {
                    if values.first().is_some_and(|v| v.fell_back) {
                        warnings.push(format!(
                            "{uid}: unknown EXDATE timezone {:?}, using {}",
                            prop.param("TZID").unwrap_or_default(),
                            tz.name()
                        ));
                    }
                    exdates.extend(values);
                }
                Err(e) => warnings.push(format!("{uid}: ignoring EXDATE: {e}")),
            }
        }
        return Ok(Classification {
            item: Classified::Master(MasterEvent {
                uid,
                start,
                duration,
                tz,
                all_day,
                rule,
                exdates,
                record,
            }),
            warnings,
        });
    }

    Ok(Classification {
        item: Classified::Single(SingleEvent {
            uid,
            start,
            end,
            all_day,
            record,
        }),
        warnings,
    })
}

/// Duration from DTEND, else DURATION, else the RFC 5545 defaults (one day
/// for all-day events, zero otherwise).
fn event_duration(
    component: &CalendarComponent,
    resolver: &mut TimezoneResolver,
    start: &DateTime<Tz>,
    all_day: bool,
) -> Result<Duration> {
    if let Some(dtend) = component.get("DTEND") {
        let end_value = parse_zoned(dtend, resolver)?;
        if let Some(end) = end_value.instant(resolver.dst_policy()) {
            let duration = end.with_timezone(&Utc) - start.with_timezone(&Utc);
            if duration >= Duration::zero() {
                return Ok(duration);
            }
        }
    }
    if let Some(raw) = component.value("DURATION") {
        return parse_duration(raw).ok_or_else(|| IngestError::InvalidValue {
            property: "DURATION".to_string(),
            value: raw.to_string(),
        });
    }
    Ok(if all_day {
        Duration::days(1)
    } else {
        Duration::zero()
    })
}

/// Parse an RFC 5545 duration such as `PT1H30M`, `P1D`, or `P2W`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (negative, rest) = match raw.as_bytes().first()? {
        b'-' => (true, &raw[1..]),
        b'+' => (false, &raw[1..]),
        _ => (false, raw),
    };
    let rest = rest.strip_prefix('P')?;
    let mut total = TimeDelta::zero();
    let mut digits = String::new();
    let mut in_time = false;
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            'T' if digits.is_empty() => in_time = true,
            _ => {
                let n: i64 = digits.parse().ok()?;
                digits.clear();
                let part = match (c, in_time) {
                    ('W', false) => TimeDelta::try_weeks(n),
                    ('D', false) => TimeDelta::try_days(n),
                    ('H', true) => TimeDelta::try_hours(n),
                    ('M', true) => TimeDelta::try_minutes(n),
                    ('S', true) => TimeDelta::try_seconds(n),
                    _ => None,
                }?;
                total = total.checked_add(&part)?;
            }
        }
    }
    if !digits.is_empty() {
        return None;
    }
    Some(if negative { -total } else { total })
}

fn event_record(component: &CalendarComponent) -> EventRecord {
    let status = match component.value("STATUS").map(str::trim) {
        Some(s) if s.eq_ignore_ascii_case("CANCELLED") => EventStatus::Cancelled,
        Some(s) if s.eq_ignore_ascii_case("TENTATIVE") => EventStatus::Tentative,
        _ => EventStatus::Confirmed,
    };
    let subject = component
        .value("SUMMARY")
        .map(unescape_text)
        .filter(|s| !s.trim().is_empty());
    let Some(subject) = subject else {
        return EventRecord::Placeholder { status };
    };
    let text = |name: &str| {
        component
            .value(name)
            .map(unescape_text)
            .filter(|s| !s.trim().is_empty())
    };
    EventRecord::Full(EventDetails {
        subject,
        location: text("LOCATION"),
        description: text("DESCRIPTION"),
        attendees: component.get_all("ATTENDEE").map(attendee_label).collect(),
        status,
        sequence: component
            .value("SEQUENCE")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0),
    })
}

/// `CN` when present, otherwise the address without its `mailto:` scheme.
fn attendee_label(prop: &Property) -> String {
    if let Some(cn) = prop.param("CN").filter(|cn| !cn.is_empty()) {
        return cn.to_string();
    }
    let value = prop.value.trim();
    value
        .strip_prefix("mailto:")
        .or_else(|| value.strip_prefix("MAILTO:"))
        .unwrap_or(value)
        .to_string()
}

/// Undo TEXT escaping (`\\`, `\;`, `\,`, `\n`).
pub fn unescape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("PT1H30M"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("P1D"), Some(Duration::days(1)));
        assert_eq!(parse_duration("P2W"), Some(Duration::weeks(2)));
        assert_eq!(parse_duration("-PT15M"), Some(Duration::minutes(-15)));
        assert_eq!(parse_duration("P1DT2H"), Some(Duration::hours(26)));
        assert_eq!(parse_duration("1H"), None);
        assert_eq!(parse_duration("PT5"), None);
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        assert_eq!(parse_duration("P99999999999999W"), None);
        assert_eq!(parse_duration("PT99999999999999999H"), None);
        // Each part fits, the sum does not.
        assert_eq!(parse_duration("P100000000DT9000000000000S"), None);
    }

    #[test]
    fn oversized_window_saturates() {
        let start = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert_eq!(Window::from_days(start, 30).end, DateTime::<Utc>::MAX_UTC);
        assert_eq!(Window::from_days(start, u32::MAX).end, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn attendees_add_to_richness() {
        let with = |n: usize| EventDetails {
            subject: "Review".into(),
            attendees: (0..n).map(|i| format!("person{i}")).collect(),
            ..EventDetails::default()
        };
        assert!(with(3).richness() > with(1).richness());
        assert!(with(1).richness() > with(0).richness());
    }

    #[test]
    fn text_escapes_are_removed() {
        assert_eq!(unescape_text(r"Room 1\, Floor 2\nBring\; laptop"), "Room 1, Floor 2\nBring; laptop");
        assert_eq!(unescape_text(r"C:\\temp"), r"C:\temp");
    }

    #[test]
    fn placeholder_ranks_below_full_record() {
        let full = EventRecord::Full(EventDetails {
            subject: "Standup".into(),
            ..EventDetails::default()
        });
        let placeholder = EventRecord::Placeholder {
            status: EventStatus::Confirmed,
        };
        assert!(full.richness() > placeholder.richness());
        assert_eq!(placeholder.subject(), UNTITLED);
    }
}
