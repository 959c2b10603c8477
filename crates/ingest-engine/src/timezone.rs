//! Timezone resolution and date-time value parsing for feed properties.
//!
//! Feeds carry TZIDs in many dialects: plain IANA names, vendor-prefixed
//! names (`/mozilla.org/...`), and Windows display names from Exchange
//! exports. [`TimezoneResolver`] normalizes these aliases to IANA names,
//! caches the result, and falls back to the configured default zone when a
//! TZID cannot be mapped.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::dst::DstPolicy;
use crate::error::{IngestError, Result};
use crate::model::Property;

/// Windows zone display names seen in Exchange/Outlook exports.
const WINDOWS_ALIASES: &[(&str, &str)] = &[
    ("AUS Eastern Standard Time", "Australia/Sydney"),
    ("Central Europe Standard Time", "Europe/Budapest"),
    ("Central European Standard Time", "Europe/Warsaw"),
    ("Central Standard Time", "America/Chicago"),
    ("China Standard Time", "Asia/Shanghai"),
    ("Coordinated Universal Time", "UTC"),
    ("E. Europe Standard Time", "Europe/Chisinau"),
    ("Eastern Standard Time", "America/New_York"),
    ("FLE Standard Time", "Europe/Kiev"),
    ("GMT Standard Time", "Europe/London"),
    ("Greenwich Standard Time", "Atlantic/Reykjavik"),
    ("India Standard Time", "Asia/Kolkata"),
    ("Mountain Standard Time", "America/Denver"),
    ("Pacific Standard Time", "America/Los_Angeles"),
    ("Romance Standard Time", "Europe/Paris"),
    ("Singapore Standard Time", "Asia/Singapore"),
    ("Tokyo Standard Time", "Asia/Tokyo"),
    ("UTC", "UTC"),
    ("W. Europe Standard Time", "Europe/Berlin"),
];

/// Resolves TZIDs to `chrono_tz::Tz`, with a configured fallback.
#[derive(Debug, Clone)]
pub struct TimezoneResolver {
    fallback: Tz,
    dst_policy: DstPolicy,
    cache: HashMap<String, Option<Tz>>,
}

/// How a TZID was resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    Known(Tz),
    /// The TZID was unknown; the fallback zone was used.
    Fallback(Tz),
}

impl Resolution {
    pub fn tz(self) -> Tz {
        match self {
            Resolution::Known(tz) | Resolution::Fallback(tz) => tz,
        }
    }
}

impl TimezoneResolver {
    pub fn new(fallback: Tz, dst_policy: DstPolicy) -> Self {
        Self {
            fallback,
            dst_policy,
            cache: HashMap::new(),
        }
    }

    pub fn fallback(&self) -> Tz {
        self.fallback
    }

    pub fn dst_policy(&self) -> DstPolicy {
        self.dst_policy
    }

    /// Strictly resolve a TZID, without falling back.
    ///
    /// # Errors
    /// Returns `IngestError::TimezoneResolution` if no alias or IANA name matches.
    pub fn lookup(&mut self, tzid: &str) -> Result<Tz> {
        if let Some(cached) = self.cache.get(tzid) {
            return cached.ok_or_else(|| IngestError::TimezoneResolution(tzid.to_string()));
        }
        let resolved = normalize_tzid(tzid).parse::<Tz>().ok();
        self.cache.insert(tzid.to_string(), resolved);
        resolved.ok_or_else(|| IngestError::TimezoneResolution(tzid.to_string()))
    }

    /// Resolve a TZID, substituting the fallback zone for unknown names.
    pub fn resolve(&mut self, tzid: Option<&str>) -> Resolution {
        match tzid {
            None => Resolution::Known(self.fallback),
            Some(id) => match self.lookup(id) {
                Ok(tz) => Resolution::Known(tz),
                Err(_) => Resolution::Fallback(self.fallback),
            },
        }
    }
}

/// Map vendor prefixes and Windows display names onto IANA identifiers.
pub fn normalize_tzid(tzid: &str) -> String {
    let trimmed = tzid.trim().trim_matches('"');
    let stripped = trimmed
        .strip_prefix("/mozilla.org/20070129_1/")
        .or_else(|| trimmed.strip_prefix("/mozilla.org/20050126_1/"))
        .or_else(|| trimmed.strip_prefix("/softwarestudio.org/Tzfile/"))
        .or_else(|| trimmed.strip_prefix("/citadel.org/20190914_1/"))
        .unwrap_or(trimmed);

    if let Some((_, iana)) = WINDOWS_ALIASES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(stripped))
    {
        return (*iana).to_string();
    }

    match stripped {
        "Z" | "GMT" | "Etc/UTC" | "Etc/GMT" => "UTC".to_string(),
        other => other.to_string(),
    }
}

/// A DTSTART/DTEND/RECURRENCE-ID/EXDATE value after interpretation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DateValue {
    /// `VALUE=DATE`: a calendar date without time.
    Date(NaiveDate),
    /// A UTC instant (`...Z` suffix).
    Utc(DateTime<Utc>),
    /// Wall-clock time to be pinned in a zone (TZID param or floating).
    Local(NaiveDateTime),
}

impl DateValue {
    /// Parse a single raw value.
    ///
    /// # Errors
    /// Returns `IngestError::InvalidValue` for anything not matching the
    /// `YYYYMMDD` or `YYYYMMDDTHHMMSS[Z]` forms.
    pub fn parse(property: &str, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = || IngestError::InvalidValue {
            property: property.to_string(),
            value: raw.to_string(),
        };
        if raw.len() == 8 {
            return NaiveDate::parse_from_str(raw, "%Y%m%d")
                .map(DateValue::Date)
                .map_err(|_| invalid());
        }
        if let Some(utc) = raw.strip_suffix('Z') {
            return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
                .map(|ndt| DateValue::Utc(ndt.and_utc()))
                .map_err(|_| invalid());
        }
        NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S")
            .map(DateValue::Local)
            .map_err(|_| invalid())
    }

    pub fn is_date(&self) -> bool {
        matches!(self, DateValue::Date(_))
    }

    /// Interpret this value as an instant in `tz`.
    ///
    /// Dates become local midnight. Returns `None` only for a wall-clock time
    /// inside a DST gap under [`DstPolicy::Skip`].
    pub fn to_zoned(&self, tz: &Tz, policy: DstPolicy) -> Option<DateTime<Tz>> {
        match self {
            DateValue::Utc(dt) => Some(dt.with_timezone(tz)),
            DateValue::Local(ndt) => policy.localize(tz, *ndt),
            DateValue::Date(d) => policy.localize(tz, d.and_time(NaiveTime::MIN)),
        }
    }
}

/// A date-time property resolved against its TZID.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZonedValue {
    pub value: DateValue,
    pub tz: Tz,
    /// True when the property's TZID was unknown and the fallback was used.
    pub fell_back: bool,
}

impl ZonedValue {
    pub fn instant(&self, policy: DstPolicy) -> Option<DateTime<Tz>> {
        self.value.to_zoned(&self.tz, policy)
    }

    /// The calendar date this value names once expressed in `target`.
    ///
    /// DATE values name a day, not an instant, and are taken as-is.
    pub fn date_in(&self, target: &Tz, policy: DstPolicy) -> NaiveDate {
        match self.value {
            DateValue::Date(d) => d,
            DateValue::Utc(dt) => dt.with_timezone(target).date_naive(),
            DateValue::Local(ndt) if self.tz == *target => ndt.date(),
            DateValue::Local(ndt) => policy
                .localize(&self.tz, ndt)
                .map_or(ndt.date(), |dt| dt.with_timezone(target).date_naive()),
        }
    }
}

/// Parse a date-time property, resolving its TZID parameter.
///
/// UTC values keep the property's declared zone when one is given so that
/// occurrences are rendered in the authored zone.
///
/// # Errors
/// Returns `IngestError::InvalidValue` if the value is malformed.
pub fn parse_zoned(prop: &Property, resolver: &mut TimezoneResolver) -> Result<ZonedValue> {
    let value = DateValue::parse(&prop.name, &prop.value)?;
    let resolution = resolver.resolve(prop.param("TZID"));
    Ok(ZonedValue {
        value,
        tz: resolution.tz(),
        fell_back: matches!(resolution, Resolution::Fallback(_)),
    })
}

/// Parse every comma-separated value of a multi-valued date property (EXDATE).
///
/// Values without a TZID, or with one that cannot be mapped, are read in
/// `floating` (the owning event's zone).
///
/// # Errors
/// Returns `IngestError::InvalidValue` on the first malformed entry.
pub fn parse_date_list(
    prop: &Property,
    resolver: &mut TimezoneResolver,
    floating: Tz,
) -> Result<Vec<ZonedValue>> {
    let (tz, fell_back) = match prop.param("TZID").map(|id| resolver.lookup(id)) {
        Some(Ok(tz)) => (tz, false),
        Some(Err(_)) => (floating, true),
        None => (floating, false),
    };
    prop.value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| -> Result<ZonedValue> {
            Ok(ZonedValue {
                value: DateValue::parse(&prop.name, s)?,
                tz,
                fell_back,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> TimezoneResolver {
        TimezoneResolver::new(chrono_tz::UTC, DstPolicy::ShiftForward)
    }

    #[test]
    fn windows_names_map_to_iana() {
        let mut r = resolver();
        assert_eq!(
            r.lookup("Eastern Standard Time").unwrap(),
            chrono_tz::America::New_York
        );
        assert_eq!(
            r.lookup("W. Europe Standard Time").unwrap(),
            chrono_tz::Europe::Berlin
        );
    }

    #[test]
    fn vendor_prefix_is_stripped() {
        let mut r = resolver();
        assert_eq!(
            r.lookup("/mozilla.org/20070129_1/Europe/Paris").unwrap(),
            chrono_tz::Europe::Paris
        );
    }

    #[test]
    fn unknown_zone_falls_back() {
        let mut r = TimezoneResolver::new(chrono_tz::Europe::London, DstPolicy::ShiftForward);
        assert!(r.lookup("Mars/Olympus_Mons").is_err());
        assert_eq!(
            r.resolve(Some("Mars/Olympus_Mons")),
            Resolution::Fallback(chrono_tz::Europe::London)
        );
        // Cached negative lookups still fall back.
        assert_eq!(
            r.resolve(Some("Mars/Olympus_Mons")).tz(),
            chrono_tz::Europe::London
        );
    }

    #[test]
    fn date_values_parse_in_all_three_forms() {
        assert!(matches!(
            DateValue::parse("DTSTART", "20250106").unwrap(),
            DateValue::Date(_)
        ));
        assert!(matches!(
            DateValue::parse("DTSTART", "20250106T090000Z").unwrap(),
            DateValue::Utc(_)
        ));
        assert!(matches!(
            DateValue::parse("DTSTART", "20250106T090000").unwrap(),
            DateValue::Local(_)
        ));
        assert!(DateValue::parse("DTSTART", "2025-01-06").is_err());
    }

    fn exdate(raw: &str) -> Property {
        crate::parser::parse_content_line(raw, 1).unwrap()
    }

    #[test]
    fn utc_exclusion_date_is_compared_in_master_zone() {
        // 2025-01-13T03:00Z is still Jan 12 in New York.
        let ny = chrono_tz::America::New_York;
        let values = parse_date_list(&exdate("EXDATE:20250113T030000Z"), &mut resolver(), ny).unwrap();
        assert_eq!(
            values[0].date_in(&ny, DstPolicy::ShiftForward),
            NaiveDate::from_ymd_opt(2025, 1, 12).unwrap()
        );
    }

    #[test]
    fn zoned_exclusion_date_is_converted_to_master_zone() {
        // 01:00 on Jan 14 in Tokyo is 11:00 on Jan 13 in New York.
        let ny = chrono_tz::America::New_York;
        let values = parse_date_list(
            &exdate("EXDATE;TZID=Asia/Tokyo:20250114T010000,20250121T010000"),
            &mut resolver(),
            ny,
        )
        .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].tz, chrono_tz::Asia::Tokyo);
        let dates: Vec<NaiveDate> = values
            .iter()
            .map(|v| v.date_in(&ny, DstPolicy::ShiftForward))
            .collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2025, 1, 13).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 20).unwrap(),
            ]
        );
    }

    #[test]
    fn floating_and_unknown_exclusion_zones_use_the_event_zone() {
        let ny = chrono_tz::America::New_York;
        let floating =
            parse_date_list(&exdate("EXDATE:20250113T230000"), &mut resolver(), ny).unwrap();
        assert_eq!(floating[0].tz, ny);
        assert!(!floating[0].fell_back);

        let unknown = parse_date_list(
            &exdate("EXDATE;TZID=Mars/Olympus_Mons:20250113T230000"),
            &mut resolver(),
            ny,
        )
        .unwrap();
        assert_eq!(unknown[0].tz, ny);
        assert!(unknown[0].fell_back);
        assert_eq!(
            unknown[0].date_in(&ny, DstPolicy::ShiftForward),
            NaiveDate::from_ymd_opt(2025, 1, 13).unwrap()
        );
    }
}
