//! Merge expanded occurrences with overrides and standalone events.
//!
//! Identity is `(UID, start instant)` throughout. An override removes the
//! generated occurrence at its RECURRENCE-ID and contributes its own data at
//! its own start. When two instances share an identity the richer one is
//! kept; remaining ties are broken on every rendered field so the result
//! never depends on input order. Output is sorted by start, then UID.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::model::{
    EventInstance, EventRecord, EventStatus, OccurrenceInstance, OverrideInstance, SingleEvent,
    Window,
};

#[derive(Debug, Clone)]
struct Candidate {
    uid: Arc<str>,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
    all_day: bool,
    record: Arc<EventRecord>,
    is_override: bool,
}

/// Everything an instance renders, compared field by field when two
/// candidates are equally rich.
type Content<'a> = (
    &'a str,
    Option<&'a str>,
    Option<&'a str>,
    &'a [String],
    DateTime<Utc>,
    &'static str,
    bool,
    EventStatus,
);

type Rank<'a> = (bool, usize, Reverse<Content<'a>>);

impl Candidate {
    fn rank(&self) -> Rank<'_> {
        let (location, description, attendees) = match self.record.as_ref() {
            EventRecord::Full(details) => (
                details.location.as_deref(),
                details.description.as_deref(),
                details.attendees.as_slice(),
            ),
            EventRecord::Placeholder { .. } => (None, None, &[][..]),
        };
        (
            self.is_override,
            self.record.richness(),
            Reverse((
                self.record.subject(),
                location,
                description,
                attendees,
                self.end.with_timezone(&Utc),
                self.start.timezone().name(),
                self.all_day,
                self.record.status(),
            )),
        )
    }

    fn into_instance(self) -> EventInstance {
        let (location, description, attendees) = match self.record.as_ref() {
            EventRecord::Full(details) => (
                details.location.clone(),
                details.description.clone(),
                details.attendees.clone(),
            ),
            EventRecord::Placeholder { .. } => (None, None, Vec::new()),
        };
        EventInstance {
            uid: self.uid.to_string(),
            subject: self.record.subject().to_string(),
            timezone: self.start.timezone().name().to_string(),
            start: self.start,
            end: self.end,
            all_day: self.all_day,
            location,
            description,
            attendees,
            is_override: self.is_override,
        }
    }
}

/// Combine occurrences, overrides, and singles into the final collection.
///
/// Overrides and singles outside `window` are dropped, as are cancelled
/// ones; a cancelled override still removes the occurrence it references.
pub fn reconcile(
    occurrences: Vec<OccurrenceInstance>,
    overrides: Vec<OverrideInstance>,
    singles: Vec<SingleEvent>,
    window: Window,
) -> Vec<EventInstance> {
    let replaced: HashSet<(Arc<str>, DateTime<Utc>)> = overrides
        .iter()
        .map(|o| (o.uid.clone(), o.original_start))
        .collect();

    let mut candidates = Vec::with_capacity(occurrences.len() + overrides.len() + singles.len());
    for occ in occurrences {
        if replaced.contains(&(occ.uid.clone(), occ.start.with_timezone(&Utc))) {
            continue;
        }
        candidates.push(Candidate {
            uid: occ.uid,
            start: occ.start,
            end: occ.end,
            all_day: occ.all_day,
            record: occ.record,
            is_override: false,
        });
    }
    for ov in overrides {
        if ov.record.status() == EventStatus::Cancelled || !window.contains(&ov.start) {
            continue;
        }
        candidates.push(Candidate {
            uid: ov.uid,
            start: ov.start,
            end: ov.end,
            all_day: ov.all_day,
            record: ov.record,
            is_override: true,
        });
    }
    for single in singles {
        if single.record.status() == EventStatus::Cancelled || !window.contains(&single.start) {
            continue;
        }
        candidates.push(Candidate {
            uid: single.uid,
            start: single.start,
            end: single.end,
            all_day: single.all_day,
            record: single.record,
            is_override: false,
        });
    }

    let mut by_identity: BTreeMap<(DateTime<Utc>, Arc<str>), Candidate> = BTreeMap::new();
    let mut collapsed = 0usize;
    for candidate in candidates {
        let key = (candidate.start.with_timezone(&Utc), candidate.uid.clone());
        match by_identity.get_mut(&key) {
            Some(existing) => {
                collapsed += 1;
                if candidate.rank() > existing.rank() {
                    *existing = candidate;
                }
            }
            None => {
                by_identity.insert(key, candidate);
            }
        }
    }
    if collapsed > 0 {
        tracing::debug!(collapsed, "Collapsed duplicate instances");
    }

    by_identity
        .into_values()
        .map(Candidate::into_instance)
        .collect()
}
