//! DST transition policies for recurring events.
//!
//! Occurrences keep their wall-clock time of day across transitions; these
//! policies only decide what happens when that wall-clock time does not exist
//! (spring forward) or exists twice (fall back).

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Policy for local times that fall into a DST gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DstPolicy {
    /// Drop instances that fall in the gap (e.g., 2:30 AM during spring forward)
    Skip,
    /// Move the instance forward by the length of the gap
    #[default]
    ShiftForward,
}

impl DstPolicy {
    /// Pin a wall-clock time to an instant in `tz`.
    ///
    /// Ambiguous times (fall back) resolve to the earlier instant. Returns
    /// `None` only for gap times under [`DstPolicy::Skip`].
    pub fn localize(self, tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => Some(dt),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => match self {
                DstPolicy::Skip => None,
                DstPolicy::ShiftForward => shift_past_gap(tz, local),
            },
        }
    }
}

/// Walk forward in 15-minute steps until the local time exists again, then
/// re-apply the original offset into the gap. Gaps are at most a few hours.
fn shift_past_gap(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    let mut step = local;
    for _ in 0..(4 * 4) {
        step += Duration::minutes(15);
        if let Some(after) = tz.from_local_datetime(&step).earliest() {
            let before = tz.from_local_datetime(&(local - Duration::hours(3))).earliest()?;
            let gap = (after.naive_local() - after.naive_utc())
                - (before.naive_local() - before.naive_utc());
            return tz.from_local_datetime(&(local + gap)).earliest();
        }
    }
    None
}
