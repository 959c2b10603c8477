//! Tests for weekly recurrence expansion over a window.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use ingest_engine::dst::DstPolicy;
use ingest_engine::error::IngestError;
use ingest_engine::expander::expand;
use ingest_engine::model::{classify, Classified, MasterEvent, OccurrenceInstance, Window};
use ingest_engine::parser::{parse_str, ParseEvent, ParserLimits};
use ingest_engine::timezone::TimezoneResolver;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn master_with(policy: DstPolicy, lines: &[&str]) -> MasterEvent {
    let feed = format!("BEGIN:VEVENT\nUID:series@test\n{}\nEND:VEVENT\n", lines.join("\n"));
    let component = parse_str(ParserLimits::default(), "test", &feed)
        .find_map(|e| match e.expect("parse") {
            ParseEvent::Component(c) => Some(c),
            ParseEvent::Warning(_) => None,
        })
        .expect("one component");
    let mut resolver = TimezoneResolver::new(chrono_tz::UTC, policy);
    match classify(&component, &mut resolver).expect("classify").item {
        Classified::Master(m) => m,
        other => panic!("expected a master, got {other:?}"),
    }
}

fn master(lines: &[&str]) -> MasterEvent {
    master_with(DstPolicy::ShiftForward, lines)
}

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn january_2025() -> Window {
    Window::new(utc(2025, 1, 1), utc(2025, 1, 31))
}

fn days(occurrences: &[OccurrenceInstance]) -> Vec<(u32, u32)> {
    occurrences
        .iter()
        .map(|o| (o.start.month(), o.start.day()))
        .collect()
}

// ---------------------------------------------------------------------------
// Window scenarios
// ---------------------------------------------------------------------------

#[test]
fn weekly_monday_fills_window() {
    let m = master(&["DTSTART:20250106T090000Z", "RRULE:FREQ=WEEKLY;BYDAY=MO"]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).expect("should expand");
    assert_eq!(days(&result), vec![(1, 6), (1, 13), (1, 20), (1, 27)]);
}

#[test]
fn interval_two_skips_alternate_weeks() {
    let m = master(&["DTSTART:20250106T090000Z", "RRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=MO"]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).expect("should expand");
    assert_eq!(days(&result), vec![(1, 6), (1, 20)]);
}

#[test]
fn exdate_removes_only_its_day() {
    let m = master(&[
        "DTSTART:20250106T090000Z",
        "RRULE:FREQ=WEEKLY;BYDAY=MO,WE",
        "EXDATE:20250113T090000Z",
    ]);
    let window = Window::new(utc(2025, 1, 12), utc(2025, 1, 18));
    let result = expand(&m, window, DstPolicy::ShiftForward).expect("should expand");
    assert_eq!(days(&result), vec![(1, 15)]);
}

#[test]
fn date_valued_exdate_matches_in_master_zone() {
    let m = master(&[
        "DTSTART;TZID=America/New_York:20250106T200000",
        "RRULE:FREQ=WEEKLY;BYDAY=MO",
        "EXDATE;VALUE=DATE:20250113",
    ]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).expect("should expand");
    // 20:00 in New York is already the next day in UTC; the exclusion still
    // matches the local Monday.
    let local: Vec<u32> = result.iter().map(|o| o.start.day()).collect();
    assert_eq!(local, vec![6, 20, 27]);
}

#[test]
fn exdate_in_another_zone_is_converted_before_matching() {
    // 01:00 on Jan 14 in Tokyo is 11:00 on Monday Jan 13 in New York.
    let m = master(&[
        "DTSTART;TZID=America/New_York:20250106T110000",
        "RRULE:FREQ=WEEKLY;BYDAY=MO",
        "EXDATE;TZID=Asia/Tokyo:20250114T010000",
    ]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).expect("should expand");
    let local: Vec<u32> = result.iter().map(|o| o.start.day()).collect();
    assert_eq!(local, vec![6, 20, 27]);
}

#[test]
fn exdate_on_a_different_local_day_excludes_nothing() {
    // 11:00 on Jan 13 in Tokyo is still Sunday Jan 12 in New York.
    let m = master(&[
        "DTSTART;TZID=America/New_York:20250106T110000",
        "RRULE:FREQ=WEEKLY;BYDAY=MO",
        "EXDATE;TZID=Asia/Tokyo:20250113T110000",
    ]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).expect("should expand");
    assert_eq!(days(&result), vec![(1, 6), (1, 13), (1, 20), (1, 27)]);
}

#[test]
fn missing_byday_uses_dtstart_weekday() {
    let m = master(&["DTSTART:20250108T120000Z", "RRULE:FREQ=WEEKLY"]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).expect("should expand");
    assert_eq!(days(&result), vec![(1, 8), (1, 15), (1, 22), (1, 29)]);
}

#[test]
fn byday_order_is_irrelevant() {
    let a = master(&["DTSTART:20250106T090000Z", "RRULE:FREQ=WEEKLY;BYDAY=MO,WE,FR"]);
    let b = master(&["DTSTART:20250106T090000Z", "RRULE:FREQ=WEEKLY;BYDAY=FR,MO,WE"]);
    assert_eq!(
        expand(&a, january_2025(), DstPolicy::ShiftForward).unwrap(),
        expand(&b, january_2025(), DstPolicy::ShiftForward).unwrap()
    );
}

#[test]
fn occurrences_before_window_are_not_returned() {
    let m = master(&["DTSTART:20250106T090000Z", "RRULE:FREQ=WEEKLY;BYDAY=MO"]);
    let window = Window::new(utc(2025, 1, 14), utc(2025, 1, 31));
    let result = expand(&m, window, DstPolicy::ShiftForward).unwrap();
    assert_eq!(days(&result), vec![(1, 20), (1, 27)]);
}

#[test]
fn window_boundaries_are_inclusive() {
    let m = master(&["DTSTART:20250106T000000Z", "RRULE:FREQ=WEEKLY;BYDAY=MO"]);
    let window = Window::new(utc(2025, 1, 6), utc(2025, 1, 20));
    let result = expand(&m, window, DstPolicy::ShiftForward).unwrap();
    assert_eq!(days(&result), vec![(1, 6), (1, 13), (1, 20)]);
}

#[test]
fn series_from_years_ago_keeps_its_phase() {
    // 2015-01-05 is exactly 522 weeks before 2025-01-06.
    let m = master(&["DTSTART:20150105T090000Z", "RRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=MO"]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).unwrap();
    assert_eq!(days(&result), vec![(1, 6), (1, 20)]);
}

// ---------------------------------------------------------------------------
// Terminators
// ---------------------------------------------------------------------------

#[test]
fn count_is_measured_from_series_start() {
    // Dec 2, 9, 16, 23, 30 use five of the six occurrences.
    let m = master(&["DTSTART:20241202T090000Z", "RRULE:FREQ=WEEKLY;COUNT=6"]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).unwrap();
    assert_eq!(days(&result), vec![(1, 6)]);
}

#[test]
fn until_is_inclusive() {
    let m = master(&[
        "DTSTART:20250106T090000Z",
        "RRULE:FREQ=WEEKLY;BYDAY=MO;UNTIL=20250120T090000Z",
    ]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).unwrap();
    assert_eq!(days(&result), vec![(1, 6), (1, 13), (1, 20)]);
}

#[test]
fn exdate_does_not_refund_count() {
    let m = master(&[
        "DTSTART:20250106T090000Z",
        "RRULE:FREQ=WEEKLY;COUNT=3",
        "EXDATE:20250113T090000Z",
    ]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).unwrap();
    assert_eq!(days(&result), vec![(1, 6), (1, 20)]);
}

#[test]
fn invalid_rules_are_reported_per_master() {
    for rule in [
        "RRULE:FREQ=DAILY",
        "RRULE:FREQ=WEEKLY;INTERVAL=0",
        "RRULE:FREQ=WEEKLY;INTERVAL=100000000",
        "RRULE:FREQ=WEEKLY;INTERVAL=9223372036854775807",
        "RRULE:FREQ=WEEKLY;COUNT=1000",
        "RRULE:FREQ=WEEKLY;COUNT=2;UNTIL=20250120T090000Z",
    ] {
        let m = master(&["DTSTART:20250106T090000Z", rule]);
        let err = expand(&m, january_2025(), DstPolicy::ShiftForward).unwrap_err();
        assert!(
            matches!(&err, IngestError::RecurrenceValidation { uid, .. } if uid == "series@test"),
            "{rule}: {err}"
        );
    }
}

#[test]
fn widest_interval_still_expands() {
    // 520 weeks after Monday 2000-01-03.
    let m = master(&["DTSTART:20000103T090000Z", "RRULE:FREQ=WEEKLY;INTERVAL=520;BYDAY=MO"]);
    let first = expand(
        &m,
        Window::new(utc(2000, 1, 1), utc(2000, 1, 31)),
        DstPolicy::ShiftForward,
    )
    .expect("should expand");
    assert_eq!(days(&first), vec![(1, 3)]);

    let second = expand(
        &m,
        Window::new(utc(2009, 12, 1), utc(2009, 12, 31)),
        DstPolicy::ShiftForward,
    )
    .expect("should expand");
    assert_eq!(days(&second), vec![(12, 21)]);
    assert_eq!(second[0].start.year(), 2009);
}

#[test]
fn series_near_the_end_of_the_calendar_stops_cleanly() {
    let m = master(&["DTSTART:99991227T090000Z", "RRULE:FREQ=WEEKLY;INTERVAL=520;BYDAY=MO"]);
    let window = Window::from_days(utc(9999, 12, 1), 366);
    let result = expand(&m, window, DstPolicy::ShiftForward).expect("should expand");
    assert_eq!(days(&result), vec![(12, 27)]);
}

// ---------------------------------------------------------------------------
// DST
// ---------------------------------------------------------------------------

#[test]
fn wall_clock_time_survives_spring_forward() {
    let m = master(&[
        "DTSTART;TZID=America/New_York:20250303T090000",
        "RRULE:FREQ=WEEKLY;BYDAY=MO",
    ]);
    let window = Window::new(utc(2025, 3, 1), utc(2025, 3, 15));
    let result = expand(&m, window, DstPolicy::ShiftForward).unwrap();
    assert_eq!(result.len(), 2);
    assert!(result.iter().all(|o| o.start.hour() == 9));
    assert_eq!(result[0].start.with_timezone(&Utc).hour(), 14);
    assert_eq!(result[1].start.with_timezone(&Utc).hour(), 13);
}

#[test]
fn gap_time_shifts_forward_by_default() {
    let m = master(&[
        "DTSTART;TZID=America/New_York:20250302T023000",
        "RRULE:FREQ=WEEKLY",
    ]);
    let window = Window::new(utc(2025, 3, 8), utc(2025, 3, 10));
    let result = expand(&m, window, DstPolicy::ShiftForward).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!((result[0].start.hour(), result[0].start.minute()), (3, 30));
}

#[test]
fn gap_time_is_dropped_under_skip() {
    let m = master_with(
        DstPolicy::Skip,
        &["DTSTART;TZID=America/New_York:20250302T023000", "RRULE:FREQ=WEEKLY"],
    );
    let window = Window::new(utc(2025, 3, 1), utc(2025, 3, 20));
    let result = expand(&m, window, DstPolicy::Skip).unwrap();
    assert_eq!(days(&result), vec![(3, 2), (3, 16)]);
}

#[test]
fn duration_is_carried_to_every_occurrence() {
    let m = master(&[
        "DTSTART;TZID=Europe/London:20250106T093000",
        "DTEND;TZID=Europe/London:20250106T110000",
        "RRULE:FREQ=WEEKLY;BYDAY=MO,TH",
    ]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).unwrap();
    assert_eq!(result.len(), 8);
    for o in &result {
        assert_eq!(o.end - o.start, Duration::minutes(90));
    }
}

#[test]
fn all_day_series_keeps_whole_day_duration() {
    let m = master(&["DTSTART;VALUE=DATE:20250106", "RRULE:FREQ=WEEKLY;COUNT=3"]);
    let result = expand(&m, january_2025(), DstPolicy::ShiftForward).unwrap();
    assert_eq!(result.len(), 3);
    assert!(result.iter().all(|o| o.all_day));
    assert!(result.iter().all(|o| o.end - o.start == Duration::days(1)));
}
