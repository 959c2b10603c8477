//! Tests for the cooperative expansion pool.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use ingest_engine::dst::DstPolicy;
use ingest_engine::error::IngestError;
use ingest_engine::model::{classify, Classified, MasterEvent, Window};
use ingest_engine::parser::{parse_str, ParseEvent, ParserLimits};
use ingest_engine::pool::{
    ExpansionOutcome, ExpansionRequest, ExpansionStatus, PartialReason, PoolConfig, WorkerPool,
};
use ingest_engine::timezone::TimezoneResolver;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn master(uid: &str, rrule: &str) -> Arc<MasterEvent> {
    let feed = format!(
        "BEGIN:VEVENT\nUID:{uid}\nDTSTART:20250106T090000Z\nRRULE:{rrule}\nEND:VEVENT\n"
    );
    let component = parse_str(ParserLimits::default(), "pool", &feed)
        .find_map(|e| match e.expect("parse") {
            ParseEvent::Component(c) => Some(c),
            ParseEvent::Warning(_) => None,
        })
        .expect("one component");
    let mut resolver = TimezoneResolver::new(chrono_tz::UTC, DstPolicy::ShiftForward);
    match classify(&component, &mut resolver).expect("classify").item {
        Classified::Master(m) => Arc::new(m),
        other => panic!("expected a master, got {other:?}"),
    }
}

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn window() -> Window {
    Window::new(utc(2025, 1, 1), utc(2025, 12, 31))
}

fn requests(masters: &[Arc<MasterEvent>]) -> Vec<ExpansionRequest> {
    masters
        .iter()
        .map(|m| ExpansionRequest {
            master: m.clone(),
            window: window(),
        })
        .collect()
}

fn pool(concurrency: usize, call_budget_ms: u64, yield_every: usize) -> WorkerPool {
    WorkerPool::new(
        &PoolConfig {
            concurrency,
            call_budget_ms,
            yield_every,
        },
        DstPolicy::ShiftForward,
    )
}

async fn run_all(pool: &WorkerPool, masters: &[Arc<MasterEvent>]) -> Vec<ExpansionOutcome> {
    pool.expand_all(requests(masters)).collect().await
}

// ---------------------------------------------------------------------------
// Ordering and isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn results_come_back_in_request_order() {
    let masters = vec![
        master("daily-ish", "FREQ=WEEKLY;BYDAY=MO,TU,WE,TH,FR,SA,SU"),
        master("short", "FREQ=WEEKLY;COUNT=2"),
        master("biweekly", "FREQ=WEEKLY;INTERVAL=2"),
        master("single-day", "FREQ=WEEKLY;BYDAY=MO"),
    ];
    let p = pool(3, 10_000, 8);
    let outcomes = run_all(&p, &masters).await;

    let order: Vec<(usize, &str)> = outcomes.iter().map(|o| (o.index, &*o.uid)).collect();
    assert_eq!(
        order,
        vec![(0, "daily-ish"), (1, "short"), (2, "biweekly"), (3, "single-day")]
    );
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.status, ExpansionStatus::Complete)));
    assert_eq!(outcomes[1].occurrences.len(), 2);
}

#[tokio::test]
async fn invalid_master_does_not_abort_the_batch() {
    let masters = vec![
        master("good", "FREQ=WEEKLY;COUNT=3"),
        master("bad", "FREQ=MONTHLY"),
        master("also-good", "FREQ=WEEKLY;COUNT=1"),
    ];
    let outcomes = run_all(&pool(2, 10_000, 64), &masters).await;

    assert!(matches!(outcomes[0].status, ExpansionStatus::Complete));
    assert!(matches!(
        &outcomes[1].status,
        ExpansionStatus::Failed(IngestError::RecurrenceValidation { uid, .. }) if uid == "bad"
    ));
    assert!(outcomes[1].occurrences.is_empty());
    assert!(matches!(outcomes[2].status, ExpansionStatus::Complete));
    assert_eq!(outcomes[2].occurrences.len(), 1);
}

// ---------------------------------------------------------------------------
// Time slices and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_budget_returns_partial_series() {
    let masters = vec![master("long", "FREQ=WEEKLY;BYDAY=MO,WE,FR")];
    let outcomes = run_all(&pool(1, 0, 1), &masters).await;

    assert!(matches!(
        outcomes[0].status,
        ExpansionStatus::Partial(PartialReason::Budget)
    ));
    assert_eq!(outcomes[0].occurrences.len(), 1);
}

#[tokio::test]
async fn cancelled_pool_schedules_nothing() {
    let masters = vec![master("a", "FREQ=WEEKLY"), master("b", "FREQ=WEEKLY")];
    let p = pool(2, 10_000, 64);
    p.cancel();
    assert!(p.is_cancelled());

    let outcomes = run_all(&p, &masters).await;
    assert_eq!(outcomes.len(), 2);
    for o in &outcomes {
        assert!(matches!(
            o.status,
            ExpansionStatus::Partial(PartialReason::Cancelled)
        ));
        assert!(o.occurrences.is_empty());
    }
}

#[tokio::test]
async fn cancel_mid_batch_keeps_finished_work() {
    let masters = vec![
        master("first", "FREQ=WEEKLY;COUNT=5"),
        master("second", "FREQ=WEEKLY"),
        master("third", "FREQ=WEEKLY"),
    ];
    let p = pool(1, 10_000, 64);
    let stream = p.expand_all(requests(&masters));
    futures::pin_mut!(stream);

    let first = stream.next().await.expect("first outcome");
    assert!(matches!(first.status, ExpansionStatus::Complete));
    assert_eq!(first.occurrences.len(), 5);

    p.cancel();
    let rest: Vec<ExpansionOutcome> = stream.collect().await;
    assert_eq!(rest.len(), 2);
    assert!(rest.iter().all(|o| matches!(
        o.status,
        ExpansionStatus::Partial(PartialReason::Cancelled)
    )));
}

#[test]
fn concurrency_is_clamped() {
    assert_eq!(pool(0, 200, 64).concurrency(), 1);
    assert_eq!(pool(2, 200, 64).concurrency(), 2);
    assert_eq!(pool(16, 200, 64).concurrency(), 3);
}
