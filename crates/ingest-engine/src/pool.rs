//! Cooperative, bounded-concurrency driver for recurrence expansion.
//!
//! The pool never spawns tasks or threads. `expand_all` returns a lazy stream
//! that runs at most `concurrency` expansions interleaved on the caller's
//! task, yielding to the scheduler between masters and every
//! `yield_every` occurrences inside one master. Results come back in request
//! order.
//!
//! Each expansion gets a time slice. When it runs out, the occurrences
//! produced so far are returned as a partial result instead of holding the
//! pool. Cancellation closes the concurrency gate: queued requests resolve
//! immediately as cancelled, in-flight ones stop at their next yield point.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dst::DstPolicy;
use crate::error::IngestError;
use crate::expander::Occurrences;
use crate::model::{MasterEvent, OccurrenceInstance, Window};

/// Hard upper bound on concurrent expansions.
pub const MAX_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent expansions, clamped to `1..=3`.
    pub concurrency: usize,
    /// Time slice per expansion, in milliseconds.
    pub call_budget_ms: u64,
    /// Occurrences produced between yield points inside one expansion.
    pub yield_every: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            call_budget_ms: 200,
            yield_every: 64,
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone)]
pub struct ExpansionRequest {
    pub master: Arc<MasterEvent>,
    pub window: Window,
}

/// Why an expansion stopped before exhausting its series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    /// The per-call time slice ran out.
    Budget,
    /// The pool was cancelled.
    Cancelled,
}

#[derive(Debug)]
pub enum ExpansionStatus {
    Complete,
    Partial(PartialReason),
    Failed(IngestError),
}

/// Result for one request, tagged with its position and master identity.
#[derive(Debug)]
pub struct ExpansionOutcome {
    pub index: usize,
    pub uid: Arc<str>,
    pub status: ExpansionStatus,
    pub occurrences: Vec<OccurrenceInstance>,
}

/// An explicitly owned expansion pool. Create one per host (or per test).
#[derive(Debug)]
pub struct WorkerPool {
    concurrency: usize,
    budget: Duration,
    yield_every: usize,
    policy: DstPolicy,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig, policy: DstPolicy) -> Self {
        let concurrency = config.concurrency.clamp(1, MAX_CONCURRENCY);
        if concurrency != config.concurrency {
            tracing::warn!(
                requested = config.concurrency,
                using = concurrency,
                "Pool concurrency out of range, clamped"
            );
        }
        Self {
            concurrency,
            budget: Duration::from_millis(config.call_budget_ms),
            yield_every: config.yield_every.max(1),
            policy,
            gate: Arc::new(Semaphore::new(concurrency)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Stop scheduling new work. In-flight expansions stop at their next
    /// yield point and report what they produced.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.gate.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Expand every request, preserving request order in the output.
    pub fn expand_all<I>(&self, requests: I) -> impl Stream<Item = ExpansionOutcome> + '_
    where
        I: IntoIterator<Item = ExpansionRequest>,
        I::IntoIter: 'static,
    {
        stream::iter(requests.into_iter().enumerate())
            .map(move |(index, request)| self.run(index, request))
            .buffered(self.concurrency)
    }

    async fn run(&self, index: usize, request: ExpansionRequest) -> ExpansionOutcome {
        let ExpansionRequest { master, window } = request;
        let uid = master.uid.clone();
        let outcome = |status, occurrences| ExpansionOutcome {
            index,
            uid: uid.clone(),
            status,
            occurrences,
        };

        let Ok(_permit) = self.gate.acquire().await else {
            return outcome(ExpansionStatus::Partial(PartialReason::Cancelled), Vec::new());
        };
        if self.cancel.is_cancelled() {
            return outcome(ExpansionStatus::Partial(PartialReason::Cancelled), Vec::new());
        }

        let iter = match Occurrences::new(&master, window, self.policy) {
            Ok(iter) => iter,
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Skipping master with invalid recurrence");
                return outcome(ExpansionStatus::Failed(e), Vec::new());
            }
        };

        let deadline = Instant::now() + self.budget;
        let mut occurrences = Vec::new();
        let mut status = ExpansionStatus::Complete;
        let mut since_yield = 0;
        for occurrence in iter {
            occurrences.push(occurrence);
            since_yield += 1;
            if since_yield < self.yield_every {
                continue;
            }
            since_yield = 0;
            tokio::task::yield_now().await;
            if self.cancel.is_cancelled() {
                status = ExpansionStatus::Partial(PartialReason::Cancelled);
                break;
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    uid = %uid,
                    produced = occurrences.len(),
                    budget_ms = self.budget.as_millis() as u64,
                    "Expansion exceeded its time slice, returning partial series"
                );
                status = ExpansionStatus::Partial(PartialReason::Budget);
                break;
            }
        }
        drop(_permit);
        tokio::task::yield_now().await;
        outcome(status, occurrences)
    }
}
