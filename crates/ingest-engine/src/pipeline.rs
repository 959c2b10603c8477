//! End-to-end ingestion: parse, classify, expand, reconcile.
//!
//! [`IngestPipeline`] is the library entry point for the fetch/orchestration
//! layer. Every run returns whatever valid events it could produce together
//! with a telemetry summary; only feed-level failures (oversize input, no
//! event components, reader errors) surface as `Err`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::time::Instant;

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::model::{
    classify, CalendarComponent, Classified, ComponentKind, EventInstance, MasterEvent,
    OccurrenceInstance, OverrideInstance, SingleEvent, Window,
};
use crate::parser::{component_stream, FeedParser, ParseEvent};
use crate::pool::{ExpansionRequest, ExpansionStatus, PartialReason, WorkerPool};
use crate::reconciler::reconcile;
use crate::telemetry::{ParserTelemetry, TelemetrySnapshot, Termination};
use crate::timezone::TimezoneResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// All input was consumed and every master fully expanded.
    Complete,
    /// Something was cut short; see `telemetry.termination` and `truncated`.
    Partial,
}

/// What a run hands back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub status: RunStatus,
    pub window: Window,
    pub events: Vec<EventInstance>,
    pub telemetry: TelemetrySnapshot,
    /// At least one master's expansion stopped early.
    pub truncated: bool,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }
}

/// Everything collected from the parse phase.
#[derive(Default)]
struct Collected {
    masters: Vec<MasterEvent>,
    master_index: HashMap<Arc<str>, usize>,
    overrides: Vec<OverrideInstance>,
    singles: Vec<SingleEvent>,
    event_components: usize,
}

impl Collected {
    /// Keep one master per UID, preferring the higher SEQUENCE.
    fn add_master(&mut self, master: MasterEvent, telemetry: &mut ParserTelemetry) {
        match self.master_index.get(&master.uid) {
            Some(&i) => {
                if master.record.sequence() > self.masters[i].record.sequence() {
                    self.masters[i] = master;
                } else {
                    telemetry.warn(format!(
                        "{}: duplicate recurring master ignored",
                        master.uid
                    ));
                }
            }
            None => {
                self.master_index.insert(master.uid.clone(), self.masters.len());
                self.masters.push(master);
            }
        }
    }
}

/// Resolve `future` unless `deadline` passes first.
async fn before<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, future).await.ok(),
        None => Some(future.await),
    }
}

/// The ingestion pipeline, configured once and run per feed.
#[derive(Debug, Clone)]
pub struct IngestPipeline {
    config: IngestConfig,
    fallback: Tz,
}

impl IngestPipeline {
    /// # Errors
    /// Returns `IngestError::Config` if `config` does not validate.
    pub fn new(config: IngestConfig) -> Result<Self> {
        config.validate()?;
        let fallback = config.default_timezone()?;
        Ok(Self { config, fallback })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// The window a run starting at `start` materializes.
    pub fn window(&self, start: DateTime<Utc>) -> Window {
        Window::from_days(start, self.config.window.days)
    }

    /// Ingest a feed held in memory.
    ///
    /// # Errors
    /// See [`IngestPipeline::run_with_deadline`].
    pub async fn run_str(&self, feed: &str, window_start: DateTime<Utc>) -> Result<IngestReport> {
        self.execute(
            "inline",
            feed.as_bytes(),
            Some(feed.len() as u64),
            window_start,
            None,
        )
        .await
    }

    /// Ingest a feed from an async reader. `size_hint` is the declared length
    /// (e.g. Content-Length), checked against the ceiling before reading.
    ///
    /// # Errors
    /// See [`IngestPipeline::run_with_deadline`].
    pub async fn run_reader<R>(
        &self,
        source: &str,
        reader: R,
        size_hint: Option<u64>,
        window_start: DateTime<Utc>,
    ) -> Result<IngestReport>
    where
        R: AsyncRead + Unpin,
    {
        self.execute(source, reader, size_hint, window_start, None)
            .await
    }

    /// Ingest a feed, abandoning remaining work at `deadline`. Work finished
    /// before the deadline is kept and the report is flagged partial.
    ///
    /// # Errors
    /// Returns `IngestError::ContentTooLarge` if the feed exceeds the size
    /// ceiling, `IngestError::NoComponents` if it holds no VEVENT, and
    /// `IngestError::Io` if the reader fails.
    pub async fn run_with_deadline<R>(
        &self,
        source: &str,
        reader: R,
        size_hint: Option<u64>,
        window_start: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<IngestReport>
    where
        R: AsyncRead + Unpin,
    {
        self.execute(source, reader, size_hint, window_start, Some(deadline))
            .await
    }

    async fn execute<R>(
        &self,
        source: &str,
        reader: R,
        size_hint: Option<u64>,
        window_start: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<IngestReport>
    where
        R: AsyncRead + Unpin,
    {
        let window = self.window(window_start);
        let mut telemetry = ParserTelemetry::new(self.config.breaker.clone());
        let mut resolver = TimezoneResolver::new(self.fallback, self.config.timezone.dst_policy);

        let parser = FeedParser::new(self.config.parser.clone(), source);
        parser.check_declared_size(size_hint)?;
        let collected = self
            .collect(parser, reader, &mut resolver, &mut telemetry, deadline)
            .await?;
        tracing::debug!(
            source,
            masters = collected.masters.len(),
            overrides = collected.overrides.len(),
            singles = collected.singles.len(),
            "Feed parsed"
        );

        let (occurrences, truncated) = self
            .expand(collected.masters, window, &mut telemetry, deadline)
            .await;
        let events = reconcile(occurrences, collected.overrides, collected.singles, window);

        let status = if truncated || telemetry.termination().is_some() {
            RunStatus::Partial
        } else {
            RunStatus::Complete
        };
        tracing::info!(
            source,
            events = events.len(),
            warnings = telemetry.warning_count(),
            ?status,
            "Feed ingested"
        );
        Ok(IngestReport {
            status,
            window,
            events,
            telemetry: telemetry.snapshot(),
            truncated,
        })
    }

    async fn collect<R>(
        &self,
        parser: FeedParser,
        reader: R,
        resolver: &mut TimezoneResolver,
        telemetry: &mut ParserTelemetry,
        deadline: Option<Instant>,
    ) -> Result<Collected>
    where
        R: AsyncRead + Unpin,
    {
        let events = component_stream(reader, parser);
        futures::pin_mut!(events);
        let mut collected = Collected::default();

        loop {
            let Some(next) = before(deadline, events.next()).await else {
                telemetry.terminate(Termination::Deadline);
                break;
            };
            match next {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(ParseEvent::Warning(message))) => telemetry.warn(message),
                Some(Ok(ParseEvent::Component(component))) => {
                    if component.kind != ComponentKind::Event {
                        continue;
                    }
                    collected.event_components += 1;
                    self.admit(&component, resolver, telemetry, &mut collected);
                }
            }

            if telemetry.should_break() {
                telemetry.terminate(Termination::CircuitBreaker);
                break;
            }
            if telemetry.at_ceiling() {
                telemetry.terminate(Termination::EventCeiling);
                break;
            }
        }

        if collected.event_components == 0 && telemetry.termination().is_none() {
            return Err(IngestError::NoComponents);
        }
        Ok(collected)
    }

    fn admit(
        &self,
        component: &CalendarComponent,
        resolver: &mut TimezoneResolver,
        telemetry: &mut ParserTelemetry,
        collected: &mut Collected,
    ) {
        match component.uid() {
            Some(uid) => {
                telemetry.record_item(uid, component.value("RECURRENCE-ID").unwrap_or(""));
            }
            None => telemetry.record_anonymous(),
        }

        match classify(component, resolver) {
            Ok(classification) => {
                for warning in classification.warnings {
                    telemetry.warn(warning);
                }
                match classification.item {
                    Classified::Master(master) => collected.add_master(master, telemetry),
                    Classified::Override(ov) => collected.overrides.push(ov),
                    Classified::Single(single) => collected.singles.push(single),
                    Classified::Other(_) => {}
                }
            }
            Err(e) => {
                tracing::debug!(line = component.line, error = %e, "Component skipped");
                telemetry.warn(format!("line {}: {e}", component.line));
            }
        }
    }

    async fn expand(
        &self,
        masters: Vec<MasterEvent>,
        window: Window,
        telemetry: &mut ParserTelemetry,
        deadline: Option<Instant>,
    ) -> (Vec<OccurrenceInstance>, bool) {
        let pool = WorkerPool::new(&self.config.pool, self.config.timezone.dst_policy);
        let requests: Vec<ExpansionRequest> = masters
            .into_iter()
            .map(|master| ExpansionRequest {
                master: Arc::new(master),
                window,
            })
            .collect();

        let outcomes = pool.expand_all(requests);
        futures::pin_mut!(outcomes);
        let mut occurrences = Vec::new();
        let mut truncated = false;
        let mut deadline = deadline;

        loop {
            let next = match before(deadline, outcomes.next()).await {
                Some(next) => next,
                None => {
                    // Stop scheduling; in-flight and queued work drains quickly.
                    pool.cancel();
                    telemetry.terminate(Termination::Deadline);
                    deadline = None;
                    continue;
                }
            };
            let Some(outcome) = next else {
                break;
            };
            match outcome.status {
                ExpansionStatus::Complete => {}
                ExpansionStatus::Partial(reason) => {
                    truncated = true;
                    if reason == PartialReason::Budget {
                        telemetry.warn(format!(
                            "{}: expansion exceeded its time budget after {} occurrences",
                            outcome.uid,
                            outcome.occurrences.len()
                        ));
                    }
                }
                ExpansionStatus::Failed(e) => telemetry.warn(e.to_string()),
            }
            occurrences.extend(outcome.occurrences);
        }

        (occurrences, truncated)
    }
}
