//! Per-run counters and the corruption circuit breaker.
//!
//! A corrupted or adversarial feed tends to repeat the same broken block over
//! and over. The breaker watches two signals, the share of duplicate event
//! identities and the number of recoverable warnings, and trips only when
//! **both** are over threshold. Legitimate feeds routinely repeat a few
//! all-day events or carry a handful of odd lines; neither alone halts a run.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Thresholds for [`ParserTelemetry::should_break`] and the event ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Trip when `duplicates / processed` exceeds this ratio...
    pub duplicate_ratio_threshold: f64,
    /// ...and the warning count exceeds this.
    pub warning_threshold: usize,
    /// Stop collecting after this many components. Not an error.
    pub max_events: usize,
    /// Warning messages kept verbatim; later ones are only counted.
    pub max_retained_warnings: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            duplicate_ratio_threshold: 0.5,
            warning_threshold: 50,
            max_events: 5000,
            max_retained_warnings: 100,
        }
    }
}

/// Why a run stopped before consuming all input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Duplicate ratio and warning count were both over threshold.
    CircuitBreaker,
    /// The absolute event ceiling was reached.
    EventCeiling,
    /// The caller's deadline expired.
    Deadline,
}

/// Serializable view of the counters at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub processed: usize,
    pub unique: usize,
    pub duplicates: usize,
    pub duplicate_ratio: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
}

/// Live counters for one parse/expand run.
#[derive(Debug, Clone)]
pub struct ParserTelemetry {
    config: BreakerConfig,
    processed: usize,
    seen: HashSet<(String, String)>,
    duplicates: usize,
    warning_count: usize,
    warnings: Vec<String>,
    termination: Option<Termination>,
}

impl ParserTelemetry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            processed: 0,
            seen: HashSet::new(),
            duplicates: 0,
            warning_count: 0,
            warnings: Vec::new(),
            termination: None,
        }
    }

    /// Count one item. `override_marker` is the RECURRENCE-ID (empty for
    /// masters and singles) so an override never looks like a repeat of
    /// its master. Returns `true` if the identity was already seen.
    pub fn record_item(&mut self, uid: &str, override_marker: &str) -> bool {
        self.processed += 1;
        let fresh = self
            .seen
            .insert((uid.to_string(), override_marker.to_string()));
        if !fresh {
            self.duplicates += 1;
        }
        !fresh
    }

    /// Count an item that carries no identity (e.g. a VEVENT without UID).
    pub fn record_anonymous(&mut self) {
        self.processed += 1;
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warning_count += 1;
        if self.warnings.len() < self.config.max_retained_warnings {
            self.warnings.push(message.into());
        }
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    pub fn duplicate_ratio(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.processed as f64
        }
    }

    /// True only when both the duplicate ratio and the warning count exceed
    /// their thresholds.
    pub fn should_break(&self) -> bool {
        self.warning_count > self.config.warning_threshold
            && self.duplicate_ratio() > self.config.duplicate_ratio_threshold
    }

    /// True once the event ceiling has been reached.
    pub fn at_ceiling(&self) -> bool {
        self.processed >= self.config.max_events
    }

    /// Record why the run stopped early. The first reason wins.
    pub fn terminate(&mut self, reason: Termination) {
        if self.termination.is_none() {
            match reason {
                Termination::CircuitBreaker => tracing::warn!(
                    processed = self.processed,
                    duplicates = self.duplicates,
                    warnings = self.warning_count,
                    "Circuit breaker tripped, returning partial results"
                ),
                Termination::EventCeiling => tracing::info!(
                    max_events = self.config.max_events,
                    "Event ceiling reached, remaining components ignored"
                ),
                Termination::Deadline => tracing::warn!(
                    processed = self.processed,
                    "Deadline expired, returning partial results"
                ),
            }
            self.termination = Some(reason);
        }
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            processed: self.processed,
            unique: self.seen.len(),
            duplicates: self.duplicates,
            duplicate_ratio: self.duplicate_ratio(),
            warning_count: self.warning_count,
            warnings: self.warnings.clone(),
            termination: self.termination,
        }
    }
}
