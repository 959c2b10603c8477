//! # ingest-engine
//!
//! Bounded-memory ingestion of iCalendar feeds into a flat, deduplicated list
//! of event instances for a rolling time window.
//!
//! A feed flows through four stages:
//!
//! 1. [`parser`] turns raw bytes into components, one chunk at a time, and
//!    recovers from broken blocks instead of failing the feed.
//! 2. [`model::classify`] sorts each VEVENT into a recurring master, an
//!    override of one occurrence, or a standalone event.
//! 3. [`pool`] expands weekly masters over the window ([`expander`]) with
//!    bounded concurrency and a time slice per master.
//! 4. [`reconciler`] applies overrides, drops cancellations, and collapses
//!    duplicates.
//!
//! [`telemetry`] watches the run and trips a circuit breaker on feeds that
//! look corrupted. [`pipeline::IngestPipeline`] wires the stages together;
//! [`bridge`] runs it from synchronous code.
//!
//! ## Modules
//!
//! - [`parser`] -- streaming content-line parser with size ceilings
//! - [`timezone`] -- TZID normalization and date-value parsing
//! - [`dst`] -- resolution of wall-clock times that fall in DST gaps/folds
//! - [`model`] -- components, event records, and output instances
//! - [`expander`] -- weekly RRULE expansion
//! - [`pool`] -- cooperative expansion pool
//! - [`reconciler`] -- override application and deduplication
//! - [`telemetry`] -- run counters and circuit breaker
//! - [`pipeline`] -- end-to-end orchestration
//! - [`bridge`] -- sync-to-async entry point
//! - [`config`] -- TOML configuration
//! - [`error`] -- Error types

pub mod bridge;
pub mod config;
pub mod dst;
pub mod error;
pub mod expander;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod pool;
pub mod reconciler;
pub mod telemetry;
pub mod timezone;

pub use config::IngestConfig;
pub use dst::DstPolicy;
pub use error::{IngestError, Result};
pub use expander::{expand, RecurrenceRule};
pub use model::{EventInstance, Window};
pub use parser::{parse_str, FeedParser, ParseEvent, ParserLimits};
pub use pipeline::{IngestPipeline, IngestReport, RunStatus};
pub use pool::WorkerPool;
pub use reconciler::reconcile;
pub use telemetry::{ParserTelemetry, TelemetrySnapshot, Termination};
