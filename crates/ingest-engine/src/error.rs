//! Error types for ingest-engine operations.
//!
//! Only feed-level conditions ([`IngestError::ContentTooLarge`],
//! [`IngestError::NoComponents`], reader I/O failures, bad configuration)
//! reach the caller. Everything else is caught at the smallest scope and
//! turned into a telemetry warning.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    /// A malformed content line or component boundary. Recovered by skipping.
    #[error("Malformed feed at line {line}: {message}")]
    Structural { line: usize, message: String },

    /// The feed exceeded the configured size ceiling.
    #[error("Feed too large: {observed} bytes exceeds limit of {limit} bytes")]
    ContentTooLarge { limit: u64, observed: u64 },

    /// The feed contained no usable event components.
    #[error("Feed contained no event components")]
    NoComponents,

    /// A recurrence rule that cannot be expanded. Isolated to one master.
    #[error("Invalid recurrence for {uid}: {reason}")]
    RecurrenceValidation { uid: String, reason: String },

    /// A TZID that could not be mapped to a known zone.
    #[error("Unknown timezone: {0}")]
    TimezoneResolution(String),

    /// A property value that could not be interpreted.
    #[error("Invalid {property} value: {value}")]
    InvalidValue { property: String, value: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error while reading feed: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Whether this error aborts the whole run rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::ContentTooLarge { .. }
                | IngestError::NoComponents
                | IngestError::Config(_)
                | IngestError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
