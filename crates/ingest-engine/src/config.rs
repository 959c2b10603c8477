//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! [window]
//! days = 14
//!
//! [breaker]
//! duplicate_ratio_threshold = 0.5
//! warning_threshold = 50
//!
//! [pool]
//! concurrency = 2
//! call_budget_ms = 200
//!
//! [timezone]
//! default = "Europe/London"
//! dst_policy = "shift_forward"
//! ```

use std::path::Path;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::dst::DstPolicy;
use crate::error::{IngestError, Result};
use crate::parser::ParserLimits;
use crate::pool::PoolConfig;
use crate::telemetry::BreakerConfig;

/// Longest accepted expansion window.
pub const MAX_WINDOW_DAYS: u32 = 366;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Days after the window start to materialize.
    pub days: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { days: 14 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimezoneConfig {
    /// Zone for floating times and the fallback for unknown TZIDs.
    pub default: String,
    pub dst_policy: DstPolicy,
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self {
            default: "UTC".to_string(),
            dst_policy: DstPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub window: WindowConfig,
    pub parser: ParserLimits,
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
    pub timezone: TimezoneConfig,
}

impl IngestConfig {
    /// Parse a TOML document and validate it.
    ///
    /// # Errors
    /// Returns `IngestError::Config` if the document is malformed or invalid.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: IngestConfig =
            toml::from_str(raw).map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    /// Returns `IngestError::Io` if the file cannot be read and
    /// `IngestError::Config` if its contents are invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// The configured fallback zone.
    ///
    /// # Errors
    /// Returns `IngestError::Config` if the name is not a known zone.
    pub fn default_timezone(&self) -> Result<Tz> {
        crate::timezone::normalize_tzid(&self.timezone.default)
            .parse()
            .map_err(|_| {
                IngestError::Config(format!(
                    "unknown default timezone {:?}",
                    self.timezone.default
                ))
            })
    }

    /// Reject values no run could succeed with.
    ///
    /// Pool concurrency is not checked here; the pool clamps it.
    ///
    /// # Errors
    /// Returns `IngestError::Config` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_WINDOW_DAYS).contains(&self.window.days) {
            return Err(IngestError::Config(format!(
                "window.days must be within 1..={MAX_WINDOW_DAYS}, got {}",
                self.window.days
            )));
        }
        if !(0.0..=1.0).contains(&self.breaker.duplicate_ratio_threshold) {
            return Err(IngestError::Config(
                "breaker.duplicate_ratio_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if self.breaker.max_events == 0 {
            return Err(IngestError::Config("breaker.max_events must be at least 1".into()));
        }
        if self.parser.max_feed_bytes == 0 || self.parser.max_line_bytes == 0 {
            return Err(IngestError::Config(
                "parser size limits must be non-zero".into(),
            ));
        }
        if self.parser.chunk_size == 0 {
            return Err(IngestError::Config("parser.chunk_size must be non-zero".into()));
        }
        self.default_timezone()?;
        Ok(())
    }
}
