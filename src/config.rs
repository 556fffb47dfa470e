//! Client configuration.
//!
//! Every field has a default, so a JSON document only needs the values it
//! changes:
//!
//! ```
//! use overlay_lookup::ClientConfig;
//!
//! let config = ClientConfig::from_json_str(r#"{ "request_timeout_ms": 750, "max_retries": 0 }"#).unwrap();
//! assert_eq!(config.request_timeout().as_millis(), 750);
//! assert_eq!(config.checkpoint_every, 64);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LookupError, Result};
use crate::log_stream::LogConfig;
use crate::protocol::DEFAULT_MAX_BODY_SIZE;
use crate::tracker::TrackerConfig;
use crate::writer::WriterConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Largest body accepted from the server.
    pub max_body_size: u32,
    /// Time to wait for an ack before retransmitting.
    pub request_timeout_ms: u64,
    /// Retransmissions before a request fails with a timeout.
    pub max_retries: u32,
    /// Period of the timeout and checkpoint sweep.
    pub tick_interval_ms: u64,
    /// Acknowledge the log after this many applied records.
    pub checkpoint_every: u64,
    /// Acknowledge pending log progress at least this often.
    pub checkpoint_interval_ms: u64,
    /// Log records held while a network resynchronizes.
    pub resync_buffer_limit: usize,
    pub writer: WriterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            request_timeout_ms: 5_000,
            max_retries: 2,
            tick_interval_ms: 250,
            checkpoint_every: 64,
            checkpoint_interval_ms: 1_000,
            resync_buffer_limit: 4096,
            writer: WriterConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_body_size == 0 {
            return Err(LookupError::Config("max_body_size must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(LookupError::Config(
                "request_timeout_ms must be positive".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(LookupError::Config("tick_interval_ms must be positive".into()));
        }
        if self.tick_interval_ms > self.request_timeout_ms {
            return Err(LookupError::Config(format!(
                "tick_interval_ms ({}) exceeds request_timeout_ms ({})",
                self.tick_interval_ms, self.request_timeout_ms
            )));
        }
        if self.checkpoint_every == 0 {
            return Err(LookupError::Config("checkpoint_every must be positive".into()));
        }
        if self.resync_buffer_limit == 0 {
            return Err(LookupError::Config(
                "resync_buffer_limit must be positive".into(),
            ));
        }
        if self.writer.channel_capacity == 0 || self.writer.max_pending_frames == 0 {
            return Err(LookupError::Config(
                "writer queue sizes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub(crate) fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            request_timeout: self.request_timeout(),
            max_retries: self.max_retries,
        }
    }

    pub(crate) fn log(&self) -> LogConfig {
        LogConfig {
            checkpoint_every: self.checkpoint_every,
            checkpoint_interval: self.checkpoint_interval(),
            resync_buffer_limit: self.resync_buffer_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.tracker().max_retries, 2);
        assert_eq!(config.log().resync_buffer_limit, 4096);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{ "max_retries": 5, "writer": { "channel_capacity": 16 } }"#,
        )
        .unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.writer.channel_capacity, 16);
        assert_eq!(config.writer.max_pending_frames, 1024);
        assert_eq!(config.tick_interval_ms, 250);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ClientConfig::from_json_str(r#"{ "request_timeout_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, LookupError::Config(_)));

        let err = ClientConfig::from_json_str(
            r#"{ "request_timeout_ms": 100, "tick_interval_ms": 500 }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tick_interval_ms"));
    }

    #[test]
    fn test_bad_json_is_json_error() {
        let err = ClientConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, LookupError::Json(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ClientConfig {
            max_retries: 7,
            ..ClientConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ClientConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_from_missing_file_is_io_error() {
        let err = ClientConfig::from_json_file("/nonexistent/overlay-lookup.json").unwrap_err();
        assert!(matches!(err, LookupError::Io(_)));
    }
}
