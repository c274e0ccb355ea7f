//! Client configuration
//!
//! Loaded from JSON; every field has a default, so `{}` is a valid config.

use serde::Deserialize;
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Largest sample count the transport carries in one message
    pub max_samples_per_message: usize,
    /// Applied to every awaited reply and to blocking create
    pub reply_timeout_ms: Option<u64>,
    /// How long blocking create waits for the connection; none = fail at once
    pub connect_timeout_ms: Option<u64>,
    pub fetch_metadata_on_create: bool,
    /// Size of the buffer id namespace for the bundled allocator
    pub buffer_id_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_samples_per_message: 1600,
            reply_timeout_ms: None,
            connect_timeout_ms: None,
            fetch_metadata_on_create: true,
            buffer_id_capacity: 1024,
        }
    }
}

impl ClientConfig {
    /// Read and validate a JSON config
    ///
    /// # Errors
    ///
    /// `Config` if the input is not valid JSON, has unknown keys, or fails `validate`.
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, Error> {
        let config: Self = serde_json::from_reader(reader)
            .map_err(|e| Error::Config(format!("failed to parse client config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Same as `from_reader`.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Self::from_reader(json.as_bytes())
    }

    /// # Errors
    ///
    /// `Config` if a size is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_samples_per_message == 0 {
            return Err(Error::Config("max_samples_per_message must be at least 1".into()));
        }
        if self.buffer_id_capacity == 0 {
            return Err(Error::Config("buffer_id_capacity must be at least 1".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}
