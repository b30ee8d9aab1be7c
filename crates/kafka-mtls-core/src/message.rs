//! Counter message payload codec.
//!
//! Payloads are UTF-8 JSON objects of the form
//! `{"timestamp": "2024-01-01T00:00:00Z", "count": 0}`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A decoded counter message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterMessage {
    /// RFC 3339 timestamp, kept as sent.
    pub timestamp: String,
    pub count: i64,
}

impl CounterMessage {
    /// A message stamped with the current UTC time at second precision.
    #[must_use]
    pub fn now(count: i64) -> Self {
        Self::at(Utc::now(), count)
    }

    #[must_use]
    pub fn at(time: DateTime<Utc>, count: i64) -> Self {
        Self {
            timestamp: time.to_rfc3339_opts(SecondsFormat::Secs, true),
            count,
        }
    }

    /// Decode a wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] for anything that is not an object with a
    /// string `timestamp` and an integer `count`, and
    /// [`CodecError::InvalidTimestamp`] when the timestamp is not RFC 3339.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let message: Self = serde_json::from_slice(payload)?;
        DateTime::parse_from_rfc3339(&message.timestamp).map_err(|source| {
            CodecError::InvalidTimestamp {
                value: message.timestamp.clone(),
                source,
            }
        })?;
        Ok(message)
    }

    /// Encode to the wire payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // a struct of a String and an i64 always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }
}
