//! Wire format of the memory queue.
//!
//! Every message is a flat JSON object with exactly three keys:
//!
//! - `type`: what the worker should do with the text (`extract`, `summarize`)
//! - `text`: the user question or search result to process
//! - `ts`: seconds since the UNIX epoch, possibly fractional; filled in at
//!   creation time when absent
//!
//! Unknown keys are rejected so that producer/consumer drift shows up as a
//! decode failure instead of silently losing data.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of memory work requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Extract long-term memory candidates from a user question.
    Extract,
    /// Condense a search result into a short summary.
    Summarize,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Extract => "extract",
            MessageKind::Summarize => "summarize",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "extract" => Ok(MessageKind::Extract),
            "summarize" => Ok(MessageKind::Summarize),
            other => Err(format!("unknown message type '{other}'")),
        }
    }
}

/// A message enqueued for the memory worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub text: String,
    #[serde(default = "unix_now")]
    pub ts: f64,
}

/// Why a delivery body could not be turned into a [`MemoryMessage`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message body")]
    Empty,

    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl MemoryMessage {
    /// Creates a message stamped with the current time.
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            ts: unix_now(),
        }
    }

    pub fn with_timestamp(mut self, ts: f64) -> Self {
        self.ts = ts;
        self
    }

    /// Builds a message from a caller-supplied mapping (`text`, `type`, optional `ts`).
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }
        let text = std::str::from_utf8(body)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Short prefix of the text, safe to put in log lines.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut out: String = self.text.chars().take(max_chars).collect();
        if self.text.chars().count() > max_chars {
            out.push_str("...");
        }
        out
    }
}
