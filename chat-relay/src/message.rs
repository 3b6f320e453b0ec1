use std::io;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name carrying chat messages. The only event the relay rebroadcasts.
pub const MESSAGE_EVENT: &str = "message";

/// A single chat line as it travels between clients and sits in a display list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub text: String,
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub timestamp: String,
    pub is_system: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: now_iso8601(),
            is_system: false,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: now_iso8601(),
            is_system: true,
        }
    }
}

/// One named event on the wire: `{"event": "...", "data": ...}`.
///
/// `data` stays an untyped JSON value so the relay can forward payloads it
/// never looked at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn message(message: &Message) -> io::Result<Self> {
        let data = serde_json::to_value(message).map_err(to_io_error)?;
        Ok(Self::new(MESSAGE_EVENT, data))
    }

    pub fn is_message(&self) -> bool {
        self.event == MESSAGE_EVENT
    }

    pub fn encode(&self) -> io::Result<String> {
        serde_json::to_string(self).map_err(to_io_error)
    }

    pub fn decode(frame: &str) -> io::Result<Self> {
        serde_json::from_str(frame).map_err(to_io_error)
    }

    /// Returns `Ok(None)` for events other than `message` and an error when a
    /// `message` payload is not Message-shaped.
    pub fn into_message(self) -> io::Result<Option<Message>> {
        if !self.is_message() {
            return Ok(None);
        }
        serde_json::from_value(self.data)
            .map(Some)
            .map_err(to_io_error)
    }
}

/// Formats the current instant the way browsers' `Date.toISOString()` does.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
