//! Chat message types.
//!
//! Decoded chat and donation entries as seen by the detection pipeline.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Kind of content frame an entry arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Regular chat message
    #[default]
    Chat,
    /// Donation with an attached message
    Donation,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => f.write_str("CHAT"),
            Self::Donation => f.write_str("DONATION"),
        }
    }
}

/// A single decoded chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub kind: MessageKind,
    /// Sender id (`anonymous` for anonymous donations)
    pub user_id: String,
    /// Display name of the sender
    pub nickname: String,
    /// Message content
    pub content: String,
    /// Server-side send time
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        kind: MessageKind,
        user_id: impl Into<String>,
        nickname: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            nickname: nickname.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Send time rendered in local time, as used by every log line.
    pub fn local_time(&self) -> String {
        format_local(self.timestamp)
    }
}

/// Format an instant as `%Y-%m-%d %H:%M:%S` in the local timezone.
pub fn format_local(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
