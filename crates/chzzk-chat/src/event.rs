//! Events published by the session worker.
//!
//! Every event is written to the system log through `tracing` and, when a
//! subscriber is attached, forwarded over an unbounded channel. The
//! `Display` output of an event is its system-log line.

use chrono::{DateTime, Utc};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::message::{ChatMessage, format_local};
use crate::session::SessionState;

/// Events emitted by a running [`ChatSession`](crate::session::ChatSession).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Compiled keyword policy, published once before connecting.
    KeywordSetup {
        global_threshold: u32,
        global_window_secs: u32,
        keywords: Vec<String>,
    },
    /// The state machine moved to a new state.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Handshake finished and the session is live.
    Connected {
        channel_name: String,
        chat_channel_id: String,
    },
    /// A decoded chat or donation entry.
    Chat(ChatMessage),
    /// A keyword window reached its threshold.
    KeywordWindow {
        keyword: String,
        window_count: usize,
        threshold: u32,
        window_secs: u32,
    },
    /// Broadcast start instant refreshed during the handshake.
    BroadcastStart { started_at: DateTime<Utc> },
    /// Non-fatal problem; the session keeps running.
    Warning { message: String },
    /// Connection lost, a new connect cycle follows.
    Reconnecting { attempt: u32, reason: String },
    /// Terminal event, published once after shutdown.
    Stopped,
}

impl SessionEvent {
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. } | Self::Reconnecting { .. })
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeywordSetup {
                global_threshold,
                global_window_secs,
                keywords,
            } => write!(
                f,
                "[KEYSETUP] global threshold={global_threshold}, window={global_window_secs}s, keywords=[{}]",
                keywords.join(", ")
            ),
            Self::StateChanged { from, to } => write!(f, "[SYSTEM] state {from} -> {to}"),
            Self::Connected {
                channel_name,
                chat_channel_id,
            } => write!(f, "[SYSTEM] Connected to {channel_name} chat ({chat_channel_id})"),
            Self::Chat(msg) => write!(
                f,
                "[{}][{}] {} : {}",
                msg.local_time(),
                msg.kind,
                msg.nickname,
                msg.content
            ),
            Self::KeywordWindow {
                keyword,
                window_count,
                threshold,
                window_secs,
            } => write!(
                f,
                "[KEYCOUNT] {keyword} window={window_secs}s count={window_count} (threshold={threshold})"
            ),
            Self::BroadcastStart { started_at } => {
                write!(f, "[BROADCAST] started at {}", format_local(*started_at))
            }
            Self::Warning { message } => write!(f, "[WARN] {message}"),
            Self::Reconnecting { attempt, reason } => {
                write!(f, "[SYSTEM] Reconnecting (attempt {attempt}): {reason}")
            }
            Self::Stopped => f.write_str("[SYSTEM] Session stopped"),
        }
    }
}

/// Writes events to the system log and forwards them to the host.
#[derive(Debug, Clone, Default)]
pub struct EventPublisher {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventPublisher {
    /// Publisher forwarding to `tx`.
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Log-only publisher.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: SessionEvent) {
        if event.is_warning() {
            warn!("{}", event);
        } else {
            info!("{}", event);
        }

        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[test]
    fn test_chat_line() {
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let msg = ChatMessage::new(MessageKind::Donation, "u1", "viewer", "gg").with_timestamp(ts);
        let line = SessionEvent::Chat(msg).to_string();

        assert_eq!(line, format!("[{}][DONATION] viewer : gg", format_local(ts)));
    }

    #[test]
    fn test_keyword_window_line() {
        let event = SessionEvent::KeywordWindow {
            keyword: "Win".into(),
            window_count: 3,
            threshold: 2,
            window_secs: 15,
        };
        assert_eq!(event.to_string(), "[KEYCOUNT] Win window=15s count=3 (threshold=2)");
    }

    #[test]
    fn test_publisher_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publisher = EventPublisher::new(tx);

        publisher.publish(SessionEvent::warning("metadata unavailable"));
        publisher.publish(SessionEvent::Stopped);

        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Warning { .. }));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Stopped));
    }

    #[test]
    fn test_publisher_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        EventPublisher::new(tx).publish(SessionEvent::Stopped);
        EventPublisher::detached().publish(SessionEvent::Stopped);
    }
}
