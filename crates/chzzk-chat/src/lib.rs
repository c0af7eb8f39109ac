//! CHZZK live chat monitoring with sliding-window keyword detection.
//!
//! A [`ChatSession`] keeps a WebSocket connection to one channel's chat,
//! decodes chat and donation entries, and attributes each message to at
//! most one keyword of a [`KeywordPolicy`]. The [`DetectionEngine`] counts
//! hits per keyword inside a sliding window and writes a
//! [`DetectionRecord`] every time a window reaches its threshold.
//!
//! ## Core Types
//!
//! - [`KeywordPolicy`] / [`KeywordRule`] - Compiled matching rules
//! - [`DetectionEngine`] - Sliding-window counters with count persistence
//! - [`ChatSession`] / [`SessionHandle`] - The connection state machine
//! - [`SessionEvent`] - Events published by a running session
//!
//! ## Collaborators
//!
//! - [`ChzzkApi`] / [`BroadcastMetadata`] - Platform lookups ([`HttpChzzkApi`])
//! - [`Connector`] / [`ChatTransport`] - Frame transport ([`WebSocketConnector`])
//! - [`ConfigStore`] / [`CountsStore`] - Settings persistence ([`SettingsStore`])
//! - [`DetectionSink`] - Detection log ([`TsvEventLog`])

pub mod api;
pub mod config;
pub mod detection;
pub mod error;
pub mod event;
pub mod message;
pub mod policy;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod store;
pub mod websocket;
pub mod writer;

pub use api::{
    AccessTokens, BroadcastMetadata, ChzzkApi, ChzzkCookies, HttpChzzkApi, normalize_channel_id,
    parse_start_time,
};
pub use config::{ContainsKeyword, KeywordSettings, RuntimeOverrides};
pub use detection::{DetectionEngine, KeywordState, WindowCrossing};
pub use error::{ChatError, Result};
pub use event::{EventPublisher, SessionEvent};
pub use message::{ChatMessage, MessageKind};
pub use policy::{KeywordKey, KeywordPolicy, KeywordRule, MatchMode};
pub use reconnect::{ExponentialBackoff, Immediate, ReconnectPolicy};
pub use session::{
    ChatSession, KeywordMonitor, MessageOutcome, SessionContext, SessionHandle, SessionParams,
    SessionState, SessionSummary,
};
pub use store::{ConfigStore, CountsStore, KeywordCounts, SettingsStore};
pub use websocket::{ChatTransport, Connector, DEFAULT_CHAT_ENDPOINT, WebSocketConnector};
pub use writer::{DetectionRecord, DetectionSink, TsvEventLog, format_duration};
