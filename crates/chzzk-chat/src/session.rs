//! Chat session state machine.
//!
//! A session runs as a single tokio task:
//!
//! ```text
//! Disconnected -> Connecting -> HandshakeSent -> RecentHistoryRequested -> Live
//!                     ^                                                    |
//!                     +------------------ Reconnecting <-------------------+
//! ```
//!
//! Any state moves to `Stopped` when the cancellation token fires or the
//! [`SessionHandle`] is dropped. Every await point races against the token,
//! so stopping never waits for the next inbound frame.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::api::{BroadcastMetadata, ChzzkApi, normalize_channel_id};
use crate::detection::DetectionEngine;
use crate::error::{ChatError, Result};
use crate::event::{EventPublisher, SessionEvent};
use crate::message::{ChatMessage, MessageKind};
use crate::policy::{KeywordKey, KeywordPolicy};
use crate::protocol::{
    ChatCommand, InboundFrame, RECENT_MESSAGE_COUNT, SkipReason, connect_frame, decode_entry,
    pong_frame, recent_chat_frame, send_chat_frame,
};
use crate::reconnect::ReconnectPolicy;
use crate::store::{CountsStore, KeywordCounts};
use crate::websocket::{ChatTransport, Connector};
use crate::writer::{DetectionRecord, DetectionSink, elapsed_since};

/// Lifecycle states of a chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    HandshakeSent,
    RecentHistoryRequested,
    Live,
    Reconnecting,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::HandshakeSent => "handshake_sent",
            Self::RecentHistoryRequested => "recent_history_requested",
            Self::Live => "live",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Per-connection identity. Rebuilt from scratch on every connect.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub channel_id: String,
    pub chat_channel_id: String,
    pub session_id: String,
    pub access_token: String,
    pub extra_token: String,
    pub user_id_hash: String,
    pub channel_name: String,
    pub broadcast_start: Option<DateTime<Utc>>,
}

/// Result of processing one chat/donation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Attributed to `keyword`; `fired` when its window reached the threshold
    /// and the detection was recorded.
    Matched { keyword: KeywordKey, fired: bool },
    /// No rule matched.
    NoMatch,
    /// Entry could not be decoded.
    Skipped(SkipReason),
}

/// Policy, detection engine and sink wired together.
pub struct KeywordMonitor {
    engine: DetectionEngine,
    sink: Box<dyn DetectionSink>,
    publisher: EventPublisher,
    detections: u64,
}

impl KeywordMonitor {
    pub fn new(engine: DetectionEngine, sink: Box<dyn DetectionSink>, publisher: EventPublisher) -> Self {
        Self {
            engine,
            sink,
            publisher,
            detections: 0,
        }
    }

    pub fn engine(&self) -> &DetectionEngine {
        &self.engine
    }

    /// Detection records written so far.
    pub fn detections(&self) -> u64 {
        self.detections
    }

    /// Decode one raw entry, publish its chat line and run detection on it.
    pub async fn process_entry(
        &mut self,
        kind: MessageKind,
        raw: &Value,
        ctx: &SessionContext,
    ) -> MessageOutcome {
        match decode_entry(kind, raw) {
            Ok(msg) => {
                self.publisher.publish(SessionEvent::Chat(msg.clone()));
                self.observe(&msg, ctx).await
            }
            Err(reason) => {
                debug!(%reason, "Skipping chat entry");
                MessageOutcome::Skipped(reason)
            }
        }
    }

    /// Attribute a message and record the hit.
    pub async fn observe(&mut self, msg: &ChatMessage, ctx: &SessionContext) -> MessageOutcome {
        let key = match self.engine.policy().attribute(&msg.content) {
            Some(rule) => rule.key().clone(),
            None => return MessageOutcome::NoMatch,
        };

        let crossing = match self.engine.record_hit(&key, msg.timestamp).await {
            Ok(Some(crossing)) => crossing,
            Ok(None) => return MessageOutcome::Matched { keyword: key, fired: false },
            Err(e) => {
                self.publisher
                    .publish(SessionEvent::warning(format!("Failed to save keyword counts: {e}")));
                return MessageOutcome::Matched { keyword: key, fired: false };
            }
        };

        let record = DetectionRecord {
            instant: msg.timestamp,
            channel_name: ctx.channel_name.clone(),
            keyword: crossing.display.clone(),
            nickname: msg.nickname.clone(),
            elapsed: elapsed_since(ctx.broadcast_start, msg.timestamp),
            message: msg.content.clone(),
        };
        if let Err(e) = self.sink.append(&record).await {
            self.publisher
                .publish(SessionEvent::warning(format!("Failed to write detection record: {e}")));
        } else {
            self.detections += 1;
        }

        self.publisher.publish(SessionEvent::KeywordWindow {
            keyword: crossing.display,
            window_count: crossing.window_count,
            threshold: crossing.threshold,
            window_secs: crossing.window_secs,
        });

        MessageOutcome::Matched {
            keyword: key,
            fired: true,
        }
    }

    pub fn reset_windows(&mut self) {
        self.engine.reset_windows();
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await
    }
}

/// Everything a session needs. Collaborators are injected so tests can
/// script the transport and the platform API.
pub struct SessionParams {
    /// Channel id or live URL
    pub channel_id: String,
    pub endpoint: String,
    pub policy: Arc<KeywordPolicy>,
    /// Cumulative counts to continue from
    pub initial_counts: KeywordCounts,
    pub api: Arc<dyn ChzzkApi>,
    pub metadata: Arc<dyn BroadcastMetadata>,
    pub connector: Arc<dyn Connector>,
    pub counts_store: Arc<dyn CountsStore>,
    pub sink: Box<dyn DetectionSink>,
    pub reconnect: Box<dyn ReconnectPolicy>,
}

/// Returned by the worker when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub cumulative_counts: KeywordCounts,
    pub reconnects: u32,
    pub detections: u64,
}

#[derive(Debug)]
enum SessionCommand {
    SendChat(String),
}

/// Control handle of a running session.
///
/// Dropping the handle stops the session.
pub struct SessionHandle {
    cancel: CancellationToken,
    _stop_on_drop: DropGuard,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<Result<SessionSummary>>,
}

impl SessionHandle {
    /// Request a graceful stop. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a chat message; it is sent once the session is live.
    pub fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.command_tx
            .send(SessionCommand::SendChat(text.into()))
            .map_err(|_| ChatError::other("Session is not running"))
    }

    /// Wait for the worker to exit.
    pub async fn join(self) -> Result<SessionSummary> {
        // Keep the guard and the command channel alive while waiting.
        let Self {
            task,
            _stop_on_drop: _guard,
            command_tx: _commands,
            ..
        } = self;
        task.await
            .map_err(|e| ChatError::other(format!("Session task failed: {e}")))?
    }
}

/// Entry point for running a chat session.
pub struct ChatSession;

impl ChatSession {
    /// Spawn the session worker on the current runtime.
    pub fn spawn(params: SessionParams) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = SessionWorker::new(params, EventPublisher::new(event_tx), command_rx);
        let task = tokio::spawn(worker.run(cancel.clone()));

        let handle = SessionHandle {
            _stop_on_drop: cancel.clone().drop_guard(),
            cancel,
            command_tx,
            task,
        };
        (handle, event_rx)
    }
}

/// Why a connection ended.
enum LoopExit {
    Stopped,
    Reconnect(String),
}

/// What a dispatched frame asks the live loop to do.
enum FrameAction {
    Continue(Vec<MessageOutcome>),
    ChannelChanged(String),
    Stopped,
}

struct SessionWorker {
    channel_id: String,
    endpoint: String,
    api: Arc<dyn ChzzkApi>,
    metadata: Arc<dyn BroadcastMetadata>,
    connector: Arc<dyn Connector>,
    reconnect: Box<dyn ReconnectPolicy>,
    monitor: KeywordMonitor,
    publisher: EventPublisher,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    state: SessionState,
    user_id_hash: String,
    channel_name: String,
    reconnects: u32,
    consecutive_failures: u32,
}

impl SessionWorker {
    fn new(
        params: SessionParams,
        publisher: EventPublisher,
        command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let SessionParams {
            channel_id,
            endpoint,
            policy,
            initial_counts,
            api,
            metadata,
            connector,
            counts_store,
            sink,
            reconnect,
        } = params;

        let engine = DetectionEngine::new(policy, &initial_counts, counts_store);
        let monitor = KeywordMonitor::new(engine, sink, publisher.clone());

        Self {
            channel_id,
            endpoint,
            api,
            metadata,
            connector,
            reconnect,
            monitor,
            publisher,
            command_rx,
            state: SessionState::Disconnected,
            user_id_hash: String::new(),
            channel_name: String::new(),
            reconnects: 0,
            consecutive_failures: 0,
        }
    }

    async fn run(mut self, cancel: CancellationToken) -> Result<SessionSummary> {
        let result = self.run_inner(&cancel).await;

        if let Err(e) = self.monitor.close().await {
            warn!(error = %e, "Failed to close detection log");
        }
        self.set_state(SessionState::Stopped);
        self.publisher.publish(SessionEvent::Stopped);

        result.map(|()| SessionSummary {
            cumulative_counts: self.monitor.engine().cumulative_counts(),
            reconnects: self.reconnects,
            detections: self.monitor.detections(),
        })
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.channel_id = normalize_channel_id(&self.channel_id)?;
        self.publish_policy();

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            r = resolve_identity(self.api.as_ref(), &self.channel_id) => r,
        };
        (self.user_id_hash, self.channel_name) = resolved?;
        info!(channel = %self.channel_name, channel_id = %self.channel_id, "Resolved channel");

        loop {
            let reason = match self.connect_and_run(cancel).await {
                LoopExit::Stopped => return Ok(()),
                LoopExit::Reconnect(reason) => reason,
            };

            self.reconnects += 1;
            self.consecutive_failures += 1;
            self.set_state(SessionState::Reconnecting);
            self.monitor.reset_windows();
            self.publisher.publish(SessionEvent::Reconnecting {
                attempt: self.consecutive_failures,
                reason,
            });

            if let Some(delay) = self.reconnect.next_delay(self.consecutive_failures) {
                debug!(?delay, "Waiting before reconnect");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    fn publish_policy(&self) {
        let policy = self.monitor.engine().policy();
        self.publisher.publish(SessionEvent::KeywordSetup {
            global_threshold: policy.global_threshold(),
            global_window_secs: policy.global_window_secs(),
            keywords: policy.rules().map(|r| r.display().to_string()).collect(),
        });
    }

    fn set_state(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        self.publisher.publish(SessionEvent::StateChanged { from, to });
    }

    /// One connect cycle: resolve, open, handshake, then the live loop.
    async fn connect_and_run(&mut self, cancel: &CancellationToken) -> LoopExit {
        self.set_state(SessionState::Connecting);

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LoopExit::Stopped,
            r = resolve_connection(
                self.api.as_ref(),
                &self.channel_id,
                &self.user_id_hash,
                &self.channel_name,
            ) => r,
        };
        let mut ctx = match resolved {
            Ok(ctx) => ctx,
            Err(e) => return LoopExit::Reconnect(format!("Failed to resolve chat channel: {e}")),
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LoopExit::Stopped,
            r = self.connector.open(&self.endpoint) => r,
        };
        let mut transport = match opened {
            Ok(transport) => transport,
            Err(e) => return LoopExit::Reconnect(e.to_string()),
        };

        let exit = match self.handshake(transport.as_mut(), &mut ctx, cancel).await {
            Ok(true) => self.live(transport.as_mut(), &ctx, cancel).await,
            Ok(false) => LoopExit::Stopped,
            Err(e) => LoopExit::Reconnect(format!("Handshake failed: {e}")),
        };

        if let Err(e) = transport.close().await {
            debug!(error = %e, "Error while closing chat connection");
        }
        exit
    }

    /// Returns `Ok(false)` when stopped mid-handshake.
    async fn handshake(
        &mut self,
        transport: &mut dyn ChatTransport,
        ctx: &mut SessionContext,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let frame = connect_frame(&ctx.chat_channel_id, &ctx.user_id_hash, &ctx.access_token)?;
        transport.send(&frame).await?;
        self.set_state(SessionState::HandshakeSent);

        let Some(raw) = recv_or_cancel(transport, cancel).await else {
            return Ok(false);
        };
        let response = InboundFrame::parse(&raw?)?;
        ctx.session_id = response
            .session_id()
            .ok_or_else(|| ChatError::protocol(format!("No session id in response (cmd {})", response.cmd)))?
            .to_string();

        let start = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            r = self.metadata.fetch_start_instant(&ctx.channel_id) => r,
        };
        ctx.broadcast_start = match start {
            Ok(started_at) => {
                self.publisher.publish(SessionEvent::BroadcastStart { started_at });
                Some(started_at)
            }
            Err(e) => {
                self.publisher
                    .publish(SessionEvent::warning(format!("Broadcast start time unavailable: {e}")));
                None
            }
        };

        let frame = recent_chat_frame(&ctx.chat_channel_id, &ctx.session_id, RECENT_MESSAGE_COUNT)?;
        transport.send(&frame).await?;
        self.set_state(SessionState::RecentHistoryRequested);

        // Any reply completes the handshake; buffered history is not replayed.
        let Some(raw) = recv_or_cancel(transport, cancel).await else {
            return Ok(false);
        };
        raw?;

        self.set_state(SessionState::Live);
        self.consecutive_failures = 0;
        self.reconnect.reset();
        self.publisher.publish(SessionEvent::Connected {
            channel_name: ctx.channel_name.clone(),
            chat_channel_id: ctx.chat_channel_id.clone(),
        });
        Ok(true)
    }

    async fn live(
        &mut self,
        transport: &mut dyn ChatTransport,
        ctx: &SessionContext,
        cancel: &CancellationToken,
    ) -> LoopExit {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return LoopExit::Stopped,

                cmd = self.command_rx.recv() => match cmd {
                    Some(SessionCommand::SendChat(text)) => {
                        let sent = match send_chat_frame(
                            &ctx.chat_channel_id,
                            &ctx.session_id,
                            &ctx.extra_token,
                            &text,
                            Utc::now(),
                        ) {
                            Ok(frame) => transport.send(&frame).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = sent {
                            return LoopExit::Reconnect(format!("Failed to send chat: {e}"));
                        }
                    }
                    // Every handle is gone.
                    None => return LoopExit::Stopped,
                },

                raw = transport.recv() => {
                    let raw = match raw {
                        Ok(raw) => raw,
                        Err(e) => return LoopExit::Reconnect(e.to_string()),
                    };
                    match self.dispatch(transport, ctx, &raw, cancel).await {
                        Ok(FrameAction::Continue(outcomes)) => {
                            if !outcomes.is_empty() {
                                debug!(entries = outcomes.len(), "Processed chat frame");
                            }
                        }
                        Ok(FrameAction::ChannelChanged(new_id)) => {
                            return LoopExit::Reconnect(format!(
                                "Chat channel changed from {} to {}",
                                ctx.chat_channel_id, new_id
                            ));
                        }
                        Ok(FrameAction::Stopped) => return LoopExit::Stopped,
                        Err(e) => return LoopExit::Reconnect(e.to_string()),
                    }
                }
            }
        }
    }

    /// Handle one inbound frame. Errors end the connection.
    async fn dispatch(
        &mut self,
        transport: &mut dyn ChatTransport,
        ctx: &SessionContext,
        raw: &str,
        cancel: &CancellationToken,
    ) -> Result<FrameAction> {
        let frame = InboundFrame::parse(raw)?;

        match frame.command() {
            ChatCommand::Ping => {
                transport.send(&pong_frame()?).await?;
                let current = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(FrameAction::Stopped),
                    r = self.api.chat_channel_id(&ctx.channel_id) => r,
                };
                match current {
                    Ok(id) if id != ctx.chat_channel_id => {
                        return Ok(FrameAction::ChannelChanged(id));
                    }
                    Ok(_) => {}
                    Err(e) => self.publisher.publish(SessionEvent::warning(format!(
                        "Failed to re-check chat channel: {e}"
                    ))),
                }
                Ok(FrameAction::Continue(Vec::new()))
            }
            cmd => {
                let Some(kind) = cmd.message_kind() else {
                    return Ok(FrameAction::Continue(Vec::new()));
                };
                let mut outcomes = Vec::new();
                for entry in frame.entries() {
                    outcomes.push(self.monitor.process_entry(kind, &entry, ctx).await);
                }
                Ok(FrameAction::Continue(outcomes))
            }
        }
    }
}

async fn resolve_connection(
    api: &dyn ChzzkApi,
    channel_id: &str,
    user_id_hash: &str,
    channel_name: &str,
) -> Result<SessionContext> {
    let chat_channel_id = api.chat_channel_id(channel_id).await?;
    let tokens = api.access_tokens(&chat_channel_id).await?;

    Ok(SessionContext {
        channel_id: channel_id.to_string(),
        chat_channel_id,
        session_id: String::new(),
        access_token: tokens.access_token,
        extra_token: tokens.extra_token,
        user_id_hash: user_id_hash.to_string(),
        channel_name: channel_name.to_string(),
        broadcast_start: None,
    })
}

async fn resolve_identity(api: &dyn ChzzkApi, channel_id: &str) -> Result<(String, String)> {
    let user_id_hash = api.user_id_hash().await?;
    let channel_name = api.channel_name(channel_id).await?;
    Ok((user_id_hash, channel_name))
}

/// `None` when cancelled first.
async fn recv_or_cancel(
    transport: &mut dyn ChatTransport,
    cancel: &CancellationToken,
) -> Option<Result<String>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        r = transport.recv() => Some(r),
    }
}
