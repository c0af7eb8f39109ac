//! CHZZK chat wire protocol.
//!
//! Frames are JSON text messages of the shape
//! `{ver, svcid, cid, cmd, tid, sid?, bdy}`. Only the commands the session
//! needs are modelled; everything else decodes to [`ChatCommand::Other`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ChatError, Result};
use crate::message::{ChatMessage, MessageKind};

/// Protocol version sent with every frame.
pub const PROTOCOL_VERSION: &str = "2";

/// Service id of the CHZZK chat cluster.
pub const SERVICE_ID: &str = "game";

/// Device type announced in the CONNECT frame (PC web).
pub const DEVICE_TYPE: u32 = 2001;

/// Number of buffered messages requested right after the handshake.
pub const RECENT_MESSAGE_COUNT: u32 = 50;

/// Display name used for anonymous donations.
pub const ANONYMOUS_NICKNAME: &str = "익명의 후원자";

/// Sender id the server uses for anonymous donations.
const ANONYMOUS_UID: &str = "anonymous";

/// Command codes understood by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatCommand {
    Ping,
    Pong,
    Connect,
    Connected,
    RequestRecentChat,
    RecentChat,
    SendChat,
    Chat,
    Donation,
    Other(i64),
}

impl ChatCommand {
    /// Numeric code used on the wire.
    pub fn code(self) -> i64 {
        match self {
            Self::Ping => 0,
            Self::Pong => 10000,
            Self::Connect => 100,
            Self::Connected => 10100,
            Self::RequestRecentChat => 5101,
            Self::RecentChat => 15101,
            Self::SendChat => 3101,
            Self::Chat => 93101,
            Self::Donation => 93102,
            Self::Other(code) => code,
        }
    }

    /// Map a wire code to a command.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Ping,
            10000 => Self::Pong,
            100 => Self::Connect,
            10100 => Self::Connected,
            5101 => Self::RequestRecentChat,
            15101 => Self::RecentChat,
            3101 => Self::SendChat,
            93101 => Self::Chat,
            93102 => Self::Donation,
            other => Self::Other(other),
        }
    }

    /// Message kind carried by content commands.
    pub fn message_kind(self) -> Option<MessageKind> {
        match self {
            Self::Chat => Some(MessageKind::Chat),
            Self::Donation => Some(MessageKind::Donation),
            _ => None,
        }
    }
}

/// Outbound frame. Channel context is flattened in by the builders below.
#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    ver: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    svcid: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<&'a str>,
    cmd: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bdy: Option<Value>,
}

impl<'a> OutboundFrame<'a> {
    fn channel(cid: &'a str, cmd: ChatCommand, tid: u32) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            svcid: Some(SERVICE_ID),
            cid: Some(cid),
            cmd: cmd.code(),
            tid: Some(tid),
            retry: None,
            sid: None,
            bdy: None,
        }
    }

    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build the identity/authentication frame sent right after the socket opens.
pub fn connect_frame(chat_channel_id: &str, user_id_hash: &str, access_token: &str) -> Result<String> {
    let mut frame = OutboundFrame::channel(chat_channel_id, ChatCommand::Connect, 1);
    frame.bdy = Some(json!({
        "uid": user_id_hash,
        "devType": DEVICE_TYPE,
        "accTkn": access_token,
        "auth": "SEND",
    }));
    frame.encode()
}

/// Build the request for the last `count` buffered messages.
pub fn recent_chat_frame(chat_channel_id: &str, sid: &str, count: u32) -> Result<String> {
    let mut frame = OutboundFrame::channel(chat_channel_id, ChatCommand::RequestRecentChat, 2);
    frame.sid = Some(sid);
    frame.bdy = Some(json!({ "recentMessageCount": count }));
    frame.encode()
}

/// Build the keepalive reply.
pub fn pong_frame() -> Result<String> {
    OutboundFrame {
        ver: PROTOCOL_VERSION,
        svcid: None,
        cid: None,
        cmd: ChatCommand::Pong.code(),
        tid: None,
        retry: None,
        sid: None,
        bdy: None,
    }
    .encode()
}

/// Build an outgoing chat message.
pub fn send_chat_frame(
    chat_channel_id: &str,
    sid: &str,
    extra_token: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let extras = json!({
        "chatType": "STREAMING",
        "emojis": "",
        "osType": "PC",
        "extraToken": extra_token,
        "streamingChannelId": chat_channel_id,
    });

    let mut frame = OutboundFrame::channel(chat_channel_id, ChatCommand::SendChat, 3);
    frame.retry = Some(false);
    frame.sid = Some(sid);
    frame.bdy = Some(json!({
        "msg": message,
        "msgTypeCode": 1,
        "extras": extras.to_string(),
        "msgTime": now.timestamp(),
    }));
    frame.encode()
}

/// A decoded inbound frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub cmd: i64,
    #[serde(default)]
    pub tid: Option<Value>,
    #[serde(default)]
    pub bdy: Value,
}

impl InboundFrame {
    /// Decode a raw text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ChatError::protocol(format!("Undecodable frame: {}", e)))
    }

    pub fn command(&self) -> ChatCommand {
        ChatCommand::from_code(self.cmd)
    }

    /// Server-assigned session id carried by the CONNECT response.
    pub fn session_id(&self) -> Option<&str> {
        self.bdy.get("sid").and_then(Value::as_str)
    }

    /// Entries of a CHAT/DONATION payload. A single object is treated as one entry.
    pub fn entries(&self) -> Vec<Value> {
        match &self.bdy {
            Value::Array(items) => items.clone(),
            Value::Object(_) => vec![self.bdy.clone()],
            _ => Vec::new(),
        }
    }
}

/// One raw chat/donation entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    #[serde(default)]
    pub uid: Option<String>,
    /// Profile metadata, itself a JSON document encoded as a string.
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub msg_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(default)]
    nickname: Option<String>,
}

/// Why a single entry was not turned into a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Entry did not have the expected JSON shape.
    MalformedEntry,
    /// Named sender without profile metadata.
    MissingProfile,
    /// Profile present but unreadable or without a nickname.
    MalformedProfile,
    /// No message body.
    MissingBody,
    /// No event timestamp.
    MissingTimestamp,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::MalformedEntry => "malformed entry",
            Self::MissingProfile => "missing profile",
            Self::MalformedProfile => "malformed profile",
            Self::MissingBody => "missing message body",
            Self::MissingTimestamp => "missing timestamp",
        };
        f.write_str(reason)
    }
}

/// Decode one entry of a CHAT/DONATION payload.
pub fn decode_entry(kind: MessageKind, raw: &Value) -> std::result::Result<ChatMessage, SkipReason> {
    let entry: ChatEntry =
        serde_json::from_value(raw.clone()).map_err(|_| SkipReason::MalformedEntry)?;

    let uid = entry.uid.unwrap_or_default();
    let nickname = if uid == ANONYMOUS_UID {
        ANONYMOUS_NICKNAME.to_string()
    } else {
        let profile = entry.profile.ok_or(SkipReason::MissingProfile)?;
        serde_json::from_str::<Profile>(&profile)
            .ok()
            .and_then(|p| p.nickname)
            .ok_or(SkipReason::MalformedProfile)?
    };

    let content = entry.msg.ok_or(SkipReason::MissingBody)?;
    let timestamp = entry
        .msg_time
        .and_then(DateTime::from_timestamp_millis)
        .ok_or(SkipReason::MissingTimestamp)?;

    Ok(ChatMessage::new(kind, uid, nickname, content).with_timestamp(timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        for cmd in [
            ChatCommand::Ping,
            ChatCommand::Pong,
            ChatCommand::Connect,
            ChatCommand::Connected,
            ChatCommand::RequestRecentChat,
            ChatCommand::RecentChat,
            ChatCommand::SendChat,
            ChatCommand::Chat,
            ChatCommand::Donation,
        ] {
            assert_eq!(ChatCommand::from_code(cmd.code()), cmd);
        }
        assert_eq!(ChatCommand::from_code(93006), ChatCommand::Other(93006));
    }

    #[test]
    fn test_connect_frame_shape() {
        let frame = connect_frame("N1abc", "hash", "token").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["ver"], "2");
        assert_eq!(value["svcid"], "game");
        assert_eq!(value["cid"], "N1abc");
        assert_eq!(value["cmd"], 100);
        assert_eq!(value["tid"], 1);
        assert_eq!(value["bdy"]["uid"], "hash");
        assert_eq!(value["bdy"]["devType"], 2001);
        assert_eq!(value["bdy"]["accTkn"], "token");
        assert_eq!(value["bdy"]["auth"], "SEND");
        assert!(value.get("sid").is_none());
    }

    #[test]
    fn test_recent_chat_frame_shape() {
        let frame = recent_chat_frame("N1abc", "sid-1", RECENT_MESSAGE_COUNT).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["cmd"], 5101);
        assert_eq!(value["tid"], 2);
        assert_eq!(value["sid"], "sid-1");
        assert_eq!(value["bdy"]["recentMessageCount"], 50);
    }

    #[test]
    fn test_pong_frame_is_minimal() {
        let value: Value = serde_json::from_str(&pong_frame().unwrap()).unwrap();
        assert_eq!(value, json!({ "ver": "2", "cmd": 10000 }));
    }

    #[test]
    fn test_send_chat_frame_embeds_extras() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let frame = send_chat_frame("N1abc", "sid-1", "extra", "hello", now).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["cmd"], 3101);
        assert_eq!(value["retry"], false);
        assert_eq!(value["bdy"]["msg"], "hello");
        assert_eq!(value["bdy"]["msgTime"], 1_700_000_000);

        let extras: Value = serde_json::from_str(value["bdy"]["extras"].as_str().unwrap()).unwrap();
        assert_eq!(extras["extraToken"], "extra");
        assert_eq!(extras["streamingChannelId"], "N1abc");
    }

    #[test]
    fn test_inbound_session_id() {
        let frame = InboundFrame::parse(r#"{"cmd":10100,"tid":1,"bdy":{"sid":"abc"}}"#).unwrap();
        assert_eq!(frame.command(), ChatCommand::Connected);
        assert_eq!(frame.session_id(), Some("abc"));
    }

    #[test]
    fn test_inbound_rejects_garbage() {
        assert!(InboundFrame::parse("not json").is_err());
    }

    #[test]
    fn test_decode_named_entry() {
        let raw = json!({
            "uid": "u1",
            "profile": "{\"nickname\":\"viewer\"}",
            "msg": "hello",
            "msgTime": 1_700_000_000_000i64,
        });
        let msg = decode_entry(MessageKind::Chat, &raw).unwrap();

        assert_eq!(msg.nickname, "viewer");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_decode_anonymous_entry() {
        let raw = json!({
            "uid": "anonymous",
            "profile": null,
            "msg": "thanks",
            "msgTime": 1_700_000_000_000i64,
        });
        let msg = decode_entry(MessageKind::Donation, &raw).unwrap();

        assert_eq!(msg.nickname, ANONYMOUS_NICKNAME);
        assert_eq!(msg.kind, MessageKind::Donation);
    }

    #[test]
    fn test_decode_skip_reasons() {
        let no_profile = json!({ "uid": "u1", "msg": "hi", "msgTime": 1 });
        assert_eq!(
            decode_entry(MessageKind::Chat, &no_profile).unwrap_err(),
            SkipReason::MissingProfile
        );

        let bad_profile = json!({ "uid": "u1", "profile": "{", "msg": "hi", "msgTime": 1 });
        assert_eq!(
            decode_entry(MessageKind::Chat, &bad_profile).unwrap_err(),
            SkipReason::MalformedProfile
        );

        let no_body = json!({ "uid": "u1", "profile": "{\"nickname\":\"n\"}", "msgTime": 1 });
        assert_eq!(
            decode_entry(MessageKind::Chat, &no_body).unwrap_err(),
            SkipReason::MissingBody
        );

        assert_eq!(
            decode_entry(MessageKind::Chat, &json!("text")).unwrap_err(),
            SkipReason::MalformedEntry
        );
    }
}
