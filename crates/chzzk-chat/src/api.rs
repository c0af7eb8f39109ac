//! CHZZK platform API client.
//!
//! Resolves everything the chat handshake needs (chat channel id, access
//! tokens, user id hash, channel name) and the broadcast start instant.
//! Every endpoint answers `{"code": 200, "content": {...}}`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Seoul;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ChatError, Result};

const CHZZK_API: &str = "https://api.chzzk.naver.com";
const GAME_API: &str = "https://comm-api.game.naver.com/nng_main";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Live statuses treated as "on air".
const LIVE_STATUSES: [&str; 3] = ["OPEN", "ON", "LIVE"];

/// Tokens authorizing a chat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokens {
    pub access_token: String,
    /// Needed for sending chat messages.
    pub extra_token: String,
}

/// Identity lookups required by the chat session.
#[async_trait]
pub trait ChzzkApi: Send + Sync {
    /// Chat channel id of the current broadcast. Changes when a new broadcast starts.
    async fn chat_channel_id(&self, channel_id: &str) -> Result<String>;

    async fn access_tokens(&self, chat_channel_id: &str) -> Result<AccessTokens>;

    async fn user_id_hash(&self) -> Result<String>;

    async fn channel_name(&self, channel_id: &str) -> Result<String>;
}

/// Resolves when the current broadcast started.
#[async_trait]
pub trait BroadcastMetadata: Send + Sync {
    async fn fetch_start_instant(&self, channel_id: &str) -> Result<DateTime<Utc>>;
}

/// Authentication cookies (`NID_AUT`, `NID_SES`) loaded from a JSON object file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChzzkCookies(BTreeMap<String, String>);

impl ChzzkCookies {
    /// Load string entries of a JSON object; other entries are ignored.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let obj = raw
            .as_object()
            .ok_or_else(|| ChatError::config("Cookies file must contain a JSON object"))?;
        Ok(Self(
            obj.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect(),
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Cookie` header value, or `None` when no cookies are set.
    pub fn header_value(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(
            self.0
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    content: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStatusContent {
    chat_channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenContent {
    access_token: String,
    #[serde(default)]
    extra_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserStatusContent {
    user_id_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContent {
    channel_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveDetailContent {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    open_date: Option<String>,
    #[serde(default)]
    live_open_date: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
}

/// reqwest-backed [`ChzzkApi`] and [`BroadcastMetadata`].
#[derive(Debug, Clone)]
pub struct HttpChzzkApi {
    client: Client,
    cookies: ChzzkCookies,
}

impl HttpChzzkApi {
    pub fn new(cookies: ChzzkCookies) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, cookies })
    }

    async fn get_content<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url, "Requesting CHZZK API");
        let mut request = self
            .client
            .get(url)
            .header("Accept", "application/json, text/plain, */*")
            .header("Accept-Language", ACCEPT_LANGUAGE);
        if let Some(cookie) = self.cookies.header_value() {
            request = request.header("Cookie", cookie);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ChatError::api(format!("{url}: HTTP {}", response.status())));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ChatError::api(format!("{url}: failed to parse response: {e}")))?;

        envelope.content.ok_or_else(|| {
            ChatError::api(format!(
                "{url}: empty content (code {:?}, {})",
                envelope.code,
                envelope.message.as_deref().unwrap_or("no message")
            ))
        })
    }
}

#[async_trait]
impl ChzzkApi for HttpChzzkApi {
    async fn chat_channel_id(&self, channel_id: &str) -> Result<String> {
        let url = format!("{CHZZK_API}/polling/v2/channels/{channel_id}/live-status");
        let content: LiveStatusContent = self.get_content(&url).await?;
        content
            .chat_channel_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ChatError::api(format!("No chat channel id for {channel_id}")))
    }

    async fn access_tokens(&self, chat_channel_id: &str) -> Result<AccessTokens> {
        let url = format!(
            "{GAME_API}/v1/chats/access-token?channelId={chat_channel_id}&chatType=STREAMING"
        );
        let content: AccessTokenContent = self.get_content(&url).await?;
        Ok(AccessTokens {
            access_token: content.access_token,
            extra_token: content.extra_token,
        })
    }

    async fn user_id_hash(&self) -> Result<String> {
        let url = format!("{GAME_API}/v1/user/getUserStatus");
        let content: UserStatusContent = self.get_content(&url).await?;
        content
            .user_id_hash
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ChatError::api("Not logged in: check NID_AUT/NID_SES cookies"))
    }

    async fn channel_name(&self, channel_id: &str) -> Result<String> {
        let url = format!("{CHZZK_API}/service/v1/channels/{channel_id}");
        let content: ChannelContent = self.get_content(&url).await?;
        Ok(content.channel_name)
    }
}

#[async_trait]
impl BroadcastMetadata for HttpChzzkApi {
    async fn fetch_start_instant(&self, channel_id: &str) -> Result<DateTime<Utc>> {
        let url = format!("{CHZZK_API}/service/v1/channels/{channel_id}/live-detail");
        let content: LiveDetailContent = self.get_content(&url).await?;

        let status = content.status.as_deref().unwrap_or_default().to_uppercase();
        if !LIVE_STATUSES.contains(&status.as_str()) {
            return Err(ChatError::api(format!(
                "Channel {channel_id} is not live (status {status:?})"
            )));
        }

        let raw = [content.open_date, content.live_open_date, content.start_date]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .ok_or_else(|| ChatError::api("Live detail has no start time"))?;

        parse_start_time(&raw)
    }
}

/// Accept a bare channel id or a `https://chzzk.naver.com/live/<id>` URL.
pub fn normalize_channel_id(input: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ChatError::config("Channel id is empty"));
    }
    if !(input.starts_with("http://") || input.starts_with("https://")) {
        return Ok(input.to_string());
    }

    let url = Url::parse(input).map_err(|e| ChatError::config(format!("Invalid URL {input}: {e}")))?;
    let mut segments = url
        .path_segments()
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty());

    match (segments.next(), segments.next()) {
        (Some(first), Some(id)) if first.eq_ignore_ascii_case("live") => Ok(id.to_string()),
        _ => Err(ChatError::config(format!(
            "Unrecognized live URL {input}, expected https://chzzk.naver.com/live/<id>"
        ))),
    }
}

/// Parse a broadcast start time.
///
/// Offsets (including `Z`) are honored; naive times are Asia/Seoul.
pub fn parse_start_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| ChatError::api(format!("Unparseable start time {raw:?}")))?;

    match Seoul.from_local_datetime(&naive).earliest() {
        Some(dt) => Ok(dt.with_timezone(&Utc)),
        None => {
            warn!(raw, "Start time does not exist in Asia/Seoul, treating as UTC");
            Ok(naive.and_utc())
        }
    }
}
