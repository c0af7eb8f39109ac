//! Duplex transport for chat frames.
//!
//! The session only needs "send text" and "receive text", so the WebSocket
//! sits behind [`ChatTransport`] and is opened through a [`Connector`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{Request, Uri};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace};

use crate::error::{ChatError, Result};

/// Default chat server endpoint.
pub const DEFAULT_CHAT_ENDPOINT: &str = "wss://kr-ss1.chat.naver.com/chat";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ORIGIN: &str = "https://chzzk.naver.com";

/// An open text-frame connection.
#[async_trait]
pub trait ChatTransport: Send {
    async fn send(&mut self, text: &str) -> Result<()>;

    /// Next text frame. A closed stream is a [`ChatError::Connection`].
    async fn recv(&mut self) -> Result<String>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports to a chat endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn ChatTransport>>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    headers: Vec<(String, String)>,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            headers: vec![
                ("User-Agent".to_string(), USER_AGENT.to_string()),
                ("Origin".to_string(), ORIGIN.to_string()),
            ],
        }
    }

    /// Add an extra upgrade request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn build_request(&self, endpoint: &str) -> Result<Request<()>> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| ChatError::connection(format!("Invalid endpoint {endpoint}: {e}")))?;
        let host = uri
            .host()
            .ok_or_else(|| ChatError::connection(format!("Endpoint without host: {endpoint}")))?;
        let host_header = match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut builder = Request::builder()
            .uri(endpoint)
            .header("Host", host_header)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());

        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
            .body(())
            .map_err(|e| ChatError::connection(format!("Failed to build request: {e}")))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn ChatTransport>> {
        let request = self.build_request(endpoint)?;
        info!("Connecting to WebSocket: {}", endpoint);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ChatError::connection(format!("WebSocket connect failed: {e}")))?;

        Ok(Box::new(WebSocketTransport { stream }))
    }
}

/// Transport over an established WebSocket stream.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChatTransport for WebSocketTransport {
    async fn send(&mut self, text: &str) -> Result<()> {
        trace!(frame = text, "Sending frame");
        self.stream
            .send(Message::text(text.to_string()))
            .await
            .map_err(|e| ChatError::connection(format!("WebSocket send failed: {e}")))
    }

    async fn recv(&mut self) -> Result<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec())
                        .map_err(|e| ChatError::protocol(format!("Binary frame is not UTF-8: {e}")));
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(ChatError::connection(format!(
                        "WebSocket closed by server: {frame:?}"
                    )));
                }
                // Control frames are answered by tungstenite itself.
                Some(Ok(other)) => debug!("Ignoring control frame: {:?}", other),
                Some(Err(e)) => return Err(ChatError::connection(format!("WebSocket error: {e}"))),
                None => return Err(ChatError::connection("WebSocket stream closed")),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ChatError::connection(format!("WebSocket close failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers() {
        let connector = WebSocketConnector::new().with_header("Cookie", "NID_AUT=a");
        let request = connector.build_request(DEFAULT_CHAT_ENDPOINT).unwrap();
        let headers = request.headers();

        assert_eq!(headers["Host"], "kr-ss1.chat.naver.com");
        assert_eq!(headers["Origin"], ORIGIN);
        assert_eq!(headers["Cookie"], "NID_AUT=a");
        assert!(headers.contains_key("Sec-WebSocket-Key"));
    }

    #[test]
    fn test_request_keeps_port() {
        let request = WebSocketConnector::new()
            .build_request("ws://127.0.0.1:9001/chat")
            .unwrap();
        assert_eq!(request.headers()["Host"], "127.0.0.1:9001");
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(WebSocketConnector::new().build_request("not a uri").is_err());
    }
}
