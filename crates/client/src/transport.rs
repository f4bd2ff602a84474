// crates/client/src/transport.rs
//! Transport seam between the event channel and the server.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use jobcast_types::{JobEvent, JobSnapshot, RESYNC_CLOSE_CODE};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ProtocolError, TransportError};

/// How an [`EventChannel`](crate::EventChannel) reaches the server.
#[async_trait]
pub trait JobTransport: Send + Sync + 'static {
    /// Open a push connection. The server-side subscription must exist once
    /// this returns, so a snapshot fetched afterwards cannot miss events.
    async fn connect(&self) -> Result<Box<dyn EventSource>, TransportError>;

    /// Fetch the registry snapshot.
    async fn snapshot(&self) -> Result<JobSnapshot, TransportError>;
}

/// Stream of raw event frames from one push connection.
#[async_trait]
pub trait EventSource: Send {
    /// Next frame. `Ok(None)` means the server closed the connection.
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError>;
}

/// Decode one push frame.
pub fn decode_event(frame: &str) -> Result<JobEvent, ProtocolError> {
    Ok(serde_json::from_str(frame)?)
}

/// Deadlines for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Whole snapshot request, connect to body.
    pub request_timeout: Duration,
    /// Longest silence tolerated on an open socket. The server pings every
    /// 15 s, so this covers two missed pings.
    pub idle_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(35),
        }
    }
}

/// WebSocket push plus HTTP snapshot against a jobcast server.
#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: String,
    http: reqwest::Client,
    config: WsConfig,
}

impl WsTransport {
    /// `base_url` is the server origin, e.g. `http://127.0.0.1:47893`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_config(base_url, WsConfig::default())
    }

    pub fn with_config(base_url: impl Into<String>, config: WsConfig) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {e}");
                reqwest::Client::new()
            });
        Self {
            base_url,
            http,
            config,
        }
    }

    pub fn snapshot_url(&self) -> String {
        format!("{}/api/jobs", self.base_url)
    }

    pub fn ws_url(&self) -> String {
        let origin = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{origin}/api/jobs/ws")
    }
}

#[async_trait]
impl JobTransport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn EventSource>, TransportError> {
        let (stream, _) = connect_async(self.ws_url())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsEventSource {
            stream,
            idle_timeout: self.config.idle_timeout,
        }))
    }

    async fn snapshot(&self) -> Result<JobSnapshot, TransportError> {
        self.http
            .get(self.snapshot_url())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransportError::Snapshot(e.to_string()))?
            .json::<JobSnapshot>()
            .await
            .map_err(|e| TransportError::Snapshot(e.to_string()))
    }
}

struct WsEventSource {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    idle_timeout: Duration,
}

#[async_trait]
impl EventSource for WsEventSource {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            // Any message, pings included, proves the peer is still there.
            let next = tokio::time::timeout(self.idle_timeout, self.stream.next())
                .await
                .map_err(|_| {
                    TransportError::Disconnected(format!(
                        "no message from server in {:?}",
                        self.idle_timeout
                    ))
                })?;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(Some(frame))))
                    if u16::from(frame.code) == RESYNC_CLOSE_CODE =>
                {
                    return Err(TransportError::Resync)
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pings are answered by tungstenite on the next read.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Disconnected(e.to_string())),
            }
        }
    }
}
