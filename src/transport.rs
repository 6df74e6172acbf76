//! Transport layer for the cloud streaming connection
//!
//! Owns one bidirectional message stream and nothing else: no transcription
//! semantics live here. The production implementation is a WebSocket client;
//! tests inject scripted transports through [`TransportFactory`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Signals a transport delivers to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One logical inbound message (text frame)
    Message(String),
    /// Peer closed the stream
    Closed,
    /// Stream failed
    Failed(String),
}

/// Supplies the opaque bearer string the transport authenticates with.
///
/// Credential refresh and storage are the collaborator's concern; the
/// transport asks once per connection attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

/// One bidirectional message stream to the transcription backend.
///
/// Exclusively owned by a single session driver; never shared across
/// sessions or adapters.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()>;
    /// Next inbound signal; after `Closed` or `Failed`, keeps returning `Closed`
    async fn next_event(&mut self) -> TransportEvent;
    async fn close(&mut self);
}

/// Builds a fresh transport per connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite
pub struct WebSocketTransport {
    url: String,
    token_provider: std::sync::Arc<dyn TokenProvider>,
    stream: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, token_provider: std::sync::Arc<dyn TokenProvider>) -> Self {
        Self {
            url: url.into(),
            token_provider,
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> Result<()> {
        let token = self.token_provider.bearer_token().await?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::ConnectionFailed(format!("invalid endpoint: {e}")))?;
        let header = HeaderValue::from_str(&token)
            .map_err(|_| Error::ConnectionFailed("token is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", header);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        info!("WebSocket connected to {}", self.url);
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ConnectionFailed("not connected".to_string()))?;
        stream
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ConnectionFailed("not connected".to_string()))?;
        stream
            .send(Message::Binary(data))
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(stream) = self.stream.as_mut() else {
            return TransportEvent::Closed;
        };
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(text.to_string()),
                // control frames are handled by tungstenite; binary is not
                // part of the inbound protocol
                Some(Ok(Message::Ping(_)))
                | Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Binary(_)))
                | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by peer");
                    self.stream = None;
                    return TransportEvent::Closed;
                }
                Some(Err(e)) => {
                    self.stream = None;
                    return TransportEvent::Failed(e.to_string());
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            // best effort; the peer may already be gone
            let _ = stream.close(None).await;
            debug!("WebSocket closed");
        }
    }
}

/// Factory producing [`WebSocketTransport`]s for one endpoint
pub struct WebSocketTransportFactory {
    url: String,
    token_provider: std::sync::Arc<dyn TokenProvider>,
}

impl WebSocketTransportFactory {
    pub fn new(url: impl Into<String>, token_provider: std::sync::Arc<dyn TokenProvider>) -> Self {
        Self {
            url: url.into(),
            token_provider,
        }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new(
            self.url.clone(),
            self.token_provider.clone(),
        ))
    }
}
