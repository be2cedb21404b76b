use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::StreamError;

/// Events surfaced by a stream transport, one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(String),
    /// Ping from the peer; must be answered with a pong carrying the same
    /// payload.
    Ping(Vec<u8>),
    Pong,
    Close { code: Option<u16>, reason: String },
    Error(String),
}

/// One bidirectional message transport. Implementations hold a single live
/// connection; a reconnect means a fresh transport from the factory.
#[async_trait]
pub trait StreamTransport: Send {
    async fn send_text(&mut self, frame: String) -> Result<(), StreamError>;
    async fn send_ping(&mut self) -> Result<(), StreamError>;
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), StreamError>;
    /// Next event from the peer; `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<TransportEvent>;
    /// Drop the connection immediately. Best effort, never fails.
    async fn terminate(&mut self);
}

/// Creates transports; the seam that lets the connection manager run against
/// in-process fakes in tests.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamTransport>, StreamError>;
}

/// Production factory backed by `tokio-tungstenite`.
pub struct WsTransportFactory;

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamTransport>, StreamError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send_text(&mut self, frame: String) -> Result<(), StreamError> {
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), StreamError> {
        self.ws
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), StreamError> {
        self.ws
            .send(Message::Pong(payload))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            let message = self.ws.next().await?;
            let event = match message {
                Ok(Message::Text(text)) => TransportEvent::Message(text),
                Ok(Message::Ping(payload)) => TransportEvent::Ping(payload),
                Ok(Message::Pong(_)) => TransportEvent::Pong,
                Ok(Message::Close(frame)) => TransportEvent::Close {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame
                        .map(|f| f.reason.into_owned())
                        .unwrap_or_default(),
                },
                // Binary and raw frames carry nothing we subscribe to.
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => TransportEvent::Error(e.to_string()),
            };
            return Some(event);
        }
    }

    async fn terminate(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
