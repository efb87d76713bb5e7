//! Transport seam for the client connection state machine.
//!
//! The state machine never touches tokio-tungstenite directly; it drives a
//! `Transport` obtained from an injected factory, so tests can script a
//! transport and production uses [`WsTransport`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// WebSocket close code for normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Synthetic close code for a connection that dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Text(String),
    /// The peer closed the connection with the given code.
    Closed { code: u16 },
}

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;

    /// Next inbound event. `None` means the connection dropped without a
    /// close frame and is treated as an abnormal close.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Close with a normal-closure code.
    async fn close(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn Transport>>;
}

/// Production transport over tokio-tungstenite.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(TransportEvent::Text(text.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or(CLOSE_ABNORMAL);
                    return Some(TransportEvent::Closed { code });
                }
                // Pings are answered by tungstenite on the next flush
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!("Ignoring binary frame");
                    continue;
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Transport read error");
                    return None;
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await?;
        Ok(())
    }
}

/// Factory producing [`WsTransport`] connections.
#[derive(Default)]
pub struct WsTransportFactory;

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn Transport>> {
        let (stream, _response) = connect_async(url).await?;
        Ok(Box::new(WsTransport { stream }))
    }
}
