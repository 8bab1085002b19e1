use crate::error::BotError;
use crate::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// One open socket carrying text frames
#[async_trait]
pub trait WsConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text frame. `Ok(None)` means the peer closed the socket.
    async fn next_text(&mut self) -> Result<Option<String>>;

    async fn close(&mut self);
}

/// Opens sockets; swapped for an in-memory double in tests
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsConnection>>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsConnection>> {
        tracing::debug!("Attempting WebSocket connection to: {}", url);

        let (stream, response) = connect_async(url).await.map_err(|e| {
            tracing::debug!("WebSocket error details: {:?}", e);
            BotError::TransientNetwork(format!("connect to {} failed: {}", url, e))
        })?;

        tracing::info!("WebSocket connected to {} (HTTP status: {})", url, response.status());
        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WsConnection for TungsteniteConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Result<Option<String>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => return Ok(Some(text)),
                Message::Ping(payload) => {
                    tracing::trace!("Received ping from server");
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Message::Close(frame) => {
                    tracing::debug!("Server closed socket: {:?}", frame);
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("Socket close returned: {}", e);
        }
    }
}
