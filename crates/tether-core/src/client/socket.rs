//! Client end of the event socket, on tokio-tungstenite.

use crate::config::ProtocolConfig;
use crate::error::{Result, TetherError};
use crate::socket::{FrameSocket, SocketError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

pub struct TungsteniteSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TungsteniteSocket {
    /// Open the event socket, requesting the `rpc` sub-protocol.
    pub async fn connect(url: &Url) -> Result<Self> {
        let mut request = url.as_str().into_client_request().map_err(|e| TetherError::Transport {
            message: format!("invalid event socket url {}: {}", url, e),
            source: None,
        })?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(ProtocolConfig::WS_SUBPROTOCOL),
        );
        let (stream, _) = connect_async(request).await.map_err(|e| TetherError::Transport {
            message: format!("ws connect to {} failed: {}", url, e),
            source: None,
        })?;
        debug!("event socket connected to {}", url);
        Ok(Self { stream })
    }
}

fn socket_error(err: WsError) -> SocketError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SocketError::Closed,
        other => SocketError::Transport(other.to_string()),
    }
}

#[async_trait]
impl FrameSocket for TungsteniteSocket {
    async fn send_frame(&mut self, frame: Vec<u8>) -> std::result::Result<(), SocketError> {
        self.stream
            .send(Message::Binary(frame))
            .await
            .map_err(socket_error)
    }

    async fn next_frame(&mut self) -> Option<std::result::Result<Vec<u8>, SocketError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(socket_error(e))),
            }
        }
    }

    async fn ping(&mut self) -> std::result::Result<(), SocketError> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(socket_error)
    }

    async fn close(&mut self) -> std::result::Result<(), SocketError> {
        self.stream
            .close(None)
            .await
            .map_err(socket_error)
    }
}
