//! Opening the push channel
use crate::chat_types::ConversationId;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// An open push channel
#[async_trait]
pub trait PushStream: Send {
    /// Next text frame. `None` once the server has closed the channel.
    async fn next_text(&mut self) -> Option<Result<String>>;

    /// Close politely; errors are ignored.
    async fn close(&mut self);
}

/// Opens push channels. Authentication failures must come back as
/// `ChatError::Auth` so the caller stops retrying.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        conversation_id: ConversationId,
        token: &str,
    ) -> Result<Box<dyn PushStream>>;
}

/// WebSocket dialer: `{base}/ws/chat/{conversation_id}/`
pub struct WsDialer {
    base_url: String,
}

impl WsDialer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn channel_url(&self, conversation_id: ConversationId) -> String {
        format!("{}/ws/chat/{}/", self.base_url, conversation_id)
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        conversation_id: ConversationId,
        token: &str,
    ) -> Result<Box<dyn PushStream>> {
        let url = self.channel_url(conversation_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::Config(format!("invalid push URL {}: {}", url, e)))?;
        let header = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ChatError::Auth("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        debug!("Dialing push channel {}", url);
        let (stream, _response) = connect_async(request).await.map_err(map_handshake_error)?;
        Ok(Box::new(WsPushStream { inner: stream }))
    }
}

fn map_handshake_error(e: tungstenite::Error) -> ChatError {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ChatError::Auth(format!("push handshake rejected: HTTP {}", status.as_u16()))
            } else {
                ChatError::Transport(format!("push handshake failed: HTTP {}", status.as_u16()))
            }
        }
        tungstenite::Error::Io(io) => ChatError::Network(io.to_string()),
        other => ChatError::Transport(other.to_string()),
    }
}

struct WsPushStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushStream for WsPushStream {
    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.inner.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("push channel closed by server: {:?}", frame);
                    return None;
                }
                // Pings are answered by tungstenite itself; binary frames carry nothing for us
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(ChatError::Network(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
