//! REST client for the chat endpoints of the portal backend
//!
//! Endpoints (relative to `Config::api_base_url`):
//!   GET  /api/chat/conversations/
//!   GET  /api/chat/conversations/:id/messages/   ?page=N&page_size=N
//!   POST /api/chat/messages/                     body: SendRequest
//!   POST /api/chat/conversations/:id/mark-read/
//!   GET  /api/chat/unread-count/
//!
//! Every request carries `Authorization: Bearer <token>`.
use crate::chat_types::{Conversation, ConversationId, Message, MessagePayload, UserId};
use crate::config::Config;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Source of the bearer token. Login/logout live outside the chat core.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Token holder the auth layer can swap after re-authentication
#[derive(Default)]
pub struct SharedToken {
    inner: RwLock<Option<String>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            inner: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = token;
        }
    }
}

impl TokenProvider for SharedToken {
    fn token(&self) -> Option<String> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }
}

/// One page of history, newest page first (page 1)
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Body of the send-message call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub recipient_id: UserId,
    pub text: String,
    /// Correlation key echoed back on the created message
    pub client_id: String,
}

/// REST operations consumed by the chat core
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<HistoryPage>;

    async fn send_message(&self, request: &SendRequest) -> Result<Message>;

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()>;

    async fn unread_count(&self) -> Result<u32>;
}

// List endpoints answer either with a bare array or a paginated envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Paged {
        results: Vec<T>,
        #[serde(default)]
        next: Option<String>,
    },
    Bare(Vec<T>),
}

#[derive(Deserialize)]
struct UnreadCountResponse {
    unread_count: u32,
}

/// `ChatApi` over HTTP
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpChatApi {
    pub fn new(config: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .tokens
            .token()
            .ok_or_else(|| ChatError::Auth("no bearer token available".to_string()))?;
        Ok(builder.bearer_auth(token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!("GET {}", path);
        let resp = self.authorized(self.client.get(self.url(path)))?.send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json::<T>().await?)
    }
}

/// Map non-2xx responses onto the error taxonomy
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!("backend rejected credentials: HTTP {}", status.as_u16());
        return Err(ChatError::Auth(format!("HTTP {}", status.as_u16())));
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ChatError::NotFound(body));
    }
    Err(ChatError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let listing: Listing<Conversation> = self.get_json("/api/chat/conversations/").await?;
        Ok(match listing {
            Listing::Paged { results, .. } => results,
            Listing::Bare(list) => list,
        })
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<HistoryPage> {
        let path = format!(
            "/api/chat/conversations/{}/messages/?page={}&page_size={}",
            conversation_id,
            urlencoding::encode(&page.to_string()),
            urlencoding::encode(&page_size.to_string()),
        );
        let listing: Listing<MessagePayload> = self.get_json(&path).await?;
        let (payloads, has_more) = match listing {
            Listing::Paged { results, next } => (results, next.is_some()),
            Listing::Bare(list) => {
                let full = list.len() as u32 >= page_size;
                (list, full)
            }
        };
        Ok(HistoryPage {
            messages: payloads
                .into_iter()
                .map(|p| p.into_message(conversation_id))
                .collect(),
            has_more,
        })
    }

    async fn send_message(&self, request: &SendRequest) -> Result<Message> {
        debug!(
            "POST /api/chat/messages/ (conversation {}, {})",
            request.conversation_id, request.client_id
        );
        let resp = self
            .authorized(self.client.post(self.url("/api/chat/messages/")))?
            .json(request)
            .send()
            .await?;
        let payload: MessagePayload = check_status(resp).await?.json().await?;
        Ok(payload.into_message(request.conversation_id))
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        let path = format!("/api/chat/conversations/{}/mark-read/", conversation_id);
        debug!("POST {}", path);
        let resp = self
            .authorized(self.client.post(self.url(&path)))?
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn unread_count(&self) -> Result<u32> {
        let resp: UnreadCountResponse = self.get_json("/api/chat/unread-count/").await?;
        Ok(resp.unread_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_accepts_both_shapes() {
        let paged: Listing<u32> =
            serde_json::from_str(r#"{"results":[1,2],"next":"http://x/?page=2"}"#).unwrap();
        assert!(matches!(paged, Listing::Paged { ref results, next: Some(_) } if results.len() == 2));

        let bare: Listing<u32> = serde_json::from_str("[1,2,3]").unwrap();
        assert!(matches!(bare, Listing::Bare(ref v) if v.len() == 3));
    }

    #[test]
    fn test_shared_token_swaps() {
        let token = SharedToken::new(None);
        assert_eq!(token.token(), None);
        token.set(Some("abc".to_string()));
        assert_eq!(token.token().as_deref(), Some("abc"));
    }
}
