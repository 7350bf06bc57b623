#![allow(dead_code)]
/// Test doubles shared by the integration tests: an in-memory REST backend
/// and a scripted push-channel dialer.
use async_trait::async_trait;
use carechat_core::api::{ChatApi, HistoryPage, SendRequest, TokenProvider};
use carechat_core::chat_types::{
    Conversation, ConversationId, DeliveryState, Message, MessageId, UserId,
};
use carechat_core::config::Config;
use carechat_core::error::{ChatError, Result};
use carechat_core::transport::{ConnectionState, Dialer, PushStream};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

pub const ME: UserId = 100;
pub const PATIENT: UserId = 200;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn msg(conversation_id: ConversationId, id: i64, secs: i64) -> Message {
    Message {
        id: MessageId::Server(id),
        conversation_id,
        sender_id: PATIENT,
        text: format!("message {}", id),
        created_at: at(secs),
        delivery_state: DeliveryState::Sent,
        client_id: None,
    }
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.to_string()).collect()
}

pub fn conversation(id: ConversationId, unread: u32) -> Conversation {
    Conversation {
        id,
        participant_ids: vec![ME, PATIENT],
        last_message_preview: None,
        last_message_at: None,
        unread_count: unread,
    }
}

/// JSON text of a `message_created` push
pub fn push_frame(
    conversation_id: ConversationId,
    id: i64,
    secs: i64,
    client_id: Option<&str>,
) -> String {
    serde_json::json!({
        "type": "message_created",
        "conversation_id": conversation_id,
        "message": {
            "id": id,
            "sender_id": PATIENT,
            "text": format!("message {}", id),
            "created_at": at(secs).to_rfc3339(),
            "client_id": client_id,
        }
    })
    .to_string()
}

pub fn test_config() -> Config {
    Config {
        user_id: Some(ME),
        connect_timeout: Duration::from_millis(200),
        retry_delays: vec![
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ],
        retry_jitter_ms: 0,
        stable_after: Duration::from_secs(5),
        history_page_size: 2,
        directory_refresh_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

pub struct StaticToken(pub &'static str);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.to_string())
    }
}

/// Wait until the connection reaches a state matching `pred`
pub async fn wait_for_state<F>(rx: &mut watch::Receiver<ConnectionState>, pred: F) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update().clone();
                if pred(&state) {
                    return state;
                }
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("connection state not reached in time")
}

// ─── REST fake ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeApi {
    pub conversations: Mutex<Vec<Conversation>>,
    pub fail_conversations: AtomicBool,
    /// (conversation, page) -> page
    pub pages: Mutex<HashMap<(ConversationId, u32), HistoryPage>>,
    pub fail_history: AtomicBool,
    /// History requests of a conversation block until notified
    pub history_gates: Mutex<HashMap<ConversationId, Arc<Notify>>>,
    pub history_calls: Mutex<Vec<(ConversationId, u32)>>,
    pub sent: Mutex<Vec<SendRequest>>,
    pub fail_send: AtomicBool,
    /// Acknowledge sends without echoing the correlation key
    pub omit_client_id: AtomicBool,
    pub send_gate: Mutex<Option<Arc<Notify>>>,
    pub next_id: AtomicI64,
    pub mark_read_calls: Mutex<Vec<ConversationId>>,
    pub fail_mark_read: AtomicBool,
    pub unread: AtomicU32,
    pub fail_unread: AtomicBool,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        let api = Self::default();
        api.next_id.store(1_000, Ordering::SeqCst);
        Arc::new(api)
    }

    pub fn set_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        messages: Vec<Message>,
        has_more: bool,
    ) {
        self.pages
            .lock()
            .unwrap()
            .insert((conversation_id, page), HistoryPage { messages, has_more });
    }

    pub fn gate_history(&self, conversation_id: ConversationId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates
            .lock()
            .unwrap()
            .insert(conversation_id, gate.clone());
        gate
    }

    pub fn gate_send(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        if self.fail_conversations.load(Ordering::SeqCst) {
            return Err(ChatError::Network("connection refused".into()));
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        _page_size: u32,
    ) -> Result<HistoryPage> {
        self.history_calls
            .lock()
            .unwrap()
            .push((conversation_id, page));
        let gate = self.history_gates.lock().unwrap().get(&conversation_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ChatError::Http {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(conversation_id, page))
            .cloned()
            .unwrap_or(HistoryPage {
                messages: Vec::new(),
                has_more: false,
            }))
    }

    async fn send_message(&self, request: &SendRequest) -> Result<Message> {
        self.sent.lock().unwrap().push(request.clone());
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ChatError::Network("timed out".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Message {
            id: MessageId::Server(id),
            conversation_id: request.conversation_id,
            sender_id: ME,
            text: request.text.clone(),
            created_at: at(id),
            delivery_state: DeliveryState::Sent,
            client_id: if self.omit_client_id.load(Ordering::SeqCst) {
                None
            } else {
                Some(request.client_id.clone())
            },
        })
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        self.mark_read_calls.lock().unwrap().push(conversation_id);
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(ChatError::Http {
                status: 500,
                body: "oops".into(),
            });
        }
        Ok(())
    }

    async fn unread_count(&self) -> Result<u32> {
        if self.fail_unread.load(Ordering::SeqCst) {
            return Err(ChatError::Network("connection reset".into()));
        }
        Ok(self.unread.load(Ordering::SeqCst))
    }
}

// ─── Push-channel fake ───────────────────────────────────────────────────────

enum Script {
    Open(mpsc::UnboundedReceiver<String>),
    Fail(ChatError),
    Hang,
}

/// Server side of one scripted channel. Dropping it closes the channel.
pub struct FakeServer {
    tx: mpsc::UnboundedSender<String>,
}

impl FakeServer {
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.tx.send(frame.into());
    }

    /// True once the client side is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
pub struct FakeDialer {
    script: Mutex<VecDeque<Script>>,
    pub dials: Mutex<Vec<(ConversationId, String)>>,
}

impl FakeDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next dial succeeds
    pub fn accept(&self) -> FakeServer {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().push_back(Script::Open(rx));
        FakeServer { tx }
    }

    /// Next dial fails with `error`
    pub fn reject(&self, error: ChatError) {
        self.script.lock().unwrap().push_back(Script::Fail(error));
    }

    /// Next dial never completes
    pub fn hang(&self) {
        self.script.lock().unwrap().push_back(Script::Hang);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }
}

struct FakeStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl PushStream for FakeStream {
    async fn next_text(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(
        &self,
        conversation_id: ConversationId,
        token: &str,
    ) -> Result<Box<dyn PushStream>> {
        self.dials
            .lock()
            .unwrap()
            .push((conversation_id, token.to_string()));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Open(rx)) => Ok(Box::new(FakeStream { rx })),
            Some(Script::Fail(e)) => Err(e),
            Some(Script::Hang) => std::future::pending().await,
            None => Err(ChatError::Network("connection refused".into())),
        }
    }
}
