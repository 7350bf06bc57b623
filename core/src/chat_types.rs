//! Shared types for the chat layer
use crate::transport::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

pub type ConversationId = i64;
pub type UserId = i64;

/// Prefix of locally generated message ids / correlation keys
pub const LOCAL_ID_PREFIX: &str = "tmp-";

/// Message identifier: server-assigned once confirmed, local while optimistic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Server(i64),
    Local(String),
}

impl MessageId {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }

    pub fn server(&self) -> Option<i64> {
        match self {
            MessageId::Server(id) => Some(*id),
            MessageId::Local(_) => None,
        }
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (MessageId::Server(a), MessageId::Server(b)) => a.cmp(b),
            (MessageId::Server(_), MessageId::Local(_)) => Ordering::Less,
            (MessageId::Local(_), MessageId::Server(_)) => Ordering::Greater,
            // "tmp-9" < "tmp-10"
            (MessageId::Local(a), MessageId::Local(b)) => {
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Local(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Shown locally, not yet confirmed by the server
    Pending,
    /// Confirmed by the server (REST ack or push)
    Sent,
    /// Send request failed; stays visible until retried or discarded
    Failed,
}

/// One chat message as rendered by a thread view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    /// Correlation key of the optimistic send that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Message {
    /// Position of the message inside its conversation
    pub fn sort_key(&self) -> SortKey {
        SortKey {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }
}

/// Server representation of a message, shared by REST bodies and push events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl MessagePayload {
    /// Confirmed message; `conversation_id` fills in when the body omits it
    /// (history pages are already scoped to one conversation).
    pub fn into_message(self, conversation_id: ConversationId) -> Message {
        Message {
            id: MessageId::Server(self.id),
            conversation_id: self.conversation_id.unwrap_or(conversation_id),
            sender_id: self.sender_id,
            text: self.text,
            created_at: self.created_at,
            delivery_state: DeliveryState::Sent,
            client_id: self.client_id,
        }
    }
}

/// Ordering key: `created_at` ascending, ties broken by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    pub created_at: DateTime<Utc>,
    pub id: MessageId,
}

/// Summary of one conversation thread (for the inbox view)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    /// Conversation seeded from its first message
    pub fn from_first_message(message: &Message) -> Self {
        Self {
            id: message.conversation_id,
            participant_ids: vec![message.sender_id],
            last_message_preview: Some(message.text.clone()),
            last_message_at: Some(message.created_at),
            unread_count: 0,
        }
    }

    /// The participant that is not `me` (the other side of a two-party thread)
    pub fn counterpart(&self, me: Option<UserId>) -> Option<UserId> {
        self.participant_ids
            .iter()
            .copied()
            .find(|id| Some(*id) != me)
    }
}

/// Change notifications published to UI subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The loaded message list of a conversation changed
    MessagesChanged { conversation_id: ConversationId },
    /// The inbox changed (previews, unread counts, membership)
    ConversationsChanged,
    /// The push channel moved to a new state
    ConnectionChanged { state: ConnectionState },
    /// A history fetch failed; stale messages remain visible
    HistoryFailed {
        conversation_id: ConversationId,
        error: String,
    },
    /// A conversation-list or unread refresh failed; stale list remains visible
    DirectoryFailed { error: String },
    /// An optimistic message could not be delivered
    SendFailed {
        conversation_id: ConversationId,
        client_id: String,
        error: String,
    },
}
