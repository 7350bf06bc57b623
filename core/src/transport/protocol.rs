//! Push-channel event definitions
use crate::chat_types::{ConversationId, Message, MessagePayload};
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events the server pushes over the per-conversation channel.
/// Any `type` this client does not know decodes to `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A message was created in a conversation
    MessageCreated {
        conversation_id: ConversationId,
        message: MessagePayload,
    },

    #[serde(other)]
    Unknown,
}

impl PushEvent {
    /// Decode one text frame
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ChatError::InvalidEvent(e.to_string()))
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            PushEvent::MessageCreated { .. } => "message_created",
            PushEvent::Unknown => "unknown",
        }
    }

    /// The message carried by this event, if it belongs to `expected`.
    pub fn into_message_for(self, expected: ConversationId) -> Option<Message> {
        match self {
            PushEvent::MessageCreated {
                conversation_id,
                message,
            } => {
                if conversation_id != expected {
                    return None;
                }
                // Body and envelope must agree when the body names a conversation
                if message.conversation_id.is_some_and(|id| id != expected) {
                    return None;
                }
                Some(message.into_message(expected))
            }
            PushEvent::Unknown => None,
        }
    }
}

impl fmt::Display for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PushEvent({})", self.event_type())
    }
}
