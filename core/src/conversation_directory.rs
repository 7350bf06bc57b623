//! Conversation directory: the inbox with previews and unread counts
use crate::api::ChatApi;
use crate::chat_types::{ChatEvent, Conversation, ConversationId, Message, UserId};
use crate::error::Result;
use crate::utils::EventBus;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// What the inbox view renders
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectorySnapshot {
    /// Visible conversations, most recent activity first
    pub conversations: Vec<Conversation>,
    /// Last refresh error; the list above is then the previous one
    pub error: Option<String>,
    /// Sum of the visible unread counts
    pub unread_total: u32,
    /// Total reported by the unread-count endpoint, if it was asked
    pub server_unread_total: Option<u32>,
}

#[derive(Default)]
struct DirectoryState {
    conversations: HashMap<ConversationId, Conversation>,
    hidden: HashSet<ConversationId>,
    error: Option<String>,
    server_unread_total: Option<u32>,
}

pub struct ConversationDirectory {
    api: Arc<dyn ChatApi>,
    events: EventBus,
    /// Signed-in user; own messages never raise the unread count
    me: Option<UserId>,
    state: RwLock<DirectoryState>,
}

impl ConversationDirectory {
    pub fn new(api: Arc<dyn ChatApi>, events: EventBus, me: Option<UserId>) -> Self {
        Self {
            api,
            events,
            me,
            state: RwLock::new(DirectoryState::default()),
        }
    }

    /// Replace the directory with the server's list. On failure the previous
    /// list stays and the error flag is set.
    pub async fn fetch_conversations(&self) -> Result<usize> {
        match self.api.list_conversations().await {
            Ok(list) => {
                let count = list.len();
                {
                    let mut state = self.state.write().await;
                    state.conversations = list.into_iter().map(|c| (c.id, c)).collect();
                    state.error = None;
                }
                debug!("directory refreshed: {} conversations", count);
                self.events.emit(ChatEvent::ConversationsChanged);
                Ok(count)
            }
            Err(e) => {
                warn!("conversation list refresh failed: {}", e);
                self.state.write().await.error = Some(e.to_string());
                self.events.emit(ChatEvent::DirectoryFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Reflect a newly ingested message. Unread grows only for conversations
    /// that are not open and for messages from someone else.
    pub async fn on_new_message(&self, message: &Message, is_open: bool) {
        {
            let mut state = self.state.write().await;
            state.hidden.remove(&message.conversation_id);

            let conversation = state
                .conversations
                .entry(message.conversation_id)
                .or_insert_with(|| {
                    info!("new conversation {}", message.conversation_id);
                    Conversation::from_first_message(message)
                });

            if !conversation.participant_ids.contains(&message.sender_id) {
                conversation.participant_ids.push(message.sender_id);
            }
            let newer = conversation
                .last_message_at
                .map_or(true, |at| message.created_at >= at);
            if newer {
                conversation.last_message_preview = Some(message.text.clone());
                conversation.last_message_at = Some(message.created_at);
            }
            if !is_open && Some(message.sender_id) != self.me {
                conversation.unread_count += 1;
            }
        }
        self.events.emit(ChatEvent::ConversationsChanged);
    }

    /// Reset unread locally, then tell the server. On failure the count is
    /// restored (plus whatever arrived meanwhile) and the error returned.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        let previous = {
            let mut state = self.state.write().await;
            match state.conversations.get_mut(&conversation_id) {
                Some(c) => std::mem::take(&mut c.unread_count),
                None => 0,
            }
        };
        if previous > 0 {
            self.events.emit(ChatEvent::ConversationsChanged);
        }

        if let Err(e) = self.api.mark_read(conversation_id).await {
            warn!("mark-read for conversation {} failed: {}", conversation_id, e);
            {
                let mut state = self.state.write().await;
                if let Some(c) = state.conversations.get_mut(&conversation_id) {
                    c.unread_count += previous;
                }
                state.error = Some(e.to_string());
            }
            self.events.emit(ChatEvent::ConversationsChanged);
            self.events.emit(ChatEvent::DirectoryFailed {
                error: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    /// Ask the unread-count endpoint for the server-side total.
    pub async fn refresh_unread_total(&self) -> Result<u32> {
        match self.api.unread_count().await {
            Ok(total) => {
                self.state.write().await.server_unread_total = Some(total);
                self.events.emit(ChatEvent::ConversationsChanged);
                Ok(total)
            }
            Err(e) => {
                warn!("unread-count refresh failed: {}", e);
                // The last known total stays
                self.state.write().await.error = Some(e.to_string());
                self.events.emit(ChatEvent::DirectoryFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Remove from the visible list. The conversation comes back with its
    /// next message.
    pub async fn hide(&self, conversation_id: ConversationId) -> bool {
        let hidden = self.state.write().await.hidden.insert(conversation_id);
        if hidden {
            self.events.emit(ChatEvent::ConversationsChanged);
        }
        hidden
    }

    pub async fn get(&self, conversation_id: ConversationId) -> Option<Conversation> {
        self.state
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned()
    }

    /// The other participant of a conversation
    pub async fn counterpart(&self, conversation_id: ConversationId) -> Option<UserId> {
        self.get(conversation_id)
            .await
            .and_then(|c| c.counterpart(self.me))
    }

    pub async fn snapshot(&self) -> DirectorySnapshot {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| !state.hidden.contains(&c.id))
            .cloned()
            .collect();
        // Most recent first; conversations without messages last
        conversations.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let unread_total = conversations.iter().map(|c| c.unread_count).sum();

        DirectorySnapshot {
            conversations,
            error: state.error.clone(),
            unread_total,
            server_unread_total: state.server_unread_total,
        }
    }
}
