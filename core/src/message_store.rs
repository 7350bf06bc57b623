//! Message store: ordered, de-duplicated messages per conversation
//!
//! REST history and pushed messages merge by server id; optimistic sends are
//! tracked in a separate correlation map (`client_id -> pending send`) and
//! folded into the id-keyed set only once the server confirms them.
use crate::api::{ChatApi, SendRequest};
use crate::chat_types::{
    ChatEvent, ConversationId, DeliveryState, Message, MessageId, SortKey, UserId,
    LOCAL_ID_PREFIX,
};
use crate::error::{ChatError, Result};
use crate::utils::EventBus;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// What a thread view renders
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThreadSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub loading: bool,
    pub error: Option<String>,
}

/// Result of a history request that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Page merged; `added` counts entries that were new or changed
    Applied { added: usize },
    /// The displayed conversation changed while the request was in flight
    Stale,
    /// No older page to load
    Exhausted,
}

/// Effect of merging one confirmed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// The id was not loaded before
    Inserted,
    /// An existing entry (same id, or the correlated optimistic one) was replaced
    Updated,
    /// Identical entry already present
    Unchanged,
}

/// Data needed to re-send an optimistic message
#[derive(Debug, Clone)]
struct PendingSend {
    recipient_id: UserId,
}

/// How a failed send request ends up in the thread
enum SendFailure {
    /// A push already confirmed the message
    AlreadyConfirmed(Message),
    MarkedFailed,
    /// The optimistic entry is gone (discarded or view reset)
    Gone,
}

#[derive(Default)]
struct Thread {
    entries: BTreeMap<SortKey, Message>,
    /// Every id present in `entries`, server and local
    by_id: HashMap<MessageId, SortKey>,
    /// Optimistic sends not yet confirmed, keyed by correlation key
    pending: HashMap<String, PendingSend>,
    /// In-flight sends whose message a push confirmed before the
    /// request returned
    confirmed: HashMap<String, MessageId>,
    /// Next older history page; 0 until the newest page has been loaded
    next_page: u32,
    has_more: bool,
    loading: bool,
    error: Option<String>,
}

impl Thread {
    fn insert(&mut self, message: Message) {
        let key = message.sort_key();
        self.by_id.insert(message.id.clone(), key.clone());
        self.entries.insert(key, message);
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let key = self.by_id.remove(id)?;
        self.entries.remove(&key)
    }

    fn get_local_mut(&mut self, client_id: &str) -> Option<&mut Message> {
        let key = self.by_id.get(&MessageId::Local(client_id.to_string()))?;
        self.entries.get_mut(key)
    }

    /// Oldest optimistic entry the confirmed `message` could be, by sender
    /// and text. Used when the server did not echo the correlation key.
    fn match_pending(&self, message: &Message) -> Option<String> {
        self.entries.values().find_map(|entry| match &entry.id {
            MessageId::Local(key)
                if self.pending.contains_key(key)
                    && entry.sender_id == message.sender_id
                    && entry.text == message.text =>
            {
                Some(key.clone())
            }
            _ => None,
        })
    }

    /// Merge a server-confirmed message. Replaces the optimistic entry it
    /// correlates with and any entry carrying the same id.
    fn upsert_confirmed(&mut self, mut message: Message) -> Merge {
        let mut replaced_optimistic = false;

        if message.client_id.is_none() && !self.by_id.contains_key(&message.id) {
            message.client_id = self.match_pending(&message);
        }
        if let Some(client_id) = message.client_id.as_deref() {
            if self.pending.remove(client_id).is_some() {
                let local = self.remove(&MessageId::Local(client_id.to_string()));
                // A pending entry still has its request in flight
                if local.is_some_and(|m| m.delivery_state == DeliveryState::Pending) {
                    self.confirmed
                        .insert(client_id.to_string(), message.id.clone());
                }
                replaced_optimistic = true;
            }
        }

        let existed = match self.by_id.get(&message.id) {
            Some(key) if self.entries.get(key) == Some(&message) => {
                return if replaced_optimistic {
                    Merge::Updated
                } else {
                    Merge::Unchanged
                };
            }
            Some(_) => {
                self.remove(&message.id);
                true
            }
            None => false,
        };
        self.insert(message);
        if existed || replaced_optimistic {
            Merge::Updated
        } else {
            Merge::Inserted
        }
    }

    fn send_failed(&mut self, client_id: &str) -> SendFailure {
        if let Some(id) = self.confirmed.remove(client_id) {
            if let Some(message) = self.by_id.get(&id).and_then(|k| self.entries.get(k)) {
                return SendFailure::AlreadyConfirmed(message.clone());
            }
        }
        if !self.pending.contains_key(client_id) {
            return SendFailure::Gone;
        }
        match self.get_local_mut(client_id) {
            Some(message) => {
                message.delivery_state = DeliveryState::Failed;
                SendFailure::MarkedFailed
            }
            None => SendFailure::Gone,
        }
    }

    fn messages(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }
}

struct StoreState {
    active: Option<ConversationId>,
    /// Bumped whenever the displayed conversation changes
    epoch: u64,
    threads: HashMap<ConversationId, Thread>,
}

/// Single source of truth for loaded messages
pub struct MessageStore {
    api: Arc<dyn ChatApi>,
    events: EventBus,
    page_size: u32,
    state: RwLock<StoreState>,
    next_local: AtomicU64,
}

impl MessageStore {
    pub fn new(api: Arc<dyn ChatApi>, events: EventBus, page_size: u32) -> Self {
        Self {
            api,
            events,
            page_size: page_size.max(1),
            state: RwLock::new(StoreState {
                active: None,
                epoch: 0,
                threads: HashMap::new(),
            }),
            next_local: AtomicU64::new(0),
        }
    }

    /// Mark `conversation_id` as the displayed thread. Results of requests
    /// started before this call are discarded when they complete.
    pub async fn activate(&self, conversation_id: ConversationId) -> u64 {
        let mut state = self.state.write().await;
        state.active = Some(conversation_id);
        state.epoch += 1;
        state.threads.entry(conversation_id).or_default();
        debug!("thread {} active (epoch {})", conversation_id, state.epoch);
        state.epoch
    }

    pub async fn deactivate(&self) {
        let mut state = self.state.write().await;
        state.active = None;
        state.epoch += 1;
    }

    pub async fn active(&self) -> Option<ConversationId> {
        self.state.read().await.active
    }

    /// Load the newest history page and merge it.
    pub async fn fetch_history(&self, conversation_id: ConversationId) -> Result<FetchOutcome> {
        self.fetch_page(conversation_id, None).await
    }

    /// Load the next older history page and merge it.
    pub async fn fetch_older(&self, conversation_id: ConversationId) -> Result<FetchOutcome> {
        let next = {
            let state = self.state.read().await;
            state
                .threads
                .get(&conversation_id)
                .map(|t| (t.next_page, t.has_more))
        };
        match next {
            Some((page, true)) if page > 0 => self.fetch_page(conversation_id, Some(page)).await,
            Some((page, false)) if page > 0 => Ok(FetchOutcome::Exhausted),
            // Nothing loaded yet: start with the newest page
            _ => self.fetch_history(conversation_id).await,
        }
    }

    async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        older: Option<u32>,
    ) -> Result<FetchOutcome> {
        let epoch = {
            let mut state = self.state.write().await;
            let epoch = state.epoch;
            state.threads.entry(conversation_id).or_default().loading = true;
            epoch
        };
        self.events.emit(ChatEvent::MessagesChanged { conversation_id });

        let page_no = older.unwrap_or(1);
        let result = self
            .api
            .fetch_messages(conversation_id, page_no, self.page_size)
            .await;

        let mut state = self.state.write().await;
        let displaced = state.active.is_some_and(|active| active != conversation_id);
        if state.epoch != epoch || displaced {
            debug!(
                "discarding history page {} of conversation {}: view changed",
                page_no, conversation_id
            );
            if let Some(thread) = state.threads.get_mut(&conversation_id) {
                thread.loading = false;
            }
            return Ok(FetchOutcome::Stale);
        }

        let thread = state.threads.entry(conversation_id).or_default();
        thread.loading = false;

        match result {
            Ok(page) => {
                let mut added = 0;
                for message in page.messages {
                    if message.conversation_id != conversation_id {
                        warn!(
                            "history of conversation {} returned message {} of conversation {}",
                            conversation_id, message.id, message.conversation_id
                        );
                        continue;
                    }
                    if thread.upsert_confirmed(message) != Merge::Unchanged {
                        added += 1;
                    }
                }
                thread.error = None;
                match older {
                    Some(n) => {
                        thread.next_page = n + 1;
                        thread.has_more = page.has_more;
                    }
                    None if thread.next_page == 0 => {
                        thread.next_page = 2;
                        thread.has_more = page.has_more;
                    }
                    None => {}
                }
                drop(state);
                debug!("history page {} of {}: {} merged", page_no, conversation_id, added);
                self.events.emit(ChatEvent::MessagesChanged { conversation_id });
                Ok(FetchOutcome::Applied { added })
            }
            Err(e) => {
                thread.error = Some(e.to_string());
                drop(state);
                warn!("history fetch for conversation {} failed: {}", conversation_id, e);
                self.events.emit(ChatEvent::HistoryFailed {
                    conversation_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Merge a message delivered by the push channel.
    pub async fn ingest_push(&self, message: Message) -> Merge {
        let conversation_id = message.conversation_id;
        let merge = {
            let mut state = self.state.write().await;
            state
                .threads
                .entry(conversation_id)
                .or_default()
                .upsert_confirmed(message)
        };
        if merge != Merge::Unchanged {
            self.events.emit(ChatEvent::MessagesChanged { conversation_id });
        }
        merge
    }

    /// Show `text` immediately as a pending message, then send it.
    ///
    /// On failure the message stays visible as `Failed` and the error is
    /// returned; `retry_send` re-sends it under the same correlation key.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
        sender_id: UserId,
        text: String,
    ) -> Result<Message> {
        let seq = self.next_local.fetch_add(1, Ordering::SeqCst) + 1;
        let client_id = format!("{}{}", LOCAL_ID_PREFIX, seq);

        let optimistic = Message {
            id: MessageId::Local(client_id.clone()),
            conversation_id,
            sender_id,
            text: text.clone(),
            created_at: Utc::now(),
            delivery_state: DeliveryState::Pending,
            client_id: Some(client_id.clone()),
        };
        {
            let mut state = self.state.write().await;
            let thread = state.threads.entry(conversation_id).or_default();
            thread
                .pending
                .insert(client_id.clone(), PendingSend { recipient_id });
            thread.insert(optimistic);
        }
        self.events.emit(ChatEvent::MessagesChanged { conversation_id });

        let request = SendRequest {
            conversation_id,
            recipient_id,
            text,
            client_id,
        };
        self.deliver(request).await
    }

    /// Re-send a failed optimistic message. It moves to the end of the
    /// thread and is pending again.
    pub async fn retry_send(
        &self,
        conversation_id: ConversationId,
        client_id: &str,
    ) -> Result<Message> {
        let request = {
            let mut state = self.state.write().await;
            let thread = state
                .threads
                .get_mut(&conversation_id)
                .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
            let recipient_id = thread
                .pending
                .get(client_id)
                .map(|p| p.recipient_id)
                .ok_or_else(|| ChatError::NotFound(format!("pending message {}", client_id)))?;
            let failed = thread
                .get_local_mut(client_id)
                .map(|m| m.delivery_state == DeliveryState::Failed)
                .unwrap_or(false);
            if !failed {
                return Err(ChatError::NotFound(format!("failed message {}", client_id)));
            }

            let mut message = thread
                .remove(&MessageId::Local(client_id.to_string()))
                .ok_or_else(|| ChatError::NotFound(format!("pending message {}", client_id)))?;
            message.delivery_state = DeliveryState::Pending;
            message.created_at = Utc::now();
            let text = message.text.clone();
            thread.insert(message);

            SendRequest {
                conversation_id,
                recipient_id,
                text,
                client_id: client_id.to_string(),
            }
        };
        info!("Retrying message {} in conversation {}", client_id, conversation_id);
        self.events.emit(ChatEvent::MessagesChanged { conversation_id });
        self.deliver(request).await
    }

    /// Drop a failed optimistic message at the user's request.
    pub async fn discard_failed(&self, conversation_id: ConversationId, client_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            let Some(thread) = state.threads.get_mut(&conversation_id) else {
                return false;
            };
            let failed = thread
                .get_local_mut(client_id)
                .map(|m| m.delivery_state == DeliveryState::Failed)
                .unwrap_or(false);
            if failed {
                thread.pending.remove(client_id);
                thread.remove(&MessageId::Local(client_id.to_string()));
            }
            failed
        };
        if removed {
            self.events.emit(ChatEvent::MessagesChanged { conversation_id });
        }
        removed
    }

    async fn deliver(&self, request: SendRequest) -> Result<Message> {
        let conversation_id = request.conversation_id;
        match self.api.send_message(&request).await {
            Ok(mut confirmed) => {
                // Backends that do not echo the key still answer this request
                confirmed.client_id.get_or_insert_with(|| request.client_id.clone());
                {
                    let mut state = self.state.write().await;
                    let thread = state.threads.entry(conversation_id).or_default();
                    thread.upsert_confirmed(confirmed.clone());
                    thread.confirmed.remove(&request.client_id);
                }
                debug!("{} confirmed as {}", request.client_id, confirmed.id);
                self.events.emit(ChatEvent::MessagesChanged { conversation_id });
                Ok(confirmed)
            }
            Err(e) => {
                let outcome = {
                    let mut state = self.state.write().await;
                    match state.threads.get_mut(&conversation_id) {
                        Some(thread) => thread.send_failed(&request.client_id),
                        None => SendFailure::Gone,
                    }
                };
                if let SendFailure::AlreadyConfirmed(message) = outcome {
                    info!(
                        "Send of {} reported {} but the server already delivered it as {}",
                        request.client_id, e, message.id
                    );
                    return Ok(message);
                }
                let marked = matches!(outcome, SendFailure::MarkedFailed);
                warn!(
                    "Sending {} to conversation {} failed: {}",
                    request.client_id, conversation_id, e
                );
                if marked {
                    self.events.emit(ChatEvent::MessagesChanged { conversation_id });
                }
                self.events.emit(ChatEvent::SendFailed {
                    conversation_id,
                    client_id: request.client_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Messages of a conversation, sorted by `(created_at, id)`
    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        let state = self.state.read().await;
        state
            .threads
            .get(&conversation_id)
            .map(Thread::messages)
            .unwrap_or_default()
    }

    pub async fn snapshot(&self, conversation_id: ConversationId) -> ThreadSnapshot {
        let state = self.state.read().await;
        match state.threads.get(&conversation_id) {
            Some(thread) => ThreadSnapshot {
                conversation_id,
                messages: thread.messages(),
                has_more: thread.has_more,
                loading: thread.loading,
                error: thread.error.clone(),
            },
            None => ThreadSnapshot {
                conversation_id,
                ..Default::default()
            },
        }
    }

    /// Correlation keys of optimistic messages still awaiting confirmation
    pub async fn pending_keys(&self, conversation_id: ConversationId) -> Vec<String> {
        let state = self.state.read().await;
        let mut keys: Vec<String> = state
            .threads
            .get(&conversation_id)
            .map(|t| t.pending.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        keys
    }
}
