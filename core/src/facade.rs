//! Chat facade: lifecycle coordination for the inbox and thread views
//!
//! One facade per signed-in session. It owns the only `TransportConnection`
//! of the application, so at most one push channel is ever live.
use crate::api::{ChatApi, HttpChatApi, SharedToken, TokenProvider};
use crate::chat_types::{ChatEvent, ConversationId, Message, UserId};
use crate::config::Config;
use crate::conversation_directory::{ConversationDirectory, DirectorySnapshot};
use crate::error::{ChatError, Result};
use crate::message_store::{FetchOutcome, Merge, MessageStore, ThreadSnapshot};
use crate::transport::{
    ConnectionSettings, ConnectionState, Dialer, MessageSink, TransportConnection, WsDialer,
};
use crate::utils::EventBus;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Routes pushed messages into the store and the directory
struct PushRouter {
    store: Arc<MessageStore>,
    directory: Arc<ConversationDirectory>,
    open: Arc<RwLock<Option<ConversationId>>>,
}

#[async_trait]
impl MessageSink for PushRouter {
    async fn deliver(&self, message: Message) {
        let merge = self.store.ingest_push(message.clone()).await;
        if merge == Merge::Inserted {
            let is_open = *self.open.read().await == Some(message.conversation_id);
            self.directory.on_new_message(&message, is_open).await;
        }
    }
}

pub struct ChatFacade {
    me: Option<UserId>,
    tokens: Arc<dyn TokenProvider>,
    events: EventBus,
    store: Arc<MessageStore>,
    directory: Arc<ConversationDirectory>,
    transport: TransportConnection,
    open: Arc<RwLock<Option<ConversationId>>>,
    /// Serializes view changes (open/switch/close)
    view: Mutex<()>,
    refresh_interval: std::time::Duration,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatFacade {
    pub fn new(
        config: &Config,
        api: Arc<dyn ChatApi>,
        dialer: Arc<dyn Dialer>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let store = Arc::new(MessageStore::new(
            api.clone(),
            events.clone(),
            config.history_page_size,
        ));
        let directory = Arc::new(ConversationDirectory::new(
            api,
            events.clone(),
            config.user_id,
        ));
        let open = Arc::new(RwLock::new(None));
        let router = Arc::new(PushRouter {
            store: store.clone(),
            directory: directory.clone(),
            open: open.clone(),
        });
        let transport = TransportConnection::new(
            dialer,
            router,
            events.clone(),
            ConnectionSettings::from(config),
        );

        Self {
            me: config.user_id,
            tokens,
            events,
            store,
            directory,
            transport,
            open,
            view: Mutex::new(()),
            refresh_interval: config.directory_refresh_interval,
            refresh_task: Mutex::new(None),
        }
    }

    /// Facade over the real backend: REST over HTTP, push over WebSocket.
    /// The returned token handle lets the auth layer swap the token later.
    pub fn from_config(config: &Config) -> Result<(Self, Arc<SharedToken>)> {
        config.validate()?;
        let tokens = Arc::new(SharedToken::new(config.token.clone()));
        let api = Arc::new(HttpChatApi::new(config, tokens.clone())?);
        let dialer = Arc::new(WsDialer::new(&config.ws_base_url));
        Ok((Self::new(config, api, dialer, tokens.clone()), tokens))
    }

    /// Thread view mounted (or switched): show `conversation_id`.
    ///
    /// The push channel is opened in the background and the newest history
    /// page is fetched meanwhile; whichever lands first populates the store
    /// and the other merges in. A history result that arrives after the
    /// view moved on is discarded.
    pub async fn open_thread(&self, conversation_id: ConversationId) -> Result<FetchOutcome> {
        {
            let _view = self.view.lock().await;
            *self.open.write().await = Some(conversation_id);
            self.store.activate(conversation_id).await;
            match self.tokens.token() {
                Some(token) => self.transport.connect(conversation_id, token).await,
                None => {
                    warn!("no bearer token; thread {} opens without push channel", conversation_id);
                    self.transport.disconnect().await;
                }
            }
        }
        info!("Thread {} opened", conversation_id);

        let outcome = self.store.fetch_history(conversation_id).await?;
        if matches!(outcome, FetchOutcome::Applied { .. }) {
            // Failure is already surfaced through the directory's error flag
            if let Err(e) = self.directory.mark_read(conversation_id).await {
                debug!("mark-read after opening {} failed: {}", conversation_id, e);
            }
        }
        Ok(outcome)
    }

    /// Thread view unmounted.
    pub async fn close_thread(&self) {
        let _view = self.view.lock().await;
        let previous = self.open.write().await.take();
        self.store.deactivate().await;
        self.transport.disconnect().await;
        if let Some(id) = previous {
            info!("Thread {} closed", id);
        }
    }

    /// Re-open the push channel of the open thread, e.g. after the auth layer
    /// refreshed the token following an `auth_failed` state.
    pub async fn reconnect(&self) -> Result<()> {
        let _view = self.view.lock().await;
        let conversation_id = self
            .open_conversation()
            .await
            .ok_or_else(|| ChatError::NotFound("no open thread".to_string()))?;
        let token = self
            .tokens
            .token()
            .ok_or_else(|| ChatError::Auth("no bearer token available".to_string()))?;
        self.transport.connect(conversation_id, token).await;
        Ok(())
    }

    pub async fn open_conversation(&self) -> Option<ConversationId> {
        *self.open.read().await
    }

    /// Send `text` to the other participant of the open thread.
    pub async fn send_message(&self, text: &str) -> Result<Message> {
        let conversation_id = self
            .open_conversation()
            .await
            .ok_or_else(|| ChatError::NotFound("no open thread".to_string()))?;
        let recipient_id = self.directory.counterpart(conversation_id).await.ok_or_else(|| {
            ChatError::NotFound(format!("recipient of conversation {}", conversation_id))
        })?;
        self.send_to(conversation_id, recipient_id, text).await
    }

    /// Send `text` into any conversation.
    pub async fn send_to(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
        text: &str,
    ) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Config("message text is empty".to_string()));
        }
        let sender_id = self
            .me
            .ok_or_else(|| ChatError::Config("signed-in user id is unknown".to_string()))?;
        let message = self
            .store
            .send_message(conversation_id, recipient_id, sender_id, text.to_string())
            .await?;
        self.directory.on_new_message(&message, true).await;
        Ok(message)
    }

    /// Re-send a failed message of the open thread.
    pub async fn retry_send(&self, client_id: &str) -> Result<Message> {
        let conversation_id = self
            .open_conversation()
            .await
            .ok_or_else(|| ChatError::NotFound("no open thread".to_string()))?;
        let message = self.store.retry_send(conversation_id, client_id).await?;
        self.directory.on_new_message(&message, true).await;
        Ok(message)
    }

    pub async fn discard_failed(&self, client_id: &str) -> bool {
        match self.open_conversation().await {
            Some(id) => self.store.discard_failed(id, client_id).await,
            None => false,
        }
    }

    /// Load the next older page of the open thread.
    pub async fn load_older(&self) -> Result<FetchOutcome> {
        let conversation_id = self
            .open_conversation()
            .await
            .ok_or_else(|| ChatError::NotFound("no open thread".to_string()))?;
        self.store.fetch_older(conversation_id).await
    }

    pub async fn refresh_conversations(&self) -> Result<usize> {
        self.directory.fetch_conversations().await
    }

    pub async fn refresh_unread_total(&self) -> Result<u32> {
        self.directory.refresh_unread_total().await
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        self.directory.mark_read(conversation_id).await
    }

    pub async fn hide_conversation(&self, conversation_id: ConversationId) -> bool {
        self.directory.hide(conversation_id).await
    }

    /// Periodically refresh the inbox and the unread total until `shutdown`.
    pub async fn spawn_directory_refresh(&self) {
        let directory = self.directory.clone();
        let period = self.refresh_interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Errors are kept in the directory's error flag
                let _ = directory.fetch_conversations().await;
                let _ = directory.refresh_unread_total().await;
            }
        });

        if let Some(previous) = self.refresh_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Stop background work and release the push channel.
    pub async fn shutdown(&self) {
        if let Some(task) = self.refresh_task.lock().await.take() {
            task.abort();
        }
        self.close_thread().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch()
    }

    /// Snapshot of the open thread
    pub async fn thread(&self) -> Option<ThreadSnapshot> {
        let id = self.open_conversation().await?;
        Some(self.store.snapshot(id).await)
    }

    pub async fn thread_snapshot(&self, conversation_id: ConversationId) -> ThreadSnapshot {
        self.store.snapshot(conversation_id).await
    }

    pub async fn directory(&self) -> DirectorySnapshot {
        self.directory.snapshot().await
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn conversations(&self) -> &Arc<ConversationDirectory> {
        &self.directory
    }
}
