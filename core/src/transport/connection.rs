//! The single push-channel slot: connect/disconnect, reconnection, inbound routing
use crate::chat_types::{ChatEvent, ConversationId, Message};
use crate::config::Config;
use crate::transport::dialer::{Dialer, PushStream};
use crate::transport::protocol::PushEvent;
use crate::utils::EventBus;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// How long a teardown waits for the channel task before aborting it
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Connection status of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No channel, or the channel dropped and a retry is scheduled
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Channel open, pushes flowing
    Connected,
    /// Server rejected the token; caller must re-authenticate and reconnect
    AuthFailed,
    /// Retries exhausted; REST keeps working
    Failed,
}

impl ConnectionStatus {
    /// Terminal states end the channel task; only an explicit connect leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::AuthFailed | ConnectionStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub conversation_id: Option<ConversationId>,
    /// Consecutive failed attempts since the channel was last stable
    pub retry_count: u32,
}

impl ConnectionState {
    pub fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            conversation_id: None,
            retry_count: 0,
        }
    }
}

/// Receiver of validated pushed messages
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: Message);
}

/// Timing knobs of the channel
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub retry_delays: Vec<Duration>,
    pub retry_jitter_ms: u64,
    pub stable_after: Duration,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            retry_delays: config.retry_delays.clone(),
            retry_jitter_ms: config.retry_jitter_ms,
            stable_after: config.stable_after,
        }
    }
}

struct ActiveChannel {
    conversation_id: ConversationId,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns at most one live push channel.
///
/// `connect`/`disconnect` are serialized on the slot mutex. Each call takes a
/// ticket first; a connect that finds a newer ticket issued while it waited
/// for the lock gives up, so rapid navigation collapses to the last request.
pub struct TransportConnection {
    dialer: Arc<dyn Dialer>,
    sink: Arc<dyn MessageSink>,
    events: EventBus,
    settings: ConnectionSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    slot: Mutex<Option<ActiveChannel>>,
    tickets: AtomicU64,
}

impl TransportConnection {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        sink: Arc<dyn MessageSink>,
        events: EventBus,
        settings: ConnectionSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::disconnected());
        Self {
            dialer,
            sink,
            events,
            settings,
            state_tx: Arc::new(state_tx),
            slot: Mutex::new(None),
            tickets: AtomicU64::new(0),
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Observe state transitions
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Open the channel for `conversation_id`.
    ///
    /// No-op when the channel already serves this conversation and is not in
    /// a terminal state. A channel for another conversation is torn down
    /// first. Returns once the channel task is running; progress is visible
    /// through `state()`/`watch()`.
    pub async fn connect(&self, conversation_id: ConversationId, token: String) {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.slot.lock().await;

        if self.tickets.load(Ordering::SeqCst) != ticket {
            debug!("connect to conversation {} superseded by a newer request", conversation_id);
            return;
        }

        if let Some(active) = slot.as_ref() {
            let status = self.state().status;
            if active.conversation_id == conversation_id
                && !status.is_terminal()
                && !active.task.is_finished()
            {
                debug!("already on conversation {} ({:?})", conversation_id, status);
                return;
            }
        }

        if let Some(active) = slot.take() {
            self.teardown(active).await;
        }

        info!("Opening push channel for conversation {}", conversation_id);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let channel = Channel {
            conversation_id,
            token,
            dialer: self.dialer.clone(),
            sink: self.sink.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
            state_tx: self.state_tx.clone(),
        };
        channel.publish(ConnectionStatus::Connecting, 0);
        let task = tokio::spawn(channel.run(shutdown_rx));

        *slot = Some(ActiveChannel {
            conversation_id,
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Release the channel. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.tickets.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.slot.lock().await;

        if let Some(active) = slot.take() {
            info!("Closing push channel for conversation {}", active.conversation_id);
            self.teardown(active).await;
        }

        let idle = ConnectionState::disconnected();
        if self.state() != idle {
            self.state_tx.send_replace(idle.clone());
            self.events.emit(ChatEvent::ConnectionChanged { state: idle });
        }
    }

    /// The conversation currently held in the slot, whatever its state
    pub async fn conversation_id(&self) -> Option<ConversationId> {
        self.slot.lock().await.as_ref().map(|a| a.conversation_id)
    }

    async fn teardown(&self, active: ActiveChannel) {
        let ActiveChannel {
            conversation_id,
            shutdown,
            mut task,
        } = active;
        // The task may already be gone after a terminal state
        let _ = shutdown.send(());
        if timeout(TEARDOWN_GRACE, &mut task).await.is_err() {
            warn!("push channel {} did not stop in time, aborting", conversation_id);
            task.abort();
            let _ = task.await;
        }
    }
}

/// Everything one channel task needs
struct Channel {
    conversation_id: ConversationId,
    token: String,
    dialer: Arc<dyn Dialer>,
    sink: Arc<dyn MessageSink>,
    events: EventBus,
    settings: ConnectionSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl Channel {
    fn publish(&self, status: ConnectionStatus, retry_count: u32) {
        let state = ConnectionState {
            status,
            conversation_id: Some(self.conversation_id),
            retry_count,
        };
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            debug!("push channel {} -> {:?} (retry {})", self.conversation_id, status, retry_count);
            self.events.emit(ChatEvent::ConnectionChanged { state });
        }
    }

    fn backoff(&self, attempt: u32) -> Option<Duration> {
        let base = *self.settings.retry_delays.get(attempt as usize)?;
        let jitter = if self.settings.retry_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.settings.retry_jitter_ms)
        } else {
            0
        };
        Some(base + Duration::from_millis(jitter))
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut retry_count: u32 = 0;

        loop {
            self.publish(ConnectionStatus::Connecting, retry_count);

            let dial = timeout(
                self.settings.connect_timeout,
                self.dialer.dial(self.conversation_id, &self.token),
            );
            let outcome = tokio::select! {
                _ = &mut shutdown => return,
                outcome = dial => outcome,
            };

            match outcome {
                Ok(Ok(mut stream)) => {
                    info!("Push channel connected (conversation {})", self.conversation_id);
                    self.publish(ConnectionStatus::Connected, retry_count);

                    if self
                        .pump(stream.as_mut(), &mut shutdown, &mut retry_count)
                        .await
                    {
                        stream.close().await;
                        return;
                    }
                    warn!("Push channel for conversation {} closed unexpectedly", self.conversation_id);
                    self.publish(ConnectionStatus::Disconnected, retry_count);
                }
                Ok(Err(e)) if e.is_auth() => {
                    error!("Push channel authentication failed: {}", e);
                    self.publish(ConnectionStatus::AuthFailed, retry_count);
                    return;
                }
                Ok(Err(e)) => {
                    warn!("Push channel connect failed (conversation {}): {}", self.conversation_id, e);
                }
                Err(_) => {
                    warn!(
                        "Push channel connect timed out after {:?} (conversation {})",
                        self.settings.connect_timeout, self.conversation_id
                    );
                }
            }

            let Some(delay) = self.backoff(retry_count) else {
                error!(
                    "Giving up on push channel for conversation {} after {} retries",
                    self.conversation_id, retry_count
                );
                self.publish(ConnectionStatus::Failed, retry_count);
                return;
            };
            retry_count += 1;
            debug!("Reconnecting in {:?} (attempt {})", delay, retry_count);

            tokio::select! {
                _ = &mut shutdown => return,
                _ = sleep(delay) => {}
            }
        }
    }

    /// Forward frames until the channel ends. Returns true when stopped by
    /// an explicit shutdown, false when the server side went away.
    ///
    /// The retry count is reset once the channel proves stable: a frame
    /// arrived or it stayed up for `stable_after`.
    async fn pump(
        &self,
        stream: &mut dyn PushStream,
        shutdown: &mut oneshot::Receiver<()>,
        retry_count: &mut u32,
    ) -> bool {
        let stable = sleep(self.settings.stable_after);
        tokio::pin!(stable);
        let mut proven = false;

        loop {
            tokio::select! {
                _ = &mut *shutdown => return true,
                _ = &mut stable, if !proven => {
                    proven = true;
                    self.mark_stable(retry_count);
                }
                frame = stream.next_text() => match frame {
                    Some(Ok(text)) => {
                        if !proven {
                            proven = true;
                            self.mark_stable(retry_count);
                        }
                        self.handle_frame(&text).await
                    }
                    Some(Err(e)) => {
                        warn!("Push channel read error: {}", e);
                        return false;
                    }
                    None => return false,
                },
            }
        }
    }

    fn mark_stable(&self, retry_count: &mut u32) {
        if *retry_count > 0 {
            debug!("push channel {} stable, retry count reset", self.conversation_id);
            *retry_count = 0;
            self.publish(ConnectionStatus::Connected, 0);
        }
    }

    async fn handle_frame(&self, text: &str) {
        let event = match PushEvent::from_text(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed push frame: {}", e);
                return;
            }
        };

        let kind = event.event_type();
        match event.into_message_for(self.conversation_id) {
            Some(message) => {
                debug!("Push {} in conversation {}", message.id, self.conversation_id);
                self.sink.deliver(message).await;
            }
            None => debug!(
                "Ignoring {} push not addressed to conversation {}",
                kind, self.conversation_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(delays: Vec<Duration>, jitter: u64) -> Channel {
        struct NullSink;
        #[async_trait]
        impl MessageSink for NullSink {
            async fn deliver(&self, _message: Message) {}
        }
        struct NullDialer;
        #[async_trait]
        impl Dialer for NullDialer {
            async fn dial(
                &self,
                _conversation_id: ConversationId,
                _token: &str,
            ) -> crate::error::Result<Box<dyn PushStream>> {
                Err(crate::error::ChatError::Network("offline".into()))
            }
        }
        let (state_tx, _) = watch::channel(ConnectionState::disconnected());
        Channel {
            conversation_id: 1,
            token: "t".into(),
            dialer: Arc::new(NullDialer),
            sink: Arc::new(NullSink),
            events: EventBus::new(4),
            settings: ConnectionSettings {
                connect_timeout: Duration::from_millis(50),
                retry_delays: delays,
                retry_jitter_ms: jitter,
                stable_after: Duration::from_secs(1),
            },
            state_tx: Arc::new(state_tx),
        }
    }

    #[test]
    fn test_backoff_follows_schedule_then_stops() {
        let ch = channel(vec![Duration::from_millis(10), Duration::from_millis(20)], 0);
        assert_eq!(ch.backoff(0), Some(Duration::from_millis(10)));
        assert_eq!(ch.backoff(1), Some(Duration::from_millis(20)));
        assert_eq!(ch.backoff(2), None);
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let ch = channel(vec![Duration::from_millis(100)], 30);
        for _ in 0..50 {
            let d = ch.backoff(0).unwrap();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(130));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionStatus::AuthFailed.is_terminal());
        assert!(ConnectionStatus::Failed.is_terminal());
        assert!(!ConnectionStatus::Disconnected.is_terminal());
        assert!(!ConnectionStatus::Connecting.is_terminal());
    }
}
