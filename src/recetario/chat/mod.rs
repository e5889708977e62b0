//! Chat screen session.
//!
//! [`ChatSession`] combines the message sync and the typing tracker into the state a
//! chat screen renders. It owns both realtime subscriptions for as long as it lives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::backend::Backend;
use crate::recetario::error::{OperationOutcome, RecetarioError};
use crate::recetario::subscription::Subscription;

pub mod message_sync;
mod timeline;
pub mod typing;
mod types;

pub use message_sync::MessageSync;
pub use timeline::MessageTimeline;
pub use typing::{TypingTracker, typing_indicator};
pub use types::{AuthorSummary, ChatState, Message, TypingStatus};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Number of most recent messages loaded on open and reload
    pub history_limit: usize,
    /// Quiet period after the last keystroke before the typing flag is cleared
    pub typing_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct SessionSubscriptions {
    messages: Option<Subscription>,
    presence: Option<Subscription>,
    closed: bool,
}

/// Live state of one chat screen.
pub struct ChatSession {
    config: ChatConfig,
    sync: MessageSync,
    typing: TypingTracker,
    state: Arc<watch::Sender<ChatState>>,
    sends_in_flight: AtomicUsize,
    loads_in_flight: AtomicUsize,
    subscriptions: Mutex<SessionSubscriptions>,
}

impl ChatSession {
    /// Opens both realtime channels, then loads the message history.
    ///
    /// Subscribing first means a message inserted while the history is in flight is
    /// either in the page or delivered live; the timeline dedupes the overlap. A
    /// channel that fails to open is logged and the session runs without it.
    pub async fn open(backend: Arc<dyn Backend>, config: ChatConfig) -> Self {
        let session = Self::new(backend, config);
        session.start().await;
        session
    }

    fn new(backend: Arc<dyn Backend>, config: ChatConfig) -> Self {
        let (state, _) = watch::channel(ChatState::default());
        Self {
            sync: MessageSync::new(backend.clone()),
            typing: TypingTracker::new(backend, config.typing_timeout),
            config,
            state: Arc::new(state),
            sends_in_flight: AtomicUsize::new(0),
            loads_in_flight: AtomicUsize::new(0),
            subscriptions: Mutex::new(SessionSubscriptions::default()),
        }
    }

    async fn start(&self) {
        let messages_state = self.state.clone();
        let presence_state = self.state.clone();
        let (messages, presence) = tokio::join!(
            self.sync.subscribe_to_inserts(move |message| {
                messages_state.send_if_modified(|state| state.messages.merge(message));
            }),
            self.typing.subscribe_to_presence(move |peers| {
                presence_state.send_if_modified(|state| {
                    if state.typing_users == peers {
                        return false;
                    }
                    state.typing_users = peers;
                    true
                });
            })
        );

        {
            let mut subscriptions = self.subscriptions();
            subscriptions.messages = messages
                .map_err(|e| {
                    tracing::error!(
                        target: "recetario::chat::session",
                        "Failed to subscribe to messages: {}",
                        e
                    );
                })
                .ok();
            subscriptions.presence = presence
                .map_err(|e| {
                    tracing::error!(
                        target: "recetario::chat::session",
                        "Failed to subscribe to typing status: {}",
                        e
                    );
                })
                .ok();
        }

        self.reload().await;
        tracing::debug!(
            target: "recetario::chat::session",
            "Chat session open with {} messages",
            self.state.borrow().messages.len()
        );
    }

    fn subscriptions(&self) -> MutexGuard<'_, SessionSubscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ChatState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.borrow().messages.to_vec()
    }

    pub fn typing_indicator(&self) -> Option<String> {
        self.state.borrow().typing_indicator()
    }

    pub fn is_closed(&self) -> bool {
        self.subscriptions().closed
    }

    /// Posts a message. It appears in the state once the insert feed delivers it.
    pub async fn send(&self, body: &str) -> OperationOutcome {
        if body.trim().is_empty() {
            return OperationOutcome::from(Err::<(), _>(RecetarioError::EmptyContent));
        }

        self.sends_in_flight.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|state| !std::mem::replace(&mut state.sending, true));

        let result = self.sync.send(body).await;

        if self.sends_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state
                .send_if_modified(|state| std::mem::replace(&mut state.sending, false));
        }
        if let Err(e) = &result {
            tracing::error!(
                target: "recetario::chat::send",
                "Failed to send message: {}",
                e
            );
        }
        result.into()
    }

    /// Deletes a message and drops it from the state on success.
    pub async fn delete(&self, id: &str) -> OperationOutcome {
        let result = self.sync.delete(id).await;
        match &result {
            Ok(()) => {
                self.state
                    .send_if_modified(|state| state.messages.remove(id).is_some());
            }
            Err(e) => tracing::error!(
                target: "recetario::chat::delete",
                "Failed to delete message {}: {}",
                id,
                e
            ),
        }
        result.into()
    }

    pub async fn notify_typing(&self) {
        self.typing.notify_typing().await;
    }

    /// Reloads the history page, keeping live messages that are newer than it.
    pub async fn reload(&self) {
        self.loads_in_flight.fetch_add(1, Ordering::SeqCst);
        self.state
            .send_if_modified(|state| !std::mem::replace(&mut state.loading, true));

        let history = self.sync.load_history(self.config.history_limit).await;

        let last = self.loads_in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
        self.state.send_modify(|state| {
            state.messages.replace_history(history);
            if last {
                state.loading = false;
            }
        });
    }

    /// Closes both channels and clears the local typing flag. Idempotent.
    pub async fn close(&self) {
        let (messages, presence) = {
            let mut subscriptions = self.subscriptions();
            if subscriptions.closed {
                return;
            }
            subscriptions.closed = true;
            (subscriptions.messages.take(), subscriptions.presence.take())
        };

        if let Some(subscription) = messages {
            subscription.close().await;
        }
        match presence {
            Some(subscription) => subscription.close().await,
            None => self.typing.stop().await,
        }
        tracing::debug!(target: "recetario::chat::session", "Chat session closed");
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AuthProvider, MemoryBackend, Operation};
    use crate::recetario::schema::{MESSAGES_TABLE, TYPING_TABLE};
    use crate::recetario::test_utils::*;

    async fn open_session(backend: &Arc<MemoryBackend>) -> ChatSession {
        ChatSession::open(backend.clone(), ChatConfig::default()).await
    }

    fn ids(session: &ChatSession) -> Vec<String> {
        session.messages().into_iter().map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn open_exposes_history_oldest_first() {
        let (backend, alice, bob) = create_test_backend();
        insert_message(&backend, "B", &bob, 2).await;
        insert_message(&backend, "A", &alice, 1).await;

        let session = open_session(&backend).await;

        assert_eq!(ids(&session), vec!["A", "B"]);
        let state = session.state();
        assert!(!state.loading);
        assert!(!state.sending);
        session.close().await;
    }

    #[tokio::test]
    async fn sent_message_arrives_through_the_feed() {
        let (backend, _, _) = create_test_backend();
        let session = open_session(&backend).await;
        let mut rx = session.watch();

        let outcome = session.send("hola").await;
        assert_eq!(outcome, OperationOutcome::ok());

        wait_for(&mut rx, |state| state.messages.len() == 1).await;
        let message = session.messages().remove(0);
        assert_eq!(message.content, "hola");
        assert_eq!(message.author_email(), Some(ALICE_EMAIL));
        session.close().await;
    }

    #[tokio::test]
    async fn duplicate_delivery_is_ignored() {
        let (backend, alice, _) = create_test_backend();
        let session = open_session(&backend).await;
        let mut rx = session.watch();

        insert_message(&backend, "m1", &alice, 1).await;
        wait_for(&mut rx, |state| state.messages.len() == 1).await;

        // replay the same insert
        backend.emit_raw(crate::backend::ChangeEvent {
            table: MESSAGES_TABLE.to_string(),
            kind: crate::backend::ChangeKind::Insert,
            new: message_row("m1", &alice.id, 1),
            old: serde_json::Value::Null,
        });
        insert_message(&backend, "m2", &alice, 2).await;
        wait_for(&mut rx, |state| state.messages.contains("m2")).await;

        assert_eq!(ids(&session), vec!["m1", "m2"]);
        session.close().await;
    }

    #[tokio::test]
    async fn send_without_session_reports_unauthenticated() {
        let (backend, _, _) = create_test_backend();
        backend.sign_out().await.unwrap();
        let session = open_session(&backend).await;

        let outcome = session.send("hi").await;

        assert_eq!(
            outcome,
            OperationOutcome::failure("Usuario no autenticado")
        );
        assert!(!session.state().sending);
        session.close().await;
    }

    #[tokio::test]
    async fn blank_send_touches_nothing() {
        let (backend, _, _) = create_test_backend();
        let session = open_session(&backend).await;
        let rx = session.watch();

        let outcome = session.send("   ").await;

        assert_eq!(outcome, OperationOutcome::failure("El mensaje está vacío"));
        assert_eq!(backend.calls(Operation::Insert, MESSAGES_TABLE), 0);
        assert!(!rx.has_changed().unwrap());
        session.close().await;
    }

    #[tokio::test]
    async fn backend_failure_becomes_outcome() {
        let (backend, _, _) = create_test_backend();
        backend.inject_failure(Operation::Insert, MESSAGES_TABLE);
        let session = open_session(&backend).await;

        let outcome = session.send("hola").await;

        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert!(!session.state().sending);
        session.close().await;
    }

    #[tokio::test]
    async fn delete_removes_message_locally() {
        let (backend, alice, _) = create_test_backend();
        insert_message(&backend, "m1", &alice, 1).await;
        insert_message(&backend, "m2", &alice, 2).await;
        let session = open_session(&backend).await;

        assert!(session.delete("m1").await.success);
        assert_eq!(ids(&session), vec!["m2"]);

        let missing = session.delete("m1").await;
        assert!(!missing.success);
        assert_eq!(ids(&session), vec!["m2"]);
        session.close().await;
    }

    #[tokio::test]
    async fn failed_history_load_leaves_empty_list() {
        let (backend, alice, _) = create_test_backend();
        insert_message(&backend, "m1", &alice, 1).await;
        backend.inject_failure(Operation::Select, MESSAGES_TABLE);

        let session = open_session(&backend).await;
        assert!(session.messages().is_empty());
        assert!(!session.state().loading);

        backend.clear_failures();
        session.reload().await;
        assert_eq!(ids(&session), vec!["m1"]);
        session.close().await;
    }

    #[tokio::test]
    async fn session_survives_subscription_failure() {
        let (backend, alice, _) = create_test_backend();
        insert_message(&backend, "m1", &alice, 1).await;
        backend.inject_failure(Operation::Subscribe, MESSAGES_TABLE);

        let session = open_session(&backend).await;

        assert_eq!(ids(&session), vec!["m1"]);
        assert_eq!(
            backend.open_channels(),
            vec![crate::recetario::schema::TYPING_CHANNEL.to_string()]
        );
        session.close().await;
    }

    #[tokio::test]
    async fn peers_typing_show_in_state() {
        let (backend, _, bob) = create_test_backend();
        let session = open_session(&backend).await;
        let mut rx = session.watch();

        upsert_typing(&backend, &bob, true).await;
        wait_for(&mut rx, |state| !state.typing_users.is_empty()).await;
        assert_eq!(
            session.typing_indicator().as_deref(),
            Some("bob está escribiendo...")
        );

        upsert_typing(&backend, &bob, false).await;
        wait_for(&mut rx, |state| state.typing_users.is_empty()).await;
        assert_eq!(session.typing_indicator(), None);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn typing_flag_clears_two_seconds_after_last_keystroke() {
        let (backend, alice, _) = create_test_backend();
        let session = open_session(&backend).await;
        let flag = |backend: &MemoryBackend| {
            backend
                .rows(TYPING_TABLE)
                .iter()
                .find(|row| row["usuario_id"] == alice.id.as_str())
                .and_then(|row| row["is_typing"].as_bool())
        };

        session.notify_typing().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        session.notify_typing().await;

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(flag(&backend), Some(true));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(flag(&backend), Some(false));
        session.close().await;
    }

    #[tokio::test]
    async fn close_stops_updates_and_clears_typing() {
        let (backend, alice, _) = create_test_backend();
        let session = open_session(&backend).await;
        session.notify_typing().await;

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(backend.open_channels().is_empty());

        let typing = backend.rows(TYPING_TABLE);
        assert_eq!(typing.len(), 1);
        assert_eq!(typing[0]["is_typing"], false);

        let before = session.state();
        insert_message(&backend, "late", &alice, 9).await;
        tokio::task::yield_now().await;
        assert_eq!(session.state(), before);
    }

    #[tokio::test]
    async fn dropping_the_session_leaves_the_channels() {
        let (backend, _, _) = create_test_backend();
        let session = open_session(&backend).await;
        assert_eq!(backend.open_channels().len(), 2);

        drop(session);

        for _ in 0..100 {
            if backend.open_channels().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(backend.open_channels().is_empty());
    }

    #[tokio::test]
    async fn closing_one_screen_keeps_the_other_live() {
        let (backend, alice, bob) = create_test_backend();
        let first = open_session(&backend).await;
        let second = open_session(&backend).await;
        let mut rx = second.watch();
        assert_eq!(backend.open_channels().len(), 4);

        first.close().await;
        assert_eq!(backend.open_channels().len(), 2);

        insert_message(&backend, "m1", &alice, 1).await;
        wait_for(&mut rx, |state| state.messages.contains("m1")).await;
        upsert_typing(&backend, &bob, true).await;
        wait_for(&mut rx, |state| state.typing_users == vec!["bob".to_string()]).await;

        second.close().await;
        assert!(backend.open_channels().is_empty());
    }

    #[tokio::test]
    async fn concurrent_sends_keep_sending_until_last_finishes() {
        let (backend, _, _) = create_test_backend();
        let session = open_session(&backend).await;

        let (a, b) = tokio::join!(session.send("uno"), session.send("dos"));

        assert!(a.success && b.success);
        assert!(!session.state().sending);
        assert_eq!(backend.rows(MESSAGES_TABLE).len(), 2);
        session.close().await;
    }

    #[test]
    fn default_config() {
        let config = ChatConfig::default();
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.typing_timeout, Duration::from_secs(2));
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn session_is_send_and_sync() {
        assert_send_sync::<ChatSession>();
    }
}
