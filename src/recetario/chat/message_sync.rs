//! Message history, sending and the live insert feed.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Value, json};

use crate::backend::{Backend, BackendError, ChangeKind, Embed, Filter, Query};
use crate::recetario::auth::require_actor;
use crate::recetario::error::{RecetarioError, Result};
use crate::recetario::schema::{
    MESSAGE_AUTHOR_FK, MESSAGES_CHANNEL, MESSAGES_TABLE, USERS_TABLE,
};
use crate::recetario::subscription::{Gate, Subscription};

use super::types::{AuthorSummary, Message};

fn author_embed() -> Embed {
    Embed {
        table: USERS_TABLE.to_string(),
        hint: Some(MESSAGE_AUTHOR_FK.to_string()),
        local_column: "usuario_id".to_string(),
        columns: vec!["email".to_string(), "rol".to_string()],
    }
}

fn decode_rows(rows: Vec<Value>) -> Vec<Message> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<Message>(row) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(
                    target: "recetario::chat::message_sync",
                    "Skipping unreadable message row: {}",
                    e
                );
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct MessageSync {
    backend: Arc<dyn Backend>,
}

impl MessageSync {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Loads the newest `limit` messages, oldest first, with author data joined.
    ///
    /// Failures are logged and yield an empty list.
    pub async fn load_history(&self, limit: usize) -> Vec<Message> {
        match self.fetch_history(limit).await {
            Ok(messages) => {
                tracing::debug!(
                    target: "recetario::chat::message_sync",
                    "Loaded {} messages",
                    messages.len()
                );
                messages
            }
            Err(e) => {
                tracing::error!(
                    target: "recetario::chat::message_sync",
                    "Failed to load messages: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    async fn fetch_history(&self, limit: usize) -> Result<Vec<Message>> {
        let query = Query::new(MESSAGES_TABLE)
            .embed(author_embed())
            .order_by("created_at", false)
            .limit(limit);
        let mut messages = decode_rows(self.backend.select(&query).await?);
        messages.reverse();
        messages.sort_by_key(|message| message.created_at);
        Ok(messages)
    }

    /// Posts `body` as the signed-in user.
    ///
    /// The message is not added locally; it shows up through the insert feed.
    pub async fn send(&self, body: &str) -> Result<()> {
        if body.trim().is_empty() {
            return Err(RecetarioError::EmptyContent);
        }
        let actor = require_actor(self.backend.as_ref()).await?;
        let row = self
            .backend
            .insert(
                MESSAGES_TABLE,
                json!({
                    "contenido": body,
                    "usuario_id": actor.id,
                }),
            )
            .await?;
        let id = row.get("id").cloned().unwrap_or_default();
        tracing::debug!(
            target: "recetario::chat::message_sync",
            "Sent message {}",
            id
        );
        Ok(())
    }

    /// Hard-deletes a message by id. Deleting an id that matches nothing is an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = self
            .backend
            .delete(MESSAGES_TABLE, &[Filter::Eq("id".to_string(), json!(id))])
            .await?;
        if removed.is_empty() {
            return Err(BackendError::NotFound.into());
        }
        tracing::debug!(
            target: "recetario::chat::message_sync",
            "Deleted message {}",
            id
        );
        Ok(())
    }

    /// Delivers every newly inserted message, with author data when it can be joined.
    pub async fn subscribe_to_inserts<F>(&self, on_message: F) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let mut feed = self
            .backend
            .subscribe(MESSAGES_CHANNEL, MESSAGES_TABLE, &[ChangeKind::Insert])
            .await?;

        let feed_id = feed.id().clone();
        let gate = Gate::new();
        let task_gate = gate.clone();
        let backend = self.backend.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = feed.recv().await {
                tracing::debug!(
                    target: "recetario::chat::message_sync",
                    "Insert received on {}",
                    feed.channel()
                );
                let message = enrich(backend.as_ref(), &event.new).await;
                if task_gate.run(|| on_message(message)).is_none() {
                    break;
                }
            }
        });

        let backend = self.backend.clone();
        let name = feed_id.to_string();
        let cleanup = async move {
            if let Err(e) = backend.unsubscribe(&feed_id).await {
                tracing::warn!(
                    target: "recetario::chat::message_sync",
                    "Failed to leave {}: {}",
                    feed_id,
                    e
                );
            }
        }
        .boxed();

        Ok(Subscription::new(name, gate, task, cleanup))
    }
}

/// Re-reads an inserted row with its author joined, falling back to the raw payload.
async fn enrich(backend: &dyn Backend, record: &Value) -> Message {
    let id = record.get("id").cloned().unwrap_or(Value::Null);
    let query = Query::new(MESSAGES_TABLE)
        .embed(author_embed())
        .eq("id", id)
        .limit(1);

    let row = match backend.select(&query).await {
        Ok(rows) => rows.into_iter().next(),
        Err(e) => {
            tracing::warn!(
                target: "recetario::chat::message_sync",
                "Could not load author for new message: {}",
                e
            );
            None
        }
    };

    match row.map(serde_json::from_value::<Message>) {
        Some(Ok(mut message)) => {
            if message.author.is_none() {
                message.author = Some(AuthorSummary::unknown());
            }
            message
        }
        Some(Err(e)) => {
            tracing::warn!(
                target: "recetario::chat::message_sync",
                "Unreadable message row, using change payload: {}",
                e
            );
            Message::from_raw_record(record)
        }
        None => Message::from_raw_record(record),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::{AuthProvider, ChangeEvent, MemoryBackend, Operation, RowStore};
    use crate::recetario::test_utils::*;

    fn sync_for(backend: &Arc<MemoryBackend>) -> MessageSync {
        MessageSync::new(backend.clone())
    }

    #[tokio::test]
    async fn history_is_oldest_first_with_authors() {
        let (backend, alice, bob) = create_test_backend();
        insert_message(&backend, "b", &bob, 2).await;
        insert_message(&backend, "a", &alice, 1).await;

        let history = sync_for(&backend).load_history(50).await;

        let ids: Vec<_> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(history[0].author_email(), Some(ALICE_EMAIL));
        assert_eq!(history[1].author_email(), Some(BOB_EMAIL));
    }

    #[tokio::test]
    async fn history_keeps_only_the_newest() {
        let (backend, alice, _) = create_test_backend();
        for second in 1..=5 {
            insert_message(&backend, &format!("m{}", second), &alice, second).await;
        }

        let history = sync_for(&backend).load_history(2).await;

        let ids: Vec<_> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m5"]);
    }

    #[tokio::test]
    async fn history_failure_yields_empty_list() {
        let (backend, alice, _) = create_test_backend();
        insert_message(&backend, "a", &alice, 1).await;
        backend.inject_failure(Operation::Select, MESSAGES_TABLE);

        assert!(sync_for(&backend).load_history(50).await.is_empty());
    }

    #[tokio::test]
    async fn whitespace_body_is_rejected_without_backend_call() {
        let (backend, _, _) = create_test_backend();
        let sync = sync_for(&backend);

        for body in ["", "   ", "\n\t "] {
            let err = sync.send(body).await.unwrap_err();
            assert!(matches!(err, RecetarioError::EmptyContent));
        }
        assert_eq!(backend.calls(Operation::Insert, MESSAGES_TABLE), 0);
    }

    #[tokio::test]
    async fn send_requires_a_session() {
        let (backend, _, _) = create_test_backend();
        backend.sign_out().await.unwrap();

        let err = sync_for(&backend).send("hola").await.unwrap_err();

        assert_eq!(err.to_string(), "Usuario no autenticado");
        assert_eq!(backend.calls(Operation::Insert, MESSAGES_TABLE), 0);
    }

    #[tokio::test]
    async fn send_stores_body_as_given() {
        let (backend, alice, _) = create_test_backend();

        sync_for(&backend).send("  hola  ").await.unwrap();

        let rows = backend.rows(MESSAGES_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["contenido"], "  hola  ");
        assert_eq!(rows[0]["usuario_id"], alice.id.as_str());
    }

    #[tokio::test]
    async fn delete_missing_message_fails() {
        let (backend, alice, _) = create_test_backend();
        insert_message(&backend, "a", &alice, 1).await;
        let sync = sync_for(&backend);

        sync.delete("a").await.unwrap();
        assert!(backend.rows(MESSAGES_TABLE).is_empty());

        let err = sync.delete("a").await.unwrap_err();
        assert!(matches!(
            err,
            RecetarioError::Backend(BackendError::NotFound)
        ));
    }

    #[tokio::test]
    async fn inserts_are_delivered_with_author() {
        let (backend, _, bob) = create_test_backend();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = sync_for(&backend)
            .subscribe_to_inserts(move |message| {
                let _ = tx.send(message);
            })
            .await
            .unwrap();

        insert_message(&backend, "m1", &bob, 1).await;

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, "m1");
        assert_eq!(message.author_email(), Some(BOB_EMAIL));

        subscription.close().await;
    }

    #[tokio::test]
    async fn enrichment_failure_falls_back_to_sentinel_author() {
        let (backend, _, bob) = create_test_backend();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = sync_for(&backend)
            .subscribe_to_inserts(move |message| {
                let _ = tx.send(message);
            })
            .await
            .unwrap();
        backend.inject_failure(Operation::Select, MESSAGES_TABLE);

        insert_message(&backend, "m1", &bob, 1).await;

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, "m1");
        assert_eq!(message.content, "mensaje m1");
        assert!(message.author.as_ref().is_some_and(AuthorSummary::is_unknown));

        subscription.close().await;
    }

    #[tokio::test]
    async fn missing_author_row_uses_sentinel() {
        let (backend, _, _) = create_test_backend();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = sync_for(&backend)
            .subscribe_to_inserts(move |message| {
                let _ = tx.send(message);
            })
            .await
            .unwrap();

        backend
            .insert(
                MESSAGES_TABLE,
                message_row("orphan", "no-such-user", 1),
            )
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.author, Some(AuthorSummary::unknown()));

        subscription.close().await;
    }

    #[tokio::test]
    async fn close_stops_delivery_and_leaves_channel() {
        let (backend, alice, _) = create_test_backend();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = sync_for(&backend)
            .subscribe_to_inserts(move |message| {
                let _ = tx.send(message);
            })
            .await
            .unwrap();
        assert_eq!(backend.open_channels(), vec![MESSAGES_CHANNEL.to_string()]);

        subscription.close().await;
        backend.emit_raw(ChangeEvent {
            table: MESSAGES_TABLE.to_string(),
            kind: ChangeKind::Insert,
            new: message_row("late", &alice.id, 3),
            old: Value::Null,
        });
        tokio::task::yield_now().await;

        assert!(backend.open_channels().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn burst_of_inserts_is_delivered_in_full() {
        let (backend, alice, _) = create_test_backend();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = sync_for(&backend)
            .subscribe_to_inserts(move |message| {
                let _ = tx.send(message.id);
            })
            .await
            .unwrap();

        for n in 0..300u32 {
            insert_message(&backend, &format!("m{}", n), &alice, n % 60).await;
        }

        let mut delivered = Vec::new();
        for _ in 0..300 {
            delivered.push(recv_within(&mut rx).await);
        }
        let expected: Vec<String> = (0..300).map(|n| format!("m{}", n)).collect();
        assert_eq!(delivered, expected);

        subscription.close().await;
    }
}
