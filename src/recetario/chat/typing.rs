//! Typing presence.
//!
//! Each user owns one row in the presence collection. Local keystrokes mark the row as
//! typing and schedule a reset after a quiet period; every change to the collection
//! re-reads who is typing and reports the peers (self excluded) by display name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;

use crate::backend::{AuthUser, Backend, ChangeKind, Query};
use crate::recetario::debounce::Debouncer;
use crate::recetario::error::Result;
use crate::recetario::schema::{
    TYPING_CHANNEL, TYPING_CONFLICT_COLUMN, TYPING_TABLE, USERS_TABLE,
};
use crate::recetario::subscription::{Gate, Subscription};

use super::types::TypingStatus;

const FALLBACK_DISPLAY_NAME: &str = "Usuario";

/// Human-readable indicator for the peers currently typing.
pub fn typing_indicator(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [name] => Some(format!("{} está escribiendo...", name)),
        many => Some(format!("{} personas están escribiendo...", many.len())),
    }
}

#[derive(Debug, Clone)]
struct Actor {
    id: String,
    email: String,
}

struct TypingInner {
    backend: Arc<dyn Backend>,
    debouncer: Debouncer,
    /// Identity of the last status write, reused to clear the flag after sign out.
    last_actor: Mutex<Option<Actor>>,
    /// Held for the whole of a status write so writes reach the backend in call order.
    write_lock: tokio::sync::Mutex<()>,
    /// Bumped by every keystroke. A deferred reset only writes if no keystroke followed.
    keystrokes: AtomicU64,
}

#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<TypingInner>,
}

impl TypingTracker {
    pub fn new(backend: Arc<dyn Backend>, quiet_period: Duration) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                backend,
                debouncer: Debouncer::new(quiet_period),
                last_actor: Mutex::new(None),
                write_lock: tokio::sync::Mutex::new(()),
                keystrokes: AtomicU64::new(0),
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.debouncer.delay()
    }

    /// True while a reset to not-typing is waiting for the quiet period to elapse.
    pub fn is_reset_pending(&self) -> bool {
        self.inner.debouncer.is_pending()
    }

    /// Records a local keystroke.
    ///
    /// Writes `is_typing = true` immediately and (re)starts the quiet-period countdown
    /// after which `is_typing = false` is written. Errors are logged, never returned.
    pub async fn notify_typing(&self) {
        self.inner.debouncer.cancel();
        let keystroke = self.inner.keystrokes.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_typing(true).await;

        let inner = self.inner.clone();
        self.inner.debouncer.schedule(async move {
            // Detached: cancelling the countdown never interrupts a started write.
            tokio::spawn(async move {
                inner.reset_unless_typed_since(keystroke).await;
            });
        });
    }

    /// Cancels any pending countdown and clears the flag right away.
    pub async fn stop(&self) {
        self.inner.debouncer.cancel();
        self.inner.set_typing(false).await;
    }

    /// Names of the peers currently typing. Failures yield an empty list.
    pub async fn typing_peers(&self) -> Vec<String> {
        self.inner.typing_peers().await
    }

    /// Calls `on_change` with the typing peers after every change to the presence
    /// collection. Closing the subscription also clears the local flag.
    pub async fn subscribe_to_presence<F>(&self, on_change: F) -> Result<Subscription>
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        let mut feed = self
            .inner
            .backend
            .subscribe(TYPING_CHANNEL, TYPING_TABLE, &ChangeKind::ALL)
            .await?;
        let feed_id = feed.id().clone();

        let gate = Gate::new();
        let task_gate = gate.clone();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = feed.recv().await {
                tracing::debug!(
                    target: "recetario::chat::typing",
                    "Presence {} received",
                    event.kind.as_str()
                );
                let peers = inner.typing_peers().await;
                if task_gate.run(|| on_change(peers)).is_none() {
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        let name = feed_id.to_string();
        let cleanup = async move {
            inner.debouncer.cancel();
            inner.set_typing(false).await;
            if let Err(e) = inner.backend.unsubscribe(&feed_id).await {
                tracing::warn!(
                    target: "recetario::chat::typing",
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

impl std::fmt::Debug for TypingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingTracker")
            .field("quiet_period", &self.quiet_period())
            .field("reset_pending", &self.is_reset_pending())
            .finish()
    }
}

impl TypingInner {
    fn last_actor(&self) -> MutexGuard<'_, Option<Actor>> {
        self.last_actor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn set_typing(&self, is_typing: bool) {
        let _writing = self.write_lock.lock().await;
        self.log_failure(self.write_status(is_typing).await);
    }

    /// The deferred reset scheduled by keystroke number `keystroke`.
    async fn reset_unless_typed_since(&self, keystroke: u64) {
        let _writing = self.write_lock.lock().await;
        if self.keystrokes.load(Ordering::SeqCst) != keystroke {
            tracing::debug!(
                target: "recetario::chat::typing",
                "Skipping stale typing reset"
            );
            return;
        }
        self.log_failure(self.write_status(false).await);
    }

    fn log_failure(&self, result: Result<()>) {
        if let Err(e) = result {
            tracing::error!(
                target: "recetario::chat::typing",
                "Failed to update typing status: {}",
                e
            );
        }
    }

    async fn write_status(&self, is_typing: bool) -> Result<()> {
        let actor = match self.backend.current_user().await {
            Ok(Some(user)) => Some(self.resolve_actor(&user).await),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    target: "recetario::chat::typing",
                    "Could not read session: {}",
                    e
                );
                None
            }
        };
        let actor = match actor {
            Some(actor) => {
                *self.last_actor() = Some(actor.clone());
                actor
            }
            None if !is_typing => {
                let cached = self.last_actor().clone();
                match cached {
                    Some(actor) => actor,
                    None => return Ok(()),
                }
            }
            None => return Ok(()),
        };

        self.backend
            .upsert(
                TYPING_TABLE,
                json!({
                    "usuario_id": actor.id,
                    "usuario_email": actor.email,
                    "is_typing": is_typing,
                    "updated_at": Utc::now().to_rfc3339(),
                }),
                TYPING_CONFLICT_COLUMN,
            )
            .await?;
        tracing::debug!(
            target: "recetario::chat::typing",
            "Typing status set to {}",
            is_typing
        );
        Ok(())
    }

    /// The profile row's email names the user; the session email only stands in when
    /// the row is missing.
    async fn resolve_actor(&self, user: &AuthUser) -> Actor {
        let email = match self.profile_email(&user.id).await {
            Some(email) => email,
            None => user
                .email
                .clone()
                .filter(|email| !email.is_empty())
                .unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_string()),
        };
        Actor {
            id: user.id.clone(),
            email,
        }
    }

    async fn profile_email(&self, user_id: &str) -> Option<String> {
        let query = Query::new(USERS_TABLE)
            .columns(["email"])
            .eq("id", user_id)
            .limit(1);
        match self.backend.select(&query).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("email"))
                .and_then(|email| email.as_str())
                .filter(|email| !email.is_empty())
                .map(str::to_string),
            Err(e) => {
                tracing::warn!(
                    target: "recetario::chat::typing",
                    "Could not load profile email: {}",
                    e
                );
                None
            }
        }
    }

    async fn typing_peers(&self) -> Vec<String> {
        match self.fetch_typing_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::error!(
                    target: "recetario::chat::typing",
                    "Failed to load typing users: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    async fn fetch_typing_peers(&self) -> Result<Vec<String>> {
        let me = self.backend.current_user().await.ok().flatten().map(|user| user.id);
        let query = Query::new(TYPING_TABLE)
            .eq("is_typing", true)
            .order_by("updated_at", true);
        let rows = self.backend.select(&query).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| serde_json::from_value::<TypingStatus>(row).ok())
            .filter(|status| status.is_typing && Some(&status.user_id) != me.as_ref())
            .map(|status| status.display_name().to_string())
            .collect())
    }
}
