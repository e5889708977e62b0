use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

pub mod auth;
pub mod chat;
pub mod debounce;
pub mod error;
pub mod recipes;
pub mod schema;
pub mod subscription;
pub mod utils;

use crate::backend::{Backend, SupabaseBackend};
use crate::init_tracing;

use auth::AuthService;
use chat::{ChatConfig, ChatSession};
use error::{RecetarioError, Result};
use recipes::RecipesService;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_FILE: &str = "session.json";

const URL_VARS: [&str; 2] = ["EXPO_PUBLIC_SUPABASE_URL", "SUPABASE_URL"];
const ANON_KEY_VARS: [&str; 2] = ["EXPO_PUBLIC_SUPABASE_ANON_KEY", "SUPABASE_ANON_KEY"];

#[derive(Clone, Debug)]
pub struct RecetarioConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Base URL of the hosted backend project
    pub backend_url: String,

    /// Public (anonymous) API key of the project
    pub anon_key: String,

    /// Chat screen settings
    pub chat: ChatConfig,

    /// Timeout applied to every HTTP request
    pub request_timeout: Duration,
}

impl RecetarioConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path, backend_url: &str, anon_key: &str) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            backend_url: backend_url.to_string(),
            anon_key: anon_key.to_string(),
            chat: ChatConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Builds a configuration from the environment, loading `.env` first if present.
    pub fn from_env(data_dir: &Path, logs_dir: &Path) -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(RecetarioError::Configuration(format!(
                    "Failed to read .env: {}",
                    e
                )));
            }
        }
        let backend_url = env_var(&URL_VARS)?;
        let anon_key = env_var(&ANON_KEY_VARS)?;
        Ok(Self::new(data_dir, logs_dir, &backend_url, &anon_key))
    }

    pub fn with_chat_config(mut self, chat: ChatConfig) -> Self {
        self.chat = chat;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Where the signed-in session is kept between runs.
    pub fn session_file(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }
}

/// First non-empty variable among `names`.
fn env_var(names: &[&str]) -> Result<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.trim().is_empty()))
        .ok_or_else(|| RecetarioError::Configuration(format!("{} is not set", names[0])))
}

/// Application root. Builds the per-screen services on top of one backend.
pub struct Recetario {
    pub config: RecetarioConfig,
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for Recetario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recetario")
            .field("config", &self.config)
            .field("backend", &"<REDACTED>")
            .finish()
    }
}

impl Recetario {
    /// Creates the data and log directories, starts logging and connects the hosted
    /// backend described by `config`.
    pub async fn initialize(config: RecetarioConfig) -> Result<Self> {
        let data_dir = &config.data_dir;
        let logs_dir = &config.logs_dir;

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))
            .map_err(RecetarioError::from)?;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(RecetarioError::from)?;

        init_tracing(logs_dir);

        tracing::debug!(
            target: "recetario::initialize",
            "Logging initialized in directory: {:?}",
            logs_dir
        );

        let backend = SupabaseBackend::new(
            &config.backend_url,
            &config.anon_key,
            config.request_timeout,
        )?
        .with_session_file(config.session_file());

        tracing::info!(
            target: "recetario::initialize",
            "Connected to backend at {}",
            config.backend_url
        );

        Ok(Self::with_backend(config, Arc::new(backend)))
    }

    /// Uses an already built backend, e.g. the in-memory one.
    pub fn with_backend(config: RecetarioConfig, backend: Arc<dyn Backend>) -> Self {
        Self { config, backend }
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    /// Opens a new chat session; each chat screen gets its own.
    pub async fn chat_session(&self) -> ChatSession {
        ChatSession::open(self.backend.clone(), self.config.chat.clone()).await
    }

    pub fn auth(&self) -> AuthService {
        AuthService::new(self.backend.clone())
    }

    pub fn recipes(&self) -> RecipesService {
        RecipesService::new(self.backend.clone())
    }
}

#[cfg(test)]
pub mod test_utils {
    use std::time::Duration;

    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::backend::{AuthUser, MemoryBackend, RowStore};
    use crate::recetario::chat::ChatState;
    use crate::recetario::schema::{
        MESSAGES_TABLE, TYPING_CONFLICT_COLUMN, TYPING_TABLE, USERS_TABLE,
    };

    pub(crate) const ALICE_EMAIL: &str = "alice@example.com";
    pub(crate) const BOB_EMAIL: &str = "bob@example.com";
    pub(crate) const TEST_PASSWORD: &str = "contraseña";

    const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

    pub(crate) fn create_test_config() -> (RecetarioConfig, TempDir, TempDir) {
        let data_temp_dir = TempDir::new().expect("Failed to create temp data dir");
        let logs_temp_dir = TempDir::new().expect("Failed to create temp logs dir");
        let config = RecetarioConfig::new(
            data_temp_dir.path(),
            logs_temp_dir.path(),
            "http://localhost:54321",
            "anon",
        );
        (config, data_temp_dir, logs_temp_dir)
    }

    /// In-memory backend with a profile table and two users: alice (chef, signed in)
    /// and bob.
    pub(crate) fn create_test_backend() -> (Arc<MemoryBackend>, AuthUser, AuthUser) {
        let backend = MemoryBackend::new().with_profile_table(USERS_TABLE);
        let alice = backend.seed_user(ALICE_EMAIL, TEST_PASSWORD, "chef");
        let bob = backend.seed_user(BOB_EMAIL, TEST_PASSWORD, "usuario");
        backend.sign_in_as(&alice);
        (Arc::new(backend), alice, bob)
    }

    /// A message row created `second` seconds into a fixed minute.
    pub(crate) fn message_row(id: &str, author_id: &str, second: u32) -> Value {
        json!({
            "id": id,
            "contenido": format!("mensaje {}", id),
            "usuario_id": author_id,
            "created_at": format!("2024-05-01T10:00:{:02}Z", second),
        })
    }

    pub(crate) async fn insert_message(
        backend: &MemoryBackend,
        id: &str,
        author: &AuthUser,
        second: u32,
    ) {
        backend
            .insert(MESSAGES_TABLE, message_row(id, &author.id, second))
            .await
            .expect("Failed to insert test message");
    }

    /// Writes `user`'s presence row directly, as another device would.
    pub(crate) async fn upsert_typing(backend: &MemoryBackend, user: &AuthUser, is_typing: bool) {
        backend
            .upsert(
                TYPING_TABLE,
                json!({
                    "usuario_id": user.id,
                    "usuario_email": user.email,
                    "is_typing": is_typing,
                    "updated_at": chrono::Utc::now().to_rfc3339(),
                }),
                TYPING_CONFLICT_COLUMN,
            )
            .await
            .expect("Failed to upsert test typing status");
    }

    pub(crate) async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(WAIT_TIMEOUT, rx.recv())
            .await
            .expect("Timed out waiting for callback")
            .expect("Callback channel closed")
    }

    pub(crate) async fn wait_for(
        rx: &mut watch::Receiver<ChatState>,
        predicate: impl FnMut(&ChatState) -> bool,
    ) {
        tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(predicate))
            .await
            .expect("Timed out waiting for chat state")
            .expect("Chat state channel closed");
    }
}
