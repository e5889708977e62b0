//! Client for the hosted backend platform.
//!
//! Row operations go through the PostgREST endpoint, sessions through the auth
//! endpoint, blobs through the storage endpoint, and change feeds through the realtime
//! websocket (see [`realtime`]).
//!
//! The session is refreshed with its refresh token shortly before it expires (or when
//! the platform rejects it) and, when a session file is configured, survives restarts.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};

use super::{
    AuthEvent, AuthProvider, AuthUser, BackendError, BlobStorage, ChangeFeed, ChangeKind, FeedId,
    Filter, Query, Realtime, Result, Row, RowStore,
};

pub mod realtime;

use realtime::RealtimeClient;

/// Sessions closer than this to expiry are refreshed before the next request.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Unix seconds.
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl Session {
    /// Fills `expires_at` from `expires_in` when only the latter was sent.
    fn stamped(mut self) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = self.expires_in.map(|secs| Utc::now().timestamp() + secs);
        }
        self
    }

    fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at
            .is_some_and(|at| at - Utc::now().timestamp() <= margin.as_secs() as i64)
    }

    fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

fn load_session(path: &Path) -> Option<Session> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(
                target: "recetario::backend::supabase::session",
                "Failed to read session file {:?}: {}",
                path,
                e
            );
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(session) => Some(session),
        Err(e) => {
            tracing::warn!(
                target: "recetario::backend::supabase::session",
                "Ignoring unreadable session file {:?}: {}",
                path,
                e
            );
            None
        }
    }
}

fn save_session(path: &Path, session: Option<&Session>) -> std::io::Result<()> {
    match session {
        Some(session) => std::fs::write(path, serde_json::to_vec(session)?),
        None => match std::fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        },
    }
}

pub struct SupabaseBackend {
    http: Client,
    base_url: Url,
    anon_key: String,
    session: RwLock<Option<Session>>,
    session_file: Option<PathBuf>,
    refresh_lock: Mutex<()>,
    auth_events: broadcast::Sender<AuthEvent>,
    realtime: RealtimeClient,
}

impl std::fmt::Debug for SupabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseBackend")
            .field("base_url", &self.base_url.as_str())
            .field("anon_key", &"<REDACTED>")
            .field("session", &"<REDACTED>")
            .finish()
    }
}

impl SupabaseBackend {
    /// Create a client for the project at `url`.
    ///
    /// # Arguments
    ///
    /// * `url` - Project URL, e.g. `https://xyz.supabase.co`
    /// * `anon_key` - Public anonymous key of the project
    /// * `timeout` - Timeout applied to every HTTP request
    pub fn new(url: &str, anon_key: &str, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(url)?;
        let http = Client::builder().timeout(timeout).build()?;
        let realtime = RealtimeClient::new(realtime_endpoint(&base_url, anon_key)?);

        Ok(Self {
            http,
            base_url,
            anon_key: anon_key.to_string(),
            session: RwLock::new(None),
            session_file: None,
            refresh_lock: Mutex::new(()),
            auth_events: broadcast::channel(16).0,
            realtime,
        })
    }

    /// Keeps the session in `path`, restoring any session already stored there.
    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(session) = load_session(&path) {
            tracing::debug!(
                target: "recetario::backend::supabase::session",
                "Restored session for {}",
                session.user.id
            );
            self.realtime
                .remember_access_token(Some(session.access_token.clone()));
            *self
                .session
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
        }
        self.session_file = Some(path);
        self
    }

    fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn access_token(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    /// Swaps the session in memory, on disk and on the realtime socket.
    async fn replace_session(&self, session: Option<Session>) {
        if let Some(path) = &self.session_file {
            if let Err(e) = save_session(path, session.as_ref()) {
                tracing::warn!(
                    target: "recetario::backend::supabase::session",
                    "Failed to persist session to {:?}: {}",
                    path,
                    e
                );
            }
        }
        let token = session.as_ref().map(|session| session.access_token.clone());
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
        self.realtime.set_access_token(token).await;
    }

    async fn store_session(&self, session: Option<Session>) {
        let event = match &session {
            Some(session) => AuthEvent::SignedIn(session.user.clone()),
            None => AuthEvent::SignedOut,
        };
        self.replace_session(session).await;
        let _ = self.auth_events.send(event);
    }

    /// Trades the refresh token for a new session unless `stale_token` was already
    /// replaced. Returns whether a usable session is in place afterwards.
    async fn refresh_session(&self, stale_token: &str) -> Result<bool> {
        let _refreshing = self.refresh_lock.lock().await;
        let Some(current) = self.session() else {
            return Ok(false);
        };
        if current.access_token != stale_token {
            return Ok(true);
        }
        let Some(refresh_token) = current.refresh_token else {
            return Ok(false);
        };

        let url = self
            .base_url
            .join("auth/v1/token")
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.anon_key)
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        let session: Session = serde_json::from_value(read_json(response).await?)?;
        self.replace_session(Some(session.stamped())).await;
        tracing::debug!(
            target: "recetario::backend::supabase::session",
            "Session refreshed"
        );
        Ok(true)
    }

    async fn refresh_if_expiring(&self) {
        let stale = match self.session() {
            Some(session) if session.can_refresh() && session.expires_within(REFRESH_MARGIN) => {
                session.access_token
            }
            _ => return,
        };
        if let Err(e) = self.refresh_session(&stale).await {
            tracing::warn!(
                target: "recetario::backend::supabase::session",
                "Failed to refresh session: {}",
                e
            );
        }
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        self.refresh_if_expiring().await;
        let url = self
            .base_url
            .join(path)
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        let bearer = self.access_token().unwrap_or_else(|| self.anon_key.clone());
        Ok(self
            .http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer))
    }

    async fn rows_request(
        &self,
        method: Method,
        table: &str,
        filters: &[Filter],
    ) -> Result<RequestBuilder> {
        let params: Vec<(String, String)> = filters.iter().map(render_filter).collect();
        Ok(self
            .request(method, &format!("rest/v1/{}", table))
            .await?
            .query(&params))
    }

    async fn fetch_user(&self) -> Result<AuthUser> {
        let response = self.request(Method::GET, "auth/v1/user").await?.send().await?;
        Ok(serde_json::from_value(read_json(response).await?)?)
    }
}

fn normalize_base_url(url: &str) -> Result<Url> {
    let mut normalized = url.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|e| BackendError::InvalidUrl(format!("{}: {}", url, e)))
}

/// Websocket endpoint of the realtime service for the project at `base_url`.
fn realtime_endpoint(base_url: &Url, api_key: &str) -> Result<Url> {
    let mut endpoint = base_url
        .join("realtime/v1/websocket")
        .map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
    let scheme = match base_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(BackendError::InvalidUrl(format!("unsupported scheme {}", other))),
    };
    endpoint
        .set_scheme(scheme)
        .map_err(|_| BackendError::InvalidUrl(base_url.to_string()))?;
    endpoint
        .query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(endpoint)
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_array_element(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        other => other.to_string(),
    }
}

/// Renders a filter as a PostgREST query parameter.
fn render_filter(filter: &Filter) -> (String, String) {
    match filter {
        Filter::Eq(column, value) => (column.clone(), format!("eq.{}", render_scalar(value))),
        Filter::Contains(column, values) => {
            let elements: Vec<String> = values.iter().map(render_array_element).collect();
            (column.clone(), format!("cs.{{{}}}", elements.join(",")))
        }
    }
}

fn error_message(body: &str, status: StatusCode) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|parsed| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| parsed.get(key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.to_string()
            }
        })
}

async fn read_json(response: Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
            message: error_message(&body, status),
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

fn into_rows(value: Value) -> Vec<Row> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

fn first_row(value: Value) -> Result<Row> {
    into_rows(value).into_iter().next().ok_or(BackendError::NotFound)
}

#[async_trait]
impl RowStore for SupabaseBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Row>> {
        let mut request = self
            .rows_request(Method::GET, &query.table, &query.filters)
            .await?
            .query(&[("select", query.select_clause())]);
        if let Some(order) = &query.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            request = request.query(&[("order", format!("{}.{}", order.column, direction))]);
        }
        if let Some(limit) = query.limit {
            request = request.query(&[("limit", limit.to_string())]);
        }
        Ok(into_rows(read_json(request.send().await?).await?))
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row> {
        let response = self
            .rows_request(Method::POST, table, &[])
            .await?
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        first_row(read_json(response).await?)
    }

    async fn upsert(&self, table: &str, row: Row, on_conflict: &str) -> Result<Row> {
        let response = self
            .rows_request(Method::POST, table, &[])
            .await?
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&row)
            .send()
            .await?;
        first_row(read_json(response).await?)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>> {
        let response = self
            .rows_request(Method::PATCH, table, filters)
            .await?
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        Ok(into_rows(read_json(response).await?))
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        let response = self
            .rows_request(Method::DELETE, table, filters)
            .await?
            .header("Prefer", "return=representation")
            .send()
            .await?;
        Ok(into_rows(read_json(response).await?))
    }
}

#[async_trait]
impl AuthProvider for SupabaseBackend {
    async fn current_user(&self) -> Result<Option<AuthUser>> {
        let Some(token) = self.access_token() else {
            return Ok(None);
        };
        match self.fetch_user().await {
            Ok(user) => return Ok(Some(user)),
            Err(BackendError::Status { status: 401 | 403, .. }) => {}
            Err(e) => return Err(e),
        }

        let refreshed = self.refresh_session(&token).await.unwrap_or_else(|e| {
            tracing::debug!(
                target: "recetario::backend::supabase::current_user",
                "Refresh after rejection failed: {}",
                e
            );
            false
        });
        if refreshed {
            match self.fetch_user().await {
                Ok(user) => return Ok(Some(user)),
                Err(BackendError::Status { status: 401 | 403, .. }) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(
            target: "recetario::backend::supabase::current_user",
            "Session rejected, clearing it"
        );
        self.store_session(None).await;
        Ok(None)
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<AuthUser> {
        let response = self
            .request(Method::POST, "auth/v1/signup")
            .await?
            .json(&json!({ "email": email, "password": password, "data": metadata }))
            .send()
            .await?;
        let body = read_json(response).await?;

        if body.get("access_token").is_some() {
            let session: Session = serde_json::from_value(body)?;
            let user = session.user.clone();
            self.store_session(Some(session.stamped())).await;
            return Ok(user);
        }
        // Email confirmation pending: the platform returns the bare user.
        let user = body.get("user").cloned().unwrap_or(body);
        Ok(serde_json::from_value(user)?)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser> {
        let response = self
            .request(Method::POST, "auth/v1/token")
            .await?
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let session: Session = serde_json::from_value(read_json(response).await?)?;
        let user = session.user.clone();
        self.store_session(Some(session.stamped())).await;
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        if self.access_token().is_none() {
            return Ok(());
        }
        let result = match self.request(Method::POST, "auth/v1/logout").await?.send().await {
            Ok(response) => read_json(response).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        // The local session is dropped even if the server call failed.
        self.store_session(None).await;
        result
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }
}

#[async_trait]
impl Realtime for SupabaseBackend {
    async fn subscribe(
        &self,
        channel: &str,
        table: &str,
        kinds: &[ChangeKind],
    ) -> Result<ChangeFeed> {
        self.realtime.subscribe(channel, table, kinds).await
    }

    async fn unsubscribe(&self, feed: &FeedId) -> Result<()> {
        self.realtime.unsubscribe(feed).await
    }
}

#[async_trait]
impl BlobStorage for SupabaseBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let response = self
            .request(Method::POST, &format!("storage/v1/object/{}/{}", bucket, path))
            .await?
            .header("content-type", content_type)
            .header("cache-control", "max-age=3600")
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;
        let body = read_json(response).await?;
        Ok(body
            .get("Key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/{}", bucket, path)))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        )
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("storage/v1/object/{}", bucket))
            .await?
            .json(&json!({ "prefixes": paths }))
            .send()
            .await?;
        read_json(response).await.map(|_| ())
    }
}
