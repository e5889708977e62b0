//! Backend collaborator interface.
//!
//! Everything the app needs from the hosted platform goes through the traits in this
//! module: row queries over named collections, the identity/session provider, realtime
//! change feeds and blob storage. Two implementations ship with the crate:
//! [`MemoryBackend`] (in-process, used by tests and offline runs) and
//! [`SupabaseBackend`] (HTTP + websocket client for the hosted platform).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

mod hub;
pub mod memory;
pub mod supabase;

pub use hub::ChangeHub;
pub use memory::{MemoryBackend, Operation};
pub use supabase::SupabaseBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
    #[error("No rows matched the request")]
    NotFound,
    #[error("Realtime connection unavailable: {0}")]
    Unavailable(String),
    #[error("Injected failure for {0}")]
    Injected(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for BackendError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BackendError::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// A row as returned by the platform: a JSON object keyed by column name.
pub type Row = Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(String, Value),
    /// Array `column` contains every element of the list.
    Contains(String, Vec<Value>),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(column, _) | Filter::Contains(column, _) => column,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(column, value) => row.get(column) == Some(value),
            Filter::Contains(column, values) => match row.get(column) {
                Some(Value::Array(items)) => values.iter().all(|v| items.contains(v)),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A to-one join rendered into each result row under the key `table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embed {
    /// Referenced collection, also the key the joined object is stored under.
    pub table: String,
    /// Foreign key constraint name used to disambiguate the relationship.
    pub hint: Option<String>,
    /// Column on the queried row that references `table.id`.
    pub local_column: String,
    /// Columns projected from the referenced row.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
    pub columns: Option<Vec<String>>,
    pub embed: Option<Embed>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
            columns: None,
            embed: None,
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    pub fn contains<V: Into<Value>>(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filters.push(Filter::Contains(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn embed(mut self, embed: Embed) -> Self {
        self.embed = Some(embed);
        self
    }

    /// Renders the PostgREST `select` parameter for this query.
    pub fn select_clause(&self) -> String {
        let mut clause = match &self.columns {
            Some(columns) if !columns.is_empty() => columns.join(","),
            _ => "*".to_string(),
        };
        if let Some(embed) = &self.embed {
            let target = match &embed.hint {
                Some(hint) => format!("{}!{}", embed.table, hint),
                None => embed.table.clone(),
            };
            clause.push_str(&format!(",{}({})", target, embed.columns.join(",")));
        }
        clause
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// A row-level change delivered by a realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// Row after the change (`Null` for deletes).
    pub new: Row,
    /// Row before the change when the platform provides it.
    pub old: Row,
}

/// Identifies one open change feed.
///
/// Feeds opened under the same channel name are distinct: closing one never affects
/// the others.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedId {
    pub channel: String,
    pub serial: u64,
}

impl std::fmt::Display for FeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.channel, self.serial)
    }
}

/// Receiving end of a realtime channel.
///
/// Only events whose kind was requested at subscription time are yielded. Each feed
/// owns an unbounded queue, so a slow consumer delays events but never loses them.
pub struct ChangeFeed {
    id: FeedId,
    kinds: Vec<ChangeKind>,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(
        id: FeedId,
        kinds: &[ChangeKind],
        receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    ) -> Self {
        Self {
            id,
            kinds: kinds.to_vec(),
            receiver,
        }
    }

    /// Key to pass to [`Realtime::unsubscribe`].
    pub fn id(&self) -> &FeedId {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.id.channel
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        self.kinds.contains(&event.kind)
    }

    /// Waits for the next accepted event. Returns `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        while let Some(event) = self.receiver.recv().await {
            if self.accepts(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Returns the next accepted event that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        while let Ok(event) = self.receiver.try_recv() {
            if self.accepts(&event) {
                return Some(event);
            }
        }
        None
    }
}

/// The authenticated identity behind the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: Value,
    /// Linked identities; an empty list after sign up means the email still needs confirming.
    #[serde(default)]
    pub identities: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(AuthUser),
    SignedOut,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The user behind the active session, if any.
    async fn current_user(&self) -> Result<Option<AuthUser>>;

    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<AuthUser>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser>;

    async fn sign_out(&self) -> Result<()>;

    /// Session changes published after subscribing.
    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
}

#[async_trait]
pub trait RowStore: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Row>>;

    /// Inserts a row and returns it as stored, including server-assigned columns.
    async fn insert(&self, table: &str, row: Row) -> Result<Row>;

    /// Inserts or merges a row keyed by `on_conflict`; last write wins.
    async fn upsert(&self, table: &str, row: Row, on_conflict: &str) -> Result<Row>;

    /// Applies `patch` to every matching row and returns the updated rows.
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>>;

    /// Deletes every matching row and returns the deleted rows.
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>>;
}

#[async_trait]
pub trait Realtime: Send + Sync {
    /// Opens a feed of changes on `table` under the channel name `channel`.
    ///
    /// Every call opens a new feed, even when `channel` is already in use.
    async fn subscribe(&self, channel: &str, table: &str, kinds: &[ChangeKind])
        -> Result<ChangeFeed>;

    /// Closes the feed identified by `feed`. Other feeds on the same channel stay open.
    async fn unsubscribe(&self, feed: &FeedId) -> Result<()>;
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Stores `bytes` at `path` inside `bucket` and returns the stored key.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()>;
}

/// The full platform surface used by the app.
pub trait Backend: AuthProvider + RowStore + Realtime + BlobStorage + Send + Sync {}

impl<T> Backend for T where T: AuthProvider + RowStore + Realtime + BlobStorage + Send + Sync {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn select_clause_renders_embed_with_hint() {
        let query = Query::new("mensajes").embed(Embed {
            table: "usuarios".to_string(),
            hint: Some("fk_usuario".to_string()),
            local_column: "usuario_id".to_string(),
            columns: vec!["email".to_string(), "rol".to_string()],
        });
        assert_eq!(query.select_clause(), "*,usuarios!fk_usuario(email,rol)");
    }

    #[test]
    fn select_clause_with_columns() {
        let query = Query::new("typing_status").columns(["usuario_email", "usuario_id"]);
        assert_eq!(query.select_clause(), "usuario_email,usuario_id");
    }

    #[test]
    fn contains_filter_requires_every_value() {
        let row = json!({"ingredientes": ["ajo", "sal", "aceite"]});
        assert!(Filter::Contains("ingredientes".into(), vec![json!("ajo")]).matches(&row));
        assert!(
            !Filter::Contains("ingredientes".into(), vec![json!("ajo"), json!("limon")])
                .matches(&row)
        );
        assert!(!Filter::Contains("missing".into(), vec![json!("ajo")]).matches(&row));
    }

    #[test]
    fn eq_filter_compares_json_values() {
        let row = json!({"is_typing": true, "usuario_id": "u1"});
        assert!(Filter::Eq("is_typing".into(), json!(true)).matches(&row));
        assert!(!Filter::Eq("usuario_id".into(), json!("u2")).matches(&row));
    }

    #[test]
    fn change_kind_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&ChangeKind::Insert).unwrap(), "\"INSERT\"");
        let kind: ChangeKind = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(kind, ChangeKind::Delete);
    }

    fn feed_id(serial: u64) -> FeedId {
        FeedId {
            channel: "test".to_string(),
            serial,
        }
    }

    fn event(kind: ChangeKind, id: &str) -> ChangeEvent {
        ChangeEvent {
            table: "mensajes".into(),
            kind,
            new: json!({ "id": id }),
            old: Value::Null,
        }
    }

    #[tokio::test]
    async fn change_feed_skips_unrequested_kinds() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut feed = ChangeFeed::new(feed_id(1), &[ChangeKind::Insert], receiver);

        sender.send(event(ChangeKind::Delete, "1")).unwrap();
        sender.send(event(ChangeKind::Insert, "2")).unwrap();

        let received = feed.recv().await.expect("insert event");
        assert_eq!(received.new["id"], "2");

        drop(sender);
        assert!(feed.recv().await.is_none());
    }

    #[tokio::test]
    async fn change_feed_keeps_every_queued_event() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut feed = ChangeFeed::new(feed_id(2), &[ChangeKind::Insert], receiver);

        for n in 0..1_000 {
            sender.send(event(ChangeKind::Insert, &n.to_string())).unwrap();
        }
        drop(sender);

        let mut received = 0;
        while let Some(change) = feed.recv().await {
            assert_eq!(change.new["id"], received.to_string());
            received += 1;
        }
        assert_eq!(received, 1_000);
    }

    #[test]
    fn feed_id_displays_channel_and_serial() {
        assert_eq!(feed_id(7).to_string(), "test#7");
    }
}
