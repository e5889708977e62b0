//! In-process backend.
//!
//! Keeps every collection in memory and publishes row changes through a [`ChangeHub`],
//! so the realtime paths behave like the hosted platform without a network. Failures can
//! be injected per operation and collection, and calls are counted for assertions.

use std::cmp::Ordering;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;

use super::{
    AuthEvent, AuthProvider, AuthUser, BackendError, BlobStorage, ChangeEvent, ChangeFeed,
    ChangeHub, ChangeKind, FeedId, Filter, Query, Realtime, Result, Row, RowStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Upsert,
    Update,
    Delete,
    Subscribe,
    Upload,
    Remove,
}

#[derive(Debug, Clone)]
struct Account {
    user: AuthUser,
    password: String,
}

/// An open feed: the channel name it was opened under and the table it watches.
#[derive(Debug, Clone)]
struct OpenFeed {
    channel: String,
    table: String,
}

#[derive(Debug, Clone)]
struct Blob {
    bytes: Vec<u8>,
    content_type: String,
}

pub struct MemoryBackend {
    tables: DashMap<String, Vec<Row>>,
    accounts: DashMap<String, Account>,
    session: RwLock<Option<AuthUser>>,
    blobs: DashMap<String, Blob>,
    channels: DashMap<u64, OpenFeed>,
    hub: ChangeHub,
    auth_events: broadcast::Sender<AuthEvent>,
    failures: DashMap<(Operation, String), ()>,
    calls: DashMap<(Operation, String), usize>,
    profile_table: Option<String>,
    require_email_confirmation: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            accounts: DashMap::new(),
            session: RwLock::new(None),
            blobs: DashMap::new(),
            channels: DashMap::new(),
            hub: ChangeHub::new(),
            auth_events: broadcast::channel(16).0,
            failures: DashMap::new(),
            calls: DashMap::new(),
            profile_table: None,
            require_email_confirmation: false,
        }
    }

    /// Mirrors every sign up into `table` as `{id, email, rol, created_at}`, the way the
    /// hosted platform's trigger fills the profile collection.
    pub fn with_profile_table(mut self, table: impl Into<String>) -> Self {
        self.profile_table = Some(table.into());
        self
    }

    /// New accounts start unconfirmed: no session and no linked identities.
    pub fn with_email_confirmation(mut self) -> Self {
        self.require_email_confirmation = true;
        self
    }

    /// Creates a confirmed account (and its profile row) without signing in.
    pub fn seed_user(&self, email: &str, password: &str, role: &str) -> AuthUser {
        let user = AuthUser {
            id: uuid::Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
            user_metadata: json!({ "rol": role }),
            identities: Some(vec![json!({ "provider": "email" })]),
        };
        self.accounts.insert(
            email.to_string(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        self.write_profile(&user);
        user
    }

    /// Replaces the active session without going through the password flow.
    pub fn sign_in_as(&self, user: &AuthUser) {
        self.set_session(Some(user.clone()));
        let _ = self.auth_events.send(AuthEvent::SignedIn(user.clone()));
    }

    /// Makes every subsequent `op` on `table` fail until cleared.
    pub fn inject_failure(&self, op: Operation, table: &str) {
        self.failures.insert((op, table.to_string()), ());
    }

    pub fn clear_failure(&self, op: Operation, table: &str) {
        self.failures.remove(&(op, table.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Number of times `op` was attempted on `table`, failed attempts included.
    pub fn calls(&self, op: Operation, table: &str) -> usize {
        self.calls
            .get(&(op, table.to_string()))
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn blob(&self, bucket: &str, path: &str) -> Option<(Vec<u8>, String)> {
        self.blobs
            .get(&blob_key(bucket, path))
            .map(|blob| (blob.bytes.clone(), blob.content_type.clone()))
    }

    /// Publishes an event on `table` without touching stored rows, e.g. to replay a
    /// duplicate delivery.
    pub fn emit_raw(&self, event: ChangeEvent) -> usize {
        let table = event.table.clone();
        self.hub.emit(&table, event)
    }

    /// Channel names of the feeds currently open, one entry per feed.
    pub fn open_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .channels
            .iter()
            .map(|entry| entry.channel.clone())
            .collect();
        channels.sort();
        channels
    }

    fn attempt(&self, op: Operation, table: &str) -> Result<()> {
        *self.calls.entry((op, table.to_string())).or_insert(0) += 1;
        if self.failures.contains_key(&(op, table.to_string())) {
            tracing::debug!(
                target: "recetario::backend::memory",
                "Injected failure for {:?} on {}",
                op,
                table
            );
            return Err(BackendError::Injected(format!("{:?} {}", op, table)));
        }
        Ok(())
    }

    fn set_session(&self, user: Option<AuthUser>) {
        let mut session = self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *session = user;
    }

    fn write_profile(&self, user: &AuthUser) {
        let Some(table) = &self.profile_table else {
            return;
        };
        let role = user
            .user_metadata
            .get("rol")
            .cloned()
            .unwrap_or_else(|| json!("usuario"));
        let row = json!({
            "id": user.id,
            "email": user.email,
            "rol": role,
            "created_at": now_timestamp(),
        });
        self.tables.entry(table.clone()).or_default().push(row.clone());
        self.publish(table, ChangeKind::Insert, row, Value::Null);
    }

    fn publish(&self, table: &str, kind: ChangeKind, new: Row, old: Row) {
        self.hub.emit(
            table,
            ChangeEvent {
                table: table.to_string(),
                kind,
                new,
                old,
            },
        );
    }

    fn embed_row(&self, row: &mut Row, query: &Query) {
        let Some(embed) = &query.embed else {
            return;
        };
        let key = row.get(&embed.local_column).cloned().unwrap_or(Value::Null);
        let joined = self
            .tables
            .get(&embed.table)
            .and_then(|rows| {
                rows.iter()
                    .find(|candidate| candidate.get("id") == Some(&key))
                    .map(|found| project(found, &embed.columns))
            })
            .unwrap_or(Value::Null);
        if let Value::Object(map) = row {
            map.insert(embed.table.clone(), joined);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("tables", &self.tables.len())
            .field("accounts", &self.accounts.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

fn blob_key(bucket: &str, path: &str) -> String {
    format!("{}/{}", bucket, path)
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn project(row: &Row, columns: &[String]) -> Row {
    let mut projected = Map::new();
    for column in columns {
        projected.insert(
            column.clone(),
            row.get(column).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(projected)
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn merge_into(target: &mut Row, patch: &Row) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn ensure_object(row: &Row) -> Result<()> {
    if row.is_object() {
        Ok(())
    } else {
        Err(BackendError::Status {
            status: 400,
            message: "row must be a JSON object".to_string(),
        })
    }
}

fn matches_all(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| filter.matches(row))
}

#[async_trait]
impl RowStore for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Row>> {
        self.attempt(Operation::Select, &query.table)?;

        let mut rows: Vec<Row> = self
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(row, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        if let Some(columns) = &query.columns {
            rows = rows.iter().map(|row| project(row, columns)).collect();
        }
        for row in rows.iter_mut() {
            self.embed_row(row, query);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row> {
        self.attempt(Operation::Insert, table)?;
        ensure_object(&row)?;

        if let Value::Object(map) = &mut row {
            map.entry("id")
                .or_insert_with(|| json!(uuid::Uuid::new_v4().to_string()));
            map.entry("created_at")
                .or_insert_with(|| json!(now_timestamp()));
        }
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        self.publish(table, ChangeKind::Insert, row.clone(), Value::Null);
        Ok(row)
    }

    async fn upsert(&self, table: &str, row: Row, on_conflict: &str) -> Result<Row> {
        self.attempt(Operation::Upsert, table)?;
        ensure_object(&row)?;

        let key = row.get(on_conflict).cloned().unwrap_or(Value::Null);
        let (kind, stored, old) = {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            match rows
                .iter_mut()
                .find(|existing| existing.get(on_conflict) == Some(&key))
            {
                Some(existing) => {
                    let old = existing.clone();
                    merge_into(existing, &row);
                    (ChangeKind::Update, existing.clone(), old)
                }
                None => {
                    rows.push(row.clone());
                    (ChangeKind::Insert, row, Value::Null)
                }
            }
        };
        self.publish(table, kind, stored.clone(), old);
        Ok(stored)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>> {
        self.attempt(Operation::Update, table)?;
        ensure_object(&patch)?;

        let changed: Vec<(Row, Row)> = {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            rows.iter_mut()
                .filter(|row| matches_all(row, filters))
                .map(|row| {
                    let old = row.clone();
                    merge_into(row, &patch);
                    (row.clone(), old)
                })
                .collect()
        };
        for (new, old) in &changed {
            self.publish(table, ChangeKind::Update, new.clone(), old.clone());
        }
        Ok(changed.into_iter().map(|(new, _)| new).collect())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        self.attempt(Operation::Delete, table)?;

        let removed: Vec<Row> = {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            let (removed, kept): (Vec<Row>, Vec<Row>) =
                rows.drain(..).partition(|row| matches_all(row, filters));
            *rows = kept;
            removed
        };
        for old in &removed {
            self.publish(table, ChangeKind::Delete, Value::Null, old.clone());
        }
        Ok(removed)
    }
}

#[async_trait]
impl Realtime for MemoryBackend {
    async fn subscribe(
        &self,
        channel: &str,
        table: &str,
        kinds: &[ChangeKind],
    ) -> Result<ChangeFeed> {
        self.attempt(Operation::Subscribe, table)?;
        let (serial, receiver) = self.hub.subscribe(table);
        self.channels.insert(
            serial,
            OpenFeed {
                channel: channel.to_string(),
                table: table.to_string(),
            },
        );
        let id = FeedId {
            channel: channel.to_string(),
            serial,
        };
        Ok(ChangeFeed::new(id, kinds, receiver))
    }

    async fn unsubscribe(&self, feed: &FeedId) -> Result<()> {
        if let Some((serial, open)) = self.channels.remove(&feed.serial) {
            self.hub.remove_subscriber(&open.table, serial);
        }
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    async fn current_user(&self) -> Result<Option<AuthUser>> {
        Ok(self
            .session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<AuthUser> {
        if self.accounts.contains_key(email) {
            return Err(BackendError::Status {
                status: 422,
                message: "User already registered".to_string(),
            });
        }
        let identities = if self.require_email_confirmation {
            Vec::new()
        } else {
            vec![json!({ "provider": "email" })]
        };
        let user = AuthUser {
            id: uuid::Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
            user_metadata: metadata,
            identities: Some(identities),
        };
        self.accounts.insert(
            email.to_string(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        self.write_profile(&user);
        if !self.require_email_confirmation {
            self.sign_in_as(&user);
        }
        Ok(user)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser> {
        let user = match self.accounts.get(email) {
            Some(account) if account.password == password => account.user.clone(),
            _ => {
                return Err(BackendError::Status {
                    status: 400,
                    message: "Invalid login credentials".to_string(),
                });
            }
        };
        self.sign_in_as(&user);
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        self.set_session(None);
        let _ = self.auth_events.send(AuthEvent::SignedOut);
        Ok(())
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }
}

#[async_trait]
impl BlobStorage for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        self.attempt(Operation::Upload, bucket)?;
        let key = blob_key(bucket, path);
        if self.blobs.contains_key(&key) {
            return Err(BackendError::Status {
                status: 409,
                message: "The resource already exists".to_string(),
            });
        }
        self.blobs.insert(
            key.clone(),
            Blob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(key)
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{}/{}", bucket, path)
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
        self.attempt(Operation::Remove, bucket)?;
        for path in paths {
            self.blobs.remove(&blob_key(bucket, path));
        }
        Ok(())
    }
}
