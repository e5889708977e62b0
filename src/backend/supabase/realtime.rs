//! Realtime change feeds over the platform's Phoenix channel websocket.
//!
//! A single socket is opened lazily on the first subscription and shared by every
//! feed. Each feed joins its own topic with a `postgres_changes` configuration; change
//! notifications are decoded into [`ChangeEvent`]s and fanned out per topic through a
//! [`ChangeHub`]. When the socket drops it is reopened in the background and every
//! topic still in use is joined again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::backend::{
    BackendError, ChangeEvent, ChangeFeed, ChangeHub, ChangeKind, FeedId, Result,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const PHOENIX_TOPIC: &str = "phoenix";

/// A frame of the Phoenix channel protocol (JSON serializer v1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: &str, event: &str, payload: Value, reference: u64) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self::new(PHOENIX_TOPIC, "heartbeat", json!({}), reference)
    }

    pub fn join(topic: &str, payload: Value, reference: u64) -> Self {
        Self::new(topic, "phx_join", payload, reference)
    }

    pub fn leave(topic: &str, reference: u64) -> Self {
        Self::new(topic, "phx_leave", json!({}), reference)
    }

    pub fn access_token(topic: &str, token: &str, reference: u64) -> Self {
        Self::new(topic, "access_token", json!({ "access_token": token }), reference)
    }
}

/// Topic of one feed. The serial keeps feeds opened under the same channel name apart
/// on the socket.
pub fn topic_for(channel: &str, serial: u64) -> String {
    format!("realtime:{}-{}", channel, serial)
}

/// Join payload subscribing to `kinds` on `public.{table}`.
pub fn join_payload(table: &str, kinds: &[ChangeKind], access_token: Option<&str>) -> Value {
    let all = ChangeKind::ALL.iter().all(|kind| kinds.contains(kind));
    let changes: Vec<Value> = if all {
        vec![json!({ "event": "*", "schema": "public", "table": table })]
    } else {
        kinds
            .iter()
            .map(|kind| json!({ "event": kind.as_str(), "schema": "public", "table": table }))
            .collect()
    };

    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        }
    });
    if let (Some(token), Value::Object(map)) = (access_token, &mut payload) {
        map.insert("access_token".to_string(), json!(token));
    }
    payload
}

/// Decodes the payload of a `postgres_changes` frame.
pub fn decode_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let kind: ChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    let table = data.get("table")?.as_str()?.to_string();
    Some(ChangeEvent {
        table,
        kind,
        new: data.get("record").cloned().unwrap_or(Value::Null),
        old: data.get("old_record").cloned().unwrap_or(Value::Null),
    })
}

fn handle_frame(hub: &ChangeHub, text: &str) {
    let message: PhoenixMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                target: "recetario::backend::realtime",
                "Discarding undecodable frame: {}",
                e
            );
            return;
        }
    };

    match message.event.as_str() {
        "postgres_changes" => match decode_change(&message.payload) {
            Some(event) => {
                hub.emit(&message.topic, event);
            }
            None => tracing::warn!(
                target: "recetario::backend::realtime",
                "Malformed change payload on {}",
                message.topic
            ),
        },
        "phx_reply" => {
            let status = message
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            if status != "ok" {
                tracing::warn!(
                    target: "recetario::backend::realtime",
                    "Channel {} replied with status {}: {}",
                    message.topic,
                    status,
                    message.payload
                );
            }
        }
        "phx_error" | "phx_close" => {
            tracing::warn!(
                target: "recetario::backend::realtime",
                "Channel {} reported {}",
                message.topic,
                message.event
            );
        }
        other => {
            tracing::trace!(
                target: "recetario::backend::realtime",
                "Ignoring {} on {}",
                other,
                message.topic
            );
        }
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<PhoenixMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.outgoing.is_closed() && self.tasks.iter().all(|task| !task.is_finished())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// What a topic was joined for, kept so the join can be replayed after a reconnect.
#[derive(Debug, Clone)]
struct JoinSpec {
    table: String,
    kinds: Vec<ChangeKind>,
}

struct Shared {
    endpoint: Url,
    hub: ChangeHub,
    joins: DashMap<String, JoinSpec>,
    access_token: RwLock<Option<String>>,
    connection: Mutex<Option<Connection>>,
    refs: AtomicU64,
    feeds: AtomicU64,
}

impl Shared {
    fn next_ref(&self) -> u64 {
        self.refs.fetch_add(1, Ordering::Relaxed)
    }

    fn access_token(&self) -> Option<String> {
        self.access_token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn join_message(&self, topic: &str, spec: &JoinSpec) -> PhoenixMessage {
        let token = self.access_token();
        PhoenixMessage::join(
            topic,
            join_payload(&spec.table, &spec.kinds, token.as_deref()),
            self.next_ref(),
        )
    }

    /// Sender of a live socket. A dead or missing socket is replaced and every
    /// registered topic is joined again on the new one.
    async fn ensure_connected(
        self: &Arc<Self>,
        connection: &mut Option<Connection>,
    ) -> Result<mpsc::UnboundedSender<PhoenixMessage>> {
        if let Some(existing) = connection.as_ref() {
            if existing.is_alive() {
                return Ok(existing.outgoing.clone());
            }
            tracing::debug!(
                target: "recetario::backend::realtime",
                "Realtime socket went away, reconnecting"
            );
        }
        let fresh = self.connect().await?;
        let outgoing = fresh.outgoing.clone();
        *connection = Some(fresh);

        let mut rejoined = 0;
        for entry in self.joins.iter() {
            if outgoing.send(self.join_message(entry.key(), entry.value())).is_ok() {
                rejoined += 1;
            }
        }
        if rejoined > 0 {
            tracing::info!(
                target: "recetario::backend::realtime",
                "Rejoined {} channels after reconnecting",
                rejoined
            );
        }
        Ok(outgoing)
    }

    /// Registers `topic` and sends its join on a live socket.
    async fn join(self: &Arc<Self>, topic: &str, spec: JoinSpec) -> Result<()> {
        let mut connection = self.connection.lock().await;
        let outgoing = self.ensure_connected(&mut connection).await?;
        let join = self.join_message(topic, &spec);
        self.joins.insert(topic.to_string(), spec);
        outgoing.send(join).map_err(|_| {
            self.joins.remove(topic);
            BackendError::Unavailable("realtime writer stopped".to_string())
        })
    }

    async fn connect(self: &Arc<Self>) -> Result<Connection> {
        tracing::debug!(
            target: "recetario::backend::realtime",
            "Connecting to {}",
            self.endpoint.host_str().unwrap_or_default()
        );
        let (stream, _) = connect_async(self.endpoint.as_str()).await?;
        let (mut sink, mut source) = stream.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<PhoenixMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(
                            target: "recetario::backend::realtime",
                            "Failed to encode {}: {}",
                            message.event,
                            e
                        );
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    tracing::warn!(
                        target: "recetario::backend::realtime",
                        "Realtime write failed: {}",
                        e
                    );
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let shared = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let Some(alive) = shared.upgrade() else {
                    return;
                };
                match frame {
                    Ok(WsMessage::Text(text)) => handle_frame(&alive.hub, &text),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            target: "recetario::backend::realtime",
                            "Realtime read failed: {}",
                            e
                        );
                        break;
                    }
                }
            }
            tracing::debug!(target: "recetario::backend::realtime", "Realtime socket closed");
            tokio::spawn(reconnect(shared));
        });

        let heartbeat_queue = outgoing.clone();
        let shared = Arc::downgrade(self);
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(alive) = shared.upgrade() else {
                    break;
                };
                if heartbeat_queue
                    .send(PhoenixMessage::heartbeat(alive.next_ref()))
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(Connection {
            outgoing,
            tasks: vec![writer, reader, heartbeat],
        })
    }
}

/// Brings the socket back after it closed, retrying with backoff while any channel is
/// still joined.
fn reconnect(shared: Weak<Shared>) -> BoxFuture<'static, ()> {
    async move {
        let mut delay = RECONNECT_MIN_DELAY;
        loop {
            tokio::time::sleep(delay).await;
            let Some(alive) = shared.upgrade() else {
                return;
            };
            if alive.joins.is_empty() {
                tracing::debug!(
                    target: "recetario::backend::realtime",
                    "No joined channels, reconnect deferred to the next subscription"
                );
                return;
            }
            let mut connection = alive.connection.lock().await;
            match alive.ensure_connected(&mut connection).await {
                Ok(_) => return,
                Err(e) => tracing::warn!(
                    target: "recetario::backend::realtime",
                    "Reconnect failed, retrying in {:?}: {}",
                    delay,
                    e
                ),
            }
            drop(connection);
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
    }
    .boxed()
}

pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl RealtimeClient {
    pub fn new(endpoint: Url) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                hub: ChangeHub::new(),
                joins: DashMap::new(),
                access_token: RwLock::new(None),
                connection: Mutex::new(None),
                refs: AtomicU64::new(1),
                feeds: AtomicU64::new(1),
            }),
        }
    }

    /// Token sent with future joins.
    pub fn remember_access_token(&self, token: Option<String>) {
        *self
            .shared
            .access_token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    /// Like [`RealtimeClient::remember_access_token`], and also tells every joined
    /// channel about the new token right away.
    pub async fn set_access_token(&self, token: Option<String>) {
        self.remember_access_token(token.clone());

        let Some(token) = token else {
            return;
        };
        let connection = self.shared.connection.lock().await;
        let Some(connection) = connection.as_ref().filter(|c| c.is_alive()) else {
            return;
        };
        for entry in self.shared.joins.iter() {
            let _ = connection.outgoing.send(PhoenixMessage::access_token(
                entry.key(),
                &token,
                self.shared.next_ref(),
            ));
        }
    }

    pub async fn subscribe(
        &self,
        channel: &str,
        table: &str,
        kinds: &[ChangeKind],
    ) -> Result<ChangeFeed> {
        let serial = self.shared.feeds.fetch_add(1, Ordering::Relaxed);
        let topic = topic_for(channel, serial);
        let (_, receiver) = self.shared.hub.subscribe(&topic);
        let spec = JoinSpec {
            table: table.to_string(),
            kinds: kinds.to_vec(),
        };
        if let Err(e) = self.shared.join(&topic, spec).await {
            self.shared.hub.remove(&topic);
            return Err(e);
        }

        tracing::debug!(
            target: "recetario::backend::realtime",
            "Joined {} for changes on {}",
            topic,
            table
        );
        let id = FeedId {
            channel: channel.to_string(),
            serial,
        };
        Ok(ChangeFeed::new(id, kinds, receiver))
    }

    pub async fn unsubscribe(&self, feed: &FeedId) -> Result<()> {
        let topic = topic_for(&feed.channel, feed.serial);
        self.shared.joins.remove(&topic);
        self.shared.hub.remove(&topic);
        let connection = self.shared.connection.lock().await;
        if let Some(connection) = connection.as_ref() {
            let _ = connection
                .outgoing
                .send(PhoenixMessage::leave(&topic, self.shared.next_ref()));
        }
        Ok(())
    }

    /// Number of channels that are rejoined on reconnect.
    pub fn joined_channels(&self) -> usize {
        self.shared.joins.len()
    }
}
