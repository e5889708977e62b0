//! Types shared by the chat components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::recetario::utils::{deserialize_timestamp, email_local_part, parse_timestamp};

use super::timeline::MessageTimeline;

const UNKNOWN_AUTHOR_EMAIL: &str = "Desconocido";
const DEFAULT_ROLE: &str = "usuario";

/// Denormalized author data joined onto a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSummary {
    #[serde(default)]
    pub email: String,
    #[serde(rename = "rol", default)]
    pub role: String,
}

impl AuthorSummary {
    /// Placeholder used when the author could not be resolved.
    pub fn unknown() -> Self {
        Self {
            email: UNKNOWN_AUTHOR_EMAIL.to_string(),
            role: DEFAULT_ROLE.to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.email == UNKNOWN_AUTHOR_EMAIL
    }
}

/// A chat message. Immutable once created; only ever hard-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identity
    pub id: String,

    #[serde(rename = "contenido")]
    pub content: String,

    #[serde(rename = "usuario_id")]
    pub author_id: String,

    /// Server-assigned creation time
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,

    /// Joined author data, absent when the row was read without the join
    #[serde(rename = "usuarios", alias = "usuario", default)]
    pub author: Option<AuthorSummary>,
}

impl Message {
    /// Builds a message from a raw change payload, without author data.
    ///
    /// Never fails: missing fields are left empty and an unreadable timestamp falls
    /// back to the time of receipt.
    pub fn from_raw_record(record: &Value) -> Self {
        let text = |key: &str| match record.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let created_at = record
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        Self {
            id: text("id"),
            content: text("contenido"),
            author_id: text("usuario_id"),
            created_at,
            author: Some(AuthorSummary::unknown()),
        }
    }

    pub fn author_email(&self) -> Option<&str> {
        self.author.as_ref().map(|author| author.email.as_str())
    }
}

/// One row of the presence collection. At most one per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStatus {
    #[serde(rename = "usuario_id")]
    pub user_id: String,

    #[serde(rename = "usuario_email", default)]
    pub email: String,

    pub is_typing: bool,

    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl TypingStatus {
    pub fn display_name(&self) -> &str {
        email_local_part(&self.email)
    }
}

/// Everything the presentation layer renders for a chat screen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    pub messages: MessageTimeline,
    /// True while the history is being (re)loaded
    pub loading: bool,
    /// True only while a send is in flight
    pub sending: bool,
    /// Display names of peers currently typing, self excluded
    pub typing_users: Vec<String>,
}

impl ChatState {
    pub fn typing_indicator(&self) -> Option<String> {
        super::typing::typing_indicator(&self.typing_users)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn message_reads_joined_row() {
        let row = json!({
            "id": "m1",
            "contenido": "hola",
            "usuario_id": "u1",
            "created_at": "2024-05-01T10:00:00.000000+00:00",
            "usuarios": {"email": "ana@example.com", "rol": "chef"}
        });
        let message: Message = serde_json::from_value(row).unwrap();

        assert_eq!(message.content, "hola");
        assert_eq!(
            message.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            message.author,
            Some(AuthorSummary {
                email: "ana@example.com".into(),
                role: "chef".into()
            })
        );
    }

    #[test]
    fn message_without_join_has_no_author() {
        let row = json!({
            "id": "m1",
            "contenido": "hola",
            "usuario_id": "u1",
            "created_at": "2024-05-01T10:00:00",
            "usuarios": null
        });
        let message: Message = serde_json::from_value(row).unwrap();
        assert!(message.author.is_none());
    }

    #[test]
    fn raw_record_fallback_uses_sentinel_author() {
        let record = json!({
            "id": "m9",
            "contenido": "sin join",
            "usuario_id": "u2",
            "created_at": "2024-05-01T10:00:00"
        });
        let message = Message::from_raw_record(&record);

        assert_eq!(message.id, "m9");
        assert_eq!(message.content, "sin join");
        assert_eq!(message.author_id, "u2");
        assert_eq!(
            message.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        let author = message.author.unwrap();
        assert!(author.is_unknown());
        assert_eq!(author.role, "usuario");
    }

    #[test]
    fn raw_record_tolerates_numeric_ids() {
        let message = Message::from_raw_record(&json!({"id": 42}));
        assert_eq!(message.id, "42");
        assert!(message.content.is_empty());
    }

    #[test]
    fn typing_status_display_name_is_local_part() {
        let status: TypingStatus = serde_json::from_value(json!({
            "usuario_id": "u1",
            "usuario_email": "ana@example.com",
            "is_typing": true,
            "updated_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(status.display_name(), "ana");
    }
}
