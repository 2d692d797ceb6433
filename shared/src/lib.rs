use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

// API client types and trait
pub mod api;
pub use api::{ApiClientConfig, ApiError, ChatApi};

/// Which side of a conversation authored a message.
///
/// Set once when a message is ingested (history, live frame, or local send)
/// and never recomputed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    #[default]
    Business,
    Customer,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Business => "business",
            Sender::Customer => "customer",
        }
    }
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preview of the most recent message in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Summary of one business <-> customer conversation, as listed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub customer_name: String,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    /// Last server-side activity on the session
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl ChatSession {
    /// Single-letter avatar for the counterpart ("?" when the name is blank)
    pub fn avatar_initial(&self) -> char {
        self.customer_name
            .trim()
            .chars()
            .next()
            .map(|c| c.to_uppercase().next().unwrap_or(c))
            .unwrap_or('?')
    }

    /// Timestamp of the last message, if any
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.created_at)
    }

    /// Session list order: latest message first, ties by id, sessions
    /// without messages last. Use with `sort_by`.
    pub fn newest_first(a: &ChatSession, b: &ChatSession) -> Ordering {
        b.last_activity()
            .cmp(&a.last_activity())
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// A confirmed message as the server reports it, both in history snapshots
/// and in live `message` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub sender: Sender,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Frames the client writes to a session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// New outgoing text. `client_id` is echoed back in the server's ack.
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<Uuid>,
    },
}

/// Frames the server writes to a session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// A message stored on the server (from either side)
    Message {
        id: Uuid,
        sender: Sender,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// Confirmation that a client send was stored
    Ack {
        client_id: Uuid,
        server_id: Uuid,
        /// Server-side timestamp of the stored message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
    },
}

impl ServerFrame {
    /// Parse a raw text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl From<MessageRecord> for ServerFrame {
    fn from(record: MessageRecord) -> Self {
        ServerFrame::Message {
            id: record.id,
            sender: record.sender,
            content: record.content,
            created_at: record.created_at,
        }
    }
}

/// Request body for starting (or resuming) a session with a business
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub tenant_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_frame_shape() {
        let client_id = Uuid::new_v4();
        let frame = ClientFrame::Message {
            content: "hello".to_string(),
            client_id: Some(client_id),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"], "hello");
        assert_eq!(value["client_id"], client_id.to_string());
    }

    #[test]
    fn client_frame_omits_missing_client_id() {
        let frame = ClientFrame::Message {
            content: "hi".to_string(),
            client_id: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("client_id"));
    }

    #[test]
    fn parse_inbound_message_frame() {
        let id = Uuid::new_v4();
        let text = format!(
            r#"{{"type":"message","id":"{}","sender":"customer","content":"Is the salon open?","created_at":"2024-05-01T10:00:00Z"}}"#,
            id
        );
        match ServerFrame::parse(&text).unwrap() {
            ServerFrame::Message {
                id: parsed,
                sender,
                content,
                ..
            } => {
                assert_eq!(parsed, id);
                assert_eq!(sender, Sender::Customer);
                assert_eq!(content, "Is the salon open?");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn parse_ack_frame_without_timestamp() {
        let client_id = Uuid::new_v4();
        let server_id = Uuid::new_v4();
        let text = format!(
            r#"{{"type":"ack","client_id":"{}","server_id":"{}"}}"#,
            client_id, server_id
        );
        assert_eq!(
            ServerFrame::parse(&text).unwrap(),
            ServerFrame::Ack {
                client_id,
                server_id,
                created_at: None,
            }
        );
    }

    #[test]
    fn unknown_frame_type_is_an_error() {
        assert!(ServerFrame::parse(r#"{"type":"typing"}"#).is_err());
        assert!(ServerFrame::parse("not json").is_err());
    }

    #[test]
    fn session_defaults_when_fields_missing() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"id":"{}","customer_name":"amina"}}"#, id);
        let session: ChatSession = serde_json::from_str(&json).unwrap();
        assert_eq!(session.unread_count, 0);
        assert!(session.last_message.is_none());
        assert!(session.is_active);
        assert_eq!(session.avatar_initial(), 'A');
    }

    #[test]
    fn avatar_initial_for_blank_name() {
        let session = ChatSession {
            id: Uuid::new_v4(),
            customer_name: "   ".to_string(),
            unread_count: 0,
            last_message: None,
            updated_at: None,
            is_active: true,
        };
        assert_eq!(session.avatar_initial(), '?');
    }

    #[test]
    fn newest_first_orders_by_last_message() {
        let session = |id: Uuid, minute: Option<u32>| ChatSession {
            id,
            customer_name: "Noor".to_string(),
            unread_count: 0,
            last_message: minute.map(|m| LastMessage {
                content: "hi".to_string(),
                created_at: format!("2024-05-01T10:{:02}:00Z", m).parse().unwrap(),
            }),
            updated_at: None,
            is_active: true,
        };
        let mut ids = [Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        let [low, high] = ids;
        let quiet = session(Uuid::new_v4(), None);
        let mut sessions = vec![
            quiet.clone(),
            session(high, Some(5)),
            session(Uuid::new_v4(), Some(1)),
            session(low, Some(5)),
        ];
        sessions.sort_by(ChatSession::newest_first);

        assert_eq!(sessions[0].id, low);
        assert_eq!(sessions[1].id, high);
        assert_eq!(sessions[3].id, quiet.id);
    }

    #[test]
    fn sender_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Sender::Business).unwrap(),
            "\"business\""
        );
        assert_eq!(Sender::Customer.to_string(), "customer");
    }
}
