use crate::error::{ChatError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[serde(alias = "msg")]
    Text,
    Card,
    Image,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Card => "card",
            MessageKind::Image => "image",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" | "msg" => Ok(MessageKind::Text),
            "card" => Ok(MessageKind::Card),
            "image" => Ok(MessageKind::Image),
            other => Err(ChatError::invalid_payload(other, "unknown message type")),
        }
    }
}

/// Structured payload of a `card` message. The caller owns the schema, so
/// the object is kept whole; only its top level must be a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Card(pub Map<String, Value>);

impl Card {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Card(Card),
}

impl Payload {
    /// Decode a generic value according to the message type tag.
    /// Cards must be JSON objects; every other type is opaque text.
    pub fn decode(kind: MessageKind, value: Value) -> Result<Self> {
        match kind {
            MessageKind::Card => serde_json::from_value(value)
                .map(Payload::Card)
                .map_err(|e| ChatError::invalid_payload(kind.as_str(), e)),
            MessageKind::Text | MessageKind::Image => Ok(Payload::Text(match value {
                Value::String(text) => text,
                other => other.to_string(),
            })),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Card(card) => Value::Object(card.0.clone()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Card(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been appended yet. The store fills in the id and
/// creation time when they are left empty.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: Option<String>,
    pub room_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub payload: Payload,
    pub created_at: Option<DateTime<Utc>>,
}

impl MessageDraft {
    pub fn new(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        kind: MessageKind,
        payload: Payload,
    ) -> Self {
        Self {
            id: None,
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            kind,
            payload,
            created_at: None,
        }
    }

    pub fn text(room_id: impl Into<String>, sender_id: impl Into<String>, text: &str) -> Self {
        Self::new(room_id, sender_id, MessageKind::Text, Payload::Text(text.to_string()))
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Descending,
    Ascending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Zero-based page index.
    pub page: u32,
    pub size: u32,
    pub direction: Direction,
}

impl PageRequest {
    pub fn new(size: u32) -> Self {
        Self {
            page: 0,
            size,
            direction: Direction::Descending,
        }
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.size)
    }

    pub fn validate(&self, max_size: u32) -> Result<()> {
        if self.size == 0 {
            return Err(ChatError::InvalidPageRequest("page size must be positive".into()));
        }
        if self.size > max_size {
            return Err(ChatError::InvalidPageRequest(format!(
                "page size {} exceeds the maximum of {}",
                self.size, max_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(rename = "chats")]
    pub messages: Vec<Message>,
    pub last: bool,
}

impl Page {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            last: true,
        }
    }
}
