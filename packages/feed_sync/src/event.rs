use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, stable event identity. The only dedup key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Routing class of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    /// One-to-one conversation.
    Direct,
    /// Message into the owner's help thread.
    Help,
    /// Staff answer on a help thread.
    Reply,
    /// Server-originated record on a non-chat topic.
    Broadcast,
}

impl FeedKind {
    /// Whether a feed configured as `self` holds events of kind `incoming`.
    pub fn accepts(self, incoming: FeedKind) -> bool {
        match self {
            FeedKind::Help => matches!(incoming, FeedKind::Help | FeedKind::Reply),
            other => other == incoming,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::Direct => "direct",
            FeedKind::Help => "help",
            FeedKind::Reply => "reply",
            FeedKind::Broadcast => "broadcast",
        }
    }
}

/// Event payload: chat text or a structured topic record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventContent {
    Text(String),
    Record(serde_json::Value),
}

impl EventContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            EventContent::Text(s) => Some(s),
            EventContent::Record(_) => None,
        }
    }
}

/// The atomic synchronized unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub kind: FeedKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub content: EventContent,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// True when `participant` sent or received this event.
    pub fn involves(&self, participant: &str) -> bool {
        self.sender_id.as_deref() == Some(participant)
            || self.receiver_id.as_deref() == Some(participant)
    }
}
