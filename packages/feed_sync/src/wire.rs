//! Wire boundary: snake_case frames in, internal [`Event`]s out.
//!
//! Everything that crosses the socket or the history endpoint is validated
//! here. A frame that does not decode is an error for the caller to drop; it
//! never reaches the reconciler.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::event::{Event, EventContent, EventId, FeedKind};
use crate::history::HistoryPage;
use crate::key::{FeedKey, Topic};

/// Chat frame as the server emits it, both live and inside history pages.
#[derive(Debug, Deserialize)]
struct ChatFrame {
    id: String,
    #[serde(rename = "type")]
    kind: FeedKind,
    content: String,
    sender_id: String,
    #[serde(default)]
    receiver_id: Option<String>,
    created_at: String,
    #[serde(default)]
    is_seen: bool,
}

/// Client-authored chat frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: FeedKind,
    pub content: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
}

impl OutboundMessage {
    /// Build the frame the owner of `key` would send with `content`.
    pub fn for_feed(key: &FeedKey, content: &str) -> Result<Self> {
        if !key.topic.accepts_outbound() {
            return Err(SyncError::SendUnsupported(key.topic));
        }
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        Ok(Self {
            kind: key.kind(),
            content: content.to_string(),
            sender_id: key.owner_id.clone(),
            receiver_id: key.counterpart_id.clone(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode one inbound text frame for `topic`.
///
/// `received_at` stands in for `created_at` on records that carry no timestamp
/// (monitoring samples).
pub fn decode_frame(topic: Topic, text: &str, received_at: DateTime<Utc>) -> Result<Event> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SyncError::Decode(e.to_string()))?;
    decode_value(topic, value, received_at)
}

/// Decode one already-parsed JSON record for `topic`.
pub fn decode_value(topic: Topic, value: Value, received_at: DateTime<Utc>) -> Result<Event> {
    match topic {
        Topic::Chat => decode_chat(value),
        Topic::AppointmentRequests | Topic::Monitoring => decode_record(value, received_at),
    }
}

fn decode_chat(value: Value) -> Result<Event> {
    let frame: ChatFrame =
        serde_json::from_value(value).map_err(|e| SyncError::Decode(e.to_string()))?;
    let created_at = parse_timestamp(&frame.created_at)
        .ok_or_else(|| SyncError::Decode(format!("bad created_at: {}", frame.created_at)))?;
    Ok(Event {
        id: EventId(frame.id),
        kind: frame.kind,
        sender_id: Some(frame.sender_id),
        receiver_id: frame.receiver_id,
        content: EventContent::Text(frame.content),
        seen: frame.is_seen,
        created_at,
    })
}

fn decode_record(value: Value, received_at: DateTime<Utc>) -> Result<Event> {
    let Value::Object(ref map) = value else {
        return Err(SyncError::Decode("record is not an object".to_string()));
    };

    let id = match map.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(SyncError::Decode("record has no id".to_string())),
    };

    let created_at = match map.get("created_at").and_then(Value::as_str) {
        Some(raw) => parse_timestamp(raw)
            .ok_or_else(|| SyncError::Decode(format!("bad created_at: {}", raw)))?,
        None => received_at,
    };

    let sender_id = ["sender_id", "patient_id"]
        .iter()
        .find_map(|field| map.get(*field).and_then(Value::as_str))
        .map(str::to_string);
    let receiver_id = ["receiver_id", "doctor_id"]
        .iter()
        .find_map(|field| map.get(*field).and_then(Value::as_str))
        .map(str::to_string);
    let seen = map.get("is_seen").and_then(Value::as_bool).unwrap_or(false);

    Ok(Event {
        id: EventId(id),
        kind: FeedKind::Broadcast,
        sender_id,
        receiver_id,
        content: EventContent::Record(value),
        seen,
        created_at,
    })
}

/// Decode a `{ total, <items>: [...] }` history response.
///
/// Items that fail to decode are skipped with a warning; a missing `total` or
/// items array fails the whole page.
pub fn decode_history_page(
    topic: Topic,
    body: Value,
    received_at: DateTime<Utc>,
) -> Result<HistoryPage> {
    let total = body
        .get("total")
        .and_then(Value::as_u64)
        .ok_or_else(|| SyncError::Decode("history response has no total".to_string()))?;

    let items = match body.get(topic.items_key()) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) => Vec::new(),
        _ => {
            return Err(SyncError::Decode(format!(
                "history response has no {} array",
                topic.items_key()
            )));
        }
    };

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        match decode_value(topic, item, received_at) {
            Ok(event) => events.push(event),
            Err(e) => warn!(%topic, error = %e, "skipping undecodable history item"),
        }
    }

    Ok(HistoryPage { total, events })
}

/// Parse server timestamps: RFC 3339, or naive ISO 8601 treated as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    // ── chat frames ─────────────────────────────────────────────────────

    #[test]
    fn chat_frame_translates_to_event() {
        let text = r#"{"id":"m1","type":"direct","content":"hello","sender_id":"a","receiver_id":"b","created_at":"2024-05-01T10:00:00.123456","is_seen":true}"#;
        let event = decode_frame(Topic::Chat, text, now()).unwrap();
        assert_eq!(event.id.as_str(), "m1");
        assert_eq!(event.kind, FeedKind::Direct);
        assert_eq!(event.sender_id.as_deref(), Some("a"));
        assert_eq!(event.receiver_id.as_deref(), Some("b"));
        assert_eq!(event.content.as_text(), Some("hello"));
        assert!(event.seen);
        assert_eq!(
            event.created_at,
            parse_timestamp("2024-05-01T10:00:00.123456Z").unwrap()
        );
    }

    #[test]
    fn chat_frame_defaults_seen_and_receiver() {
        let text = r#"{"id":"m2","type":"reply","content":"ok","sender_id":"staff","created_at":"2024-05-01T10:00:00Z"}"#;
        let event = decode_frame(Topic::Chat, text, now()).unwrap();
        assert_eq!(event.kind, FeedKind::Reply);
        assert!(!event.seen);
        assert!(event.receiver_id.is_none());
    }

    #[test]
    fn malformed_chat_frames_are_rejected() {
        assert!(decode_frame(Topic::Chat, "not json", now()).is_err());
        assert!(decode_frame(Topic::Chat, r#"{"id":"m1"}"#, now()).is_err());
        let bad_kind = r#"{"id":"m1","type":"shout","content":"x","sender_id":"a","created_at":"2024-05-01T10:00:00Z"}"#;
        assert!(decode_frame(Topic::Chat, bad_kind, now()).is_err());
        let bad_time = r#"{"id":"m1","type":"help","content":"x","sender_id":"a","created_at":"yesterday"}"#;
        assert!(matches!(
            decode_frame(Topic::Chat, bad_time, now()),
            Err(SyncError::Decode(_))
        ));
    }

    // ── records ─────────────────────────────────────────────────────────

    #[test]
    fn monitoring_sample_uses_receive_time() {
        let text = r#"{"id":"h1","weight":70.5,"blood_oxygen":98,"blood_pressure_records":null}"#;
        let event = decode_frame(Topic::Monitoring, text, now()).unwrap();
        assert_eq!(event.kind, FeedKind::Broadcast);
        assert_eq!(event.created_at, now());
        match &event.content {
            EventContent::Record(v) => assert_eq!(v["weight"], 70.5),
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn appointment_record_keeps_its_timestamp_and_parties() {
        let value = json!({
            "id": 42,
            "patient_id": "p1",
            "doctor_id": "d1",
            "created_at": "2024-06-01 08:30:00",
        });
        let event = decode_value(Topic::AppointmentRequests, value, now()).unwrap();
        assert_eq!(event.id.as_str(), "42");
        assert_eq!(event.sender_id.as_deref(), Some("p1"));
        assert_eq!(event.receiver_id.as_deref(), Some("d1"));
        assert_eq!(event.created_at, parse_timestamp("2024-06-01T08:30:00Z").unwrap());
    }

    #[test]
    fn record_without_id_is_rejected() {
        assert!(decode_frame(Topic::Monitoring, r#"{"weight":1}"#, now()).is_err());
        assert!(decode_frame(Topic::Monitoring, r#"[1,2]"#, now()).is_err());
        assert!(decode_frame(Topic::Monitoring, r#"{"id":""}"#, now()).is_err());
    }

    // ── history pages ───────────────────────────────────────────────────

    #[test]
    fn history_page_skips_bad_items() {
        let body = json!({
            "total": 7,
            "messages": [
                {"id":"m2","type":"help","content":"b","sender_id":"u","created_at":"2024-05-01T10:00:01Z"},
                {"id":"broken"},
                {"id":"m1","type":"help","content":"a","sender_id":"u","created_at":"2024-05-01T10:00:00Z"},
            ]
        });
        let page = decode_history_page(Topic::Chat, body, now()).unwrap();
        assert_eq!(page.total, 7);
        let ids: Vec<_> = page.events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[test]
    fn history_page_requires_total_and_items() {
        assert!(decode_history_page(Topic::Chat, json!({"messages": []}), now()).is_err());
        assert!(decode_history_page(Topic::Chat, json!({"total": 1}), now()).is_err());
        let empty = decode_history_page(Topic::Chat, json!({"total": 3, "messages": []}), now())
            .unwrap();
        assert_eq!(empty.total, 3);
        assert!(empty.events.is_empty());
    }

    // ── outbound ────────────────────────────────────────────────────────

    #[test]
    fn outbound_direct_includes_receiver() {
        let key = FeedKey::direct_chat("me", "you");
        let msg = OutboundMessage::for_feed(&key, "hey").unwrap();
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"type": "direct", "content": "hey", "sender_id": "me", "receiver_id": "you"})
        );
    }

    #[test]
    fn outbound_help_omits_receiver() {
        let msg = OutboundMessage::for_feed(&FeedKey::help_chat("me"), "help!").unwrap();
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json, json!({"type": "help", "content": "help!", "sender_id": "me"}));
    }

    #[test]
    fn outbound_rejects_blank_and_non_chat() {
        assert!(matches!(
            OutboundMessage::for_feed(&FeedKey::help_chat("me"), "   "),
            Err(SyncError::EmptyMessage)
        ));
        assert!(matches!(
            OutboundMessage::for_feed(&FeedKey::monitoring("me"), "x"),
            Err(SyncError::SendUnsupported(Topic::Monitoring))
        ));
    }
}
