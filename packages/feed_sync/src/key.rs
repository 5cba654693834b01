//! Typed feed identifiers.
//!
//! A [`FeedKey`] names one reconciled collection: which room it lives in, whose
//! it is, and (for direct chat) who the other participant is. Endpoint URLs,
//! history paths and invalidation routing are all derived from it.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use crate::event::FeedKind;

/// Push-channel rooms the server exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Help and direct chat messages.
    Chat,
    /// New appointment requests for a doctor.
    AppointmentRequests,
    /// Live health-monitoring samples for a patient.
    Monitoring,
}

impl Topic {
    /// Path segment under `/api/v1/ws/`.
    pub fn ws_path(self) -> &'static str {
        match self {
            Topic::Chat => "chats",
            Topic::AppointmentRequests => "appointment/requests",
            Topic::Monitoring => "monitoring",
        }
    }

    /// Name of the array field holding events in a history response.
    pub fn items_key(self) -> &'static str {
        match self {
            Topic::Chat => "messages",
            Topic::AppointmentRequests => "appointments",
            Topic::Monitoring => "records",
        }
    }

    /// Only chat rooms accept client-authored frames.
    pub fn accepts_outbound(self) -> bool {
        matches!(self, Topic::Chat)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::Chat => "chat",
            Topic::AppointmentRequests => "appointment-request",
            Topic::Monitoring => "monitoring",
        };
        f.write_str(name)
    }
}

/// Identity of one feed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedKey {
    pub topic: Topic,
    pub owner_id: String,
    /// Other participant of a direct conversation.
    pub counterpart_id: Option<String>,
}

impl FeedKey {
    /// The owner's help thread (help requests and staff replies).
    pub fn help_chat(owner_id: impl Into<String>) -> Self {
        Self {
            topic: Topic::Chat,
            owner_id: owner_id.into(),
            counterpart_id: None,
        }
    }

    pub fn direct_chat(owner_id: impl Into<String>, counterpart_id: impl Into<String>) -> Self {
        Self {
            topic: Topic::Chat,
            owner_id: owner_id.into(),
            counterpart_id: Some(counterpart_id.into()),
        }
    }

    pub fn appointment_requests(doctor_id: impl Into<String>) -> Self {
        Self {
            topic: Topic::AppointmentRequests,
            owner_id: doctor_id.into(),
            counterpart_id: None,
        }
    }

    pub fn monitoring(patient_id: impl Into<String>) -> Self {
        Self {
            topic: Topic::Monitoring,
            owner_id: patient_id.into(),
            counterpart_id: None,
        }
    }

    /// Event kind this feed is configured to hold.
    pub fn kind(&self) -> FeedKind {
        match (self.topic, &self.counterpart_id) {
            (Topic::Chat, Some(_)) => FeedKind::Direct,
            (Topic::Chat, None) => FeedKind::Help,
            _ => FeedKind::Broadcast,
        }
    }

    /// Chat lists render newest at the bottom and load older entries on scroll-up.
    pub fn is_reversed(&self) -> bool {
        self.topic == Topic::Chat
    }

    /// `ws://<origin>/api/v1/ws/<topic>/<owner>`, owner percent-encoded.
    pub fn endpoint_url(&self, ws_origin: &str) -> String {
        let origin = ws_origin
            .trim_start_matches("ws://")
            .trim_start_matches("wss://")
            .trim_end_matches('/');
        let scheme = if ws_origin.starts_with("wss://") {
            "wss"
        } else {
            "ws"
        };
        format!(
            "{}://{}/api/v1/ws/{}/{}",
            scheme,
            origin,
            self.topic.ws_path(),
            segment(&self.owner_id)
        )
    }

    /// Path of the paginated history endpoint, relative to the API base.
    pub fn history_path(&self) -> String {
        let owner = segment(&self.owner_id);
        match (self.topic, &self.counterpart_id) {
            (Topic::Chat, Some(other)) => format!("chats/{}/{}", owner, segment(other)),
            (Topic::Chat, None) => format!("chats/user/{}", owner),
            (Topic::AppointmentRequests, _) => format!("appointments/doctor/{}", owner),
            (Topic::Monitoring, _) => format!("patients/{}/health", owner),
        }
    }

    /// Feed-specific query filters sent alongside `page` and `limit`.
    pub fn history_filters(&self) -> Vec<(&'static str, String)> {
        match self.topic {
            Topic::AppointmentRequests => vec![("status", "requested".to_string())],
            _ => Vec::new(),
        }
    }
}

/// Ids are opaque; `/`, `?` and friends must not leak into the path.
fn segment(id: &str) -> Cow<'_, str> {
    urlencoding::encode(id)
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.counterpart_id {
            Some(other) => write!(f, "{}:{}:{}", self.topic, self.owner_id, other),
            None => write!(f, "{}:{}", self.topic, self.owner_id),
        }
    }
}
