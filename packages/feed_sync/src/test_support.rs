//! Fixtures shared by unit tests: event builders, a scripted connector and an
//! in-memory history source.

use chrono::{DateTime, Utc};
use futures::SinkExt;
use futures::channel::mpsc as fmpsc;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Semaphore, mpsc};

use crate::connection::{Connector, Frame, Link};
use crate::error::{Result, SyncError};
use crate::event::{Event, EventContent, EventId, FeedKind};
use crate::history::{HistoryPage, HistorySource};
use crate::key::FeedKey;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_557_600 + secs, 0).expect("valid timestamp")
}

pub(crate) fn chat_event(id: &str, secs: i64) -> Event {
    Event {
        id: EventId::from(id),
        kind: FeedKind::Help,
        sender_id: Some("u1".to_string()),
        receiver_id: None,
        content: EventContent::Text(format!("message {}", id)),
        seen: false,
        created_at: at(secs),
    }
}

pub(crate) fn direct_event(id: &str, sender: &str, receiver: &str, secs: i64) -> Event {
    Event {
        id: EventId::from(id),
        kind: FeedKind::Direct,
        sender_id: Some(sender.to_string()),
        receiver_id: Some(receiver.to_string()),
        content: EventContent::Text(format!("message {}", id)),
        seen: false,
        created_at: at(secs),
    }
}

/// Chat frame JSON as the server sends it.
pub(crate) fn help_frame(id: &str) -> String {
    format!(
        r#"{{"id":"{}","type":"help","content":"hi","sender_id":"u1","created_at":"2024-05-01T10:00:00Z","is_seen":false}}"#,
        id
    )
}

// ── connector ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub(crate) enum Script {
    Refuse,
    Accept,
}

/// Test side of an accepted mock socket.
pub(crate) struct MockLink {
    frames: fmpsc::UnboundedSender<Result<Frame>>,
    /// Payloads the manager wrote. Ends when the manager closes the socket.
    pub sent: fmpsc::UnboundedReceiver<String>,
}

impl MockLink {
    pub fn push_text(&self, text: &str) {
        let _ = self.frames.unbounded_send(Ok(Frame::Text(text.to_string())));
    }

    pub fn push_close(&self) {
        let _ = self.frames.unbounded_send(Ok(Frame::Close));
    }

    pub fn push_error(&self, message: &str) {
        let _ = self
            .frames
            .unbounded_send(Err(SyncError::Transport(message.to_string())));
    }
}

/// Connector that follows a script of outcomes, then accepts forever.
pub(crate) struct MockConnector {
    script: Mutex<VecDeque<Script>>,
    urls: Mutex<Vec<String>>,
    links_tx: mpsc::UnboundedSender<MockLink>,
    links_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockLink>>,
}

impl MockConnector {
    pub fn new(script: impl IntoIterator<Item = Script>) -> Arc<Self> {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            urls: Mutex::new(Vec::new()),
            links_tx,
            links_rx: tokio::sync::Mutex::new(links_rx),
        })
    }

    pub fn attempts(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Wait for the next accepted socket.
    pub async fn next_link(&self) -> MockLink {
        self.links_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector alive")
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Link>> + Send {
        self.urls.lock().unwrap().push(url.to_string());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Accept);

        let result = match step {
            Script::Refuse => Err(SyncError::Unavailable),
            Script::Accept => {
                let (frames_tx, frames_rx) = fmpsc::unbounded();
                let (sent_tx, sent_rx) = fmpsc::unbounded::<String>();
                let _ = self.links_tx.send(MockLink {
                    frames: frames_tx,
                    sent: sent_rx,
                });
                Ok(Link {
                    outbound: Box::pin(
                        sent_tx.sink_map_err(|e| SyncError::Transport(e.to_string())),
                    ),
                    inbound: Box::pin(frames_rx),
                })
            }
        };
        futures::future::ready(result)
    }
}

// ── history ─────────────────────────────────────────────────────────────

/// In-memory history. Requests can be held at a gate until the test releases
/// them.
pub(crate) struct MockHistory {
    pages: Mutex<HashMap<u32, Vec<Event>>>,
    total: AtomicU64,
    requests: Mutex<Vec<u32>>,
    gate: Option<Arc<Semaphore>>,
    failing: AtomicBool,
}

impl MockHistory {
    pub fn new(total: u64, pages: impl IntoIterator<Item = (u32, Vec<Event>)>) -> Arc<Self> {
        Arc::new(Self::build(total, pages, None))
    }

    /// Every fetch waits for one permit on the returned semaphore.
    pub fn gated(
        total: u64,
        pages: impl IntoIterator<Item = (u32, Vec<Event>)>,
    ) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let history = Arc::new(Self::build(total, pages, Some(gate.clone())));
        (history, gate)
    }

    fn build(
        total: u64,
        pages: impl IntoIterator<Item = (u32, Vec<Event>)>,
        gate: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            pages: Mutex::new(pages.into_iter().collect()),
            total: AtomicU64::new(total),
            requests: Mutex::new(Vec::new()),
            gate,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_page(&self, page: u32, events: Vec<Event>) {
        self.pages.lock().unwrap().insert(page, events);
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Page numbers requested so far, in order.
    pub fn requests(&self) -> Vec<u32> {
        self.requests.lock().unwrap().clone()
    }
}

impl HistorySource for MockHistory {
    async fn fetch_page(&self, _key: &FeedKey, page: u32, _limit: u32) -> Result<HistoryPage> {
        self.requests.lock().unwrap().push(page);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::FetchStatus { status: 500 });
        }
        let events = self
            .pages
            .lock()
            .unwrap()
            .get(&page)
            .cloned()
            .unwrap_or_default();
        Ok(HistoryPage {
            total: self.total.load(Ordering::SeqCst),
            events,
        })
    }
}
