//! Connection lifecycle manager for the push channel.
//!
//! One manager owns at most one live socket. A spawned lifecycle task runs the
//! state machine:
//!
//! ```text
//!            connect ok                 close / error
//! Connecting ──────────► Connected ─────────────────► Reconnecting
//!     │                      ▲                          │    ▲
//!     │ connect failed       │ connect ok               │    │ connect failed
//!     └──────────────────────┴──── retry timer fires ───┘────┘
//! ```
//!
//! The task owns the only retry timer. Dispose cancels the task, which drops
//! the timer and closes the socket before returning. Decoded events and state
//! transitions go out through one bounded queue the owning feed drains.

use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::event::Event;
use crate::key::Topic;
use crate::wire::decode_frame;

/// Upper bound on waiting for a close handshake during dispose.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// How long to wait before each reconnection attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `1.0` keeps the interval fixed.
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Consecutive failed retries before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const GENERIC_INTERVAL: Duration = Duration::from_millis(5000);
    pub const CHAT_INTERVAL: Duration = Duration::from_millis(3000);

    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            multiplier: 1.0,
            max_interval: interval,
            max_attempts: None,
        }
    }

    pub fn for_topic(topic: Topic) -> Self {
        match topic {
            Topic::Chat => Self::fixed(Self::CHAT_INTERVAL),
            _ => Self::fixed(Self::GENERIC_INTERVAL),
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.multiplier = multiplier;
        self.max_interval = max_interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.multiplier <= 1.0 {
            return self.interval;
        }
        let base = self.interval.as_secs_f64();
        let ceiling = self.max_interval.as_secs_f64().max(base);
        let scaled = base * self.multiplier.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(scaled.min(ceiling))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Self::GENERIC_INTERVAL)
    }
}

/// Items the manager queues for its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    State(ConnectionState),
    Event(Event),
}

/// A transport-level inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

pub type OutboundSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Both halves of an open socket.
pub struct Link {
    pub outbound: OutboundSink,
    pub inbound: InboundStream,
}

/// Opens push-channel sockets.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Link>> + Send;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(SyncError::from_tungstenite)?;
        let (write, read) = stream.split();

        let outbound = write
            .with(|text: String| {
                futures::future::ready(Ok::<_, tungstenite::Error>(Message::Text(text.into())))
            })
            .sink_map_err(SyncError::from_tungstenite);

        let inbound = read.filter_map(|message| {
            futures::future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::from_tungstenite(e))),
            })
        });

        Ok(Link {
            outbound: Box::pin(outbound),
            inbound: Box::pin(inbound),
        })
    }
}

/// State shared between the manager, its lifecycle task and senders.
struct Shared {
    state: watch::Sender<ConnectionState>,
    /// Present only while a link is up; dropped with the link so nothing
    /// accepted for one socket is ever written to the next.
    outbound: watch::Sender<Option<mpsc::UnboundedSender<String>>>,
}

/// Synchronous send handle. Rejects unless the channel is connected.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    state: watch::Receiver<ConnectionState>,
    outbound: watch::Receiver<Option<mpsc::UnboundedSender<String>>>,
}

impl ChannelSender {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Hand `payload` to the open socket. Never queues and never suspends.
    pub fn send(&self, payload: String) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }
        match self.outbound.borrow().as_ref() {
            Some(tx) => tx.send(payload).map_err(|_| SyncError::NotConnected),
            None => Err(SyncError::NotConnected),
        }
    }
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    topic: Topic,
    policy: RetryPolicy,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<ChannelEvent>,
    url: Option<String>,
    session: Option<Session>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create an idle manager and the queue its events arrive on.
    pub fn new(
        connector: Arc<C>,
        topic: Topic,
        policy: RetryPolicy,
        inbound_capacity: usize,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (outbound, _) = watch::channel(None);
        let manager = Self {
            connector,
            topic,
            policy,
            shared: Arc::new(Shared { state, outbound }),
            inbound_tx,
            url: None,
            session: None,
        };
        (manager, inbound_rx)
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            state: self.shared.state.subscribe(),
            outbound: self.shared.outbound.subscribe(),
        }
    }

    pub fn send(&self, payload: String) -> Result<()> {
        self.sender().send(payload)
    }

    /// Point the manager at `url`. The previous connection, if any, is fully
    /// disposed before the new one is opened. `None` leaves it disconnected.
    pub async fn set_url(&mut self, url: Option<String>) {
        if self.url == url && (url.is_none() || self.session.is_some()) {
            return;
        }
        self.dispose().await;
        self.url = url;
        if let Some(url) = self.url.clone() {
            self.open(url);
        }
    }

    fn open(&mut self, url: String) {
        info!(url = %url, topic = %self.topic, "opening push channel");
        let cancel = CancellationToken::new();
        let lifecycle = Lifecycle {
            connector: self.connector.clone(),
            url,
            topic: self.topic,
            policy: self.policy.clone(),
            shared: self.shared.clone(),
            inbound_tx: self.inbound_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(lifecycle.run());
        self.session = Some(Session { cancel, task });
    }

    /// Cancel the retry timer, close the socket and wait for the lifecycle
    /// task to finish.
    pub async fn dispose(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                warn!(error = %e, "push channel task ended abnormally");
            }
            debug!(url = ?self.url, "push channel disposed");
        }
        self.shared.outbound.send_replace(None);
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

enum LinkExit {
    Disposed,
    Dropped,
}

struct Lifecycle<C: Connector> {
    connector: Arc<C>,
    url: String,
    topic: Topic,
    policy: RetryPolicy,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

impl<C: Connector> Lifecycle<C> {
    async fn run(self) {
        let mut failures: u32 = 0;

        if self.transition(ConnectionState::Connecting).await {
            loop {
                let attempt = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    result = self.connector.connect(&self.url) => result,
                };

                match attempt {
                    Ok(link) => {
                        failures = 0;
                        info!(url = %self.url, "push channel connected");
                        match self.pump(link).await {
                            LinkExit::Disposed => break,
                            LinkExit::Dropped => info!(url = %self.url, "push channel closed"),
                        }
                    }
                    Err(e) => {
                        warn!(url = %self.url, error = %e, "push channel connect failed");
                    }
                }

                if let Some(max) = self.policy.max_attempts {
                    if failures >= max {
                        warn!(url = %self.url, attempts = failures, "giving up on push channel");
                        self.transition(ConnectionState::Disconnected).await;
                        return;
                    }
                }

                let delay = self.policy.delay_for(failures);
                failures += 1;
                if !self.transition(ConnectionState::Reconnecting).await {
                    break;
                }

                debug!(url = %self.url, delay_ms = delay.as_millis() as u64, "retry timer armed");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                debug!(url = %self.url, attempt = failures, "reconnecting push channel");
            }
        }

        self.shared.outbound.send_replace(None);
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }

    /// Run one open link until it drops or the manager is disposed. The socket
    /// is always closed on the way out, errors included.
    async fn pump(&self, link: Link) -> LinkExit {
        let Link {
            mut outbound,
            mut inbound,
        } = link;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        self.shared.outbound.send_replace(Some(out_tx));

        let exit = if self.transition(ConnectionState::Connected).await {
            self.pump_link(&mut outbound, &mut inbound, &mut out_rx).await
        } else {
            LinkExit::Disposed
        };

        self.shared.outbound.send_replace(None);
        if tokio::time::timeout(CLOSE_TIMEOUT, outbound.close())
            .await
            .is_err()
        {
            debug!(url = %self.url, "close handshake timed out");
        }
        exit
    }

    async fn pump_link(
        &self,
        outbound: &mut OutboundSink,
        inbound: &mut InboundStream,
        out_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> LinkExit {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LinkExit::Disposed,

                Some(payload) = out_rx.recv() => {
                    if let Err(e) = outbound.send(payload).await {
                        warn!(url = %self.url, error = %e, "push channel send failed");
                        return LinkExit::Dropped;
                    }
                }

                frame = inbound.next() => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        match decode_frame(self.topic, &text, Utc::now()) {
                            Ok(event) => {
                                if !self.publish(ChannelEvent::Event(event)).await {
                                    return LinkExit::Disposed;
                                }
                            }
                            Err(e) => {
                                warn!(url = %self.url, error = %e, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Frame::Close)) | None => return LinkExit::Dropped,
                    Some(Err(e)) => {
                        warn!(url = %self.url, error = %e, "push channel error, closing");
                        return LinkExit::Dropped;
                    }
                },
            }
        }
    }

    async fn transition(&self, state: ConnectionState) -> bool {
        self.shared.state.send_replace(state);
        debug!(url = %self.url, state = state.as_str(), "push channel state");
        self.publish(ChannelEvent::State(state)).await
    }

    /// Queue `item` for the owner, waiting for capacity. Returns `false` once
    /// disposed or when the owner is gone.
    async fn publish(&self, item: ChannelEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.inbound_tx.send(item) => sent.is_ok(),
        }
    }
}
