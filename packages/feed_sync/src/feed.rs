//! A synchronized feed: history pages plus live events for one [`FeedKey`].
//!
//! [`FeedState`] is the synchronous core (reconciler plus pagination plus the
//! last known connection state). [`FeedHandle::open`] wraps it in an actor
//! task that owns the connection manager, runs history fetches and publishes
//! a [`FeedSnapshot`] after every change. The handle talks to the actor over a
//! command channel; disposing the handle cancels the actor, its fetches and
//! the push channel, and no snapshot is published afterwards.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{
    ChannelEvent, ChannelSender, ConnectionManager, ConnectionState, Connector, RetryPolicy,
};
use crate::error::{Result, SyncError};
use crate::event::Event;
use crate::history::{HistoryPage, HistorySource};
use crate::invalidation::{InvalidationRegistry, Invalidations};
use crate::key::FeedKey;
use crate::pagination::{FetchTicket, PaginationCoordinator};
use crate::reconciler::{FeedFilter, MergeOutcome, Reconciler};
use crate::wire::OutboundMessage;

const COMMAND_CAPACITY: usize = 32;

#[derive(Clone, Debug)]
pub struct FeedOptions {
    /// `host[:port]` or a full `ws://` / `wss://` origin.
    pub ws_origin: String,
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub inbound_capacity: usize,
}

impl FeedOptions {
    pub fn for_key(key: &FeedKey, ws_origin: impl Into<String>) -> Self {
        Self {
            ws_origin: ws_origin.into(),
            page_size: 20,
            retry: RetryPolicy::for_topic(key.topic),
            inbound_capacity: 256,
        }
    }
}

/// What a consumer renders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedSnapshot {
    /// Most recent first.
    pub events: Vec<Event>,
    pub current_page: u32,
    pub page_size: u32,
    pub total_count: Option<u64>,
    pub has_more: bool,
    pub loading: bool,
    pub last_error: Option<String>,
    pub connection: ConnectionState,
}

#[derive(Debug)]
pub struct FeedState {
    key: FeedKey,
    reconciler: Reconciler,
    pagination: PaginationCoordinator,
    connection: ConnectionState,
    disposed: bool,
}

impl FeedState {
    pub fn new(key: FeedKey, page_size: u32) -> Self {
        let reconciler = Reconciler::new(FeedFilter::for_key(&key));
        let pagination = PaginationCoordinator::new(page_size, key.is_reversed());
        Self {
            key,
            reconciler,
            pagination,
            connection: ConnectionState::Disconnected,
            disposed: false,
        }
    }

    pub fn key(&self) -> &FeedKey {
        &self.key
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn pagination(&self) -> &PaginationCoordinator {
        &self.pagination
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// No fetches are issued once disposed or while the owner is unknown.
    fn idle(&self) -> bool {
        self.disposed || self.key.owner_id.is_empty()
    }

    pub fn start(&mut self) -> Option<FetchTicket> {
        if self.idle() {
            return None;
        }
        self.pagination.initial_fetch()
    }

    pub fn sentinel_visible(&mut self) -> Option<FetchTicket> {
        if self.idle() {
            return None;
        }
        self.pagination.on_sentinel_visible()
    }

    pub fn scrolled(&mut self, offset: f64) {
        if !self.disposed {
            self.pagination.on_scroll(offset);
        }
    }

    pub fn retry(&mut self) -> Option<FetchTicket> {
        if self.idle() {
            return None;
        }
        self.pagination.retry()
    }

    /// Forget pagination progress and request page 1 again. Held events stay;
    /// the refetched page is deduplicated against them and its new events are
    /// placed ahead of older history.
    pub fn invalidate(&mut self) -> Option<FetchTicket> {
        if self.idle() {
            return None;
        }
        Some(self.pagination.reset())
    }

    /// Apply a finished fetch. Returns whether anything changed.
    pub fn apply_fetch(&mut self, ticket: FetchTicket, result: Result<HistoryPage>) -> bool {
        if self.disposed {
            return false;
        }
        match result {
            Ok(page) => {
                if !self.pagination.complete(ticket, page.total) {
                    return false;
                }
                let outcome = self.reconciler.merge_history_page(page.events);
                debug!(
                    key = %self.key,
                    page = ticket.page,
                    total = page.total,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    "history page merged"
                );
                true
            }
            Err(e) => {
                warn!(key = %self.key, page = ticket.page, error = %e, "history fetch failed");
                self.pagination.fail(ticket, e.to_string())
            }
        }
    }

    /// Apply one item from the push channel queue.
    pub fn apply_channel(&mut self, item: ChannelEvent) -> bool {
        if self.disposed {
            return false;
        }
        match item {
            ChannelEvent::State(state) => {
                let changed = self.connection != state;
                self.connection = state;
                changed
            }
            ChannelEvent::Event(event) => self.apply_live(event).changed(),
        }
    }

    pub fn apply_live(&mut self, event: Event) -> MergeOutcome {
        if self.disposed {
            return MergeOutcome::default();
        }
        self.reconciler.merge_live_event(event)
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            events: self.reconciler.to_vec(),
            current_page: self.pagination.current_page(),
            page_size: self.pagination.page_size(),
            total_count: self.pagination.total_count(),
            has_more: self.pagination.has_more(),
            loading: self.pagination.is_loading(),
            last_error: self.pagination.last_error().map(str::to_string),
            connection: self.connection,
        }
    }
}

#[derive(Debug)]
enum FeedCommand {
    SentinelVisible,
    Scrolled(f64),
    Retry,
    Invalidate,
}

/// Consumer handle for a running feed.
pub struct FeedHandle {
    key: FeedKey,
    commands: mpsc::Sender<FeedCommand>,
    snapshots: watch::Receiver<FeedSnapshot>,
    sender: ChannelSender,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    /// Start a feed: connect the push channel and request page 1.
    ///
    /// An empty owner id means the identity is not resolved yet; the feed
    /// then stays idle and disconnected.
    pub fn open<C, H>(
        key: FeedKey,
        options: FeedOptions,
        connector: Arc<C>,
        history: Arc<H>,
        registry: &InvalidationRegistry,
    ) -> Self
    where
        C: Connector,
        H: HistorySource,
    {
        let (connection, inbound) = ConnectionManager::new(
            connector,
            key.topic,
            options.retry.clone(),
            options.inbound_capacity,
        );
        let sender = connection.sender();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let state = FeedState::new(key.clone(), options.page_size);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let url = (!key.owner_id.is_empty()).then(|| key.endpoint_url(&options.ws_origin));
        let actor = FeedActor {
            url,
            state,
            connection,
            inbound,
            history,
            commands: command_rx,
            fetch_tx,
            fetch_rx,
            invalidations: registry.subscribe(key.clone()),
            snapshots: snapshot_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run());

        Self {
            key,
            commands: command_tx,
            snapshots: snapshot_rx,
            sender,
            cancel,
            task: Some(task),
        }
    }

    pub fn key(&self) -> &FeedKey {
        &self.key
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that changes whenever the feed publishes a new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshots.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.sender.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The pagination sentinel entered the viewport.
    pub async fn sentinel_visible(&self) -> Result<()> {
        self.command(FeedCommand::SentinelVisible).await
    }

    /// The consumer scrolled; `offset` is the distance from the initial anchor.
    pub async fn scrolled(&self, offset: f64) -> Result<()> {
        self.command(FeedCommand::Scrolled(offset)).await
    }

    /// Re-issue the last failed page fetch.
    pub async fn retry(&self) -> Result<()> {
        self.command(FeedCommand::Retry).await
    }

    /// Refetch from page 1. Other holders of the same key are not affected;
    /// use [`InvalidationRegistry::invalidate`] for that.
    pub async fn invalidate(&self) -> Result<()> {
        self.command(FeedCommand::Invalidate).await
    }

    /// Send a chat message on the push channel. Fails immediately unless the
    /// channel is connected; nothing is queued.
    pub fn send(&self, content: &str) -> Result<()> {
        if self.is_disposed() {
            return Err(SyncError::Disposed);
        }
        let message = OutboundMessage::for_feed(&self.key, content)?;
        self.sender.send(message.to_json()?)
    }

    /// Stop the feed and wait until its task, fetches and socket are gone.
    pub async fn dispose(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(key = %self.key, error = %e, "feed task ended abnormally");
            }
        }
    }

    async fn command(&self, command: FeedCommand) -> Result<()> {
        if self.is_disposed() {
            return Err(SyncError::Disposed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Disposed)
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type FetchResult = (FetchTicket, Result<HistoryPage>);

struct FeedActor<C: Connector, H: HistorySource> {
    url: Option<String>,
    state: FeedState,
    connection: ConnectionManager<C>,
    inbound: mpsc::Receiver<ChannelEvent>,
    history: Arc<H>,
    commands: mpsc::Receiver<FeedCommand>,
    fetch_tx: mpsc::UnboundedSender<FetchResult>,
    fetch_rx: mpsc::UnboundedReceiver<FetchResult>,
    invalidations: Invalidations,
    snapshots: watch::Sender<FeedSnapshot>,
    cancel: CancellationToken,
}

impl<C: Connector, H: HistorySource> FeedActor<C, H> {
    async fn run(mut self) {
        info!(key = %self.state.key(), "feed opened");
        self.connection.set_url(self.url.clone()).await;
        if let Some(ticket) = self.state.start() {
            self.spawn_fetch(ticket);
        }
        self.publish();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                Some(item) = self.inbound.recv() => {
                    self.state.apply_channel(item);
                }

                Some((ticket, result)) = self.fetch_rx.recv() => {
                    self.state.apply_fetch(ticket, result);
                }

                Some(()) = self.invalidations.recv() => {
                    self.handle_command(FeedCommand::Invalidate);
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.publish();
        }

        self.state.dispose();
        self.connection.dispose().await;
        info!(key = %self.state.key(), "feed disposed");
    }

    fn handle_command(&mut self, command: FeedCommand) {
        let ticket = match command {
            FeedCommand::SentinelVisible => self.state.sentinel_visible(),
            FeedCommand::Scrolled(offset) => {
                self.state.scrolled(offset);
                None
            }
            FeedCommand::Retry => self.state.retry(),
            FeedCommand::Invalidate => {
                info!(key = %self.state.key(), "refetching from page 1");
                self.state.invalidate()
            }
        };
        if let Some(ticket) = ticket {
            self.spawn_fetch(ticket);
        }
    }

    fn spawn_fetch(&self, ticket: FetchTicket) {
        let history = self.history.clone();
        let key = self.state.key().clone();
        let results = self.fetch_tx.clone();
        let cancel = self.cancel.clone();
        debug!(%key, page = ticket.page, limit = ticket.limit, "requesting history page");

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = history.fetch_page(&key, ticket.page, ticket.limit) => {
                    let _ = results.send((ticket, result));
                }
            }
        });
    }

    fn publish(&self) {
        let next = self.state.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
