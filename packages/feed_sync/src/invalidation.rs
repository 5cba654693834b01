//! Typed invalidation registry.
//!
//! Feeds subscribe under their [`FeedKey`]. Invalidating a key tells every
//! live feed with that key to restart pagination from page 1. Held events are
//! kept; the refetched page is deduplicated against them. Keys are compared
//! structurally, so two components that build the same key reach the same
//! subscribers. Senders of dropped feeds are swept on every subscribe, so the
//! map only grows with feeds that are still open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::key::FeedKey;

pub type Invalidations = mpsc::UnboundedReceiver<()>;

type Subscribers = HashMap<FeedKey, Vec<mpsc::UnboundedSender<()>>>;

#[derive(Clone, Debug, Default)]
pub struct InvalidationRegistry {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl InvalidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: FeedKey) -> Invalidations {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        subscribers.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
        subscribers.entry(key).or_default().push(tx);
        rx
    }

    /// Signal every live subscriber of `key`. Returns how many were reached.
    pub fn invalidate(&self, key: &FeedKey) -> usize {
        let mut subscribers = self.lock();
        let Some(senders) = subscribers.get_mut(key) else {
            return 0;
        };
        senders.retain(|tx| tx.send(()).is_ok());
        let reached = senders.len();
        if senders.is_empty() {
            subscribers.remove(key);
        }
        debug!(%key, reached, "feed invalidated");
        reached
    }

    /// Invalidate every key matching `predicate`, e.g. all chat feeds of one owner.
    pub fn invalidate_where(&self, predicate: impl Fn(&FeedKey) -> bool) -> usize {
        let mut subscribers = self.lock();
        let mut reached = 0;
        subscribers.retain(|key, senders| {
            if predicate(key) {
                senders.retain(|tx| tx.send(()).is_ok());
                reached += senders.len();
            } else {
                senders.retain(|tx| !tx.is_closed());
            }
            !senders.is_empty()
        });
        reached
    }

    /// Live subscribers of `key`.
    pub fn subscriber_count(&self, key: &FeedKey) -> usize {
        self.lock()
            .get(key)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Senders held in the map, closed ones included.
    #[cfg(test)]
    pub(crate) fn retained(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        // The map stays consistent even if a holder panicked mid-send.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
