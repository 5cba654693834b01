//! Feed Sync - client-side realtime feed synchronization
//!
//! Keeps one ordered, deduplicated view of a feed (a chat conversation,
//! appointment requests, monitoring records) fed by two producers: a
//! persistent push channel delivering live events and a paginated history
//! endpoint delivering older ones. The push channel reconnects on its own;
//! history pages are requested as the consumer scrolls toward the sentinel.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feed_sync::{FeedHandle, FeedKey, InvalidationRegistry, SyncConfig, WsConnector};
//!
//! #[tokio::main]
//! async fn main() -> feed_sync::Result<()> {
//!     let config = SyncConfig::load(None)?;
//!     let key = FeedKey::help_chat("42");
//!     let registry = InvalidationRegistry::new();
//!
//!     let mut feed = FeedHandle::open(
//!         key.clone(),
//!         config.feed_options(&key),
//!         Arc::new(WsConnector),
//!         Arc::new(config.rest_history()?),
//!         &registry,
//!     );
//!
//!     let mut snapshots = feed.subscribe();
//!     while snapshots.changed().await.is_ok() {
//!         let snapshot = snapshots.borrow_and_update().clone();
//!         println!("{} events, {:?}", snapshot.events.len(), snapshot.connection);
//!         if snapshot.has_more {
//!             feed.scrolled(-1.0).await?;
//!             feed.sentinel_visible().await?;
//!         }
//!         if snapshot.events.len() > 100 {
//!             break;
//!         }
//!     }
//!
//!     feed.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
mod error;
pub mod event;
pub mod feed;
pub mod history;
pub mod invalidation;
pub mod key;
pub mod pagination;
pub mod reconciler;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{FileConfig, SyncConfig, load_config};
pub use connection::{
    ChannelEvent, ChannelSender, ConnectionManager, ConnectionState, Connector, Frame, Link,
    RetryPolicy, WsConnector,
};
pub use error::{Result, SyncError};
pub use event::{Event, EventContent, EventId, FeedKind};
pub use feed::{FeedHandle, FeedOptions, FeedSnapshot, FeedState};
pub use history::{HistoryPage, HistorySource, RestHistory};
pub use invalidation::InvalidationRegistry;
pub use key::{FeedKey, Topic};
pub use pagination::{FetchTicket, PaginationCoordinator};
pub use reconciler::{FeedFilter, MergeOutcome, Reconciler};
pub use wire::OutboundMessage;
