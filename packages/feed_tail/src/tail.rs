use anyhow::{Context, Result};
use feed_sync::{
    ConnectionState, Event, EventContent, EventId, FeedHandle, FeedKey, FeedSnapshot,
    InvalidationRegistry, SyncConfig, SyncError, WsConnector,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Follow `key` until Ctrl-C, loading up to `pages` history pages first.
pub async fn run(config: SyncConfig, key: FeedKey, token: Option<String>, pages: u32) -> Result<()> {
    let mut history = config
        .rest_history()
        .context("Failed to build history client")?;
    if let Some(token) = token {
        history = history.with_token(token);
    }

    let registry = InvalidationRegistry::new();
    let mut feed = FeedHandle::open(
        key.clone(),
        config.feed_options(&key),
        Arc::new(WsConnector),
        Arc::new(history),
        &registry,
    );
    info!(%key, pages, "tailing feed");

    if pages > 1 {
        // Chat feeds only page once scrolled away from the newest message.
        feed.scrolled(1.0).await?;
    }

    let mut printer = Printer::default();
    let mut snapshots = feed.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = key.topic.accepts_outbound();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }

            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                printer.print(&snapshot);
                if !snapshot.loading && snapshot.has_more && snapshot.current_page < pages {
                    feed.sentinel_visible().await?;
                }
            }

            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match feed.send(&line) {
                    Ok(()) | Err(SyncError::EmptyMessage) => {}
                    Err(SyncError::NotConnected) => {
                        eprintln!("-- not connected, message not sent");
                    }
                    Err(e) => eprintln!("-- send failed: {}", e),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    feed.dispose().await;
    Ok(())
}

#[derive(Default)]
struct Printer {
    printed: HashSet<EventId>,
    connection: ConnectionState,
    last_error: Option<String>,
}

impl Printer {
    fn print(&mut self, snapshot: &FeedSnapshot) {
        if snapshot.connection != self.connection {
            self.connection = snapshot.connection;
            eprintln!("-- {}", snapshot.connection.as_str());
        }
        if snapshot.last_error != self.last_error {
            if let Some(error) = &snapshot.last_error {
                eprintln!("-- history: {}", error);
            }
            self.last_error = snapshot.last_error.clone();
        }
        // Oldest first, so the terminal reads top to bottom.
        for event in snapshot.events.iter().rev() {
            if self.printed.insert(event.id.clone()) {
                println!("{}", format_event(event));
            }
        }
    }
}

fn format_event(event: &Event) -> String {
    let body = match &event.content {
        EventContent::Text(text) => text.clone(),
        EventContent::Record(record) => record.to_string(),
    };
    format!(
        "[{}] {} {}: {}",
        event.created_at.format("%Y-%m-%d %H:%M:%S"),
        event.id,
        event.sender_id.as_deref().unwrap_or("-"),
        body
    )
}
