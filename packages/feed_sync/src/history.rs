//! Paginated history fetch.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::event::Event;
use crate::key::FeedKey;
use crate::wire::decode_history_page;

/// One page of history, newest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryPage {
    /// Server-side count of all events in the feed. Authoritative for `has_more`.
    pub total: u64,
    pub events: Vec<Event>,
}

/// Source of history pages. Page numbers start at 1 (most recent).
pub trait HistorySource: Send + Sync + 'static {
    fn fetch_page(
        &self,
        key: &FeedKey,
        page: u32,
        limit: u32,
    ) -> impl Future<Output = Result<HistoryPage>> + Send;
}

/// `GET {api_base}/{path}?page=&limit=` over HTTP.
#[derive(Clone, Debug)]
pub struct RestHistory {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl RestHistory {
    pub fn new(api_base: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(SyncError::Http)?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            token: None,
        })
    }

    /// Attach a bearer token to every request. Refreshing it is the caller's job.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn page_url(&self, key: &FeedKey) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), key.history_path())
    }
}

impl HistorySource for RestHistory {
    async fn fetch_page(&self, key: &FeedKey, page: u32, limit: u32) -> Result<HistoryPage> {
        let url = self.page_url(key);
        debug!(%key, page, limit, url = %url, "fetching history page");

        let mut request = self
            .client
            .get(&url)
            .query(&[("page", page.to_string()), ("limit", limit.to_string())])
            .query(&key.history_filters());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(SyncError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::FetchStatus {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response.json().await.map_err(SyncError::from_reqwest)?;
        decode_history_page(key.topic, body, Utc::now())
    }
}
