use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::RetryPolicy;
use crate::error::Result;
use crate::feed::FeedOptions;
use crate::history::RestHistory;
use crate::key::{FeedKey, Topic};

// =============================================================================
// Tunable config (figment-deserialized from defaults / feed-sync.toml / env)
// =============================================================================
//
//   feed-sync.toml:  [connection]
//                    chat_retry_ms = 1500
//
//   env var:         FEED_SYNC_CONNECTION__CHAT_RETRY_MS=1500
//                    (double underscore = nesting)

pub const CONFIG_FILE_NAME: &str = "feed-sync.toml";
pub const ENV_PREFIX: &str = "FEED_SYNC_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub pagination: PaginationFileConfig,
}

/// Endpoints (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// `host[:port]`, or a full `ws://` / `wss://` origin.
    #[serde(default = "default_ws_origin")]
    pub ws_origin: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bearer token for history requests.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            ws_origin: default_ws_origin(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout_secs(),
            token: None,
        }
    }
}

/// Push channel tunables (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    #[serde(default = "default_chat_retry_ms")]
    pub chat_retry_ms: u64,
    /// 1.0 keeps the retry interval fixed.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_ms")]
    pub max_retry_ms: u64,
    /// Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            retry_ms: default_retry_ms(),
            chat_retry_ms: default_chat_retry_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_ms: default_max_retry_ms(),
            max_attempts: None,
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

/// History paging (lives under `[pagination]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaginationFileConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// The server rejects larger limits.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

impl Default for PaginationFileConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_ws_origin() -> String {
    "localhost:8000".to_string()
}
fn default_api_base() -> String {
    "http://localhost:8000/api/v1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_retry_ms() -> u64 {
    5000
}
fn default_chat_retry_ms() -> u64 {
    3000
}
fn default_backoff_multiplier() -> f64 {
    1.0
}
fn default_max_retry_ms() -> u64 {
    60_000
}
fn default_inbound_capacity() -> usize {
    256
}
fn default_page_size() -> u32 {
    20
}
fn default_max_page_size() -> u32 {
    100
}

/// Build the layered figment: struct defaults, then the config file (if it
/// exists), then `FEED_SYNC_*` env vars.
///
///   `FEED_SYNC_SERVER__WS_ORIGIN=chat.example.com`  →  `server.ws_origin`
///   `FEED_SYNC_PAGINATION__PAGE_SIZE=50`  →  `pagination.page_size = 50`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime view
// =============================================================================

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub ws_origin: String,
    pub api_base: String,
    pub request_timeout: Duration,
    pub token: Option<String>,
    pub page_size: u32,
    pub inbound_capacity: usize,
    connection: ConnectionFileConfig,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let max = fc.pagination.max_page_size.max(1);
        Self {
            ws_origin: fc.server.ws_origin.clone(),
            api_base: fc.server.api_base.clone(),
            request_timeout: Duration::from_secs(fc.server.request_timeout_secs),
            token: fc.server.token.clone().filter(|t| !t.is_empty()),
            page_size: fc.pagination.page_size.clamp(1, max),
            inbound_capacity: fc.connection.inbound_capacity.max(1),
            connection: fc.connection.clone(),
        }
    }

    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc: FileConfig = load_config(config_path).extract()?;
        Ok(Self::from_file(&fc))
    }

    pub fn retry_policy(&self, topic: Topic) -> RetryPolicy {
        let interval = match topic {
            Topic::Chat => self.connection.chat_retry_ms,
            _ => self.connection.retry_ms,
        };
        RetryPolicy::fixed(Duration::from_millis(interval))
            .with_backoff(
                self.connection.backoff_multiplier,
                Duration::from_millis(self.connection.max_retry_ms),
            )
            .with_max_attempts(self.connection.max_attempts)
    }

    pub fn feed_options(&self, key: &FeedKey) -> FeedOptions {
        FeedOptions {
            ws_origin: self.ws_origin.clone(),
            page_size: self.page_size,
            retry: self.retry_policy(key.topic),
            inbound_capacity: self.inbound_capacity,
        }
    }

    /// History client with the configured base, timeout and token.
    pub fn rest_history(&self) -> Result<RestHistory> {
        let rest = RestHistory::new(&self.api_base, self.request_timeout)?;
        Ok(match &self.token {
            Some(token) => rest.with_token(token),
            None => rest,
        })
    }
}
