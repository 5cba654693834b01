use tokio_tungstenite::tungstenite;

use crate::key::Topic;

/// Errors produced by the sync layer.
///
/// Transport failures never reach consumers as errors: the connection manager
/// turns them into state transitions. They only appear here so the lifecycle
/// loop can log them.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("push channel is not connected")]
    NotConnected,

    #[error("feed has been disposed")]
    Disposed,

    #[error("{0} feeds do not accept outbound messages")]
    SendUnsupported(Topic),

    #[error("refusing to send an empty message")]
    EmptyMessage,

    #[error("endpoint unavailable")]
    Unavailable,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("history fetch failed with HTTP {status}")]
    FetchStatus { status: u16 },

    #[error(transparent)]
    Http(reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] Box<figment::Error>),
}

impl SyncError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else if let Some(status) = err.status() {
            Self::FetchStatus {
                status: status.as_u16(),
            }
        } else {
            Self::Http(err)
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
