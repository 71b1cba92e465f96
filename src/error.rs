use thiserror::Error;

use crate::session::state::{ConnectionStatus, Transition};

/// Failure of a call through the REST boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// 401 from `/me` or `/auth/*`. Credentials are no longer usable.
    #[error("authentication rejected by {endpoint}")]
    Unauthorized { endpoint: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not signed in")]
    MissingToken,
    #[error("could not read {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// A frame could not be turned into (or out of) its wire JSON.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no type field")]
    MissingType,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("invalid connection url: {0}")]
    Url(#[from] url::ParseError),
}

/// Why an outbound frame was not sent. No optimistic entry survives these
/// except `Transport`, which leaves the entry marked failed.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected (status: {0})")]
    NotConnected(ConnectionStatus),
    #[error("conversation {0} not found")]
    UnknownConversation(String),
    #[error("no other participant in direct conversation {0}")]
    NoRecipient(String),
    #[error("no signed-in user")]
    NoIdentity,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session loop has stopped")]
    SessionGone,
}

#[derive(Debug, Error)]
#[error("invalid status transition {transition:?} from {from}")]
pub struct InvalidTransition {
    pub from: ConnectionStatus,
    pub transition: Transition,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no data directory available")]
    NoDataDir,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not write config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no config directory available")]
    NoConfigDir,
}
