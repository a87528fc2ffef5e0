use thiserror::Error;

use crate::api::models::{ChatId, DeliveryStatus, MessageId, ServerId, TempId};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered HTTP {0}")]
    Status(u16),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("response is missing `{0}`")]
    MissingField(&'static str),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("no message {0}")]
    UnknownMessage(MessageId),
    #[error("no chat {0}")]
    UnknownChat(ChatId),
    #[error("message {0} has not been acknowledged yet")]
    NotAcknowledged(TempId),
    #[error("message {0} is already acknowledged")]
    AlreadyAcknowledged(TempId),
    #[error("message {0} was sent by someone else")]
    NotOwnMessage(ServerId),
    #[error("cannot move message {id} from {from} to {to}")]
    InvalidTransition {
        id: MessageId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config toml: {0}")]
    TomlRead(#[from] toml::de::Error),
    #[error("config toml: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    #[error("config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no config directory on this platform")]
    NoConfigDir,
    #[error("`{0}` is not configured")]
    Missing(&'static str),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cache database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache row: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no data directory on this platform")]
    NoDataDir,
}

/// Top-level error for the client binary.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("session loop has stopped")]
    SessionClosed,
    #[error("stdin: {0}")]
    Io(#[from] std::io::Error),
}
