pub mod api;
pub mod app;
pub mod error;
pub mod session;
pub mod storage;
pub mod sync;
pub mod utils;

pub use api::models::{Chat, ChatId, DeliveryStatus, Message, MessageContent, MessageId, ServerId, TempId};
pub use error::{ApiError, ClientError, ConfigError, StorageError, SyncError};
pub use session::{Session, SessionHandle};
pub use sync::{ChatSyncEngine, EngineSettings, Outbox};
