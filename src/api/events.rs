use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::{
    Chat, DeliveryStatus, Message, MessageContent, MessagePayload, Reaction, ServerId, TempId,
    UserId,
};

/// Socket frame envelope: `{"type": "...", "data": {...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IncomingEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event type `{0}`")]
    UnknownType(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage {
        message: Message,
        client_ref: Option<TempId>,
    },
    Ack {
        temp_id: TempId,
        server_id: ServerId,
        server_time: DateTime<Utc>,
    },
    StatusUpdate {
        message_id: ServerId,
        status: DeliveryStatus,
    },
    ReactionAdded {
        message_id: ServerId,
        reaction: Reaction,
    },
    ReactionRemoved {
        message_id: ServerId,
        reactor: UserId,
        emoji: Option<String>,
    },
    Edited {
        message_id: ServerId,
        content: MessageContent,
        edited_at: DateTime<Utc>,
    },
    Deleted {
        message_id: ServerId,
    },
    Presence {
        user_id: UserId,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },
    ChatUpdated(Chat),
}

impl InboundEvent {
    /// The existing message this event mutates, if any.
    pub fn target(&self) -> Option<ServerId> {
        match self {
            InboundEvent::StatusUpdate { message_id, .. }
            | InboundEvent::ReactionAdded { message_id, .. }
            | InboundEvent::ReactionRemoved { message_id, .. }
            | InboundEvent::Edited { message_id, .. }
            | InboundEvent::Deleted { message_id } => Some(*message_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage { .. } => "new-message",
            InboundEvent::Ack { .. } => "message-ack",
            InboundEvent::StatusUpdate { .. } => "status-update",
            InboundEvent::ReactionAdded { .. } => "reaction-added",
            InboundEvent::ReactionRemoved { .. } => "reaction-removed",
            InboundEvent::Edited { .. } => "message-edited",
            InboundEvent::Deleted { .. } => "message-deleted",
            InboundEvent::Presence { .. } => "presence-changed",
            InboundEvent::ChatUpdated(_) => "chat-updated",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckData {
    #[serde(alias = "tempGuid")]
    temp_id: TempId,
    #[serde(alias = "messageId")]
    id: ServerId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusData {
    #[serde(alias = "id")]
    message_id: ServerId,
    status: DeliveryStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionData {
    message_id: ServerId,
    #[serde(alias = "userId")]
    reactor: UserId,
    #[serde(default)]
    emoji: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditData {
    message_id: ServerId,
    content: MessageContent,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    edited_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteData {
    #[serde(alias = "id")]
    message_id: ServerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceData {
    user_id: UserId,
    online: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    last_seen: Option<DateTime<Utc>>,
}

impl TryFrom<IncomingEvent> for InboundEvent {
    type Error = EventError;

    fn try_from(ev: IncomingEvent) -> Result<Self, Self::Error> {
        let data = ev.data;
        let event = match ev.event_type.as_str() {
            "new-message" => {
                let (message, client_ref) =
                    serde_json::from_value::<MessagePayload>(data)?.into_message();
                InboundEvent::NewMessage { message, client_ref }
            }
            "message-ack" => {
                let d: AckData = serde_json::from_value(data)?;
                InboundEvent::Ack {
                    temp_id: d.temp_id,
                    server_id: d.id,
                    server_time: d.created_at,
                }
            }
            "status-update" => {
                let d: StatusData = serde_json::from_value(data)?;
                InboundEvent::StatusUpdate {
                    message_id: d.message_id,
                    status: d.status,
                }
            }
            "reaction-added" => {
                let d: ReactionData = serde_json::from_value(data)?;
                let emoji = d.emoji.ok_or_else(|| {
                    <serde_json::Error as serde::de::Error>::missing_field("emoji")
                })?;
                InboundEvent::ReactionAdded {
                    message_id: d.message_id,
                    reaction: Reaction {
                        emoji,
                        reactor: d.reactor,
                    },
                }
            }
            "reaction-removed" => {
                let d: ReactionData = serde_json::from_value(data)?;
                InboundEvent::ReactionRemoved {
                    message_id: d.message_id,
                    reactor: d.reactor,
                    emoji: d.emoji,
                }
            }
            "message-edited" => {
                let d: EditData = serde_json::from_value(data)?;
                InboundEvent::Edited {
                    message_id: d.message_id,
                    content: d.content,
                    edited_at: d.edited_at.unwrap_or_else(Utc::now),
                }
            }
            "message-deleted" => {
                let d: DeleteData = serde_json::from_value(data)?;
                InboundEvent::Deleted {
                    message_id: d.message_id,
                }
            }
            "presence-changed" => {
                let d: PresenceData = serde_json::from_value(data)?;
                InboundEvent::Presence {
                    user_id: d.user_id,
                    online: d.online,
                    last_seen: d.last_seen,
                }
            }
            "chat-updated" => InboundEvent::ChatUpdated(serde_json::from_value(data)?),
            other => return Err(EventError::UnknownType(other.to_string())),
        };
        Ok(event)
    }
}

/// Decodes one text frame from the socket.
pub fn decode_frame(text: &str) -> Result<InboundEvent, EventError> {
    let envelope: IncomingEvent = serde_json::from_str(text)?;
    InboundEvent::try_from(envelope)
}
