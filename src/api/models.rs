use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type UserId = String;

/// Client-generated identifier carried by a message until the server assigns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(pub Uuid);

impl TempId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

impl std::str::FromStr for TempId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim_start_matches("tmp-")).map(TempId)
    }
}

/// Permanent identifier assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        ChatId(s.to_string())
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        ChatId(s)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum MessageId {
    Temp(TempId),
    Server(ServerId),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Temp(t) => t.fmt(f),
            MessageId::Server(s) => s.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> Option<u8> {
        match self {
            DeliveryStatus::Sending => Some(0),
            DeliveryStatus::Sent => Some(1),
            DeliveryStatus::Delivered => Some(2),
            DeliveryStatus::Read => Some(3),
            DeliveryStatus::Failed => None,
        }
    }

    /// Whether `next` is a legal move from `self`.
    ///
    /// Acknowledged messages only move forward along sent, delivered, read
    /// (a read receipt may arrive without a delivered one). Leaving `Sending`
    /// is only possible through an ack or a failure, and `Failed` only goes
    /// back to `Sending` on retry.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (self, next) {
            (Sending, Sent) | (Sending, Failed) | (Failed, Sending) => true,
            (Sending, _) | (Failed, _) | (_, Sending) | (_, Failed) => false,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Media {
        url: String,
        #[serde(default)]
        mime: Option<String>,
        #[serde(default)]
        caption: Option<String>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }

    /// Short human-readable form for chat list rows and logs.
    pub fn preview(&self) -> &str {
        match self {
            MessageContent::Text { text } => text,
            MessageContent::Media { caption: Some(c), .. } => c,
            MessageContent::Media { .. } => "[media]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub reactor: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub reply_to: Option<ServerId>,
    pub reactions: Vec<Reaction>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn server_id(&self) -> Option<ServerId> {
        match self.id {
            MessageId::Server(id) => Some(id),
            MessageId::Temp(_) => None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.server_id().is_some()
    }

    /// Sets `reactor`'s reaction, replacing any previous one from the same reactor.
    /// Returns false when nothing changed.
    pub fn set_reaction(&mut self, reactor: &str, emoji: &str) -> bool {
        if let Some(existing) = self.reactions.iter_mut().find(|r| r.reactor == reactor) {
            if existing.emoji == emoji {
                return false;
            }
            existing.emoji = emoji.to_string();
            return true;
        }
        self.reactions.push(Reaction {
            emoji: emoji.to_string(),
            reactor: reactor.to_string(),
        });
        true
    }

    /// Removes `reactor`'s reaction. When `emoji` is given only a matching reaction is removed.
    pub fn remove_reaction(&mut self, reactor: &str, emoji: Option<&str>) -> bool {
        let before = self.reactions.len();
        self.reactions
            .retain(|r| !(r.reactor == reactor && emoji.is_none_or(|e| r.emoji == e)));
        before != self.reactions.len()
    }
}

/// Message as the server serialises it, over HTTP history pages and the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: ServerId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: MessageContent,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub reply_to: Option<ServerId>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Echo of the sender's temporary id, present on the sender's own messages.
    #[serde(default, alias = "tempGuid")]
    pub client_ref: Option<TempId>,
}

impl MessagePayload {
    pub fn into_message(self) -> (Message, Option<TempId>) {
        let status = match self.status {
            Some(s @ (DeliveryStatus::Delivered | DeliveryStatus::Read)) => s,
            _ => DeliveryStatus::Sent,
        };
        let mut message = Message {
            id: MessageId::Server(self.id),
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: self.content,
            created_at: self.created_at,
            status,
            reply_to: self.reply_to,
            reactions: Vec::new(),
            edited_at: self.edited_at,
        };
        for r in &self.reactions {
            message.set_reaction(&r.reactor, &r.emoji);
        }
        (message, self.client_ref)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Private,
    Group,
    Class,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    #[serde(default)]
    pub kind: ChatKind,
    #[serde(default, alias = "name", alias = "displayName")]
    pub title: String,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default, skip_deserializing)]
    pub last_message: Option<MessageId>,
    #[serde(default)]
    pub unread: u32,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl Chat {
    pub fn new(id: ChatId, kind: ChatKind) -> Self {
        Self {
            title: id.0.clone(),
            id,
            kind,
            participants: Vec::new(),
            last_message: None,
            unread: 0,
            pinned: false,
            muted: false,
            last_activity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeliveryStatus::*;

    #[test]
    fn forward_path_is_allowed() {
        assert!(Sending.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Delivered.can_advance_to(Read));
        assert!(Sent.can_advance_to(Read));
    }

    #[test]
    fn regressions_and_side_doors_are_rejected() {
        assert!(!Read.can_advance_to(Delivered));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sending));
        assert!(!Sent.can_advance_to(Failed));
        assert!(!Sending.can_advance_to(Delivered));
        assert!(!Failed.can_advance_to(Sent));
        assert!(!Read.can_advance_to(Read));
    }

    #[test]
    fn failure_and_retry() {
        assert!(Sending.can_advance_to(Failed));
        assert!(Failed.can_advance_to(Sending));
    }

    #[test]
    fn reactions_are_one_per_reactor() {
        let (mut msg, _) = MessagePayload {
            id: ServerId(7),
            chat_id: ChatId::from("c"),
            sender_id: "alice".into(),
            content: MessageContent::text("hi"),
            created_at: Utc::now(),
            status: None,
            reply_to: None,
            reactions: vec![],
            edited_at: None,
            client_ref: None,
        }
        .into_message();

        assert!(msg.set_reaction("bob", "👍"));
        assert!(!msg.set_reaction("bob", "👍"));
        assert!(msg.set_reaction("bob", "🔥"));
        assert!(msg.set_reaction("carol", "👍"));
        assert_eq!(msg.reactions.len(), 2);
        assert_eq!(msg.reactions[0].emoji, "🔥");

        assert!(!msg.remove_reaction("bob", Some("👍")));
        assert!(msg.remove_reaction("bob", None));
        assert_eq!(msg.reactions.len(), 1);
    }

    #[test]
    fn temp_id_display_round_trips() {
        let id = TempId::new();
        let parsed: TempId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn chat_accepts_display_name_alias() {
        let chat: Chat = serde_json::from_value(serde_json::json!({
            "id": "42",
            "displayName": "5B Class",
            "kind": "class"
        }))
        .unwrap();
        assert_eq!(chat.title, "5B Class");
        assert_eq!(chat.kind, ChatKind::Class);
        assert_eq!(chat.unread, 0);
    }
}
