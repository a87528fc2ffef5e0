//! Client-side chat state.
//!
//! [`ChatSyncEngine`] owns every chat and message of a session. Local sends
//! show up immediately with a temporary id and are reconciled once the server
//! acknowledges them; inbound socket events are applied in arrival order, and
//! events that reference a message we have not seen yet wait in a bounded
//! buffer until it shows up.

mod anomaly;
mod deferred;
mod identity;
mod outbox;
mod recent;

pub use anomaly::{Anomaly, AnomalyLog, AnomalyRecord};
pub use deferred::{DEFAULT_CAPACITY, DEFAULT_WINDOW, DeferredEvents};
pub use outbox::{OutboundRequest, Outbox};
pub use recent::{REMEMBERED_IDS, RecentSet};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::api::events::{InboundEvent, decode_frame};
use crate::api::models::{
    Chat, ChatId, ChatKind, DeliveryStatus, Message, MessageContent, MessageId, Presence,
    ServerId, TempId, UserId,
};
use crate::error::SyncError;
use identity::{IdentityTable, RecordKey};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub deferred_window: Duration,
    pub deferred_capacity: usize,
    pub anomaly_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            deferred_window: DEFAULT_WINDOW,
            deferred_capacity: DEFAULT_CAPACITY,
            anomaly_capacity: 128,
        }
    }
}

#[derive(Debug)]
struct ChatState {
    chat: Chat,
    /// Acknowledged records in server order, then unacknowledged ones in submission order.
    order: Vec<RecordKey>,
}

#[derive(Debug)]
struct PendingSend {
    key: RecordKey,
    attempts: u32,
    last_error: Option<String>,
}

fn chat_entry<'a>(chats: &'a mut HashMap<ChatId, ChatState>, id: &ChatId) -> &'a mut ChatState {
    chats.entry(id.clone()).or_insert_with(|| {
        debug!("creating chat {id} on first use");
        ChatState {
            chat: Chat::new(id.clone(), ChatKind::Private),
            order: Vec::new(),
        }
    })
}

fn order_key(m: &Message) -> (DateTime<Utc>, u64) {
    (m.created_at, m.server_id().map_or(u64::MAX, |s| s.0))
}

/// Inserts an acknowledged record at its server position, ahead of every pending one.
fn place_confirmed(
    records: &HashMap<RecordKey, Message>,
    order: &mut Vec<RecordKey>,
    key: RecordKey,
    sort_key: (DateTime<Utc>, u64),
) {
    let confirmed = order.partition_point(|k| records.get(k).is_some_and(Message::is_acknowledged));
    let pos = order[..confirmed]
        .partition_point(|k| records.get(k).is_some_and(|m| order_key(m) <= sort_key));
    order.insert(pos, key);
}

pub struct ChatSyncEngine {
    own_user: UserId,
    chats: HashMap<ChatId, ChatState>,
    records: HashMap<RecordKey, Message>,
    ids: IdentityTable,
    pending: HashMap<TempId, PendingSend>,
    cancelled: RecentSet<TempId>,
    tombstones: RecentSet<ServerId>,
    deferred: DeferredEvents,
    anomalies: AnomalyLog,
    presence: HashMap<UserId, Presence>,
    outbox: Outbox,
    open_chat: Option<ChatId>,
    changed: BTreeSet<ChatId>,
}

impl ChatSyncEngine {
    pub fn new(own_user: impl Into<UserId>, outbox: Outbox, settings: EngineSettings) -> Self {
        Self {
            own_user: own_user.into(),
            chats: HashMap::new(),
            records: HashMap::new(),
            ids: IdentityTable::default(),
            pending: HashMap::new(),
            cancelled: RecentSet::new(REMEMBERED_IDS),
            tombstones: RecentSet::new(REMEMBERED_IDS),
            deferred: DeferredEvents::new(settings.deferred_window, settings.deferred_capacity),
            anomalies: AnomalyLog::new(settings.anomaly_capacity),
            presence: HashMap::new(),
            outbox,
            open_chat: None,
            changed: BTreeSet::new(),
        }
    }

    pub fn own_user(&self) -> &str {
        &self.own_user
    }

    // ---- local sends -------------------------------------------------------

    /// Appends a `Sending` message to the chat and queues it for transmission.
    pub fn send_message(&mut self, chat_id: &ChatId, content: MessageContent) -> TempId {
        self.enqueue_send(chat_id, content, None)
    }

    pub fn send_reply(
        &mut self,
        chat_id: &ChatId,
        content: MessageContent,
        reply_to: ServerId,
    ) -> TempId {
        self.enqueue_send(chat_id, content, Some(reply_to))
    }

    fn enqueue_send(
        &mut self,
        chat_id: &ChatId,
        content: MessageContent,
        reply_to: Option<ServerId>,
    ) -> TempId {
        let temp_id = TempId::new();
        let key = self.ids.allocate();
        self.ids.bind_temp(temp_id, key);
        let now = Utc::now();
        self.records.insert(
            key,
            Message {
                id: MessageId::Temp(temp_id),
                chat_id: chat_id.clone(),
                sender_id: self.own_user.clone(),
                content,
                created_at: now,
                status: DeliveryStatus::Sending,
                reply_to,
                reactions: Vec::new(),
                edited_at: None,
            },
        );
        self.pending.insert(
            temp_id,
            PendingSend {
                key,
                attempts: 1,
                last_error: None,
            },
        );
        let state = chat_entry(&mut self.chats, chat_id);
        state.order.push(key);
        state.chat.last_activity = Some(now);
        self.touch(chat_id);
        debug!("queued {temp_id} in chat {chat_id}");
        self.transmit(temp_id);
        temp_id
    }

    fn transmit(&mut self, temp_id: TempId) {
        let Some(pending) = self.pending.get(&temp_id) else {
            return;
        };
        let Some(msg) = self.records.get(&pending.key) else {
            return;
        };
        let req = OutboundRequest::Send {
            temp_id,
            chat_id: msg.chat_id.clone(),
            content: msg.content.clone(),
            reply_to: msg.reply_to,
            attempt: pending.attempts,
        };
        if !self.outbox.dispatch(req) {
            self.on_send_failure(temp_id, "outbound dispatcher is not running");
        }
    }

    /// Swaps the temporary id for the permanent one and marks the message sent.
    pub fn on_server_ack(&mut self, temp_id: TempId, server_id: ServerId, server_time: DateTime<Utc>) {
        if self.cancelled.contains(&temp_id) {
            self.retract_cancelled(temp_id, server_id);
            return;
        }
        let Some(pending) = self.pending.remove(&temp_id) else {
            let anomaly = if self.ids.by_temp(temp_id).is_some() {
                Anomaly::DuplicateAck { temp_id, server_id }
            } else {
                Anomaly::OrphanAck { temp_id, server_id }
            };
            self.anomalies.record(anomaly);
            return;
        };
        let key = pending.key;
        let Some(chat_id) = self.records.get(&key).map(|m| m.chat_id.clone()) else {
            return;
        };
        if self.tombstones.contains(&server_id) {
            debug!("{temp_id} acknowledged as {server_id}, which is already deleted");
            self.remove_record(&chat_id, key);
            self.ids.forget(key);
            self.touch(&chat_id);
            return;
        }

        // The socket echo can beat the ack; keep the server's copy.
        if let Some(existing) = self.ids.by_server(server_id) {
            if existing != key {
                debug!("{temp_id} already arrived as {server_id}, merging");
                self.remove_record(&chat_id, key);
                self.ids.redirect_temps(key, existing);
                self.touch(&chat_id);
                return;
            }
        }

        let Some(msg) = self.records.get_mut(&key) else {
            return;
        };
        if msg.status == DeliveryStatus::Failed {
            // The failure was spurious; the server has the message.
            debug!("ack {server_id} arrived after {temp_id} was marked failed");
        }
        msg.status = DeliveryStatus::Sent;
        msg.id = MessageId::Server(server_id);
        msg.created_at = server_time;
        let sort_key = order_key(msg);
        self.ids.bind_server(server_id, key);
        if let Some(state) = self.chats.get_mut(&chat_id) {
            state.order.retain(|k| *k != key);
            place_confirmed(&self.records, &mut state.order, key, sort_key);
        }
        info!("{temp_id} acknowledged as {server_id}");
        self.touch(&chat_id);
        self.replay_deferred(server_id);
    }

    pub fn on_send_failure(&mut self, temp_id: TempId, reason: impl Into<String>) {
        let reason = reason.into();
        if self.cancelled.contains(&temp_id) {
            debug!("ignoring failure for cancelled send {temp_id}: {reason}");
            return;
        }
        let Some(pending) = self.pending.get_mut(&temp_id) else {
            self.anomalies.record(Anomaly::OrphanFailure { temp_id });
            return;
        };
        let Some(msg) = self.records.get_mut(&pending.key) else {
            return;
        };
        if !msg.status.can_advance_to(DeliveryStatus::Failed) {
            debug!("ignoring failure for {temp_id} while {}", msg.status);
            return;
        }
        msg.status = DeliveryStatus::Failed;
        pending.last_error = Some(reason.clone());
        let chat_id = msg.chat_id.clone();
        warn!("send {temp_id} failed: {reason}");
        self.touch(&chat_id);
    }

    /// Moves a failed message back to `Sending` and transmits it again under the same temp id.
    pub fn retry(&mut self, temp_id: TempId) -> Result<(), SyncError> {
        let Some(pending) = self.pending.get_mut(&temp_id) else {
            return Err(self.not_pending(temp_id));
        };
        let msg = self
            .records
            .get_mut(&pending.key)
            .ok_or(SyncError::UnknownMessage(MessageId::Temp(temp_id)))?;
        if !msg.status.can_advance_to(DeliveryStatus::Sending) {
            return Err(SyncError::InvalidTransition {
                id: msg.id,
                from: msg.status,
                to: DeliveryStatus::Sending,
            });
        }
        msg.status = DeliveryStatus::Sending;
        pending.attempts += 1;
        pending.last_error = None;
        info!("retrying {temp_id}, attempt {}", pending.attempts);
        let chat_id = msg.chat_id.clone();
        self.touch(&chat_id);
        self.transmit(temp_id);
        Ok(())
    }

    /// Drops an unacknowledged message. Late acks or failures for it become no-ops.
    pub fn cancel(&mut self, temp_id: TempId) -> Result<(), SyncError> {
        let Some(pending) = self.pending.remove(&temp_id) else {
            return Err(self.not_pending(temp_id));
        };
        let chat_id = self.records.get(&pending.key).map(|m| m.chat_id.clone());
        self.ids.forget(pending.key);
        self.cancelled.insert(temp_id);
        if let Some(chat_id) = chat_id {
            self.remove_record(&chat_id, pending.key);
            self.touch(&chat_id);
        }
        info!("cancelled {temp_id}");
        Ok(())
    }

    /// The server stored a send that was cancelled locally. Drops any copy we
    /// hold and asks the server to delete it, once per server id.
    fn retract_cancelled(&mut self, temp_id: TempId, server_id: ServerId) {
        if self.tombstones.contains(&server_id) {
            debug!("cancelled send {temp_id} already retracted as {server_id}");
            return;
        }
        if self.ids.by_server(server_id).is_some() {
            self.remove_by_server_id(server_id);
        } else {
            self.tombstones.insert(server_id);
        }
        info!("retracting cancelled send {temp_id}, stored by the server as {server_id}");
        self.outbox.dispatch(OutboundRequest::Delete {
            message_id: server_id,
        });
    }

    fn not_pending(&self, temp_id: TempId) -> SyncError {
        if self.ids.by_temp(temp_id).is_some() {
            SyncError::AlreadyAcknowledged(temp_id)
        } else {
            SyncError::UnknownMessage(MessageId::Temp(temp_id))
        }
    }

    // ---- local mutations on acknowledged messages -----------------------

    fn acknowledged(&self, id: &MessageId) -> Result<(RecordKey, ServerId), SyncError> {
        let key = self.ids.resolve(id).ok_or(SyncError::UnknownMessage(*id))?;
        let msg = self.records.get(&key).ok_or(SyncError::UnknownMessage(*id))?;
        match (msg.server_id(), id) {
            (Some(server_id), _) => Ok((key, server_id)),
            (None, MessageId::Temp(t)) => Err(SyncError::NotAcknowledged(*t)),
            (None, MessageId::Server(_)) => Err(SyncError::UnknownMessage(*id)),
        }
    }

    fn own_acknowledged(&self, id: &MessageId) -> Result<(RecordKey, ServerId), SyncError> {
        let (key, server_id) = self.acknowledged(id)?;
        match self.records.get(&key) {
            Some(m) if m.sender_id == self.own_user => Ok((key, server_id)),
            _ => Err(SyncError::NotOwnMessage(server_id)),
        }
    }

    fn mutate_record(&mut self, key: RecordKey, f: impl FnOnce(&mut Message) -> bool) {
        let Some(msg) = self.records.get_mut(&key) else {
            return;
        };
        if f(msg) {
            let chat_id = msg.chat_id.clone();
            self.touch(&chat_id);
        }
    }

    pub fn react(&mut self, id: &MessageId, emoji: &str) -> Result<(), SyncError> {
        let (key, server_id) = self.acknowledged(id)?;
        let own = self.own_user.clone();
        self.mutate_record(key, |m| m.set_reaction(&own, emoji));
        self.outbox.dispatch(OutboundRequest::React {
            message_id: server_id,
            emoji: Some(emoji.to_string()),
        });
        Ok(())
    }

    pub fn unreact(&mut self, id: &MessageId) -> Result<(), SyncError> {
        let (key, server_id) = self.acknowledged(id)?;
        let own = self.own_user.clone();
        self.mutate_record(key, |m| m.remove_reaction(&own, None));
        self.outbox.dispatch(OutboundRequest::React {
            message_id: server_id,
            emoji: None,
        });
        Ok(())
    }

    pub fn edit(&mut self, id: &MessageId, content: MessageContent) -> Result<(), SyncError> {
        let (key, server_id) = self.own_acknowledged(id)?;
        let sent = content.clone();
        self.mutate_record(key, |m| {
            m.content = content;
            m.edited_at = Some(Utc::now());
            true
        });
        self.outbox.dispatch(OutboundRequest::Edit {
            message_id: server_id,
            content: sent,
        });
        Ok(())
    }

    pub fn delete(&mut self, id: &MessageId) -> Result<(), SyncError> {
        let (_, server_id) = self.own_acknowledged(id)?;
        self.remove_by_server_id(server_id);
        self.outbox.dispatch(OutboundRequest::Delete {
            message_id: server_id,
        });
        Ok(())
    }

    // ---- inbound ------------------------------------------------------------

    /// Decodes and applies one socket frame. Malformed frames leave state untouched.
    pub fn on_raw_frame(&mut self, text: &str) {
        match decode_frame(text) {
            Ok(event) => self.on_inbound_event(event),
            Err(e) => self.anomalies.record(Anomaly::MalformedFrame {
                reason: e.to_string(),
            }),
        }
    }

    pub fn on_inbound_event(&mut self, event: InboundEvent) {
        if let Some(target) = event.target() {
            if self.tombstones.contains(&target) {
                debug!("dropping {} for deleted message {target}", event.kind());
                return;
            }
            if self.ids.by_server(target).is_none() {
                debug!("deferring {} until message {target} arrives", event.kind());
                if let Some(evicted) = self.deferred.push(target, event, Instant::now()) {
                    self.anomalies.record(Anomaly::EvictedEvent {
                        kind: evicted.event.kind(),
                        message_id: evicted.target,
                    });
                }
                return;
            }
        }
        self.apply(event);
    }

    fn apply(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::NewMessage { message, client_ref } => {
                self.apply_new_message(message, client_ref)
            }
            InboundEvent::Ack {
                temp_id,
                server_id,
                server_time,
            } => self.on_server_ack(temp_id, server_id, server_time),
            InboundEvent::StatusUpdate { message_id, status } => {
                self.apply_status(message_id, status)
            }
            InboundEvent::ReactionAdded {
                message_id,
                reaction,
            } => self.mutate_server(message_id, |m| {
                m.set_reaction(&reaction.reactor, &reaction.emoji)
            }),
            InboundEvent::ReactionRemoved {
                message_id,
                reactor,
                emoji,
            } => self.mutate_server(message_id, |m| {
                m.remove_reaction(&reactor, emoji.as_deref())
            }),
            InboundEvent::Edited {
                message_id,
                content,
                edited_at,
            } => self.mutate_server(message_id, |m| {
                if m.content == content {
                    return false;
                }
                m.content = content;
                m.edited_at = Some(edited_at);
                true
            }),
            InboundEvent::Deleted { message_id } => self.remove_by_server_id(message_id),
            InboundEvent::Presence {
                user_id,
                online,
                last_seen,
            } => {
                self.presence.insert(user_id, Presence { online, last_seen });
            }
            InboundEvent::ChatUpdated(chat) => self.upsert_chat(chat),
        }
    }

    fn mutate_server(&mut self, id: ServerId, f: impl FnOnce(&mut Message) -> bool) {
        if let Some(key) = self.ids.by_server(id) {
            self.mutate_record(key, f);
        }
    }

    fn apply_new_message(&mut self, message: Message, client_ref: Option<TempId>) {
        let Some(server_id) = message.server_id() else {
            self.anomalies.record(Anomaly::ServerMessageWithoutId);
            return;
        };
        if self.tombstones.contains(&server_id) {
            debug!("dropping late copy of deleted message {server_id}");
            return;
        }
        if let Some(temp_id) = client_ref.filter(|t| self.cancelled.contains(t)) {
            self.retract_cancelled(temp_id, server_id);
            return;
        }
        if let Some(temp_id) = client_ref.filter(|t| self.pending.contains_key(t)) {
            debug!("echo {server_id} acknowledges {temp_id}");
            let status = message.status;
            self.on_server_ack(temp_id, server_id, message.created_at);
            if status != DeliveryStatus::Sent {
                self.apply_status(server_id, status);
            }
            return;
        }
        if self.ids.by_server(server_id).is_some() {
            debug!("duplicate message {server_id}");
            self.apply_status(server_id, message.status);
            return;
        }

        let chat_id = message.chat_id.clone();
        let incoming = message.sender_id != self.own_user;
        let created = message.created_at;
        self.insert_confirmed(server_id, message);
        let is_open = self.open_chat.as_ref() == Some(&chat_id);
        let state = chat_entry(&mut self.chats, &chat_id);
        if incoming && !is_open {
            state.chat.unread = state.chat.unread.saturating_add(1);
        }
        if state.chat.last_activity.is_none_or(|t| t < created) {
            state.chat.last_activity = Some(created);
        }
        self.touch(&chat_id);
        self.replay_deferred(server_id);
    }

    fn insert_confirmed(&mut self, server_id: ServerId, message: Message) {
        let chat_id = message.chat_id.clone();
        let key = self.ids.allocate();
        self.ids.bind_server(server_id, key);
        let sort_key = order_key(&message);
        self.records.insert(key, message);
        let state = chat_entry(&mut self.chats, &chat_id);
        place_confirmed(&self.records, &mut state.order, key, sort_key);
    }

    fn apply_status(&mut self, id: ServerId, status: DeliveryStatus) {
        let Some(msg) = self.ids.by_server(id).and_then(|k| self.records.get_mut(&k)) else {
            return;
        };
        if msg.status == status {
            return;
        }
        if msg.status.can_advance_to(status) {
            msg.status = status;
            let chat_id = msg.chat_id.clone();
            self.touch(&chat_id);
        } else if matches!(status, DeliveryStatus::Sending | DeliveryStatus::Failed) {
            let anomaly = Anomaly::RejectedTransition {
                message_id: msg.id,
                from: msg.status,
                to: status,
            };
            self.anomalies.record(anomaly);
        } else {
            debug!("stale status {status} for {id}, already {}", msg.status);
        }
    }

    fn remove_by_server_id(&mut self, id: ServerId) {
        let Some(key) = self.ids.by_server(id) else {
            return;
        };
        let Some(chat_id) = self.records.get(&key).map(|m| m.chat_id.clone()) else {
            return;
        };
        self.remove_record(&chat_id, key);
        self.ids.forget(key);
        self.tombstones.insert(id);
        self.touch(&chat_id);
    }

    fn remove_record(&mut self, chat_id: &ChatId, key: RecordKey) -> Option<Message> {
        if let Some(state) = self.chats.get_mut(chat_id) {
            state.order.retain(|k| *k != key);
        }
        self.records.remove(&key)
    }

    fn replay_deferred(&mut self, id: ServerId) {
        for event in self.deferred.take_for(id) {
            debug!("replaying deferred {} for {id}", event.kind());
            self.on_inbound_event(event);
        }
    }

    /// Discards buffered events older than the window. Returns how many expired.
    pub fn sweep_deferred(&mut self, now: Instant) -> usize {
        let expired = self.deferred.expire(now);
        let count = expired.len();
        for d in expired {
            self.anomalies.record(Anomaly::ExpiredEvent {
                kind: d.event.kind(),
                message_id: d.target,
            });
        }
        count
    }

    // ---- chats ----------------------------------------------------------------

    pub fn upsert_chats(&mut self, chats: impl IntoIterator<Item = Chat>) {
        for chat in chats {
            self.upsert_chat(chat);
        }
    }

    fn upsert_chat(&mut self, incoming: Chat) {
        let id = incoming.id.clone();
        let is_open = self.open_chat.as_ref() == Some(&id);
        match self.chats.get_mut(&id) {
            Some(state) => {
                let chat = &mut state.chat;
                chat.kind = incoming.kind;
                if !incoming.title.is_empty() {
                    chat.title = incoming.title;
                }
                chat.participants = incoming.participants;
                chat.pinned = incoming.pinned;
                chat.muted = incoming.muted;
                if !is_open {
                    chat.unread = incoming.unread;
                }
                if incoming.last_activity > chat.last_activity {
                    chat.last_activity = incoming.last_activity;
                }
            }
            None => {
                let mut chat = incoming;
                chat.last_message = None;
                if chat.title.is_empty() {
                    chat.title = id.0.clone();
                }
                if is_open {
                    chat.unread = 0;
                }
                self.chats.insert(
                    id.clone(),
                    ChatState {
                        chat,
                        order: Vec::new(),
                    },
                );
            }
        }
        self.touch(&id);
    }

    /// Merges a page of server history. Already known or deleted messages are skipped.
    pub fn merge_history(
        &mut self,
        chat_id: &ChatId,
        messages: impl IntoIterator<Item = Message>,
    ) -> usize {
        chat_entry(&mut self.chats, chat_id);
        let mut added = 0;
        for message in messages {
            let Some(id) = message.server_id() else {
                continue;
            };
            if message.chat_id != *chat_id {
                debug!("history for {chat_id} carried message {id} of {}", message.chat_id);
                continue;
            }
            if self.tombstones.contains(&id) || self.ids.by_server(id).is_some() {
                continue;
            }
            let created = message.created_at;
            self.insert_confirmed(id, message);
            let state = chat_entry(&mut self.chats, chat_id);
            if state.chat.last_activity.is_none_or(|t| t < created) {
                state.chat.last_activity = Some(created);
            }
            added += 1;
            self.replay_deferred(id);
        }
        if added > 0 {
            self.touch(chat_id);
        }
        added
    }

    /// Marks `chat_id` as the one on screen and clears its unread counter.
    pub fn open_chat(&mut self, chat_id: &ChatId) -> Result<(), SyncError> {
        let state = self
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| SyncError::UnknownChat(chat_id.clone()))?;
        state.chat.unread = 0;
        self.open_chat = Some(chat_id.clone());
        self.touch(chat_id);
        Ok(())
    }

    pub fn close_chat(&mut self) {
        self.open_chat = None;
    }

    fn touch(&mut self, chat_id: &ChatId) {
        if let Some(state) = self.chats.get_mut(chat_id) {
            state.chat.last_message = state
                .order
                .last()
                .and_then(|k| self.records.get(k))
                .map(|m| m.id);
        }
        self.changed.insert(chat_id.clone());
    }

    // ---- views --------------------------------------------------------------

    /// Messages of a chat in display order.
    pub fn messages(&self, chat_id: &ChatId) -> Vec<&Message> {
        self.chats
            .get(chat_id)
            .map(|s| s.order.iter().filter_map(|k| self.records.get(k)).collect())
            .unwrap_or_default()
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.ids.resolve(id).and_then(|k| self.records.get(&k))
    }

    pub fn chat(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.chats.get(chat_id).map(|s| &s.chat)
    }

    /// Pinned chats first, then most recently active.
    pub fn chats(&self) -> Vec<&Chat> {
        let mut chats: Vec<&Chat> = self.chats.values().map(|s| &s.chat).collect();
        chats.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.last_activity.cmp(&a.last_activity))
                .then_with(|| a.id.cmp(&b.id))
        });
        chats
    }

    pub fn open_chat_id(&self) -> Option<&ChatId> {
        self.open_chat.as_ref()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn failure_reason(&self, temp_id: TempId) -> Option<&str> {
        self.pending.get(&temp_id)?.last_error.as_deref()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn anomalies(&self) -> &AnomalyLog {
        &self.anomalies
    }

    pub fn presence(&self, user_id: &str) -> Option<&Presence> {
        self.presence.get(user_id)
    }

    /// Chats whose view changed since the previous call.
    pub fn take_changed(&mut self) -> Vec<ChatId> {
        std::mem::take(&mut self.changed).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    fn engine() -> (ChatSyncEngine, mpsc::UnboundedReceiver<OutboundRequest>) {
        let (outbox, rx) = Outbox::channel();
        (ChatSyncEngine::new("me", outbox, EngineSettings::default()), rx)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn inbound(id: u64, chat: &str, sender: &str, secs: i64) -> InboundEvent {
        InboundEvent::NewMessage {
            message: Message {
                id: MessageId::Server(ServerId(id)),
                chat_id: ChatId::from(chat),
                sender_id: sender.to_string(),
                content: MessageContent::text(format!("m{id}")),
                created_at: at(secs),
                status: DeliveryStatus::Sent,
                reply_to: None,
                reactions: Vec::new(),
                edited_at: None,
            },
            client_ref: None,
        }
    }

    fn ids(engine: &ChatSyncEngine, chat: &str) -> Vec<MessageId> {
        engine
            .messages(&ChatId::from(chat))
            .iter()
            .map(|m| m.id)
            .collect()
    }

    #[test]
    fn pending_stays_at_tail_until_acknowledged() {
        let (mut engine, mut rx) = engine();
        let chat = ChatId::from("c");
        engine.on_inbound_event(inbound(1, "c", "bob", 0));
        let temp = engine.send_message(&chat, MessageContent::text("mine"));
        engine.on_inbound_event(inbound(3, "c", "bob", 1_000_000));

        assert_eq!(
            ids(&engine, "c"),
            vec![
                MessageId::Server(ServerId(1)),
                MessageId::Server(ServerId(3)),
                MessageId::Temp(temp)
            ]
        );
        assert!(matches!(rx.try_recv(), Ok(OutboundRequest::Send { temp_id, attempt: 1, .. }) if temp_id == temp));

        engine.on_server_ack(temp, ServerId(2), at(10));
        assert_eq!(
            ids(&engine, "c"),
            vec![
                MessageId::Server(ServerId(1)),
                MessageId::Server(ServerId(2)),
                MessageId::Server(ServerId(3))
            ]
        );
        assert_eq!(
            engine.message(&MessageId::Temp(temp)).map(|m| m.id),
            Some(MessageId::Server(ServerId(2)))
        );
    }

    #[test]
    fn echo_before_ack_does_not_duplicate() {
        let (mut engine, _rx) = engine();
        let chat = ChatId::from("c");
        let temp = engine.send_message(&chat, MessageContent::text("hi"));

        // echo without client ref, then the HTTP ack
        engine.on_inbound_event(inbound(5, "c", "me", 1));
        engine.on_server_ack(temp, ServerId(5), at(1));

        assert_eq!(ids(&engine, "c"), vec![MessageId::Server(ServerId(5))]);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(
            engine.message(&MessageId::Temp(temp)).map(|m| m.id),
            Some(MessageId::Server(ServerId(5)))
        );
    }

    #[test]
    fn echo_with_client_ref_acts_as_ack() {
        let (mut engine, _rx) = engine();
        let chat = ChatId::from("c");
        let temp = engine.send_message(&chat, MessageContent::text("hi"));
        let InboundEvent::NewMessage { message, .. } = inbound(8, "c", "me", 2) else {
            unreachable!()
        };
        engine.on_inbound_event(InboundEvent::NewMessage {
            message,
            client_ref: Some(temp),
        });

        let msgs = engine.messages(&chat);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id, MessageId::Server(ServerId(8)));
        assert_eq!(msgs[0].status, DeliveryStatus::Sent);
        assert_eq!(engine.chat(&chat).unwrap().unread, 0);
    }

    #[test]
    fn cancelled_send_ignores_late_callbacks() {
        let (mut engine, mut rx) = engine();
        let chat = ChatId::from("c");
        let temp = engine.send_message(&chat, MessageContent::text("oops"));
        engine.cancel(temp).unwrap();
        assert!(engine.messages(&chat).is_empty());

        engine.on_server_ack(temp, ServerId(4), at(0));
        engine.on_send_failure(temp, "timeout");
        assert!(engine.messages(&chat).is_empty());
        assert_eq!(engine.anomalies().total(), 0);

        let sent: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            sent.last(),
            Some(&OutboundRequest::Delete {
                message_id: ServerId(4)
            })
        );
        assert_eq!(
            engine.cancel(temp),
            Err(SyncError::UnknownMessage(MessageId::Temp(temp)))
        );
    }

    #[test]
    fn cannot_cancel_or_retry_acknowledged() {
        let (mut engine, _rx) = engine();
        let chat = ChatId::from("c");
        let temp = engine.send_message(&chat, MessageContent::text("x"));
        engine.on_server_ack(temp, ServerId(1), at(0));
        assert_eq!(engine.cancel(temp), Err(SyncError::AlreadyAcknowledged(temp)));
        assert_eq!(engine.retry(temp), Err(SyncError::AlreadyAcknowledged(temp)));
    }

    #[test]
    fn retry_requires_failed() {
        let (mut engine, _rx) = engine();
        let temp = engine.send_message(&ChatId::from("c"), MessageContent::text("x"));
        assert_eq!(
            engine.retry(temp),
            Err(SyncError::InvalidTransition {
                id: MessageId::Temp(temp),
                from: DeliveryStatus::Sending,
                to: DeliveryStatus::Sending,
            })
        );
    }

    #[test]
    fn closed_outbox_fails_immediately() {
        let (mut engine, rx) = engine();
        drop(rx);
        let chat = ChatId::from("c");
        let temp = engine.send_message(&chat, MessageContent::text("x"));
        let msg = engine.message(&MessageId::Temp(temp)).unwrap();
        assert_eq!(msg.status, DeliveryStatus::Failed);
        assert!(engine.failure_reason(temp).is_some());
    }

    #[test]
    fn ack_after_failure_marks_sent() {
        let (mut engine, _rx) = engine();
        let temp = engine.send_message(&ChatId::from("c"), MessageContent::text("x"));
        engine.on_send_failure(temp, "timeout");
        engine.on_server_ack(temp, ServerId(7), at(0));
        let msg = engine.message(&MessageId::Server(ServerId(7))).unwrap();
        assert_eq!(msg.status, DeliveryStatus::Sent);
    }

    #[test]
    fn unread_counts_only_others_in_closed_chats() {
        let (mut engine, _rx) = engine();
        let chat = ChatId::from("c");
        engine.on_inbound_event(inbound(1, "c", "bob", 0));
        engine.on_inbound_event(inbound(2, "c", "me", 1));
        engine.on_inbound_event(inbound(3, "c", "bob", 2));
        assert_eq!(engine.chat(&chat).unwrap().unread, 2);

        engine.open_chat(&chat).unwrap();
        assert_eq!(engine.chat(&chat).unwrap().unread, 0);
        engine.on_inbound_event(inbound(4, "c", "bob", 3));
        assert_eq!(engine.chat(&chat).unwrap().unread, 0);
        assert_eq!(
            engine.chat(&chat).unwrap().last_message,
            Some(MessageId::Server(ServerId(4)))
        );
        assert_eq!(
            engine.open_chat(&ChatId::from("nope")),
            Err(SyncError::UnknownChat(ChatId::from("nope")))
        );
    }

    #[test]
    fn delete_tombstones_and_drops_followups() {
        let (mut engine, _rx) = engine();
        engine.on_inbound_event(inbound(1, "c", "bob", 0));
        engine.on_inbound_event(InboundEvent::Deleted {
            message_id: ServerId(1),
        });
        engine.on_inbound_event(InboundEvent::StatusUpdate {
            message_id: ServerId(1),
            status: DeliveryStatus::Read,
        });
        engine.on_inbound_event(inbound(1, "c", "bob", 0));

        assert!(ids(&engine, "c").is_empty());
        assert_eq!(engine.deferred_count(), 0);
    }

    #[test]
    fn history_merge_skips_known() {
        let (mut engine, _rx) = engine();
        let chat = ChatId::from("c");
        engine.on_inbound_event(inbound(2, "c", "bob", 2));
        let page: Vec<Message> = [1u64, 2, 3]
            .into_iter()
            .map(|id| match inbound(id, "c", "bob", id as i64) {
                InboundEvent::NewMessage { message, .. } => message,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(engine.merge_history(&chat, page), 2);
        assert_eq!(
            ids(&engine, "c"),
            vec![
                MessageId::Server(ServerId(1)),
                MessageId::Server(ServerId(2)),
                MessageId::Server(ServerId(3))
            ]
        );
        assert_eq!(engine.chat(&chat).unwrap().unread, 1);
    }

    #[test]
    fn local_edit_requires_own_message() {
        let (mut engine, mut rx) = engine();
        engine.on_inbound_event(inbound(1, "c", "bob", 0));
        assert_eq!(
            engine.edit(&MessageId::Server(ServerId(1)), MessageContent::text("no")),
            Err(SyncError::NotOwnMessage(ServerId(1)))
        );

        let temp = engine.send_message(&ChatId::from("c"), MessageContent::text("draft"));
        assert_eq!(
            engine.edit(&MessageId::Temp(temp), MessageContent::text("x")),
            Err(SyncError::NotAcknowledged(temp))
        );
        engine.on_server_ack(temp, ServerId(2), at(1));
        engine
            .edit(&MessageId::Temp(temp), MessageContent::text("final"))
            .unwrap();
        let msg = engine.message(&MessageId::Server(ServerId(2))).unwrap();
        assert_eq!(msg.content, MessageContent::text("final"));
        assert!(msg.edited_at.is_some());

        let sent: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(sent.last(), Some(OutboundRequest::Edit { message_id, .. }) if *message_id == ServerId(2)));
    }

    #[test]
    fn local_reaction_replaces_previous() {
        let (mut engine, _rx) = engine();
        engine.on_inbound_event(inbound(1, "c", "bob", 0));
        let id = MessageId::Server(ServerId(1));
        engine.react(&id, "👍").unwrap();
        engine.react(&id, "❤️").unwrap();
        let msg = engine.message(&id).unwrap();
        assert_eq!(msg.reactions.len(), 1);
        assert_eq!(msg.reactions[0].emoji, "❤️");
        engine.unreact(&id).unwrap();
        assert!(engine.message(&id).unwrap().reactions.is_empty());
    }

    #[test]
    fn chats_sorted_pinned_then_recent() {
        let (mut engine, _rx) = engine();
        engine.on_inbound_event(inbound(1, "old", "bob", 0));
        engine.on_inbound_event(inbound(2, "new", "bob", 100));
        let mut pinned = Chat::new(ChatId::from("pinned"), ChatKind::Class);
        pinned.pinned = true;
        engine.upsert_chats([pinned]);

        let order: Vec<_> = engine.chats().iter().map(|c| c.id.0.clone()).collect();
        assert_eq!(order, vec!["pinned", "new", "old"]);
    }

    #[test]
    fn server_status_rejects_backward_and_side_moves() {
        let (mut engine, _rx) = engine();
        engine.on_inbound_event(inbound(1, "c", "bob", 0));
        engine.on_inbound_event(InboundEvent::StatusUpdate {
            message_id: ServerId(1),
            status: DeliveryStatus::Read,
        });
        engine.on_inbound_event(InboundEvent::StatusUpdate {
            message_id: ServerId(1),
            status: DeliveryStatus::Delivered,
        });
        engine.on_inbound_event(InboundEvent::StatusUpdate {
            message_id: ServerId(1),
            status: DeliveryStatus::Failed,
        });
        let msg = engine.message(&MessageId::Server(ServerId(1))).unwrap();
        assert_eq!(msg.status, DeliveryStatus::Read);
        assert_eq!(engine.anomalies().total(), 1);
    }

    #[test]
    fn take_changed_drains() {
        let (mut engine, _rx) = engine();
        engine.on_inbound_event(inbound(1, "a", "bob", 0));
        engine.on_inbound_event(inbound(2, "b", "bob", 0));
        assert_eq!(engine.take_changed(), vec![ChatId::from("a"), ChatId::from("b")]);
        assert!(engine.take_changed().is_empty());
    }
}
