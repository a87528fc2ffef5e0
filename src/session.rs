//! Single-owner event loop around [`ChatSyncEngine`].
//!
//! Socket frames, send results and UI commands all arrive on one queue and
//! are applied strictly in arrival order. Network work runs in its own tasks
//! and only talks to the loop through channels.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::api::client::ApiClient;
use crate::api::models::{Chat, ChatId, Message, MessageContent, MessageId, ServerId, TempId};
use crate::error::{ApiError, SyncError};
use crate::sync::{ChatSyncEngine, OutboundRequest};

#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub chat: Chat,
    pub messages: Vec<Message>,
}

#[derive(Debug)]
pub enum Command {
    Send {
        chat_id: ChatId,
        content: MessageContent,
        reply_to: Option<ServerId>,
        reply: oneshot::Sender<TempId>,
    },
    Retry(TempId, oneshot::Sender<Result<(), SyncError>>),
    Cancel(TempId, oneshot::Sender<Result<(), SyncError>>),
    React(MessageId, Option<String>, oneshot::Sender<Result<(), SyncError>>),
    Edit(MessageId, MessageContent, oneshot::Sender<Result<(), SyncError>>),
    Delete(MessageId, oneshot::Sender<Result<(), SyncError>>),
    Open(ChatId, oneshot::Sender<Result<(), SyncError>>),
    LoadChats(Vec<Chat>),
    MergeHistory(ChatId, Vec<Message>),
    Snapshot(ChatId, oneshot::Sender<Option<ChatSnapshot>>),
    ChatList(oneshot::Sender<Vec<Chat>>),
}

#[derive(Debug)]
pub enum EngineInput {
    Frame(String),
    Acked {
        temp_id: TempId,
        server_id: ServerId,
        server_time: DateTime<Utc>,
    },
    SendFailed {
        temp_id: TempId,
        reason: String,
    },
    Command(Command),
    Shutdown,
}

/// Cloneable sender side of the session queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl SessionHandle {
    fn push(&self, input: EngineInput) -> bool {
        self.tx.send(input).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn push_frame(&self, text: String) -> bool {
        self.push(EngineInput::Frame(text))
    }

    pub fn acked(&self, temp_id: TempId, server_id: ServerId, server_time: DateTime<Utc>) -> bool {
        self.push(EngineInput::Acked {
            temp_id,
            server_id,
            server_time,
        })
    }

    pub fn send_failed(&self, temp_id: TempId, reason: String) -> bool {
        self.push(EngineInput::SendFailed { temp_id, reason })
    }

    pub fn shutdown(&self) {
        self.push(EngineInput::Shutdown);
    }

    pub fn load_chats(&self, chats: Vec<Chat>) -> bool {
        self.push(EngineInput::Command(Command::LoadChats(chats)))
    }

    pub fn merge_history(&self, chat_id: ChatId, messages: Vec<Message>) -> bool {
        self.push(EngineInput::Command(Command::MergeHistory(chat_id, messages)))
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if !self.push(EngineInput::Command(make(tx))) {
            return None;
        }
        rx.await.ok()
    }

    pub async fn send_message(
        &self,
        chat_id: ChatId,
        content: MessageContent,
        reply_to: Option<ServerId>,
    ) -> Option<TempId> {
        self.ask(|reply| Command::Send {
            chat_id,
            content,
            reply_to,
            reply,
        })
        .await
    }

    pub async fn retry(&self, temp_id: TempId) -> Option<Result<(), SyncError>> {
        self.ask(|r| Command::Retry(temp_id, r)).await
    }

    pub async fn cancel(&self, temp_id: TempId) -> Option<Result<(), SyncError>> {
        self.ask(|r| Command::Cancel(temp_id, r)).await
    }

    pub async fn react(&self, id: MessageId, emoji: Option<String>) -> Option<Result<(), SyncError>> {
        self.ask(|r| Command::React(id, emoji, r)).await
    }

    pub async fn edit(&self, id: MessageId, content: MessageContent) -> Option<Result<(), SyncError>> {
        self.ask(|r| Command::Edit(id, content, r)).await
    }

    pub async fn delete(&self, id: MessageId) -> Option<Result<(), SyncError>> {
        self.ask(|r| Command::Delete(id, r)).await
    }

    pub async fn open_chat(&self, chat_id: ChatId) -> Option<Result<(), SyncError>> {
        self.ask(|r| Command::Open(chat_id, r)).await
    }

    pub async fn snapshot(&self, chat_id: ChatId) -> Option<ChatSnapshot> {
        self.ask(|r| Command::Snapshot(chat_id, r)).await.flatten()
    }

    pub async fn chat_list(&self) -> Option<Vec<Chat>> {
        self.ask(Command::ChatList).await
    }
}

pub struct Session {
    engine: ChatSyncEngine,
    rx: mpsc::UnboundedReceiver<EngineInput>,
    changes: Option<mpsc::UnboundedSender<ChatId>>,
    sweep_every: Duration,
}

impl Session {
    pub fn new(engine: ChatSyncEngine, sweep_every: Duration) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            engine,
            rx,
            changes: None,
            sweep_every,
        };
        (session, SessionHandle { tx })
    }

    /// Feed of chat ids whose view changed, sent after each applied input.
    pub fn change_feed(&mut self) -> mpsc::UnboundedReceiver<ChatId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.changes = Some(tx);
        rx
    }

    pub fn engine(&self) -> &ChatSyncEngine {
        &self.engine
    }

    /// Applies one input. Returns false on shutdown.
    pub fn apply(&mut self, input: EngineInput) -> bool {
        match input {
            EngineInput::Frame(text) => self.engine.on_raw_frame(&text),
            EngineInput::Acked {
                temp_id,
                server_id,
                server_time,
            } => self.engine.on_server_ack(temp_id, server_id, server_time),
            EngineInput::SendFailed { temp_id, reason } => {
                self.engine.on_send_failure(temp_id, reason)
            }
            EngineInput::Command(cmd) => self.command(cmd),
            EngineInput::Shutdown => return false,
        }
        self.publish_changes();
        true
    }

    fn command(&mut self, cmd: Command) {
        let engine = &mut self.engine;
        // A dropped reply receiver just means the caller stopped waiting.
        match cmd {
            Command::Send {
                chat_id,
                content,
                reply_to,
                reply,
            } => {
                let temp_id = match reply_to {
                    Some(r) => engine.send_reply(&chat_id, content, r),
                    None => engine.send_message(&chat_id, content),
                };
                let _ = reply.send(temp_id);
            }
            Command::Retry(t, reply) => {
                let _ = reply.send(engine.retry(t));
            }
            Command::Cancel(t, reply) => {
                let _ = reply.send(engine.cancel(t));
            }
            Command::React(id, Some(emoji), reply) => {
                let _ = reply.send(engine.react(&id, &emoji));
            }
            Command::React(id, None, reply) => {
                let _ = reply.send(engine.unreact(&id));
            }
            Command::Edit(id, content, reply) => {
                let _ = reply.send(engine.edit(&id, content));
            }
            Command::Delete(id, reply) => {
                let _ = reply.send(engine.delete(&id));
            }
            Command::Open(chat_id, reply) => {
                let _ = reply.send(engine.open_chat(&chat_id));
            }
            Command::LoadChats(chats) => engine.upsert_chats(chats),
            Command::MergeHistory(chat_id, messages) => {
                let added = engine.merge_history(&chat_id, messages);
                debug!("merged {} history messages into {}", added, chat_id);
            }
            Command::Snapshot(chat_id, reply) => {
                let snapshot = engine.chat(&chat_id).map(|chat| ChatSnapshot {
                    chat: chat.clone(),
                    messages: engine.messages(&chat_id).into_iter().cloned().collect(),
                });
                let _ = reply.send(snapshot);
            }
            Command::ChatList(reply) => {
                let _ = reply.send(engine.chats().into_iter().cloned().collect());
            }
        }
    }

    fn publish_changes(&mut self) {
        let changed = self.engine.take_changed();
        if let Some(tx) = &self.changes {
            for chat_id in changed {
                if tx.send(chat_id).is_err() {
                    self.changes = None;
                    break;
                }
            }
        }
    }

    /// Runs until shutdown or until every handle is dropped, then hands the engine back.
    pub async fn run(mut self) -> ChatSyncEngine {
        let mut tick = tokio::time::interval(self.sweep_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                input = self.rx.recv() => match input {
                    Some(input) => {
                        if !self.apply(input) {
                            info!("session shutting down");
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    let expired = self.engine.sweep_deferred(Instant::now());
                    if expired > 0 {
                        debug!("expired {} deferred events", expired);
                    }
                }
            }
        }
        self.engine
    }
}

/// Drains the engine's outbox, performing each request over HTTP and
/// reporting send results back to the session.
///
/// Requests run one at a time in queue order, so the server receives sends in
/// submission order. A hung send holds the ones behind it back for at most
/// `timeout`.
pub async fn run_dispatcher(
    api: Arc<ApiClient>,
    mut outbox: mpsc::UnboundedReceiver<OutboundRequest>,
    session: SessionHandle,
    timeout: Duration,
) {
    while let Some(req) = outbox.recv().await {
        match req {
            OutboundRequest::Send {
                temp_id,
                chat_id,
                content,
                reply_to,
                attempt,
            } => {
                debug!("sending {} to {} (attempt {})", temp_id, chat_id, attempt);
                let call = api.send_message(&chat_id, temp_id, &content, reply_to);
                let delivered = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(receipt)) => session.acked(temp_id, receipt.id, receipt.created_at),
                    Ok(Err(e)) => session.send_failed(temp_id, e.to_string()),
                    Err(_) => session.send_failed(temp_id, ApiError::Timeout.to_string()),
                };
                if !delivered {
                    return;
                }
            }
            OutboundRequest::Edit {
                message_id,
                content,
            } => {
                if let Err(e) = api.edit_message(message_id, &content).await {
                    warn!("edit of {} failed: {}", message_id, e);
                }
            }
            OutboundRequest::Delete { message_id } => {
                if let Err(e) = api.delete_message(message_id).await {
                    warn!("delete of {} failed: {}", message_id, e);
                }
            }
            OutboundRequest::React { message_id, emoji } => {
                if let Err(e) = api.react(message_id, emoji.as_deref()).await {
                    warn!("reaction on {} failed: {}", message_id, e);
                }
            }
        }
    }
    debug!("outbox closed, dispatcher stopping");
}
