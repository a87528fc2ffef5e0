use log::debug;
use tokio::sync::mpsc;

use crate::api::models::{ChatId, MessageContent, ServerId, TempId};

/// Work the engine hands to the network side.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRequest {
    Send {
        temp_id: TempId,
        chat_id: ChatId,
        content: MessageContent,
        reply_to: Option<ServerId>,
        attempt: u32,
    },
    Edit {
        message_id: ServerId,
        content: MessageContent,
    },
    Delete {
        message_id: ServerId,
    },
    React {
        message_id: ServerId,
        emoji: Option<String>,
    },
}

/// Non-blocking handle onto the outbound dispatcher.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundRequest>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<OutboundRequest>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queues `req`. Returns false once the dispatcher is gone.
    pub fn dispatch(&self, req: OutboundRequest) -> bool {
        match self.tx.send(req) {
            Ok(()) => true,
            Err(mpsc::error::SendError(req)) => {
                debug!("outbox closed, dropping {:?}", req);
                false
            }
        }
    }
}
