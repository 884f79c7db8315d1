//! Notifications for the UI layer.

use serde::Serialize;
use tokio::sync::broadcast;

use courier_shared::{ChatId, ConnectionState, MessageId, PresenceStatus, UserId};
use courier_store::MessageStatus;

/// Capacity of the UI event channel. Slow subscribers lag rather than block
/// the messenger.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Connection {
        state: ConnectionState,
    },
    ChatCreated {
        chat_id: ChatId,
        peer: UserId,
    },
    MessageAdded {
        chat_id: ChatId,
        message_id: MessageId,
    },
    MessageUpdated {
        message_id: MessageId,
        status: MessageStatus,
    },
    /// An inbound message failed verification and was dropped.
    MessageRejected {
        from: UserId,
        message_id: MessageId,
        reason: String,
    },
    Typing {
        chat_id: ChatId,
        user: UserId,
        is_typing: bool,
    },
    Presence {
        user: UserId,
        status: PresenceStatus,
    },
}

pub fn emit_event(events: &broadcast::Sender<ClientEvent>, event: ClientEvent) {
    if events.send(event).is_err() {
        tracing::trace!("No UI subscribers for event");
    }
}
