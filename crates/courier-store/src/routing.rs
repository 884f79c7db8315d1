//! Inbound message routing.

use chrono::{DateTime, Utc};
use tracing::debug;

use courier_shared::{ChatId, UserId};

use crate::models::Message;
use crate::store::ChatStateStore;

/// What happened to a routed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Added {
        chat_id: ChatId,
        /// A direct chat was synthesized for the sender.
        new_chat: bool,
        /// The sender had no peer record before.
        new_peer: bool,
    },
    /// A message with the same id is already stored.
    Duplicate,
    /// The sender is blocked; nothing was created.
    Blocked,
}

impl ChatStateStore {
    /// Place a message received by `me` into the sender's direct chat.
    ///
    /// The blocked set is consulted before anything is synthesized, so a
    /// blocked sender never gains a chat or a peer record.
    pub fn route_incoming(
        &mut self,
        me: &UserId,
        message: Message,
        now: DateTime<Utc>,
    ) -> RouteOutcome {
        let sender = message.sender;
        if self.is_blocked(&sender) {
            debug!(
                peer = %sender.short(),
                msg_id = %message.id,
                "Dropping message from blocked user"
            );
            return RouteOutcome::Blocked;
        }
        if self.message(&message.id).is_some() {
            return RouteOutcome::Duplicate;
        }

        let (chat_id, new_chat) = self.ensure_direct_chat(*me, sender, now);
        let new_peer = self.upsert_peer(sender);
        if self.add_message(&chat_id, message) {
            RouteOutcome::Added {
                chat_id,
                new_chat,
                new_peer,
            }
        } else {
            RouteOutcome::Duplicate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use courier_shared::{MessageId, PresenceStatus};

    const ME: UserId = UserId([1; 32]);
    const BOB: UserId = UserId([2; 32]);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn from_bob(id: &str, secs: i64) -> Message {
        Message::incoming(MessageId::from(id), BOB, ME, "hi", at(secs))
    }

    #[test]
    fn test_unknown_sender_gets_chat_and_peer() {
        let mut store = ChatStateStore::new();

        let outcome = store.route_incoming(&ME, from_bob("m1", 1), at(1));
        let chat_id = ChatId::direct(&ME, &BOB);
        assert_eq!(
            outcome,
            RouteOutcome::Added {
                chat_id: chat_id.clone(),
                new_chat: true,
                new_peer: true,
            }
        );
        assert_eq!(store.chat(&chat_id).unwrap().unread_count, 1);
        assert_eq!(store.peer(&BOB).unwrap().presence, PresenceStatus::Offline);

        assert_eq!(
            store.route_incoming(&ME, from_bob("m2", 2), at(2)),
            RouteOutcome::Added {
                chat_id,
                new_chat: false,
                new_peer: false,
            }
        );
        assert_eq!(
            store.route_incoming(&ME, from_bob("m2", 2), at(3)),
            RouteOutcome::Duplicate
        );
    }

    #[test]
    fn test_blocking_suppresses_creation_until_unblocked() {
        let mut store = ChatStateStore::new();
        store.block(BOB);

        assert_eq!(
            store.route_incoming(&ME, from_bob("m1", 1), at(1)),
            RouteOutcome::Blocked
        );
        assert!(store.chats().is_empty());
        assert!(store.peer(&BOB).is_none());

        store.unblock(&BOB);
        assert!(matches!(
            store.route_incoming(&ME, from_bob("m1", 1), at(2)),
            RouteOutcome::Added { new_chat: true, .. }
        ));
        assert!(store.peer(&BOB).is_some());
    }

    #[test]
    fn test_active_chat_does_not_count_unread() {
        let mut store = ChatStateStore::new();
        let (chat_id, _) = store.ensure_direct_chat(ME, BOB, at(0));
        store.set_active_chat(Some(chat_id.clone()));

        store.route_incoming(&ME, from_bob("m1", 1), at(1));
        assert_eq!(store.chat(&chat_id).unwrap().unread_count, 0);
    }
}
