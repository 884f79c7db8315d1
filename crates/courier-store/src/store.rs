//! In-memory chat state.
//!
//! [`ChatStateStore`] exclusively owns every entity collection: chats,
//! per-chat message sequences, peers, drafts, selections, typing
//! indicators and the session key cache. Entities are keyed by stable
//! identifiers and reference each other by id only.
//!
//! Every operation takes `&self`/`&mut self` and completes synchronously,
//! so each one is atomic with respect to any observer. Mutating something
//! that does not exist is a no-op reported through the return value.
//!
//! The impl is split across modules by concern: chats and messages live
//! here, peers and keys in `peers`, drafts, selection and typing in
//! `ephemeral`, and inbound routing in `routing`.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use courier_shared::{ChatId, MessageId, UserId};

use crate::models::{Chat, Message, MessageStatus, Peer, SessionKeys, Snapshot, UserProfile};

#[derive(Debug, Default)]
pub struct ChatStateStore {
    pub(crate) profile: Option<UserProfile>,
    pub(crate) chats: HashMap<ChatId, Chat>,
    /// Per-chat sequences, ascending on `(timestamp, id)`.
    pub(crate) messages: HashMap<ChatId, Vec<Message>>,
    pub(crate) message_index: HashMap<MessageId, ChatId>,
    pub(crate) peers: HashMap<UserId, Peer>,
    pub(crate) blocked: HashSet<UserId>,
    pub(crate) drafts: HashMap<ChatId, String>,
    pub(crate) selection: HashMap<ChatId, BTreeSet<MessageId>>,
    pub(crate) typing: HashMap<ChatId, HashMap<UserId, DateTime<Utc>>>,
    pub(crate) keys: HashMap<UserId, SessionKeys>,
    pub(crate) active_chat: Option<ChatId>,
    pub(crate) last_sync: Option<DateTime<Utc>>,
}

impl ChatStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: UserProfile) -> Self {
        Self {
            profile: Some(profile),
            ..Self::default()
        }
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn set_profile(&mut self, profile: UserProfile) {
        self.profile = Some(profile);
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn set_last_sync(&mut self, at: DateTime<Utc>) {
        self.last_sync = Some(at);
    }

    // ------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------

    /// Get or create the direct chat between `a` and `b`. Returns the id and
    /// whether the chat was created by this call.
    pub fn ensure_direct_chat(
        &mut self,
        a: UserId,
        b: UserId,
        now: DateTime<Utc>,
    ) -> (ChatId, bool) {
        let id = ChatId::direct(&a, &b);
        if self.chats.contains_key(&id) {
            return (id, false);
        }
        debug!(chat = %id, "Creating direct chat");
        self.chats.insert(id.clone(), Chat::direct(a, b, now));
        self.messages.entry(id.clone()).or_default();
        (id, true)
    }

    pub fn chat(&self, id: &ChatId) -> Option<&Chat> {
        self.chats.get(id)
    }

    /// All chats, most recent activity first.
    pub fn chats(&self) -> Vec<&Chat> {
        let mut chats: Vec<&Chat> = self.chats.values().collect();
        chats.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        chats
    }

    /// Remove a chat together with its messages and per-chat UI state.
    pub fn remove_chat(&mut self, id: &ChatId) -> bool {
        if self.chats.remove(id).is_none() {
            return false;
        }
        if let Some(seq) = self.messages.remove(id) {
            for message in seq {
                self.message_index.remove(&message.id);
            }
        }
        self.drafts.remove(id);
        self.selection.remove(id);
        self.typing.remove(id);
        if self.active_chat.as_ref() == Some(id) {
            self.active_chat = None;
        }
        true
    }

    pub fn active_chat(&self) -> Option<&ChatId> {
        self.active_chat.as_ref()
    }

    /// Make `id` the chat on screen (or none). Opening a chat marks it read
    /// and returns the incoming message ids that became read.
    pub fn set_active_chat(&mut self, id: Option<ChatId>) -> Vec<MessageId> {
        match id {
            None => {
                self.active_chat = None;
                Vec::new()
            }
            Some(id) if self.chats.contains_key(&id) => {
                self.active_chat = Some(id.clone());
                self.mark_chat_read(&id)
            }
            Some(id) => {
                debug!(chat = %id, "Ignoring activation of unknown chat");
                Vec::new()
            }
        }
    }

    /// Zero the unread counter and advance incoming messages to `Read`.
    pub fn mark_chat_read(&mut self, id: &ChatId) -> Vec<MessageId> {
        let Some(chat) = self.chats.get_mut(id) else {
            return Vec::new();
        };
        chat.unread_count = 0;

        let mut read = Vec::new();
        if let Some(seq) = self.messages.get_mut(id) {
            for message in seq.iter_mut().filter(|m| !m.outgoing) {
                if message.status.can_advance_to(MessageStatus::Read) {
                    message.status = MessageStatus::Read;
                    read.push(message.id.clone());
                }
            }
        }
        read
    }

    pub fn total_unread(&self) -> u32 {
        self.chats.values().map(|c| c.unread_count).sum()
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// The chat's messages in ascending `(timestamp, id)` order.
    pub fn messages(&self, chat_id: &ChatId) -> &[Message] {
        self.messages.get(chat_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        let chat_id = self.message_index.get(id)?;
        self.messages.get(chat_id)?.iter().find(|m| &m.id == id)
    }

    pub fn messages_with_status(&self, status: MessageStatus) -> Vec<&Message> {
        self.messages
            .values()
            .flatten()
            .filter(|m| m.status == status)
            .collect()
    }

    /// Insert `message` at its sorted position in `chat_id`.
    ///
    /// Updates the chat's last message and activity, and bumps its unread
    /// counter unless the chat is active or the message is outgoing.
    /// Returns `false` for a duplicate id or an unknown chat.
    pub fn add_message(&mut self, chat_id: &ChatId, mut message: Message) -> bool {
        if self.message_index.contains_key(&message.id) {
            debug!(msg_id = %message.id, "Ignoring duplicate message");
            return false;
        }
        let Some(chat) = self.chats.get_mut(chat_id) else {
            debug!(chat = %chat_id, msg_id = %message.id, "Message for unknown chat");
            return false;
        };
        if !message.outgoing && self.active_chat.as_ref() != Some(chat_id) {
            chat.unread_count += 1;
        }

        message.chat_id = chat_id.clone();
        self.insert_sorted(message);
        self.refresh_chat(chat_id);
        true
    }

    /// Apply `update` to the message with `id`. The id and chat cannot be
    /// changed; a changed timestamp re-sorts the chat.
    pub fn update_message(&mut self, id: &MessageId, update: impl FnOnce(&mut Message)) -> bool {
        let Some(chat_id) = self.message_index.get(id).cloned() else {
            return false;
        };
        let Some(seq) = self.messages.get_mut(&chat_id) else {
            return false;
        };
        let Some(pos) = seq.iter().position(|m| &m.id == id) else {
            return false;
        };

        let before = seq[pos].timestamp;
        update(&mut seq[pos]);
        seq[pos].id = id.clone();
        seq[pos].chat_id = chat_id.clone();

        if seq[pos].timestamp != before {
            let message = seq.remove(pos);
            let at = seq.partition_point(|m| m.order_key() < message.order_key());
            seq.insert(at, message);
        }
        self.refresh_chat(&chat_id);
        true
    }

    pub fn remove_message(&mut self, id: &MessageId) -> Option<Message> {
        let chat_id = self.message_index.remove(id)?;
        let seq = self.messages.get_mut(&chat_id)?;
        let pos = seq.iter().position(|m| &m.id == id)?;
        let message = seq.remove(pos);

        if !message.outgoing && message.status != MessageStatus::Read {
            if let Some(chat) = self.chats.get_mut(&chat_id) {
                chat.unread_count = chat.unread_count.saturating_sub(1);
            }
        }
        if let Some(selected) = self.selection.get_mut(&chat_id) {
            selected.remove(id);
        }
        self.refresh_chat(&chat_id);
        Some(message)
    }

    /// Move a message to `status` if the transition is forward.
    pub fn update_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        let allowed = self
            .message(id)
            .is_some_and(|m| m.status.can_advance_to(status));
        allowed && self.update_message(id, |m| m.status = status)
    }

    /// Put a failed message back into `Sending` for a retry.
    pub fn mark_retrying(&mut self, id: &MessageId) -> bool {
        let allowed = self.message(id).is_some_and(|m| m.status.can_retry());
        allowed && self.update_message(id, |m| m.status = MessageStatus::Sending)
    }

    pub fn edit_message(&mut self, id: &MessageId, content: impl Into<String>) -> bool {
        let content = content.into();
        self.update_message(id, |m| {
            m.content = content;
            m.edited = true;
        })
    }

    /// Add `user`'s `emoji` reaction, or remove it if already present.
    /// Returns `Some(true)` when added, `Some(false)` when removed.
    pub fn toggle_reaction(&mut self, id: &MessageId, emoji: &str, user: UserId) -> Option<bool> {
        let mut added = None;
        self.update_message(id, |m| {
            let users = m.reactions.entry(emoji.to_string()).or_default();
            if users.remove(&user) {
                added = Some(false);
            } else {
                users.insert(user);
                added = Some(true);
            }
            if users.is_empty() {
                m.reactions.remove(emoji);
            }
        });
        added
    }

    fn insert_sorted(&mut self, message: Message) {
        let seq = self.messages.entry(message.chat_id.clone()).or_default();
        let at = seq.partition_point(|m| m.order_key() < message.order_key());
        self.message_index
            .insert(message.id.clone(), message.chat_id.clone());
        seq.insert(at, message);
    }

    fn refresh_chat(&mut self, chat_id: &ChatId) {
        let Some(chat) = self.chats.get_mut(chat_id) else {
            return;
        };
        let last = self.messages.get(chat_id).and_then(|seq| seq.last());
        chat.last_message = last.map(|m| m.id.clone());
        if let Some(last) = last {
            chat.last_activity = chat.last_activity.max(last.timestamp);
        }
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Persistable copy of the store. Session keys, selections, typing
    /// indicators and the active chat are left out.
    pub fn snapshot(&self) -> Snapshot {
        let mut chats: Vec<Chat> = self.chats.values().cloned().collect();
        chats.sort_by(|a, b| a.id.cmp(&b.id));

        let messages = chats
            .iter()
            .flat_map(|c| self.messages(&c.id).iter().cloned())
            .collect();

        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut blocked: Vec<UserId> = self.blocked.iter().copied().collect();
        blocked.sort();

        Snapshot {
            profile: self.profile.clone(),
            chats,
            messages,
            peers,
            drafts: self
                .drafts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            blocked,
            last_sync: self.last_sync,
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut store = Self {
            profile: snapshot.profile,
            last_sync: snapshot.last_sync,
            blocked: snapshot.blocked.into_iter().collect(),
            drafts: snapshot.drafts.into_iter().collect(),
            ..Self::default()
        };

        for chat in snapshot.chats {
            store.messages.entry(chat.id.clone()).or_default();
            store.chats.insert(chat.id.clone(), chat);
        }
        for message in snapshot.messages {
            if store.chats.contains_key(&message.chat_id)
                && !store.message_index.contains_key(&message.id)
            {
                store.insert_sorted(message);
            }
        }
        let ids: Vec<ChatId> = store.chats.keys().cloned().collect();
        for id in &ids {
            store.refresh_chat(id);
        }
        for peer in snapshot.peers {
            store.peers.insert(peer.id, peer);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    const ME: UserId = UserId([1; 32]);
    const BOB: UserId = UserId([2; 32]);

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn store_with_chat() -> (ChatStateStore, ChatId) {
        let mut store = ChatStateStore::new();
        let (chat, created) = store.ensure_direct_chat(ME, BOB, at(0));
        assert!(created);
        (store, chat)
    }

    fn incoming(id: &str, ms: i64) -> Message {
        Message::incoming(MessageId::from(id), BOB, ME, format!("msg {id}"), at(ms))
    }

    fn outgoing(chat: &ChatId, id: &str, ms: i64) -> Message {
        Message::outgoing(MessageId::from(id), chat.clone(), ME, BOB, "out", at(ms))
    }

    fn ids(store: &ChatStateStore, chat: &ChatId) -> Vec<String> {
        store.messages(chat).iter().map(|m| m.id.0.clone()).collect()
    }

    #[test]
    fn test_add_message_keeps_timestamp_order() {
        let (mut store, chat) = store_with_chat();
        assert!(store.add_message(&chat, incoming("c", 30)));
        assert!(store.add_message(&chat, incoming("a", 10)));
        assert!(store.add_message(&chat, incoming("b", 20)));

        assert_eq!(ids(&store, &chat), vec!["a", "b", "c"]);
        let c = store.chat(&chat).unwrap();
        assert_eq!(c.last_message, Some(MessageId::from("c")));
        assert_eq!(c.last_activity, at(30));
        assert_eq!(c.unread_count, 3);
    }

    #[test]
    fn test_equal_timestamps_tie_break_on_id() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, incoming("y", 10));
        store.add_message(&chat, incoming("x", 10));
        assert_eq!(ids(&store, &chat), vec!["x", "y"]);
    }

    #[test]
    fn test_duplicate_id_is_ignored() {
        let (mut store, chat) = store_with_chat();
        assert!(store.add_message(&chat, incoming("a", 10)));
        assert!(!store.add_message(&chat, incoming("a", 50)));
        assert_eq!(store.messages(&chat).len(), 1);
        assert_eq!(store.chat(&chat).unwrap().unread_count, 1);
    }

    #[test]
    fn test_unread_skips_outgoing_and_active_chat() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, outgoing(&chat, "mine", 5));
        assert_eq!(store.chat(&chat).unwrap().unread_count, 0);

        store.add_message(&chat, incoming("a", 10));
        let read = store.set_active_chat(Some(chat.clone()));
        assert_eq!(read, vec![MessageId::from("a")]);
        assert_eq!(store.chat(&chat).unwrap().unread_count, 0);
        assert_eq!(
            store.message(&MessageId::from("a")).unwrap().status,
            MessageStatus::Read
        );

        store.add_message(&chat, incoming("b", 20));
        assert_eq!(store.chat(&chat).unwrap().unread_count, 0);
        assert_eq!(store.total_unread(), 0);
    }

    #[test]
    fn test_add_to_unknown_chat_is_noop() {
        let mut store = ChatStateStore::new();
        let chat = ChatId::direct(&ME, &BOB);
        assert!(!store.add_message(&chat, incoming("a", 1)));
        assert!(store.message(&MessageId::from("a")).is_none());
    }

    #[test]
    fn test_update_and_remove_missing_are_noops() {
        let (mut store, _chat) = store_with_chat();
        let missing = MessageId::from("nope");
        assert!(!store.update_message(&missing, |m| m.content = "x".into()));
        assert!(store.remove_message(&missing).is_none());
        assert!(!store.update_status(&missing, MessageStatus::Sent));
        assert_eq!(store.toggle_reaction(&missing, "👍", ME), None);
    }

    #[test]
    fn test_update_changing_timestamp_resorts() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, incoming("a", 10));
        store.add_message(&chat, incoming("b", 20));
        store.add_message(&chat, incoming("c", 30));

        assert!(store.update_message(&MessageId::from("a"), |m| m.timestamp = at(40)));
        assert_eq!(ids(&store, &chat), vec!["b", "c", "a"]);
        assert_eq!(
            store.chat(&chat).unwrap().last_message,
            Some(MessageId::from("a"))
        );
    }

    #[test]
    fn test_remove_unread_message_drops_unread_count() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, incoming("a", 10));
        assert_eq!(store.chat(&chat).unwrap().unread_count, 1);

        store.remove_message(&MessageId::from("a")).unwrap();
        assert!(store.messages(&chat).is_empty());
        assert_eq!(store.chat(&chat).unwrap().unread_count, 0);
        assert_eq!(store.total_unread(), 0);

        // A read message was never counted
        store.add_message(&chat, incoming("b", 20));
        store.add_message(&chat, incoming("c", 30));
        store.set_active_chat(Some(chat.clone()));
        store.set_active_chat(None);
        store.add_message(&chat, incoming("d", 40));
        store.remove_message(&MessageId::from("b")).unwrap();
        assert_eq!(store.chat(&chat).unwrap().unread_count, 1);
    }

    #[test]
    fn test_remove_message_refreshes_last_message() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, incoming("a", 10));
        store.add_message(&chat, incoming("b", 20));

        let removed = store.remove_message(&MessageId::from("b")).unwrap();
        assert_eq!(removed.id, MessageId::from("b"));
        assert_eq!(
            store.chat(&chat).unwrap().last_message,
            Some(MessageId::from("a"))
        );
        // the id is free again
        assert!(store.add_message(&chat, incoming("b", 25)));
    }

    #[test]
    fn test_status_transitions_forward_only() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, outgoing(&chat, "m", 10));
        let id = MessageId::from("m");

        assert!(store.update_status(&id, MessageStatus::Delivered));
        assert!(!store.update_status(&id, MessageStatus::Sent));
        assert!(!store.update_status(&id, MessageStatus::Failed));
        assert!(store.update_status(&id, MessageStatus::Read));
        assert_eq!(store.message(&id).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_failed_message_can_be_retried() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, outgoing(&chat, "m", 10));
        let id = MessageId::from("m");

        assert!(!store.mark_retrying(&id));
        assert!(store.update_status(&id, MessageStatus::Failed));
        assert!(!store.update_status(&id, MessageStatus::Sent));
        assert!(store.mark_retrying(&id));
        assert_eq!(store.message(&id).unwrap().status, MessageStatus::Sending);
    }

    #[test]
    fn test_edit_and_reactions() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, incoming("a", 10));
        let id = MessageId::from("a");

        assert!(store.edit_message(&id, "fixed"));
        let m = store.message(&id).unwrap();
        assert_eq!(m.content, "fixed");
        assert!(m.edited);

        assert_eq!(store.toggle_reaction(&id, "🔥", ME), Some(true));
        assert_eq!(store.toggle_reaction(&id, "🔥", BOB), Some(true));
        assert_eq!(store.message(&id).unwrap().reactions["🔥"].len(), 2);
        assert_eq!(store.toggle_reaction(&id, "🔥", ME), Some(false));
        assert_eq!(store.toggle_reaction(&id, "🔥", BOB), Some(false));
        assert!(store.message(&id).unwrap().reactions.is_empty());
    }

    #[test]
    fn test_chats_ordered_by_recent_activity() {
        let mut store = ChatStateStore::new();
        let carol = UserId([3; 32]);
        let (with_bob, _) = store.ensure_direct_chat(ME, BOB, at(0));
        let (with_carol, _) = store.ensure_direct_chat(ME, carol, at(0));

        store.add_message(&with_bob, incoming("a", 10));
        let mut later = Message::incoming(MessageId::from("b"), carol, ME, "hey", at(20));
        later.chat_id = with_carol.clone();
        store.add_message(&with_carol, later);

        let order: Vec<_> = store.chats().iter().map(|c| c.id.clone()).collect();
        assert_eq!(order, vec![with_carol, with_bob]);
    }

    #[test]
    fn test_remove_chat_drops_messages_and_state() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, incoming("a", 10));
        store.set_draft(&chat, "half typed");
        store.set_active_chat(Some(chat.clone()));

        assert!(store.remove_chat(&chat));
        assert!(!store.remove_chat(&chat));
        assert!(store.message(&MessageId::from("a")).is_none());
        assert_eq!(store.draft(&chat), None);
        assert_eq!(store.active_chat(), None);
    }

    #[test]
    fn test_snapshot_roundtrip_excludes_ephemeral_state() {
        let (mut store, chat) = store_with_chat();
        store.set_profile(UserProfile {
            user_id: ME,
            display_name: Some("me".into()),
        });
        store.add_message(&chat, incoming("b", 20));
        store.add_message(&chat, incoming("a", 10));
        store.upsert_peer(BOB);
        store.set_draft(&chat, "draft");
        store.toggle_selection(&chat, &MessageId::from("a"));
        store.set_typing(&chat, BOB, at(30));
        store.set_active_chat(Some(chat.clone()));
        store.block(UserId([9; 32]));
        store.set_last_sync(at(99));

        let snapshot = store.snapshot();
        let restored = ChatStateStore::from_snapshot(snapshot.clone());

        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(ids(&restored, &chat), vec!["a", "b"]);
        assert_eq!(restored.draft(&chat), Some("draft"));
        assert!(restored.is_blocked(&UserId([9; 32])));
        assert_eq!(restored.last_sync(), Some(at(99)));
        assert_eq!(restored.active_chat(), None);
        assert!(restored.selection(&chat).is_empty());
        assert!(restored.typing_in(&chat).is_empty());
    }

    proptest! {
        #[test]
        fn prop_sequence_sorted_after_every_add(
            stamps in proptest::collection::vec(0i64..50, 1..40)
        ) {
            let (mut store, chat) = store_with_chat();
            for (i, ms) in stamps.iter().enumerate() {
                store.add_message(&chat, incoming(&format!("m{i:03}"), *ms));
                let seq = store.messages(&chat);
                prop_assert!(seq.windows(2).all(|w| w[0].order_key() <= w[1].order_key()));
                prop_assert_eq!(
                    store.chat(&chat).unwrap().last_message.as_ref(),
                    seq.last().map(|m| &m.id)
                );
            }
            prop_assert_eq!(store.messages(&chat).len(), stamps.len());
        }

        #[test]
        fn prop_order_independent_of_arrival(
            stamps in proptest::collection::vec(0i64..20, 1..20)
        ) {
            let messages: Vec<Message> = stamps
                .iter()
                .enumerate()
                .map(|(i, ms)| incoming(&format!("m{i:03}"), *ms))
                .collect();

            let (mut forward, chat) = store_with_chat();
            for m in messages.iter().cloned() {
                forward.add_message(&chat, m);
            }
            let (mut backward, _) = store_with_chat();
            for m in messages.iter().rev().cloned() {
                backward.add_message(&chat, m);
            }
            prop_assert_eq!(ids(&forward, &chat), ids(&backward, &chat));
        }
    }

    #[test]
    fn test_last_activity_never_moves_backwards() {
        let (mut store, chat) = store_with_chat();
        store.add_message(&chat, incoming("late", 100));
        store.add_message(&chat, incoming("early", 10));
        assert_eq!(store.chat(&chat).unwrap().last_activity, at(100));
        assert_eq!(
            store.chat(&chat).unwrap().last_message,
            Some(MessageId::from("late"))
        );
    }
}
