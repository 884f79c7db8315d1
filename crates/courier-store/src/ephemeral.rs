//! Drafts, message selection and typing indicators.
//!
//! Drafts survive a snapshot; selections and typing indicators do not.

use chrono::{DateTime, Duration, Utc};

use courier_shared::{ChatId, MessageId, UserId};

use crate::store::ChatStateStore;

impl ChatStateStore {
    // ------------------------------------------------------------------
    // Drafts
    // ------------------------------------------------------------------

    /// Store the unsent text of a chat. An empty draft clears it.
    pub fn set_draft(&mut self, chat_id: &ChatId, text: impl Into<String>) -> bool {
        if !self.chats.contains_key(chat_id) {
            return false;
        }
        let text = text.into();
        if text.is_empty() {
            self.drafts.remove(chat_id);
        } else {
            self.drafts.insert(chat_id.clone(), text);
        }
        true
    }

    pub fn draft(&self, chat_id: &ChatId) -> Option<&str> {
        self.drafts.get(chat_id).map(String::as_str)
    }

    pub fn clear_draft(&mut self, chat_id: &ChatId) -> Option<String> {
        self.drafts.remove(chat_id)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Select or deselect a message of `chat_id`. Returns whether it is
    /// selected afterwards.
    pub fn toggle_selection(&mut self, chat_id: &ChatId, id: &MessageId) -> bool {
        if self.message_index.get(id) != Some(chat_id) {
            return false;
        }
        let selected = self.selection.entry(chat_id.clone()).or_default();
        if selected.remove(id) {
            false
        } else {
            selected.insert(id.clone());
            true
        }
    }

    pub fn selection(&self, chat_id: &ChatId) -> Vec<MessageId> {
        self.selection
            .get(chat_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_selection(&mut self, chat_id: &ChatId) {
        self.selection.remove(chat_id);
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Record that `user` is typing in `chat_id`. A newer indicator replaces
    /// the previous one for the same pair.
    pub fn set_typing(&mut self, chat_id: &ChatId, user: UserId, now: DateTime<Utc>) -> bool {
        if !self.chats.contains_key(chat_id) || self.blocked.contains(&user) {
            return false;
        }
        self.typing
            .entry(chat_id.clone())
            .or_default()
            .insert(user, now);
        true
    }

    pub fn clear_typing(&mut self, chat_id: &ChatId, user: &UserId) -> bool {
        let Some(typing) = self.typing.get_mut(chat_id) else {
            return false;
        };
        let removed = typing.remove(user).is_some();
        if typing.is_empty() {
            self.typing.remove(chat_id);
        }
        removed
    }

    /// Users currently typing in `chat_id`, ordered by id.
    pub fn typing_in(&self, chat_id: &ChatId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .typing
            .get(chat_id)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Drop indicators older than `ttl`. Returns how many were removed.
    pub fn prune_typing(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut pruned = 0;
        for typing in self.typing.values_mut() {
            let before = typing.len();
            typing.retain(|_, since| now - *since <= ttl);
            pruned += before - typing.len();
        }
        self.typing.retain(|_, t| !t.is_empty());
        pruned
    }
}
