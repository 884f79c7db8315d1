//! Peers, blocking and the session key cache.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use courier_shared::{PresenceStatus, UserId};

use crate::models::{Peer, SessionKeys};
use crate::store::ChatStateStore;

impl ChatStateStore {
    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    pub fn peer(&self, id: &UserId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// All known peers, ordered by id.
    pub fn peers(&self) -> Vec<&Peer> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Create an offline peer record if none exists. Returns whether one was
    /// created.
    pub fn upsert_peer(&mut self, id: UserId) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        debug!(peer = %id.short(), "New peer");
        self.peers.insert(id, Peer::new(id));
        true
    }

    pub fn set_display_name(&mut self, id: &UserId, name: Option<String>) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.display_name = name;
                true
            }
            None => false,
        }
    }

    pub fn set_nickname(&mut self, id: &UserId, nickname: Option<String>) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.nickname = nickname.filter(|n| !n.trim().is_empty());
                true
            }
            None => false,
        }
    }

    /// Record a presence event. Unknown and blocked peers are ignored.
    pub fn update_presence(
        &mut self,
        id: &UserId,
        status: PresenceStatus,
        now: DateTime<Utc>,
    ) -> bool {
        if self.blocked.contains(id) {
            return false;
        }
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        peer.presence = status;
        peer.last_seen = Some(now);
        true
    }

    /// Mark peers offline whose last heartbeat is older than `timeout`.
    /// Returns the peers that changed.
    pub fn expire_presence(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<UserId> {
        let mut expired = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.presence == PresenceStatus::Offline {
                continue;
            }
            let stale = peer.last_seen.map_or(true, |seen| now - seen > timeout);
            if stale {
                peer.presence = PresenceStatus::Offline;
                expired.push(peer.id);
            }
        }
        expired.sort();
        expired
    }

    // ------------------------------------------------------------------
    // Blocking
    // ------------------------------------------------------------------

    /// Block `id`. Its typing indicators are cleared immediately; existing
    /// chats and messages are kept.
    pub fn block(&mut self, id: UserId) -> bool {
        if !self.blocked.insert(id) {
            return false;
        }
        info!(peer = %id.short(), "User blocked");
        for typing in self.typing.values_mut() {
            typing.remove(&id);
        }
        true
    }

    pub fn unblock(&mut self, id: &UserId) -> bool {
        let removed = self.blocked.remove(id);
        if removed {
            info!(peer = %id.short(), "User unblocked");
        }
        removed
    }

    pub fn is_blocked(&self, id: &UserId) -> bool {
        self.blocked.contains(id)
    }

    pub fn blocked(&self) -> Vec<UserId> {
        let mut blocked: Vec<UserId> = self.blocked.iter().copied().collect();
        blocked.sort();
        blocked
    }

    // ------------------------------------------------------------------
    // Key cache
    // ------------------------------------------------------------------

    pub fn session_keys(&self, peer: &UserId) -> Option<&SessionKeys> {
        self.keys.get(peer)
    }

    pub fn cache_session_keys(&mut self, peer: UserId, keys: SessionKeys) {
        self.keys.insert(peer, keys);
    }

    pub fn forget_session_keys(&mut self, peer: &UserId) -> bool {
        self.keys.remove(peer).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use courier_shared::{ChatId, Identity};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_new_peer_defaults_offline() {
        let mut store = ChatStateStore::new();
        let bob = UserId([2; 32]);
        assert!(store.upsert_peer(bob));
        assert!(!store.upsert_peer(bob));
        assert_eq!(store.peer(&bob).unwrap().presence, PresenceStatus::Offline);
    }

    #[test]
    fn test_presence_updates_and_expires() {
        let mut store = ChatStateStore::new();
        let (bob, carol) = (UserId([2; 32]), UserId([3; 32]));
        store.upsert_peer(bob);
        store.upsert_peer(carol);

        assert!(store.update_presence(&bob, PresenceStatus::Online, at(0)));
        assert!(store.update_presence(&carol, PresenceStatus::Away, at(50)));
        assert!(!store.update_presence(&UserId([4; 32]), PresenceStatus::Online, at(0)));

        let expired = store.expire_presence(at(70), Duration::seconds(60));
        assert_eq!(expired, vec![bob]);
        assert_eq!(store.peer(&bob).unwrap().presence, PresenceStatus::Offline);
        assert_eq!(store.peer(&carol).unwrap().presence, PresenceStatus::Away);
    }

    #[test]
    fn test_block_clears_typing_and_presence_is_ignored() {
        let mut store = ChatStateStore::new();
        let me = UserId([1; 32]);
        let bob = UserId([2; 32]);
        let (chat, _) = store.ensure_direct_chat(me, bob, at(0));
        store.upsert_peer(bob);
        store.set_typing(&chat, bob, at(1));

        assert!(store.block(bob));
        assert!(!store.block(bob));
        assert!(store.typing_in(&chat).is_empty());
        assert!(!store.update_presence(&bob, PresenceStatus::Online, at(2)));
        assert_eq!(store.blocked(), vec![bob]);

        assert!(store.unblock(&bob));
        assert!(!store.is_blocked(&bob));
        assert_eq!(chat, ChatId::direct(&bob, &me));
    }

    #[test]
    fn test_nickname_blank_clears() {
        let mut store = ChatStateStore::new();
        let bob = UserId([2; 32]);
        assert!(!store.set_nickname(&bob, Some("b".into())));
        store.upsert_peer(bob);
        assert!(store.set_nickname(&bob, Some("bobby".into())));
        assert_eq!(store.peer(&bob).unwrap().label(), "bobby");
        assert!(store.set_nickname(&bob, Some("  ".into())));
        assert_eq!(store.peer(&bob).unwrap().nickname, None);
    }

    #[test]
    fn test_key_cache() {
        let mut store = ChatStateStore::new();
        let peer = Identity::generate();
        let keys = SessionKeys {
            session_key: [7; 32],
            bundle: peer.key_bundle(),
            confirmation: "tag".into(),
            established_at: at(0),
        };

        store.cache_session_keys(peer.user_id(), keys);
        assert_eq!(
            store.session_keys(&peer.user_id()).unwrap().session_key,
            [7; 32]
        );
        assert!(store.forget_session_keys(&peer.user_id()));
        assert!(store.session_keys(&peer.user_id()).is_none());
    }
}
