//! The messaging context.
//!
//! [`Messenger`] owns the identity, the chat state, the transport handle and
//! the optional database. Every mutation of chat state happens on `&mut
//! self`, and transport results arrive as [`TransportEvent`]s that are
//! applied one at a time, so no two mutations interleave.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use courier_net::{
    dispatch, spawn_transport, Connector, InboundHandler, SendOutcome, TransportEvent,
    TransportHandle, WebSocketConnector,
};
use courier_shared::constants::MAX_MESSAGE_SIZE;
use courier_shared::protocol::wire_now;
use courier_shared::{
    ChatId, ChatPayload, ConnectionState, Envelope, EnvelopeKind, Identity, IdentityError,
    MessageId, MessageType, PresencePayload, PresenceStatus, ProtocolError, PublicKeyBundle,
    ReceiptPayload, TypingPayload, UserId,
};
use courier_store::{
    ChatStateStore, Database, Message, MessageStatus, RouteOutcome, SessionKeys, UserProfile,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{emit_event, ClientEvent, EVENT_CAPACITY};
use crate::keys::{self, Outgoing};

pub struct Messenger {
    identity: Identity,
    pub(crate) store: ChatStateStore,
    transport: TransportHandle,
    database: Option<Database>,
    pub(crate) config: ClientConfig,
    events: broadcast::Sender<ClientEvent>,
    connection: ConnectionState,
    /// Outgoing messages awaiting the relay's ack, with the time they were
    /// last handed to the transport.
    in_flight: HashMap<MessageId, DateTime<Utc>>,
    /// Envelopes produced while handling inbound traffic.
    outbox: Vec<Envelope>,
    targets_dirty: bool,
}

impl Messenger {
    /// Build a messenger and spawn its transport task. Must be called from
    /// within a tokio runtime.
    pub fn new(
        identity: Identity,
        connector: Arc<dyn Connector>,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let user_id = identity.user_id();
        let (transport, transport_events) =
            spawn_transport(user_id, connector, config.transport.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let messenger = Self {
            store: ChatStateStore::with_profile(UserProfile {
                user_id,
                display_name: None,
            }),
            identity,
            transport,
            database: None,
            config,
            events,
            connection: ConnectionState::Disconnected,
            in_flight: HashMap::new(),
            outbox: Vec::new(),
            targets_dirty: false,
        };
        (messenger, transport_events)
    }

    /// A messenger talking to the relay at `config.transport.relay_url`.
    pub fn with_websocket(
        identity: Identity,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let connector = Arc::new(WebSocketConnector::new(config.transport.relay_url.clone()));
        Self::new(identity, connector, config)
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id()
    }

    /// The bundle peers need to start a chat with us.
    pub fn bundle(&self) -> PublicKeyBundle {
        self.identity.key_bundle()
    }

    pub fn store(&self) -> &ChatStateStore {
        &self.store
    }

    /// Direct access for UI-local state such as drafts and selections.
    pub fn store_mut(&mut self) -> &mut ChatStateStore {
        &mut self.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ClientEvent> {
        self.events.clone()
    }

    fn emit(&self, event: ClientEvent) {
        emit_event(&self.events, event);
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Open the configured database (or the platform default) and load the
    /// state stored in it.
    pub fn open_database(&mut self) -> Result<()> {
        let key = self.identity.derive_db_key();
        let database = match &self.config.db_path {
            Some(path) => Database::open_at(path, &key)?,
            None => Database::open(&key)?,
        };
        self.restore(database)
    }

    /// Replace the in-memory state with the snapshot stored in `database`
    /// and keep the database for later [`persist`](Self::persist) calls.
    ///
    /// Messages that were still sending when the snapshot was taken lost
    /// their queue with the previous process; they come back as failed so
    /// they can be retried.
    pub fn restore(&mut self, database: Database) -> Result<()> {
        let snapshot = database.load_snapshot()?;
        let mut store = ChatStateStore::from_snapshot(snapshot);

        let me = self.user_id();
        match store.profile() {
            Some(profile) if profile.user_id != me => {
                return Err(IdentityError::BundleMismatch(profile.user_id.to_hex()).into());
            }
            Some(_) => {}
            None => store.set_profile(UserProfile {
                user_id: me,
                display_name: None,
            }),
        }

        let stale: Vec<MessageId> = store
            .messages_with_status(MessageStatus::Sending)
            .into_iter()
            .filter(|m| m.outgoing)
            .map(|m| m.id.clone())
            .collect();
        for id in &stale {
            store.update_status(id, MessageStatus::Failed);
        }

        info!(
            chats = store.chats().len(),
            failed = stale.len(),
            "Restored chat state"
        );
        self.store = store;
        self.database = Some(database);
        self.in_flight.clear();
        self.targets_dirty = true;
        Ok(())
    }

    /// Write the current snapshot. Returns `false` when no database is
    /// attached.
    pub fn persist(&mut self) -> Result<bool> {
        let Some(database) = self.database.as_mut() else {
            return Ok(false);
        };
        self.store.set_last_sync(Utc::now());
        database.save_snapshot(&self.store.snapshot())?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    pub async fn connect(&mut self) -> Result<ConnectionState> {
        self.sync_presence_targets().await?;
        Ok(self.transport.connect().await?)
    }

    /// Explicit reconnect, needed once automatic attempts are exhausted.
    pub async fn reconnect(&mut self) -> Result<ConnectionState> {
        self.sync_presence_targets().await?;
        Ok(self.transport.reconnect().await?)
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        Ok(self.transport.disconnect().await?)
    }

    async fn sync_presence_targets(&mut self) -> Result<()> {
        let targets: Vec<UserId> = self
            .store
            .peers()
            .into_iter()
            .map(|p| p.id)
            .filter(|id| !self.store.is_blocked(id))
            .collect();
        self.transport.set_presence_targets(targets).await?;
        self.targets_dirty = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------

    /// Open (or reopen) the direct chat with the owner of `peer`, caching
    /// the session derived from the verified bundle.
    pub fn start_chat(&mut self, peer: &PublicKeyBundle) -> Result<ChatId> {
        if self.store.is_blocked(&peer.user_id) {
            return Err(ClientError::Blocked(peer.user_id));
        }
        let now = Utc::now();
        let keys = keys::establish_session(&self.identity, peer, now)?;
        self.store.cache_session_keys(peer.user_id, keys);

        let (chat_id, created) = self.store.ensure_direct_chat(self.user_id(), peer.user_id, now);
        if self.store.upsert_peer(peer.user_id) {
            self.targets_dirty = true;
        }
        if created {
            info!(chat = %chat_id, peer = %peer.user_id.short(), "Chat started");
            self.emit(ClientEvent::ChatCreated {
                chat_id: chat_id.clone(),
                peer: peer.user_id,
            });
        }
        Ok(chat_id)
    }

    fn peer_of(&self, chat_id: &ChatId) -> Result<UserId> {
        if self.store.chat(chat_id).is_none() {
            return Err(ClientError::UnknownChat(chat_id.clone()));
        }
        chat_id
            .direct_peer(&self.user_id())
            .ok_or_else(|| ClientError::UnknownChat(chat_id.clone()))
    }

    /// Open `chat_id` on screen (or close the current chat with `None`).
    /// Incoming messages that become read are reported to their sender.
    pub async fn set_active_chat(&mut self, chat_id: Option<ChatId>) -> Result<Vec<MessageId>> {
        let read = self.store.set_active_chat(chat_id.clone());
        if read.is_empty() {
            return Ok(read);
        }
        if let Some(chat_id) = chat_id {
            let peer = self.peer_of(&chat_id)?;
            for id in &read {
                self.emit(ClientEvent::MessageUpdated {
                    message_id: id.clone(),
                    status: MessageStatus::Read,
                });
            }
            self.queue_receipt(EnvelopeKind::ReadReceipt, peer, read.clone());
            self.flush_outbox().await;
        }
        Ok(read)
    }

    pub async fn block_user(&mut self, user: UserId) -> Result<bool> {
        let changed = self.store.block(user);
        if changed {
            self.sync_presence_targets().await?;
        }
        Ok(changed)
    }

    pub async fn unblock_user(&mut self, user: &UserId) -> Result<bool> {
        let changed = self.store.unblock(user);
        if changed {
            self.sync_presence_targets().await?;
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Append `content` to `chat_id` as a sending message and hand it to the
    /// transport.
    ///
    /// `recipient_key` may supply the peer's bundle when no session is
    /// cached yet. Once the message is in the chat, any failure to encrypt
    /// or enqueue it leaves it `Failed`; the error is still returned.
    pub async fn send_encrypted_message(
        &mut self,
        chat_id: &ChatId,
        content: &str,
        recipient_key: Option<&PublicKeyBundle>,
    ) -> Result<MessageId> {
        self.send_new(chat_id, content, recipient_key, None).await
    }

    pub async fn send_reply(
        &mut self,
        chat_id: &ChatId,
        reply_to: &MessageId,
        content: &str,
    ) -> Result<MessageId> {
        match self.store.message(reply_to) {
            Some(m) if &m.chat_id == chat_id => {}
            _ => return Err(ClientError::UnknownMessage(reply_to.clone())),
        }
        self.send_new(chat_id, content, None, Some(reply_to.clone()))
            .await
    }

    /// Send a failed message again under its original id.
    pub async fn retry_message(&mut self, id: &MessageId) -> Result<()> {
        match self.store.message(id) {
            None => return Err(ClientError::UnknownMessage(id.clone())),
            Some(m) if !m.outgoing || !m.status.can_retry() => {
                return Err(ClientError::NotRetryable(id.clone()));
            }
            Some(_) => {}
        }
        self.store.mark_retrying(id);
        self.emit(ClientEvent::MessageUpdated {
            message_id: id.clone(),
            status: MessageStatus::Sending,
        });
        info!(msg_id = %id, "Retrying message");
        self.transmit(id, None).await
    }

    async fn send_new(
        &mut self,
        chat_id: &ChatId,
        content: &str,
        recipient_key: Option<&PublicKeyBundle>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        let me = self.user_id();
        let peer = self.peer_of(chat_id)?;
        if self.store.is_blocked(&peer) {
            return Err(ClientError::Blocked(peer));
        }
        if let Some(bundle) = recipient_key {
            if bundle.user_id != peer {
                return Err(IdentityError::BundleMismatch(peer.to_hex()).into());
            }
        }
        if content.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: content.len(),
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }

        let id = MessageId::generate();
        let mut message =
            Message::outgoing(id.clone(), chat_id.clone(), me, peer, content, wire_now());
        message.reply_to = reply_to;
        self.store.add_message(chat_id, message);
        self.store.clear_draft(chat_id);
        self.emit(ClientEvent::MessageAdded {
            chat_id: chat_id.clone(),
            message_id: id.clone(),
        });

        self.transmit(&id, recipient_key).await?;
        Ok(id)
    }

    /// Seal the stored message `id` and enqueue it. Any failure marks the
    /// message failed.
    async fn transmit(
        &mut self,
        id: &MessageId,
        recipient_key: Option<&PublicKeyBundle>,
    ) -> Result<()> {
        let result = self.try_transmit(id, recipient_key).await;
        if let Err(e) = &result {
            warn!(msg_id = %id, error = %e, "Send failed");
            self.in_flight.remove(id);
            self.set_status(id, MessageStatus::Failed);
        }
        result
    }

    async fn try_transmit(
        &mut self,
        id: &MessageId,
        recipient_key: Option<&PublicKeyBundle>,
    ) -> Result<()> {
        let envelope = self.seal_stored(id, recipient_key)?;
        self.in_flight.insert(id.clone(), Utc::now());
        match self.transport.send(envelope).await? {
            SendOutcome::Transmitted => debug!(msg_id = %id, "Message transmitted"),
            SendOutcome::Queued => info!(msg_id = %id, "Offline, message queued"),
        }
        Ok(())
    }

    fn seal_stored(
        &mut self,
        id: &MessageId,
        recipient_key: Option<&PublicKeyBundle>,
    ) -> Result<Envelope> {
        let message = self
            .store
            .message(id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownMessage(id.clone()))?;
        let keys = self.session_for(&message.recipient, recipient_key)?;
        let payload = keys::seal_message(
            &self.identity,
            &keys,
            Outgoing {
                id,
                to: &message.recipient,
                timestamp: &message.timestamp,
                content: &message.content,
                message_type: message.message_type,
                reply_to: message.reply_to.clone(),
            },
        )?;

        let (ciphertext, nonce) = (payload.ciphertext.clone(), payload.nonce.clone());
        self.store.update_message(id, |m| {
            m.ciphertext = Some(ciphertext);
            m.nonce = Some(nonce);
        });

        Ok(Envelope::with_id(
            id.clone(),
            EnvelopeKind::Message,
            message.sender,
            message.recipient,
            message.timestamp,
            &payload,
        )?)
    }

    /// The cached session with `peer`, re-established first when `bundle`
    /// differs from the cached one.
    fn session_for(
        &mut self,
        peer: &UserId,
        bundle: Option<&PublicKeyBundle>,
    ) -> Result<SessionKeys> {
        if let Some(bundle) = bundle {
            let stale = self
                .store
                .session_keys(peer)
                .map_or(true, |k| &k.bundle != bundle);
            if stale {
                let keys = keys::establish_session(&self.identity, bundle, Utc::now())?;
                self.store.cache_session_keys(*peer, keys);
            }
        }
        self.store
            .session_keys(peer)
            .cloned()
            .ok_or(ClientError::NoSession(*peer))
    }

    /// Tell the peer of `chat_id` whether we are typing. Dropped while
    /// offline.
    pub async fn send_typing(&mut self, chat_id: &ChatId, is_typing: bool) -> Result<()> {
        let peer = self.peer_of(chat_id)?;
        if !self.connection.is_connected() || self.store.is_blocked(&peer) {
            return Ok(());
        }
        let envelope = Envelope::new(
            EnvelopeKind::Typing,
            self.user_id(),
            peer,
            &TypingPayload {
                chat_id: chat_id.clone(),
                is_typing,
            },
        )?;
        self.transport.send(envelope).await?;
        Ok(())
    }

    fn set_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        let changed = self.store.update_status(id, status);
        if changed {
            self.emit(ClientEvent::MessageUpdated {
                message_id: id.clone(),
                status,
            });
        }
        changed
    }

    fn queue_receipt(&mut self, kind: EnvelopeKind, to: UserId, message_ids: Vec<MessageId>) {
        if self.store.is_blocked(&to) {
            return;
        }
        match Envelope::new(kind, self.user_id(), to, &ReceiptPayload { message_ids }) {
            Ok(envelope) => self.outbox.push(envelope),
            Err(e) => warn!(error = %e, "Failed to build receipt"),
        }
    }

    async fn flush_outbox(&mut self) {
        if self.targets_dirty {
            if let Err(e) = self.sync_presence_targets().await {
                warn!(error = %e, "Failed to update presence targets");
            }
        }
        for envelope in std::mem::take(&mut self.outbox) {
            let id = envelope.id.clone();
            if let Err(e) = self.transport.send(envelope).await {
                warn!(id = %id, error = %e, "Failed to send receipt");
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                debug!(?state, "Connection state changed");
                self.connection = state;
                self.emit(ClientEvent::Connection { state });
            }
            TransportEvent::Sent { envelope_id } => {
                if self.in_flight.remove(&envelope_id).is_some() {
                    self.set_status(&envelope_id, MessageStatus::Sent);
                }
            }
            TransportEvent::Rejected {
                envelope_id,
                reason,
            } => {
                if self.in_flight.remove(&envelope_id).is_some() {
                    warn!(msg_id = %envelope_id, reason = %reason, "Relay refused message");
                    self.set_status(&envelope_id, MessageStatus::Failed);
                }
            }
            TransportEvent::Inbound(envelope) => self.handle_inbound(envelope),
        }
        self.flush_outbox().await;
    }

    fn handle_inbound(&mut self, envelope: Envelope) {
        if envelope.to != self.user_id() {
            warn!(
                id = %envelope.id,
                to = %envelope.to.short(),
                "Envelope addressed to someone else"
            );
            return;
        }
        if self.store.is_blocked(&envelope.from) {
            debug!(
                id = %envelope.id,
                peer = %envelope.from.short(),
                "Dropping envelope from blocked user"
            );
            return;
        }
        if let Err(e) = dispatch(&envelope, self) {
            warn!(
                id = %envelope.id,
                kind = envelope.kind.as_str(),
                error = %e,
                "Malformed payload"
            );
            if envelope.kind == EnvelopeKind::Message {
                self.emit(ClientEvent::MessageRejected {
                    from: envelope.from,
                    message_id: envelope.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn apply_receipt(&mut self, from: &UserId, ids: &[MessageId], status: MessageStatus) {
        for id in ids {
            let ours = self
                .store
                .message(id)
                .is_some_and(|m| m.outgoing && &m.recipient == from);
            if ours {
                self.in_flight.remove(id);
                self.set_status(id, status);
            }
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Expire unacknowledged sends, stale typing indicators and silent
    /// peers as of `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let send_timeout = to_chrono(self.config.send_timeout);
        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, since)| now - **since > send_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.in_flight.remove(&id);
            if self.set_status(&id, MessageStatus::Failed) {
                warn!(msg_id = %id, "No acknowledgement before send timeout");
                match self.transport.discard(id.clone()).await {
                    Ok(true) => debug!(msg_id = %id, "Removed from offline queue"),
                    Ok(false) => {}
                    Err(e) => warn!(msg_id = %id, error = %e, "Failed to discard envelope"),
                }
            }
        }

        let pruned = self.store.prune_typing(now, to_chrono(self.config.typing_ttl));
        if pruned > 0 {
            debug!(pruned, "Typing indicators expired");
        }

        for user in self
            .store
            .expire_presence(now, to_chrono(self.config.presence_timeout))
        {
            self.emit(ClientEvent::Presence {
                user,
                status: PresenceStatus::Offline,
            });
        }
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

// ---------------------------------------------------------------------------
// Inbound handling
// ---------------------------------------------------------------------------

impl InboundHandler for Messenger {
    fn on_message(&mut self, envelope: &Envelope, payload: ChatPayload) {
        let now = Utc::now();
        let cached = self.store.session_keys(&envelope.from).cloned();
        let (keys, text) =
            match keys::open_message(&self.identity, envelope, &payload, cached.as_ref(), now) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(
                        msg_id = %envelope.id,
                        peer = %envelope.from.short(),
                        error = %e,
                        "Rejected inbound message"
                    );
                    self.emit(ClientEvent::MessageRejected {
                        from: envelope.from,
                        message_id: envelope.id.clone(),
                        reason: e.to_string(),
                    });
                    return;
                }
            };
        if cached.map_or(true, |c| c.bundle != keys.bundle) {
            self.store.cache_session_keys(envelope.from, keys);
        }

        let mut message = Message::incoming(
            envelope.id.clone(),
            envelope.from,
            envelope.to,
            text,
            envelope.timestamp,
        );
        message.message_type = payload.message_type;
        message.reply_to = payload.reply_to;
        if message.message_type == MessageType::System {
            debug!(msg_id = %envelope.id, "System message received");
        }

        let me = self.user_id();
        match self.store.route_incoming(&me, message, now) {
            RouteOutcome::Added {
                chat_id,
                new_chat,
                new_peer,
            } => {
                debug!(msg_id = %envelope.id, chat = %chat_id, "Message received");
                if new_peer {
                    self.targets_dirty = true;
                }
                if new_chat {
                    self.emit(ClientEvent::ChatCreated {
                        chat_id: chat_id.clone(),
                        peer: envelope.from,
                    });
                }
                if self.store.clear_typing(&chat_id, &envelope.from) {
                    self.emit(ClientEvent::Typing {
                        chat_id: chat_id.clone(),
                        user: envelope.from,
                        is_typing: false,
                    });
                }
                self.emit(ClientEvent::MessageAdded {
                    chat_id: chat_id.clone(),
                    message_id: envelope.id.clone(),
                });
                self.queue_receipt(
                    EnvelopeKind::DeliveryReceipt,
                    envelope.from,
                    vec![envelope.id.clone()],
                );

                let on_screen = self.store.active_chat() == Some(&chat_id);
                if on_screen && self.set_status(&envelope.id, MessageStatus::Read) {
                    self.queue_receipt(
                        EnvelopeKind::ReadReceipt,
                        envelope.from,
                        vec![envelope.id.clone()],
                    );
                }
            }
            RouteOutcome::Duplicate => {
                // The sender may have missed our first receipt
                debug!(msg_id = %envelope.id, "Duplicate message");
                self.queue_receipt(
                    EnvelopeKind::DeliveryReceipt,
                    envelope.from,
                    vec![envelope.id.clone()],
                );
            }
            RouteOutcome::Blocked => {}
        }
    }

    fn on_typing(&mut self, envelope: &Envelope, payload: TypingPayload) {
        let chat_id = ChatId::direct(&self.user_id(), &envelope.from);
        if payload.chat_id != chat_id {
            debug!(chat = %payload.chat_id, "Typing indicator for a foreign chat");
            return;
        }
        let changed = if payload.is_typing {
            self.store.set_typing(&chat_id, envelope.from, Utc::now())
        } else {
            self.store.clear_typing(&chat_id, &envelope.from)
        };
        if changed {
            self.emit(ClientEvent::Typing {
                chat_id,
                user: envelope.from,
                is_typing: payload.is_typing,
            });
        }
    }

    fn on_presence(&mut self, envelope: &Envelope, payload: PresencePayload) {
        if self
            .store
            .update_presence(&envelope.from, payload.status, Utc::now())
        {
            self.emit(ClientEvent::Presence {
                user: envelope.from,
                status: payload.status,
            });
        }
    }

    fn on_delivery_receipt(&mut self, envelope: &Envelope, payload: ReceiptPayload) {
        self.apply_receipt(&envelope.from, &payload.message_ids, MessageStatus::Delivered);
    }

    fn on_read_receipt(&mut self, envelope: &Envelope, payload: ReceiptPayload) {
        self.apply_receipt(&envelope.from, &payload.message_ids, MessageStatus::Read);
    }
}
