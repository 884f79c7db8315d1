//! Relay transport task with the mpsc command/notification pattern.
//!
//! The task owns the relay link and the outbound queue. Application code
//! talks to it through a cloneable [`TransportHandle`] and receives
//! [`TransportEvent`]s on an unbounded channel, so the task never blocks
//! on a slow consumer.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use courier_shared::constants::PROTOCOL_VERSION;
use courier_shared::{
    ConnectionState, Envelope, EnvelopeKind, Frame, MessageId, PresencePayload, PresenceStatus,
    ProtocolError, UserId,
};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::link::{Connector, Link};
use crate::queue::OutboundQueue;

// ---------------------------------------------------------------------------
// Command / event types
// ---------------------------------------------------------------------------

/// Commands sent *into* the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Open the link (or retry immediately after the reconnect budget ran
    /// out). Replies with the state reached by the attempt.
    Connect(oneshot::Sender<ConnectionState>),
    /// Announce `offline`, close the link and stop reconnecting.
    Disconnect(oneshot::Sender<()>),
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<SendOutcome, TransportError>>,
    },
    /// Drop a still-queued envelope.
    Discard {
        id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    SetPresenceTargets(Vec<UserId>),
    GetState(oneshot::Sender<ConnectionState>),
    QueueLen(oneshot::Sender<usize>),
    Shutdown,
}

/// Notifications sent *from* the transport task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Inbound(Envelope),
    /// The relay acknowledged an envelope.
    Sent { envelope_id: MessageId },
    /// The relay refused an envelope. It is dropped and never resent.
    Rejected {
        envelope_id: MessageId,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the live link; a `Sent` event follows on ack.
    Transmitted,
    /// Held in the offline queue until the next connection.
    Queued,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<TransportCommand>,
    user_id: UserId,
}

impl TransportHandle {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TransportCommand,
    ) -> Result<T, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Open the link and register with the relay.
    pub async fn connect(&self) -> Result<ConnectionState, TransportError> {
        self.request(TransportCommand::Connect).await
    }

    /// Explicit reconnect trigger, required once the backoff budget is
    /// exhausted. Resets the attempt counter.
    pub async fn reconnect(&self) -> Result<ConnectionState, TransportError> {
        self.request(TransportCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.request(TransportCommand::Disconnect).await
    }

    pub async fn send(&self, envelope: Envelope) -> Result<SendOutcome, TransportError> {
        self.request(|reply| TransportCommand::Send { envelope, reply })
            .await?
    }

    pub async fn discard(&self, id: MessageId) -> Result<bool, TransportError> {
        self.request(|reply| TransportCommand::Discard { id, reply })
            .await
    }

    pub async fn set_presence_targets(&self, targets: Vec<UserId>) -> Result<(), TransportError> {
        self.commands
            .send(TransportCommand::SetPresenceTargets(targets))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn state(&self) -> Result<ConnectionState, TransportError> {
        self.request(TransportCommand::GetState).await
    }

    pub async fn queue_len(&self) -> Result<usize, TransportError> {
        self.request(TransportCommand::QueueLen).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(TransportCommand::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Spawn the transport task for `user_id`.
///
/// Returns the command handle and the event receiver. The task starts
/// disconnected; call [`TransportHandle::connect`] to open the link.
pub fn spawn_transport(
    user_id: UserId,
    connector: Arc<dyn Connector>,
    config: TransportConfig,
) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<TransportCommand>(256);
    let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

    let task = TransportTask {
        user_id,
        connector,
        queue: OutboundQueue::new(config.max_queue_len),
        config,
        link: None,
        state: ConnectionState::Disconnected,
        presence_targets: Vec::new(),
        wanted: false,
        attempt: 0,
        retry_at: None,
        events: event_tx,
    };
    tokio::spawn(task.run(cmd_rx));

    (
        TransportHandle {
            commands: cmd_tx,
            user_id,
        },
        event_rx,
    )
}

struct TransportTask {
    user_id: UserId,
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    link: Option<Box<dyn Link>>,
    state: ConnectionState,
    queue: OutboundQueue,
    presence_targets: Vec<UserId>,
    /// False after an explicit disconnect; a lost link is only re-dialled
    /// while this is set.
    wanted: bool,
    attempt: u32,
    retry_at: Option<Instant>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportTask {
    async fn run(mut self, mut commands: mpsc::Receiver<TransportCommand>) {
        // The first heartbeat goes out from `establish`
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(user = %self.user_id.short(), url = %self.config.relay_url, "Transport task started");

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(TransportCommand::Shutdown) => {
                            info!("Transport shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("Command channel closed, shutting down transport");
                            break;
                        }
                    }
                }

                frame = next_frame(&mut self.link) => self.handle_frame(frame).await,

                _ = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    debug!(attempt = self.attempt, "Reconnect timer fired");
                    self.establish().await;
                }

                _ = heartbeat.tick() => self.broadcast_presence(PresenceStatus::Online).await,
            }
        }

        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        info!("Transport event loop terminated");
    }

    async fn handle_command(&mut self, cmd: TransportCommand) {
        match cmd {
            TransportCommand::Connect(reply) => {
                self.connect().await;
                let _ = reply.send(self.state);
            }
            TransportCommand::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            TransportCommand::Send { envelope, reply } => {
                let _ = reply.send(self.send(envelope).await);
            }
            TransportCommand::Discard { id, reply } => {
                let removed = self.queue.discard(&id);
                if removed {
                    debug!(id = %id, "Queued envelope discarded");
                }
                let _ = reply.send(removed);
            }
            TransportCommand::SetPresenceTargets(targets) => {
                self.presence_targets = targets;
            }
            TransportCommand::GetState(reply) => {
                let _ = reply.send(self.state);
            }
            TransportCommand::QueueLen(reply) => {
                let _ = reply.send(self.queue.len());
            }
            TransportCommand::Shutdown => {}
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Frame, TransportError>>) {
        match frame {
            Some(Ok(Frame::Envelope(envelope))) => {
                debug!(id = %envelope.id, kind = envelope.kind.as_str(), "Envelope received");
                self.emit(TransportEvent::Inbound(envelope));
            }
            Some(Ok(Frame::Ack { id })) => {
                if self.queue.acknowledge(&id) {
                    debug!(id = %id, "Envelope acknowledged by relay");
                    self.emit(TransportEvent::Sent { envelope_id: id });
                }
            }
            Some(Ok(Frame::Rejected {
                reason,
                id: Some(id),
            })) => {
                warn!(id = %id, reason = %reason, "Relay rejected an envelope");
                if self.queue.reject(&id) {
                    self.emit(TransportEvent::Rejected {
                        envelope_id: id,
                        reason,
                    });
                }
            }
            Some(Ok(Frame::Rejected { reason, id: None })) => {
                warn!(reason = %reason, "Relay rejected a frame");
            }
            Some(Ok(other)) => {
                debug!(frame = ?other, "Ignoring unexpected frame");
            }
            Some(Err(TransportError::Frame(e))) => {
                warn!(error = %e, "Malformed frame from relay");
            }
            Some(Err(e)) => self.link_lost(e).await,
            None => self.link_lost("closed by relay").await,
        }
    }

    // -- connection lifecycle --

    async fn connect(&mut self) {
        self.wanted = true;
        if self.link.is_some() {
            return;
        }
        self.attempt = 0;
        self.retry_at = None;
        self.set_state(ConnectionState::Connecting);
        self.establish().await;
    }

    async fn establish(&mut self) {
        let handshake = open_link(self.connector.clone(), self.user_id);
        let result = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .unwrap_or(Err(TransportError::Timeout));

        match result {
            Ok(link) => {
                self.link = Some(link);
                self.attempt = 0;
                self.retry_at = None;
                info!(user = %self.user_id.short(), "Registered with relay");
                self.set_state(ConnectionState::Connected);
                self.flush_queue().await;
                self.broadcast_presence(PresenceStatus::Online).await;
            }
            Err(e) => {
                warn!(error = %e, attempt = self.attempt, "Relay connection failed");
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.config.reconnect.delay_for(self.attempt) {
            Some(delay) => {
                self.attempt += 1;
                self.retry_at = Some(Instant::now() + delay);
                info!(
                    attempt = self.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                self.set_state(ConnectionState::Reconnecting {
                    attempt: self.attempt,
                });
            }
            None => {
                self.retry_at = None;
                warn!(
                    attempts = self.attempt,
                    "Reconnect attempts exhausted, waiting for explicit reconnect"
                );
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn link_lost(&mut self, reason: impl std::fmt::Display) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        let requeued = self.queue.requeue_in_flight();
        warn!(reason = %reason, requeued, "Relay link lost");

        if self.wanted {
            self.attempt = 0;
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn disconnect(&mut self) {
        self.wanted = false;
        self.retry_at = None;
        self.attempt = 0;

        self.broadcast_presence(PresenceStatus::Offline).await;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        let requeued = self.queue.requeue_in_flight();
        info!(requeued, "Disconnected from relay");
        self.set_state(ConnectionState::Disconnected);
    }

    // -- outbound --

    async fn send(&mut self, envelope: Envelope) -> Result<SendOutcome, TransportError> {
        // The relay drops the link on an oversized frame; such an envelope
        // would otherwise be requeued and resent forever.
        let size = Frame::Envelope(envelope.clone()).to_text()?.len();
        if size > self.config.max_frame_bytes {
            warn!(
                id = %envelope.id,
                size,
                max = self.config.max_frame_bytes,
                "Envelope exceeds frame limit"
            );
            return Err(ProtocolError::TooLarge {
                size,
                max: self.config.max_frame_bytes,
            }
            .into());
        }

        if self.link.is_none() {
            debug!(id = %envelope.id, queued = self.queue.len() + 1, "Offline, queueing envelope");
            self.queue.push(envelope)?;
            return Ok(SendOutcome::Queued);
        }
        if self.transmit(envelope).await {
            Ok(SendOutcome::Transmitted)
        } else {
            Ok(SendOutcome::Queued)
        }
    }

    /// Write one tracked envelope. On failure the envelope goes back to the
    /// head of the queue and the link is torn down.
    async fn transmit(&mut self, envelope: Envelope) -> bool {
        let Some(link) = self.link.as_mut() else {
            self.queue.push_front(envelope);
            return false;
        };
        match link.send(&Frame::Envelope(envelope.clone())).await {
            Ok(()) => {
                debug!(id = %envelope.id, to = %envelope.to.short(), "Envelope transmitted");
                self.queue.mark_in_flight(envelope);
                true
            }
            Err(e) => {
                self.queue.push_front(envelope);
                self.link_lost(e).await;
                false
            }
        }
    }

    async fn flush_queue(&mut self) {
        let mut flushed = 0usize;
        while self.link.is_some() {
            let Some(envelope) = self.queue.pop_front() else {
                break;
            };
            if !self.transmit(envelope).await {
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed, "Offline queue drained");
        }
    }

    /// Untracked presence envelope to every target. No-op while offline.
    async fn broadcast_presence(&mut self, status: PresenceStatus) {
        for target in self.presence_targets.clone() {
            let envelope = match Envelope::new(
                EnvelopeKind::Presence,
                self.user_id,
                target,
                &PresencePayload { status },
            ) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Failed to build presence envelope");
                    return;
                }
            };
            let Some(link) = self.link.as_mut() else {
                return;
            };
            if let Err(e) = link.send(&Frame::Envelope(envelope)).await {
                self.link_lost(e).await;
                return;
            }
        }
    }

    // -- helpers --

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// Open a link and complete the registration handshake.
async fn open_link(
    connector: Arc<dyn Connector>,
    user_id: UserId,
) -> Result<Box<dyn Link>, TransportError> {
    let mut link = connector.connect().await?;
    link.send(&Frame::Register {
        user_id,
        protocol: PROTOCOL_VERSION.to_string(),
    })
    .await?;

    loop {
        match link.recv().await {
            Some(Ok(Frame::Registered { user_id: registered })) if registered == user_id => {
                return Ok(link);
            }
            Some(Ok(Frame::Rejected { reason, .. })) => {
                link.close().await;
                return Err(TransportError::Registration(reason));
            }
            Some(Ok(other)) => debug!(frame = ?other, "Ignoring frame before registration"),
            Some(Err(TransportError::Frame(e))) => {
                warn!(error = %e, "Malformed frame during registration");
            }
            Some(Err(e)) => return Err(e),
            None => return Err(TransportError::ConnectionLost),
        }
    }
}

/// Next frame from the link, or never while there is no link.
async fn next_frame(link: &mut Option<Box<dyn Link>>) -> Option<Result<Frame, TransportError>> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::memory::MemoryRelay;
    use courier_shared::{ReceiptPayload, TypingPayload};
    use std::time::Duration;

    const ALICE: UserId = UserId([1; 32]);
    const BOB: UserId = UserId([2; 32]);

    fn config() -> TransportConfig {
        TransportConfig {
            heartbeat_interval: Duration::from_secs(3600),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(400),
                max_attempts: 3,
            },
            ..TransportConfig::default()
        }
    }

    fn spawn(
        relay: &MemoryRelay,
        user: UserId,
        config: TransportConfig,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        spawn_transport(user, Arc::new(relay.connector()), config)
    }

    fn receipt(id: &str) -> Envelope {
        Envelope::new(
            EnvelopeKind::DeliveryReceipt,
            ALICE,
            BOB,
            &ReceiptPayload {
                message_ids: vec![MessageId::from(id)],
            },
        )
        .unwrap()
    }

    async fn next_state(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> ConnectionState {
        loop {
            match events.recv().await {
                Some(TransportEvent::StateChanged(state)) => return state,
                Some(_) => continue,
                None => panic!("transport closed"),
            }
        }
    }

    async fn next_sent(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> MessageId {
        loop {
            match events.recv().await {
                Some(TransportEvent::Sent { envelope_id }) => return envelope_id,
                Some(_) => continue,
                None => panic!("transport closed"),
            }
        }
    }

    fn non_presence(envelopes: Vec<Envelope>) -> Vec<Envelope> {
        envelopes
            .into_iter()
            .filter(|e| e.kind != EnvelopeKind::Presence)
            .collect()
    }

    #[tokio::test]
    async fn test_connect_registers_with_relay() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = spawn(&relay, ALICE, config());

        assert_eq!(handle.connect().await.unwrap(), ConnectionState::Connected);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert!(relay.is_registered(&ALICE));
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_offline_sends_drain_in_order_exactly_once() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = spawn(&relay, ALICE, config());

        let envelopes: Vec<_> = ["a", "b", "c"].iter().map(|id| receipt(id)).collect();
        for env in &envelopes {
            assert_eq!(handle.send(env.clone()).await.unwrap(), SendOutcome::Queued);
        }
        assert_eq!(handle.queue_len().await.unwrap(), 3);
        assert!(relay.delivered().is_empty());

        handle.connect().await.unwrap();

        for env in &envelopes {
            assert_eq!(next_sent(&mut events).await, env.id);
        }
        assert_eq!(non_presence(relay.delivered()), envelopes);
        assert_eq!(handle.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_while_connected_is_transmitted() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = spawn(&relay, ALICE, config());
        handle.connect().await.unwrap();

        let env = receipt("live");
        assert_eq!(
            handle.send(env.clone()).await.unwrap(),
            SendOutcome::Transmitted
        );
        assert_eq!(next_sent(&mut events).await, env.id);
    }

    #[tokio::test]
    async fn test_queue_full_is_reported() {
        let relay = MemoryRelay::new();
        let (handle, _events) = spawn(
            &relay,
            ALICE,
            TransportConfig {
                max_queue_len: 1,
                ..config()
            },
        );

        handle.send(receipt("one")).await.unwrap();
        assert!(matches!(
            handle.send(receipt("two")).await,
            Err(TransportError::QueueFull { capacity: 1 })
        ));
    }

    #[tokio::test]
    async fn test_discarded_envelope_is_never_sent() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = spawn(&relay, ALICE, config());

        let dropped = receipt("dropped");
        let kept = receipt("kept");
        handle.send(dropped.clone()).await.unwrap();
        handle.send(kept.clone()).await.unwrap();
        assert!(handle.discard(dropped.id.clone()).await.unwrap());
        assert!(!handle.discard(dropped.id.clone()).await.unwrap());

        handle.connect().await.unwrap();
        assert_eq!(next_sent(&mut events).await, kept.id);
        assert_eq!(non_presence(relay.delivered()), vec![kept]);
    }

    #[tokio::test]
    async fn test_registration_rejection_enters_reconnect_cycle() {
        let relay = MemoryRelay::new();
        relay.reject_user(ALICE);
        let (handle, _events) = spawn(&relay, ALICE, config());

        assert_eq!(
            handle.connect().await.unwrap(),
            ConnectionState::Reconnecting { attempt: 1 }
        );
        assert!(!relay.is_registered(&ALICE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhaustion_requires_explicit_reconnect() {
        let relay = MemoryRelay::new();
        relay.set_online(false);
        let (handle, mut events) = spawn(&relay, ALICE, config());
        let started = Instant::now();

        handle.connect().await.unwrap();

        let mut states = Vec::new();
        loop {
            let state = next_state(&mut events).await;
            states.push(state);
            if state == ConnectionState::Disconnected {
                break;
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Reconnecting { attempt: 1 },
                ConnectionState::Reconnecting { attempt: 2 },
                ConnectionState::Reconnecting { attempt: 3 },
                ConnectionState::Disconnected,
            ]
        );
        // 100 + 200 + 400 ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(700));

        // Nothing further happens on its own
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);

        relay.set_online(true);
        assert_eq!(handle.reconnect().await.unwrap(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_envelopes_are_resent_after_link_loss() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = spawn(&relay, ALICE, config());
        handle.connect().await.unwrap();

        relay.set_acks_enabled(false);
        let env = receipt("unacked");
        assert_eq!(
            handle.send(env.clone()).await.unwrap(),
            SendOutcome::Transmitted
        );

        relay.set_online(false);
        loop {
            if let ConnectionState::Reconnecting { .. } = next_state(&mut events).await {
                break;
            }
        }
        assert_eq!(handle.queue_len().await.unwrap(), 1);

        relay.set_acks_enabled(true);
        relay.set_online(true);
        assert_eq!(next_sent(&mut events).await, env.id);

        let resent: Vec<_> = non_presence(relay.delivered())
            .into_iter()
            .filter(|e| e.id == env.id)
            .collect();
        assert_eq!(resent.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_envelope_is_refused() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = spawn(
            &relay,
            ALICE,
            TransportConfig {
                max_frame_bytes: 1024,
                ..config()
            },
        );

        let ids: Vec<_> = (0..100).map(|i| MessageId(format!("id-{i}"))).collect();
        let big = Envelope::new(
            EnvelopeKind::DeliveryReceipt,
            ALICE,
            BOB,
            &ReceiptPayload { message_ids: ids },
        )
        .unwrap();

        assert!(matches!(
            handle.send(big.clone()).await,
            Err(TransportError::Frame(ProtocolError::TooLarge { max: 1024, .. }))
        ));
        assert_eq!(handle.queue_len().await.unwrap(), 0);

        handle.connect().await.unwrap();
        assert!(matches!(
            handle.send(big).await,
            Err(TransportError::Frame(ProtocolError::TooLarge { .. }))
        ));

        let small = receipt("small");
        assert_eq!(
            handle.send(small.clone()).await.unwrap(),
            SendOutcome::Transmitted
        );
        assert_eq!(next_sent(&mut events).await, small.id);
        assert_eq!(non_presence(relay.delivered()), vec![small]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_envelope_is_not_resent() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = spawn(&relay, ALICE, config());
        handle.connect().await.unwrap();

        // Signed as someone else, so the relay refuses it
        let forged = Envelope::new(
            EnvelopeKind::DeliveryReceipt,
            BOB,
            ALICE,
            &ReceiptPayload {
                message_ids: vec![MessageId::from("x")],
            },
        )
        .unwrap();
        assert_eq!(
            handle.send(forged.clone()).await.unwrap(),
            SendOutcome::Transmitted
        );

        loop {
            match events.recv().await {
                Some(TransportEvent::Rejected { envelope_id, .. }) => {
                    assert_eq!(envelope_id, forged.id);
                    break;
                }
                Some(TransportEvent::Sent { envelope_id }) => {
                    panic!("unexpected ack for {envelope_id}")
                }
                Some(_) => continue,
                None => panic!("transport closed"),
            }
        }

        relay.set_online(false);
        loop {
            if let ConnectionState::Reconnecting { .. } = next_state(&mut events).await {
                break;
            }
        }
        assert_eq!(handle.queue_len().await.unwrap(), 0);

        relay.set_online(true);
        while next_state(&mut events).await != ConnectionState::Connected {}
        let after = receipt("after");
        handle.send(after.clone()).await.unwrap();
        assert_eq!(next_sent(&mut events).await, after.id);
        assert!(relay.delivered().iter().all(|e| e.id != forged.id));
    }

    #[tokio::test]
    async fn test_heartbeat_and_offline_announcement() {
        let relay = MemoryRelay::new();
        let (handle, _events) = spawn(&relay, ALICE, config());
        handle.set_presence_targets(vec![BOB]).await.unwrap();
        handle.connect().await.unwrap();

        let online = relay.delivered_to(&BOB);
        assert_eq!(online.len(), 1);
        assert_eq!(
            online[0].payload::<PresencePayload>().unwrap().status,
            PresenceStatus::Online
        );

        handle.disconnect().await.unwrap();
        let all = relay.delivered_to(&BOB);
        assert_eq!(
            all.last().unwrap().payload::<PresencePayload>().unwrap().status,
            PresenceStatus::Offline
        );
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
        assert!(!relay.is_registered(&ALICE));
    }

    #[tokio::test]
    async fn test_inbound_envelopes_reach_recipient() {
        let relay = MemoryRelay::new();
        let (alice, _alice_events) = spawn(&relay, ALICE, config());
        let (bob, mut bob_events) = spawn(&relay, BOB, config());
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();

        let env = Envelope::new(
            EnvelopeKind::Typing,
            ALICE,
            BOB,
            &TypingPayload {
                chat_id: courier_shared::ChatId::direct(&ALICE, &BOB),
                is_typing: true,
            },
        )
        .unwrap();
        alice.send(env.clone()).await.unwrap();

        loop {
            match bob_events.recv().await {
                Some(TransportEvent::Inbound(received)) => {
                    assert_eq!(received, env);
                    break;
                }
                Some(_) => continue,
                None => panic!("transport closed"),
            }
        }
    }
}
