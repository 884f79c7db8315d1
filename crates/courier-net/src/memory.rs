//! In-process relay.
//!
//! Implements the same contract as `courier-relay` (register, ack, fan-out
//! keyed by user id) behind the [`Connector`] trait so transports and
//! clients can be exercised without sockets. The relay can be taken
//! offline, told to reject users, or told to stop acknowledging envelopes.
//!
//! Test-only: every accepted envelope is recorded for inspection and never
//! evicted. Compiled for this crate's tests and behind the `test-util`
//! feature for downstream crates.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use courier_shared::{Envelope, Frame, UserId};

use crate::error::TransportError;
use crate::link::{Connector, Link};

#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

struct RelayState {
    online: bool,
    acks_enabled: bool,
    rejected: HashSet<UserId>,
    connections: HashMap<u64, Connection>,
    next_conn: u64,
    delivered: Vec<Envelope>,
}

struct Connection {
    user: Option<UserId>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RelayState {
                online: true,
                acks_enabled: true,
                rejected: HashSet::new(),
                connections: HashMap::new(),
                next_conn: 0,
                delivered: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            relay: self.clone(),
        }
    }

    /// Taking the relay offline drops every live connection and refuses new
    /// ones until it is brought back.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state();
        state.online = online;
        if !online {
            state.connections.clear();
        }
    }

    pub fn reject_user(&self, user: UserId) {
        self.state().rejected.insert(user);
    }

    pub fn set_acks_enabled(&self, enabled: bool) {
        self.state().acks_enabled = enabled;
    }

    /// Every envelope the relay accepted, in arrival order.
    pub fn delivered(&self) -> Vec<Envelope> {
        self.state().delivered.clone()
    }

    pub fn delivered_to(&self, user: &UserId) -> Vec<Envelope> {
        self.state()
            .delivered
            .iter()
            .filter(|e| &e.to == user)
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, user: &UserId) -> bool {
        self.state()
            .connections
            .values()
            .any(|c| c.user.as_ref() == Some(user))
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    fn open(&self) -> Result<(u64, mpsc::UnboundedReceiver<Frame>), TransportError> {
        let mut state = self.state();
        if !state.online {
            return Err(TransportError::Connect("relay offline".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_conn;
        state.next_conn += 1;
        state.connections.insert(id, Connection { user: None, tx });
        Ok((id, rx))
    }

    fn close(&self, conn: u64) {
        self.state().connections.remove(&conn);
    }

    fn handle(&self, conn: u64, frame: &Frame) -> Result<(), TransportError> {
        let mut state = self.state();
        let registered = match state.connections.get(&conn) {
            Some(c) => c.user,
            None => return Err(TransportError::ConnectionLost),
        };

        match frame {
            Frame::Register { user_id, .. } => {
                let reply = if state.rejected.contains(user_id) {
                    Frame::Rejected {
                        reason: "user not allowed".into(),
                        id: None,
                    }
                } else {
                    if let Some(c) = state.connections.get_mut(&conn) {
                        c.user = Some(*user_id);
                    }
                    Frame::Registered { user_id: *user_id }
                };
                state.reply(conn, reply);
            }
            Frame::Envelope(envelope) => {
                if registered != Some(envelope.from) {
                    debug!(conn, "Dropping envelope from unregistered sender");
                    state.reply(
                        conn,
                        Frame::Rejected {
                            reason: "sender does not match registration".into(),
                            id: Some(envelope.id.clone()),
                        },
                    );
                    return Ok(());
                }

                state.delivered.push(envelope.clone());
                if state.acks_enabled {
                    state.reply(
                        conn,
                        Frame::Ack {
                            id: envelope.id.clone(),
                        },
                    );
                }
                for c in state.connections.values() {
                    if c.user == Some(envelope.to) {
                        let _ = c.tx.send(Frame::Envelope(envelope.clone()));
                    }
                }
            }
            // Relay-to-client frames are meaningless in this direction
            Frame::Registered { .. } | Frame::Rejected { .. } | Frame::Ack { .. } => {}
        }
        Ok(())
    }
}

impl RelayState {
    fn reply(&self, conn: u64, frame: Frame) {
        if let Some(c) = self.connections.get(&conn) {
            let _ = c.tx.send(frame);
        }
    }
}

// ---------------------------------------------------------------------------
// Connector / Link
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemoryConnector {
    relay: MemoryRelay,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Link>, TransportError> {
        let (conn, rx) = self.relay.open()?;
        Ok(Box::new(MemoryLink {
            relay: self.relay.clone(),
            conn,
            rx,
        }))
    }
}

struct MemoryLink {
    relay: MemoryRelay,
    conn: u64,
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.relay.handle(self.conn, frame)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.relay.close(self.conn);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.relay.close(self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::{EnvelopeKind, PresencePayload, PresenceStatus};

    fn presence(from: UserId, to: UserId) -> Envelope {
        Envelope::new(
            EnvelopeKind::Presence,
            from,
            to,
            &PresencePayload {
                status: PresenceStatus::Online,
            },
        )
        .unwrap()
    }

    async fn register(relay: &MemoryRelay, user: UserId) -> Box<dyn Link> {
        let mut link = relay.connector().connect().await.unwrap();
        link.send(&Frame::Register {
            user_id: user,
            protocol: "courier/1".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            link.recv().await.unwrap().unwrap(),
            Frame::Registered { user_id: user }
        );
        link
    }

    #[tokio::test]
    async fn test_envelope_is_acked_and_fanned_out() {
        let relay = MemoryRelay::new();
        let (a, b) = (UserId([1; 32]), UserId([2; 32]));
        let mut link_a = register(&relay, a).await;
        let mut link_b = register(&relay, b).await;

        let env = presence(a, b);
        link_a.send(&Frame::Envelope(env.clone())).await.unwrap();

        assert_eq!(
            link_a.recv().await.unwrap().unwrap(),
            Frame::Ack { id: env.id.clone() }
        );
        assert_eq!(
            link_b.recv().await.unwrap().unwrap(),
            Frame::Envelope(env.clone())
        );
        assert_eq!(relay.delivered_to(&b), vec![env]);
    }

    #[tokio::test]
    async fn test_spoofed_sender_is_dropped() {
        let relay = MemoryRelay::new();
        let (a, b) = (UserId([1; 32]), UserId([2; 32]));
        let mut link_a = register(&relay, a).await;

        let spoofed = presence(b, a);
        link_a
            .send(&Frame::Envelope(spoofed.clone()))
            .await
            .unwrap();
        assert!(matches!(
            link_a.recv().await.unwrap().unwrap(),
            Frame::Rejected { id: Some(id), .. } if id == spoofed.id
        ));
        assert!(relay.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_user_and_offline_relay() {
        let relay = MemoryRelay::new();
        let user = UserId([9; 32]);
        relay.reject_user(user);

        let mut link = relay.connector().connect().await.unwrap();
        link.send(&Frame::Register {
            user_id: user,
            protocol: "courier/1".into(),
        })
        .await
        .unwrap();
        assert!(matches!(
            link.recv().await.unwrap().unwrap(),
            Frame::Rejected { id: None, .. }
        ));

        relay.set_online(false);
        assert!(link.recv().await.is_none());
        assert!(relay.connector().connect().await.is_err());
    }
}
