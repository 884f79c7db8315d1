//! Fan-out hub and the per-connection WebSocket session.
//!
//! Each WebSocket is one session. A `register` frame joins the session to
//! the channel of its user id; an `envelope` frame whose `from` matches that
//! id is acknowledged and copied to every live session registered as `to`.
//! Nothing is stored: an envelope for a user with no live session is
//! acknowledged and dropped.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_shared::constants::PROTOCOL_VERSION;
use courier_shared::{Envelope, Frame, UserId};

use crate::api::AppState;
use crate::error::RelayError;

type FrameSender = mpsc::UnboundedSender<Frame>;

/// Live sessions by user id. A user may hold several sessions at once.
#[derive(Default)]
pub struct Hub {
    channels: RwLock<HashMap<UserId, HashMap<Uuid, FrameSender>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user: UserId, conn: Uuid, tx: FrameSender) {
        let mut channels = self.channels.write().await;
        channels.entry(user).or_default().insert(conn, tx);
    }

    pub async fn unregister(&self, user: &UserId, conn: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(sessions) = channels.get_mut(user) {
            sessions.remove(&conn);
            if sessions.is_empty() {
                channels.remove(user);
            }
        }
    }

    /// Copy `envelope` to every session of its recipient. Returns how many
    /// sessions it reached.
    pub async fn fan_out(&self, envelope: &Envelope) -> usize {
        let channels = self.channels.read().await;
        let Some(sessions) = channels.get(&envelope.to) else {
            return 0;
        };
        sessions
            .values()
            .filter(|tx| tx.send(Frame::Envelope(envelope.clone())).is_ok())
            .count()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.channels.read().await.contains_key(user)
    }

    pub async fn user_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn session_count(&self) -> usize {
        self.channels.read().await.values().map(HashMap::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    conn: Uuid,
    user: Option<UserId>,
    tx: FrameSender,
}

impl Session {
    /// Handle one text frame. A refusal is answered with `rejected`, naming
    /// the envelope when the frame carried one.
    async fn handle_text(&mut self, state: &AppState, text: &str) {
        let (result, id) = match Frame::from_text(text) {
            Ok(frame) => {
                let id = match &frame {
                    Frame::Envelope(envelope) => Some(envelope.id.clone()),
                    _ => None,
                };
                (self.handle_frame(state, frame).await, id)
            }
            Err(e) => (Err(RelayError::from(e)), None),
        };

        if let Err(e) = result {
            debug!(conn = %self.conn, error = %e, "Frame rejected");
            self.reply(Frame::Rejected {
                reason: e.to_string(),
                id,
            });
        }
    }

    async fn handle_frame(&mut self, state: &AppState, frame: Frame) -> Result<(), RelayError> {
        match frame {
            Frame::Register { user_id, protocol } => {
                if protocol != PROTOCOL_VERSION {
                    return Err(RelayError::UnsupportedProtocol(protocol));
                }
                if let Some(previous) = self.user.replace(user_id) {
                    if previous != user_id {
                        state.hub.unregister(&previous, self.conn).await;
                    }
                }
                state.hub.register(user_id, self.conn, self.tx.clone()).await;
                info!(conn = %self.conn, user = %user_id.short(), "Session registered");
                self.reply(Frame::Registered { user_id });
            }
            Frame::Envelope(envelope) => {
                let registered = self.user.ok_or(RelayError::NotRegistered)?;
                if envelope.from != registered {
                    return Err(RelayError::sender_mismatch(&envelope.from, &registered));
                }
                if !state.user_limiter.check(registered).await {
                    return Err(RelayError::RateLimited);
                }

                let reached = state.hub.fan_out(&envelope).await;
                debug!(
                    id = %envelope.id,
                    kind = envelope.kind.as_str(),
                    to = %envelope.to.short(),
                    reached,
                    "Envelope relayed"
                );
                self.reply(Frame::Ack { id: envelope.id });
            }
            Frame::Registered { .. } => return Err(RelayError::UnexpectedFrame("registered")),
            Frame::Rejected { .. } => return Err(RelayError::UnexpectedFrame("rejected")),
            Frame::Ack { .. } => return Err(RelayError::UnexpectedFrame("ack")),
        }
        Ok(())
    }

    fn reply(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }
}

/// Drive one WebSocket until the client goes away.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    // Single writer per socket: replies and fanned-out envelopes share it
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    debug!(conn = %conn, "Session opened");
    let mut session = Session {
        conn,
        user: None,
        tx,
    };

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn = %conn, error = %e, "Socket error");
                break;
            }
        };

        session.handle_text(&state, &text).await;
    }

    if let Some(user) = session.user {
        state.hub.unregister(&user, conn).await;
    }
    // Last sender gone: the writer drains and closes the sink
    drop(session);
    let _ = writer.await;
    debug!(conn = %conn, "Session closed");
}
