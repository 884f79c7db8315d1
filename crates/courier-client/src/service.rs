//! Messenger task with the mpsc command pattern.
//!
//! [`Messenger::spawn`] moves the messenger into its own task. The task's
//! loop is the only place chat state changes: commands from the UI,
//! transport events and the housekeeping tick are handled one at a time.

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use courier_net::TransportEvent;
use courier_shared::{ChatId, ConnectionState, MessageId, PublicKeyBundle, UserId};
use courier_store::Snapshot;

use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::messenger::Messenger;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands sent *into* the messenger task.
#[derive(Debug)]
pub enum MessengerCommand {
    Connect(oneshot::Sender<Result<ConnectionState>>),
    Reconnect(oneshot::Sender<Result<ConnectionState>>),
    Disconnect(oneshot::Sender<Result<()>>),
    StartChat {
        bundle: PublicKeyBundle,
        reply: oneshot::Sender<Result<ChatId>>,
    },
    Send {
        chat_id: ChatId,
        content: String,
        recipient_key: Option<PublicKeyBundle>,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    Reply {
        chat_id: ChatId,
        reply_to: MessageId,
        content: String,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    Retry {
        id: MessageId,
        reply: oneshot::Sender<Result<()>>,
    },
    Typing {
        chat_id: ChatId,
        is_typing: bool,
    },
    SetActiveChat {
        chat_id: Option<ChatId>,
        reply: oneshot::Sender<Result<Vec<MessageId>>>,
    },
    SetDraft {
        chat_id: ChatId,
        text: String,
    },
    Block {
        user: UserId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Unblock {
        user: UserId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Snapshot(oneshot::Sender<Snapshot>),
    Persist(oneshot::Sender<Result<bool>>),
    /// Persist, stop the transport and end the task.
    Shutdown(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MessengerHandle {
    commands: mpsc::Sender<MessengerCommand>,
    events: broadcast::Sender<ClientEvent>,
    user_id: UserId,
}

impl MessengerHandle {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MessengerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn connect(&self) -> Result<ConnectionState> {
        self.request(MessengerCommand::Connect).await?
    }

    pub async fn reconnect(&self) -> Result<ConnectionState> {
        self.request(MessengerCommand::Reconnect).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(MessengerCommand::Disconnect).await?
    }

    pub async fn start_chat(&self, bundle: PublicKeyBundle) -> Result<ChatId> {
        self.request(|reply| MessengerCommand::StartChat { bundle, reply })
            .await?
    }

    pub async fn send_encrypted_message(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
        recipient_key: Option<PublicKeyBundle>,
    ) -> Result<MessageId> {
        let content = content.into();
        self.request(|reply| MessengerCommand::Send {
            chat_id,
            content,
            recipient_key,
            reply,
        })
        .await?
    }

    pub async fn send_reply(
        &self,
        chat_id: ChatId,
        reply_to: MessageId,
        content: impl Into<String>,
    ) -> Result<MessageId> {
        let content = content.into();
        self.request(|reply| MessengerCommand::Reply {
            chat_id,
            reply_to,
            content,
            reply,
        })
        .await?
    }

    pub async fn retry_message(&self, id: MessageId) -> Result<()> {
        self.request(|reply| MessengerCommand::Retry { id, reply })
            .await?
    }

    pub async fn send_typing(&self, chat_id: ChatId, is_typing: bool) -> Result<()> {
        self.commands
            .send(MessengerCommand::Typing { chat_id, is_typing })
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn set_active_chat(&self, chat_id: Option<ChatId>) -> Result<Vec<MessageId>> {
        self.request(|reply| MessengerCommand::SetActiveChat { chat_id, reply })
            .await?
    }

    pub async fn set_draft(&self, chat_id: ChatId, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.commands
            .send(MessengerCommand::SetDraft { chat_id, text })
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn block_user(&self, user: UserId) -> Result<bool> {
        self.request(|reply| MessengerCommand::Block { user, reply })
            .await?
    }

    pub async fn unblock_user(&self, user: UserId) -> Result<bool> {
        self.request(|reply| MessengerCommand::Unblock { user, reply })
            .await?
    }

    /// Copy of the persistable state, for rendering.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(MessengerCommand::Snapshot).await
    }

    pub async fn persist(&self) -> Result<bool> {
        self.request(MessengerCommand::Persist).await?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(MessengerCommand::Shutdown).await
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

impl Messenger {
    /// Move the messenger into its own task.
    pub fn spawn(
        self,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> MessengerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<MessengerCommand>(256);
        let handle = MessengerHandle {
            commands: cmd_tx,
            events: self.event_sender(),
            user_id: self.user_id(),
        };
        tokio::spawn(self.run(transport_events, cmd_rx));
        handle
    }

    /// The cooperative loop: transport events, commands and the
    /// housekeeping tick, one at a time.
    pub async fn run(
        mut self,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::Receiver<MessengerCommand>,
    ) {
        let mut housekeeping = tokio::time::interval(self.config.tick_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(user = %self.user_id().short(), "Messenger task started");

        let mut done: Option<oneshot::Sender<()>> = None;
        loop {
            tokio::select! {
                event = transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        warn!("Transport event channel closed");
                        break;
                    }
                },

                cmd = commands.recv() => match cmd {
                    Some(MessengerCommand::Shutdown(reply)) => {
                        info!("Messenger shutdown requested");
                        done = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        info!("Command channel closed, shutting down messenger");
                        break;
                    }
                },

                _ = housekeeping.tick() => self.tick(Utc::now()).await,
            }
        }

        if let Err(e) = self.persist() {
            error!(error = %e, "Failed to persist state on shutdown");
        }
        self.transport().shutdown().await;
        info!("Messenger task terminated");
        if let Some(reply) = done {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, cmd: MessengerCommand) {
        match cmd {
            MessengerCommand::Connect(reply) => {
                let _ = reply.send(self.connect().await);
            }
            MessengerCommand::Reconnect(reply) => {
                let _ = reply.send(self.reconnect().await);
            }
            MessengerCommand::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            MessengerCommand::StartChat { bundle, reply } => {
                let _ = reply.send(self.start_chat(&bundle));
            }
            MessengerCommand::Send {
                chat_id,
                content,
                recipient_key,
                reply,
            } => {
                let result = self
                    .send_encrypted_message(&chat_id, &content, recipient_key.as_ref())
                    .await;
                let _ = reply.send(result);
            }
            MessengerCommand::Reply {
                chat_id,
                reply_to,
                content,
                reply,
            } => {
                let _ = reply.send(self.send_reply(&chat_id, &reply_to, &content).await);
            }
            MessengerCommand::Retry { id, reply } => {
                let _ = reply.send(self.retry_message(&id).await);
            }
            MessengerCommand::Typing { chat_id, is_typing } => {
                if let Err(e) = self.send_typing(&chat_id, is_typing).await {
                    warn!(chat = %chat_id, error = %e, "Failed to send typing indicator");
                }
            }
            MessengerCommand::SetActiveChat { chat_id, reply } => {
                let _ = reply.send(self.set_active_chat(chat_id).await);
            }
            MessengerCommand::SetDraft { chat_id, text } => {
                self.store_mut().set_draft(&chat_id, text);
            }
            MessengerCommand::Block { user, reply } => {
                let _ = reply.send(self.block_user(user).await);
            }
            MessengerCommand::Unblock { user, reply } => {
                let _ = reply.send(self.unblock_user(&user).await);
            }
            MessengerCommand::Snapshot(reply) => {
                let _ = reply.send(self.store().snapshot());
            }
            MessengerCommand::Persist(reply) => {
                let _ = reply.send(self.persist());
            }
            MessengerCommand::Shutdown(_) => {}
        }
    }
}
