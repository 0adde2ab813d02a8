use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    protocol::{
        ClientEvent, ErrorNotice, Frame, ServerEvent, TypingNotice, decode_client_event, encode,
    },
    record::{MessageRecord, Submission},
    relay::MessageRelay,
};

pub type ConnectionId = u64;

/// Number of events a connection may fall behind before it is told it lagged.
pub const DEFAULT_BROADCAST_BUFFER: usize = 128;

const COMMAND_BUFFER: usize = 256;
const SHUTDOWN_NOTICE: &str = "server shutting down";

/// One fan-out event. `exclude` names the connection that must not see it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exclude: Option<ConnectionId>,
    pub frame: Frame,
}

impl Delivery {
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        self.exclude != Some(connection)
    }
}

/// What a connection gets when it joins: its id, the relay contents at
/// the moment of joining, and a feed of everything broadcast after that.
pub struct Session {
    pub id: ConnectionId,
    pub snapshot: Vec<MessageRecord>,
    pub inbox: broadcast::Receiver<Delivery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub messages: usize,
    pub capacity: usize,
}

enum Command {
    Join {
        respond_to: oneshot::Sender<Session>,
    },
    Submit {
        submission: Submission,
        respond_to: oneshot::Sender<MessageRecord>,
    },
    Typing {
        from: ConnectionId,
        notice: TypingNotice,
    },
    StopTyping {
        from: ConnectionId,
    },
    Snapshot {
        respond_to: oneshot::Sender<Vec<MessageRecord>>,
    },
    Stats {
        respond_to: oneshot::Sender<HubStats>,
    },
    Shutdown,
}

/// Owner of the relay. All relay reads and writes happen on the hub task,
/// one command at a time.
pub struct Hub {
    relay: MessageRelay,
    broadcaster: broadcast::Sender<Delivery>,
    commands: mpsc::Receiver<Command>,
    next_id: ConnectionId,
}

impl Hub {
    pub fn spawn(relay: MessageRelay, broadcast_buffer: usize) -> (HubHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (broadcaster, _) = broadcast::channel(broadcast_buffer.max(1));
        let hub = Hub {
            relay,
            broadcaster,
            commands,
            next_id: 1,
        };
        let task = tokio::spawn(hub.run());
        (HubHandle { commands: command_tx }, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        debug!(messages = self.relay.len(), "hub stopped");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Join { respond_to } => {
                let id = self.next_id;
                self.next_id += 1;
                let session = Session {
                    id,
                    snapshot: self.relay.snapshot(),
                    inbox: self.broadcaster.subscribe(),
                };
                if respond_to.send(session).is_err() {
                    debug!(connection = id, "connection went away while joining");
                }
            }
            Command::Submit {
                submission,
                respond_to,
            } => {
                let record = self.relay.append(submission);
                debug!(id = %record.id, sender = %record.sender, kind = %record.kind(), "message appended");
                self.broadcast(None, &ServerEvent::Message(record.clone()));
                let _ = respond_to.send(record);
            }
            Command::Typing { from, notice } => {
                self.broadcast(Some(from), &ServerEvent::Typing(notice));
            }
            Command::StopTyping { from } => {
                self.broadcast(Some(from), &ServerEvent::StopTyping);
            }
            Command::Snapshot { respond_to } => {
                let _ = respond_to.send(self.relay.snapshot());
            }
            Command::Stats { respond_to } => {
                let _ = respond_to.send(HubStats {
                    messages: self.relay.len(),
                    capacity: self.relay.capacity(),
                });
            }
            Command::Shutdown => {
                info!("hub shutting down");
                self.broadcast(None, &ServerEvent::Error(ErrorNotice::new(SHUTDOWN_NOTICE)));
                return false;
            }
        }
        true
    }

    fn broadcast(&self, exclude: Option<ConnectionId>, event: &ServerEvent) {
        let frame = match Frame::encode(event) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to encode broadcast");
                return;
            }
        };
        // Sending only fails when nobody is connected, which is fine.
        if self.broadcaster.send(Delivery { exclude, frame }).is_err() {
            debug!("no connected peers for broadcast");
        }
    }
}

/// Cloneable handle used by connections and HTTP handlers to reach the hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl HubHandle {
    pub async fn join(&self) -> Result<Session, RelayError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Command::Join { respond_to }).await?;
        response.await.map_err(|_| RelayError::HubClosed)
    }

    /// Appends a message and broadcasts it to every connection.
    pub async fn submit(&self, submission: Submission) -> Result<MessageRecord, RelayError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Command::Submit {
            submission,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| RelayError::HubClosed)
    }

    pub async fn typing(&self, from: ConnectionId, notice: TypingNotice) -> Result<(), RelayError> {
        self.send(Command::Typing { from, notice }).await
    }

    pub async fn stop_typing(&self, from: ConnectionId) -> Result<(), RelayError> {
        self.send(Command::StopTyping { from }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<MessageRecord>, RelayError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Command::Snapshot { respond_to }).await?;
        response.await.map_err(|_| RelayError::HubClosed)
    }

    pub async fn stats(&self) -> Result<HubStats, RelayError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Command::Stats { respond_to }).await?;
        response.await.map_err(|_| RelayError::HubClosed)
    }

    /// Tells every connection the server is going away, then stops the hub.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<(), RelayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::HubClosed)
    }
}

pub async fn handle_socket(socket: WebSocket, hub: HubHandle, peer: SocketAddr) {
    if let Err(err) = run_connection(socket, &hub, peer).await {
        warn!(peer = %peer, error = ?err, "connection closed with error");
    }
}

async fn run_connection(mut socket: WebSocket, hub: &HubHandle, peer: SocketAddr) -> Result<()> {
    let Session {
        id,
        snapshot,
        mut inbox,
    } = hub.join().await?;
    info!(%peer, connection = id, history = snapshot.len(), "client connected");

    if !send_event(&mut socket, &ServerEvent::Messages(snapshot), id).await? {
        return Ok(());
    }

    loop {
        select! {
            incoming = socket.recv() => {
                if !handle_incoming(incoming, &mut socket, hub, id).await? {
                    break;
                }
            }
            delivery = inbox.recv() => {
                if !handle_delivery(delivery, &mut socket, id).await {
                    break;
                }
            }
        }
    }

    info!(%peer, connection = id, "client disconnected");
    Ok(())
}

async fn handle_incoming(
    incoming: Option<Result<Message, axum::Error>>,
    socket: &mut WebSocket,
    hub: &HubHandle,
    id: ConnectionId,
) -> Result<bool> {
    let text = match incoming {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Close(_))) | None => return Ok(false),
        Some(Ok(_)) => return Ok(true),
        Some(Err(err)) => {
            debug!(connection = id, error = ?err, "websocket receive failed");
            return Ok(false);
        }
    };

    match decode_client_event(&text) {
        // The sender learns about its own message through the broadcast.
        Ok(ClientEvent::Message(submission)) => {
            hub.submit(submission).await?;
        }
        Ok(ClientEvent::Typing(notice)) => hub.typing(id, notice).await?,
        Ok(ClientEvent::StopTyping) => hub.stop_typing(id).await?,
        Err(err) => {
            warn!(connection = id, error = %err, "rejected client event");
            return send_event(socket, &ServerEvent::Error(err.notice()), id).await;
        }
    }

    Ok(true)
}

async fn handle_delivery(
    delivery: Result<Delivery, broadcast::error::RecvError>,
    socket: &mut WebSocket,
    id: ConnectionId,
) -> bool {
    match delivery {
        Ok(delivery) if !delivery.is_for(id) => true,
        Ok(delivery) => send_text(socket, delivery.frame.as_str().to_owned(), id).await,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(connection = id, skipped, "client fell behind the broadcast");
            let warning = ServerEvent::Error(ErrorNotice::new(format!(
                "you are behind by {skipped} messages; consider reconnecting"
            )));
            match encode(&warning) {
                Ok(text) => send_text(socket, text, id).await,
                Err(_) => true,
            }
        }
        Err(broadcast::error::RecvError::Closed) => {
            let _ = socket.send(Message::Close(None)).await;
            false
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent, id: ConnectionId) -> Result<bool> {
    let text = encode(event)?;
    Ok(send_text(socket, text, id).await)
}

async fn send_text(socket: &mut WebSocket, text: String, id: ConnectionId) -> bool {
    if let Err(err) = socket.send(Message::Text(text)).await {
        debug!(connection = id, error = ?err, "failed to deliver frame");
        return false;
    }
    true
}
