use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    events::ServerEvent,
    history::HistoryStore,
    identity::{Identity, IdentityError, IdentityResolver},
    models::ChatMessage,
};

use super::{BrokerHandle, ConnId, RoomId};

/// A command received by the [`Broker`].
pub enum Command {
    /// Registers a connection for the given external user id.
    Connect {
        user_id: String,
        conn_tx: mpsc::UnboundedSender<ServerEvent>,
        res_tx: oneshot::Sender<ConnId>,
    },

    Join {
        conn: ConnId,
        room: RoomId,
    },

    Leave {
        conn: ConnId,
        room: RoomId,
    },

    /// A chat message from a connection, not yet attributed to an author.
    Send {
        conn: ConnId,
        room: RoomId,
        text: String,
    },

    /// Result of the identity lookup started by a [`Command::Send`].
    Resolved {
        conn: ConnId,
        room: RoomId,
        text: String,
        identity: Result<Option<Identity>, IdentityError>,
    },

    /// Server-initiated fan-out of an already built message.
    Publish {
        message: ChatMessage,
    },

    Disconnect {
        conn: ConnId,
    },

    Rooms {
        conn: ConnId,
        res_tx: oneshot::Sender<Option<BTreeSet<RoomId>>>,
    },

    Members {
        room: RoomId,
        res_tx: oneshot::Sender<BTreeSet<ConnId>>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "Connect",
            Self::Join { .. } => "Join",
            Self::Leave { .. } => "Leave",
            Self::Send { .. } => "Send",
            Self::Resolved { .. } => "Resolved",
            Self::Publish { .. } => "Publish",
            Self::Disconnect { .. } => "Disconnect",
            Self::Rooms { .. } => "Rooms",
            Self::Members { .. } => "Members",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Connection {
    user_id: String,
    rooms: BTreeSet<RoomId>,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

/// Owner of the connection and room tables.
///
/// Call and spawn [`run`](Self::run) to start processing commands.
pub struct Broker {
    connections: BTreeMap<ConnId, Connection>,

    /// Map of room id to the connections currently in it. Rooms with no
    /// members are removed.
    rooms: BTreeMap<RoomId, BTreeSet<ConnId>>,

    identities: Arc<dyn IdentityResolver>,
    history: Arc<dyn HistoryStore>,

    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
}

impl Broker {
    pub fn new(identities: Arc<dyn IdentityResolver>, history: Arc<dyn HistoryStore>) -> (Self, BrokerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = BrokerHandle::new(cmd_tx.clone(), token.clone());

        (
            Self {
                connections: BTreeMap::new(),
                rooms: BTreeMap::new(),
                identities,
                history,
                cmd_tx,
                cmd_rx,
                token,
            },
            handle,
        )
    }

    pub async fn run(mut self) {
        loop {
            let cmd = tokio::select! {
                () = self.token.cancelled() => {
                    tracing::debug!("broker was cancelled");
                    break;
                }
                cmd = self.cmd_rx.recv() => cmd,
            };

            // the broker keeps a sender of its own, so the channel never closes
            let Some(cmd) = cmd else { break };
            tracing::trace!(?cmd, "processing command");
            self.process_command(cmd);
        }

        tracing::debug!(connections = self.connections.len(), "broker stopped");
    }

    fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { user_id, conn_tx, res_tx } => {
                let conn = self.connect(user_id, conn_tx);
                if res_tx.send(conn).is_err() {
                    // the caller went away before learning its id
                    self.disconnect(conn);
                }
            }
            Command::Join { conn, room } => self.join(conn, room),
            Command::Leave { conn, room } => self.leave(conn, &room),
            Command::Send { conn, room, text } => self.send(conn, room, text),
            Command::Resolved { conn, room, text, identity } => self.on_resolved(conn, room, text, identity),
            Command::Publish { message } => {
                let delivered = self.fan_out(&message.room_id, &ServerEvent::Message(message.clone()));
                tracing::debug!(room = %message.room_id, delivered, "published message");
            }
            Command::Disconnect { conn } => self.disconnect(conn),
            Command::Rooms { conn, res_tx } => {
                let rooms = self.connections.get(&conn).map(|connection| connection.rooms.clone());
                let _ = res_tx.send(rooms);
            }
            Command::Members { room, res_tx } => {
                let members = self.rooms.get(&room).cloned().unwrap_or_default();
                let _ = res_tx.send(members);
            }
        }
    }

    fn connect(&mut self, user_id: String, sender: mpsc::UnboundedSender<ServerEvent>) -> ConnId {
        let conn = Uuid::now_v7();
        tracing::info!(%conn, %user_id, "connected");

        self.connections.insert(
            conn,
            Connection {
                user_id,
                rooms: BTreeSet::new(),
                sender,
            },
        );

        conn
    }

    fn join(&mut self, conn: ConnId, room: RoomId) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            tracing::debug!(%conn, %room, "join from unknown connection ignored");
            return;
        };

        if connection.rooms.insert(room.clone()) {
            tracing::debug!(%conn, %room, "joined room");
        }
        self.rooms.entry(room).or_default().insert(conn);
    }

    fn leave(&mut self, conn: ConnId, room: &str) {
        if let Some(connection) = self.connections.get_mut(&conn) {
            if connection.rooms.remove(room) {
                tracing::debug!(%conn, %room, "left room");
            }
        }
        self.remove_member(room, conn);
    }

    fn disconnect(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            tracing::debug!(%conn, "already disconnected");
            return;
        };

        for room in &connection.rooms {
            self.remove_member(room, conn);
        }
        tracing::info!(%conn, user_id = %connection.user_id, rooms = connection.rooms.len(), "disconnected");
    }

    fn remove_member(&mut self, room: &str, conn: ConnId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    /// Starts resolving the sender's identity. The message itself is built
    /// once the lookup comes back as [`Command::Resolved`].
    fn send(&self, conn: ConnId, room: RoomId, text: String) {
        let Some(connection) = self.connections.get(&conn) else {
            tracing::debug!(%conn, %room, "send from unknown connection ignored");
            return;
        };

        if text.trim().is_empty() {
            self.send_to(conn, ServerEvent::room_error(room, "message text is empty"));
            return;
        }

        let user_id = connection.user_id.clone();
        let identities = Arc::clone(&self.identities);
        let cmd_tx = self.cmd_tx.clone();

        tokio::spawn(async move {
            let identity = identities.resolve(&user_id).await;
            // fails only once the broker has stopped
            let _ = cmd_tx.send(Command::Resolved { conn, room, text, identity });
        });
    }

    fn on_resolved(
        &mut self,
        conn: ConnId,
        room: RoomId,
        text: String,
        identity: Result<Option<Identity>, IdentityError>,
    ) {
        let identity = match identity {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                tracing::warn!(%conn, %room, "dropping message: sender's user was not found");
                self.send_to(conn, ServerEvent::room_error(room, "user not found"));
                return;
            }
            Err(err) => {
                tracing::error!(%conn, %room, error = %err, "dropping message: identity lookup failed");
                self.send_to(conn, ServerEvent::room_error(room, "could not resolve message author"));
                return;
            }
        };

        let message = ChatMessage::new(room, text, identity.into());

        let history = Arc::clone(&self.history);
        let stored = message.clone();
        tokio::spawn(async move {
            if let Err(err) = history.append(&stored).await {
                tracing::error!(id = %stored.id, room = %stored.room_id, error = %err, "failed to persist message");
            }
        });

        let delivered = self.fan_out(&message.room_id, &ServerEvent::Message(message.clone()));
        tracing::debug!(%conn, room = %message.room_id, delivered, "broadcast message");
    }

    /// Sends `event` to every current member of `room`, returning how many
    /// members it was handed to.
    fn fan_out(&self, room: &str, event: &ServerEvent) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in members {
            if let Some(Connection { sender, .. }) = self.connections.get(conn) {
                // errors if the client went away and its disconnect is still queued
                if sender.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn send_to(&self, conn: ConnId, event: ServerEvent) {
        if let Some(connection) = self.connections.get(&conn) {
            let _ = connection.sender.send(event);
        }
    }
}
