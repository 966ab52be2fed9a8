use std::collections::BTreeSet;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{events::ServerEvent, models::ChatMessage};

use super::{BrokerError, Command, ConnId, RoomId};

/// Handle and command sender for the [`Broker`](super::Broker).
///
/// Cheap to clone; every websocket connection holds one.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
}

impl BrokerHandle {
    pub(super) fn new(cmd_tx: mpsc::UnboundedSender<Command>, token: CancellationToken) -> Self {
        Self { cmd_tx, token }
    }

    fn command(&self, cmd: Command) -> Result<(), BrokerError> {
        self.cmd_tx.send(cmd).map_err(|_| BrokerError::Closed)
    }

    /// Registers a connection for `user_id` and returns its id. Events for the
    /// connection are delivered through `conn_tx`.
    pub async fn connect(
        &self,
        user_id: impl Into<String>,
        conn_tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<ConnId, BrokerError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.command(Command::Connect {
            user_id: user_id.into(),
            conn_tx,
            res_tx,
        })?;

        res_rx.await.map_err(|_| BrokerError::Closed)
    }

    pub fn join(&self, conn: ConnId, room: impl Into<RoomId>) -> Result<(), BrokerError> {
        self.command(Command::Join { conn, room: room.into() })
    }

    pub fn leave(&self, conn: ConnId, room: impl Into<RoomId>) -> Result<(), BrokerError> {
        self.command(Command::Leave { conn, room: room.into() })
    }

    /// Queues a chat message from `conn`. Failures are reported to the
    /// connection as an error event, never to the caller.
    pub fn send_message(&self, conn: ConnId, room: impl Into<RoomId>, text: impl Into<String>) -> Result<(), BrokerError> {
        self.command(Command::Send {
            conn,
            room: room.into(),
            text: text.into(),
        })
    }

    /// Pushes `message` to everyone currently in its room. Nothing is persisted.
    pub fn publish(&self, message: ChatMessage) -> Result<(), BrokerError> {
        self.command(Command::Publish { message })
    }

    pub fn disconnect(&self, conn: ConnId) -> Result<(), BrokerError> {
        self.command(Command::Disconnect { conn })
    }

    /// Rooms `conn` is in, or `None` once it has disconnected.
    pub async fn rooms(&self, conn: ConnId) -> Result<Option<BTreeSet<RoomId>>, BrokerError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.command(Command::Rooms { conn, res_tx })?;
        res_rx.await.map_err(|_| BrokerError::Closed)
    }

    pub async fn members(&self, room: impl Into<RoomId>) -> Result<BTreeSet<ConnId>, BrokerError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.command(Command::Members {
            room: room.into(),
            res_tx,
        })?;
        res_rx.await.map_err(|_| BrokerError::Closed)
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
