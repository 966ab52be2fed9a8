//! Forum room membership and live message fan-out.
//!
//! A single [`Broker`] task owns the membership tables and processes
//! [`Command`]s one at a time. Connections talk to it through a cloneable
//! [`BrokerHandle`]. Identity lookups and history writes run in spawned tasks
//! and report back to the broker as commands.

mod handle;
mod server;

use thiserror::Error;
use uuid::Uuid;

pub use handle::BrokerHandle;
pub use server::{Broker, Command};

pub type ConnId = Uuid;
pub type RoomId = String;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("room broker is not running")]
    Closed,
}
