//! Duplex packet transports.
//!
//! A client transport carries one connection to a server; a server
//! transport accepts many. Both deliver incoming packets through handler
//! callbacks. Every implementation preserves packet order per connection
//! and always notifies disconnects.

mod framing;
mod memory;
mod stream;
mod tcp;
#[cfg(unix)]
mod unix;
mod uri;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::Packet;

pub use framing::{read_frame, write_frame, MAX_FRAME_BYTES};
pub use memory::{MemoryClientTransport, MemoryHub};
pub use tcp::{TcpClientTransport, TcpServerTransport};
#[cfg(unix)]
pub use unix::{UnixClientTransport, UnixServerTransport};
pub use uri::{client_transport, server_transport, TransportUri};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("invalid transport uri '{0}'")]
    InvalidUri(String),
    #[error("unsupported transport scheme in '{0}'")]
    UnsupportedScheme(String),
}

/// Receives packets for a client transport. `None` signals the
/// connection is gone; nothing follows it.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    async fn on_packet(&self, packet: Option<Packet>);
}

#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Connect and start delivering packets to the handler.
    async fn connect(&self, handler: Arc<dyn ClientHandler>) -> Result<(), TransportError>;

    /// Tear the connection down. The handler still receives its final
    /// `None`.
    async fn disconnect(&self);

    async fn send_packet(&self, packet: Packet) -> Result<(), TransportError>;
}

/// Receives connection lifecycle events and packets for a server
/// transport.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn on_connect(&self, conn: Uuid);
    async fn on_packet(&self, conn: Uuid, packet: Packet);
    async fn on_disconnect(&self, conn: Uuid);
}

#[async_trait]
pub trait ServerTransport: Send + Sync {
    async fn start(&self, handler: Arc<dyn ServerHandler>) -> Result<(), TransportError>;

    /// Stop accepting and close every connection.
    async fn stop(&self);

    async fn send_packet(&self, conn: Uuid, packet: Packet) -> Result<(), TransportError>;

    async fn close_connection(&self, conn: Uuid) -> Result<(), TransportError>;
}
