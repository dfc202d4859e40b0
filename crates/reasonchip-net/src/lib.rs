//! # ReasonChip networking
//!
//! The broker–worker–client routing fabric: a typed packet protocol,
//! transport abstractions with TCP/UNIX/in-memory implementations, the
//! broker with its switchboard, the worker task manager and the client
//! multiplexor with its high-level API.

pub mod broker;
pub mod client;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use broker::{Broker, Switchboard};
pub use client::{Api, ClientError, Multiplexor, RunOutcome, Session};
pub use protocol::{Packet, PacketType, ResultCode};
pub use transport::{
    client_transport, server_transport, ClientHandler, ClientTransport, MemoryClientTransport,
    MemoryHub, ServerHandler, ServerTransport, TransportError, TransportUri,
};
pub use worker::{TaskManager, Worker, WorkerError};
