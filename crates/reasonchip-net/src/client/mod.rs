//! Client side: the multiplexor demultiplexes per-session packet
//! streams arriving over one shared broker transport.

mod api;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::protocol::{Packet, PacketType};
use crate::transport::{ClientHandler, ClientTransport, TransportError};

pub use api::{Api, RunOutcome};

/// Bound on each session's incoming-packet queue. A session that lets
/// its queue fill is considered stalled and loses further packets.
pub const SESSION_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection to the broker was lost")]
    BrokerLost,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum SessionMsg {
    Packet(Packet),
    BrokerLost,
}

struct SessionEntry {
    tx: mpsc::Sender<SessionMsg>,
    cookies: Vec<Uuid>,
}

#[derive(Default)]
struct MuxState {
    sessions: HashMap<Uuid, SessionEntry>,
    /// Which session is waiting on each in-flight cookie.
    cookies: HashMap<Uuid, Uuid>,
    poisoned: bool,
}

pub struct Multiplexor {
    transport: Arc<dyn ClientTransport>,
    state: Arc<Mutex<MuxState>>,
}

impl Multiplexor {
    pub fn new(transport: Arc<dyn ClientTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            state: Arc::new(Mutex::new(MuxState::default())),
        })
    }

    /// Connect the shared transport and start dispatching.
    pub async fn start(&self) -> Result<(), ClientError> {
        let handler = Arc::new(MuxHandler {
            state: self.state.clone(),
        });
        self.transport.connect(handler).await?;
        tracing::debug!("multiplexor started");
        Ok(())
    }

    /// Disconnect. Every open session observes `BrokerLost` on its next
    /// receive.
    pub async fn stop(&self) {
        self.transport.disconnect().await;
        poison(&mut *self.state.lock().await);
    }

    /// Open a logical session with a fresh connection id.
    pub async fn register_session(self: &Arc<Self>) -> Result<Session, ClientError> {
        let mut state = self.state.lock().await;
        if state.poisoned {
            return Err(ClientError::BrokerLost);
        }
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        state.sessions.insert(
            id,
            SessionEntry {
                tx,
                cookies: Vec::new(),
            },
        );
        tracing::debug!(session = %id, "session registered");
        Ok(Session {
            id,
            rx,
            mux: self.clone(),
        })
    }

    /// Drop a session and its pending cookie mappings.
    pub async fn release_session(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.sessions.remove(&id) {
            for cookie in entry.cookies {
                state.cookies.remove(&cookie);
            }
            tracing::debug!(session = %id, "session released");
        }
    }

    /// Send on behalf of a session. A packet without a cookie is stamped
    /// with the session's connection id; the cookie is recorded so the
    /// response finds its way back.
    pub async fn send(&self, session: Uuid, mut packet: Packet) -> Result<Uuid, ClientError> {
        let cookie = {
            let mut state = self.state.lock().await;
            if state.poisoned {
                return Err(ClientError::BrokerLost);
            }
            let entry = state
                .sessions
                .get_mut(&session)
                .ok_or(ClientError::BrokerLost)?;
            let cookie = *packet.cookie.get_or_insert(session);
            if !entry.cookies.contains(&cookie) {
                entry.cookies.push(cookie);
            }
            state.cookies.insert(cookie, session);
            cookie
        };
        self.transport.send_packet(packet).await?;
        Ok(cookie)
    }
}

fn poison(state: &mut MuxState) {
    if state.poisoned {
        return;
    }
    state.poisoned = true;
    for entry in state.sessions.values() {
        let tx = entry.tx.clone();
        // The sentinel must arrive even when the queue is momentarily
        // full; delivery order past this point no longer matters.
        tokio::spawn(async move {
            let _ = tx.send(SessionMsg::BrokerLost).await;
        });
    }
    state.cookies.clear();
    tracing::warn!("broker connection lost; sessions poisoned");
}

struct MuxHandler {
    state: Arc<Mutex<MuxState>>,
}

#[async_trait]
impl ClientHandler for MuxHandler {
    async fn on_packet(&self, packet: Option<Packet>) {
        let mut state = self.state.lock().await;
        let Some(packet) = packet else {
            poison(&mut state);
            return;
        };

        let Some(cookie) = packet.cookie else {
            tracing::warn!("packet without cookie dropped");
            return;
        };
        let Some(&session) = state.cookies.get(&cookie) else {
            tracing::warn!(cookie = %cookie, "packet with unknown cookie dropped");
            return;
        };

        let is_result = packet.packet_type == PacketType::Result;
        if let Some(entry) = state.sessions.get_mut(&session) {
            if let Err(err) = entry.tx.try_send(SessionMsg::Packet(packet)) {
                tracing::warn!(session = %session, error = %err, "session queue full; packet dropped");
            }
            if is_result {
                entry.cookies.retain(|c| *c != cookie);
            }
        }
        if is_result {
            state.cookies.remove(&cookie);
        }
    }
}

/// A logical client session handle.
pub struct Session {
    id: Uuid,
    rx: mpsc::Receiver<SessionMsg>,
    mux: Arc<Multiplexor>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn send(&self, packet: Packet) -> Result<Uuid, ClientError> {
        self.mux.send(self.id, packet).await
    }

    /// Block until a packet or the broker-lost sentinel arrives.
    pub async fn recv(&mut self) -> Result<Packet, ClientError> {
        match self.rx.recv().await {
            Some(SessionMsg::Packet(packet)) => Ok(packet),
            Some(SessionMsg::BrokerLost) | None => Err(ClientError::BrokerLost),
        }
    }

    /// Release the session, draining anything pending.
    pub async fn release(self) {
        self.mux.release_session(self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultCode;
    use crate::transport::{MemoryClientTransport, MemoryHub, ServerHandler, ServerTransport};
    use serde_json::json;

    /// Broker stand-in that answers every RUN with an immediate OK.
    struct InstantBroker {
        hub: Arc<MemoryHub>,
    }

    #[async_trait]
    impl ServerHandler for InstantBroker {
        async fn on_connect(&self, _conn: Uuid) {}
        async fn on_packet(&self, conn: Uuid, packet: Packet) {
            if packet.packet_type == PacketType::Run {
                let reply = Packet::result_ok(packet.cookie.unwrap(), json!("done"));
                let _ = self.hub.send_packet(conn, reply).await;
            }
        }
        async fn on_disconnect(&self, _conn: Uuid) {}
    }

    #[test]
    fn test_session_roundtrip() {
        tokio_test::block_on(async {
            let hub = MemoryHub::new();
            hub.start(Arc::new(InstantBroker { hub: hub.clone() }))
                .await
                .unwrap();

            let mux = Multiplexor::new(Arc::new(MemoryClientTransport::new(hub.clone())));
            mux.start().await.unwrap();

            let mut session = mux.register_session().await.unwrap();
            let cookie = session
                .send(Packet::run(Uuid::new_v4(), "p", json!({})))
                .await
                .unwrap();
            let reply = session.recv().await.unwrap();
            assert_eq!(reply.cookie, Some(cookie));
            assert_eq!(reply.rc, Some(ResultCode::Ok));
            session.release().await;
        });
    }

    #[test]
    fn test_stop_poisons_sessions() {
        tokio_test::block_on(async {
            let hub = MemoryHub::new();
            hub.start(Arc::new(InstantBroker { hub: hub.clone() }))
                .await
                .unwrap();

            let mux = Multiplexor::new(Arc::new(MemoryClientTransport::new(hub.clone())));
            mux.start().await.unwrap();
            let mut session = mux.register_session().await.unwrap();

            mux.stop().await;
            assert!(matches!(
                session.recv().await,
                Err(ClientError::BrokerLost)
            ));
            // New sessions are refused once poisoned.
            assert!(mux.register_session().await.is_err());
        });
    }
}
