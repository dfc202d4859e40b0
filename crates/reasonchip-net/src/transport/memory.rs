//! In-process transports for deterministic tests.
//!
//! A `MemoryHub` plays the server side; `MemoryClientTransport`s attach
//! to it directly. Packets are delivered inline on the caller's task so
//! per-connection ordering is exact.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ClientHandler, ClientTransport, ServerHandler, ServerTransport, TransportError};
use crate::protocol::Packet;

#[derive(Default)]
pub struct MemoryHub {
    handler: RwLock<Option<Arc<dyn ServerHandler>>>,
    clients: RwLock<HashMap<Uuid, Arc<dyn ClientHandler>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn server_handler(&self) -> Option<Arc<dyn ServerHandler>> {
        self.handler.read().await.clone()
    }

    async fn attach(
        &self,
        id: Uuid,
        client: Arc<dyn ClientHandler>,
    ) -> Result<(), TransportError> {
        let handler = self
            .server_handler()
            .await
            .ok_or(TransportError::NotConnected)?;
        self.clients.write().await.insert(id, client);
        handler.on_connect(id).await;
        Ok(())
    }

    async fn detach(&self, id: Uuid) {
        let removed = self.clients.write().await.remove(&id);
        if let Some(client) = removed {
            client.on_packet(None).await;
            if let Some(handler) = self.server_handler().await {
                handler.on_disconnect(id).await;
            }
        }
    }

    async fn from_client(&self, id: Uuid, packet: Packet) -> Result<(), TransportError> {
        let handler = self
            .server_handler()
            .await
            .ok_or(TransportError::Closed)?;
        if !self.clients.read().await.contains_key(&id) {
            return Err(TransportError::Closed);
        }
        handler.on_packet(id, packet).await;
        Ok(())
    }
}

#[async_trait]
impl ServerTransport for MemoryHub {
    async fn start(&self, handler: Arc<dyn ServerHandler>) -> Result<(), TransportError> {
        *self.handler.write().await = Some(handler);
        Ok(())
    }

    async fn stop(&self) {
        *self.handler.write().await = None;
        let clients: Vec<_> = self.clients.write().await.drain().collect();
        for (_, client) in clients {
            client.on_packet(None).await;
        }
    }

    async fn send_packet(&self, conn: Uuid, packet: Packet) -> Result<(), TransportError> {
        let client = {
            let clients = self.clients.read().await;
            clients
                .get(&conn)
                .cloned()
                .ok_or(TransportError::UnknownConnection(conn))?
        };
        client.on_packet(Some(packet)).await;
        Ok(())
    }

    async fn close_connection(&self, conn: Uuid) -> Result<(), TransportError> {
        self.detach(conn).await;
        Ok(())
    }
}

pub struct MemoryClientTransport {
    hub: Arc<MemoryHub>,
    id: Uuid,
    connected: RwLock<bool>,
}

impl MemoryClientTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self {
            hub,
            id: Uuid::new_v4(),
            connected: RwLock::new(false),
        }
    }

    /// The connection id the hub knows this client by.
    pub fn connection_id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl ClientTransport for MemoryClientTransport {
    async fn connect(&self, handler: Arc<dyn ClientHandler>) -> Result<(), TransportError> {
        self.hub.attach(self.id, handler).await?;
        *self.connected.write().await = true;
        Ok(())
    }

    async fn disconnect(&self) {
        let was_connected = {
            let mut connected = self.connected.write().await;
            std::mem::replace(&mut *connected, false)
        };
        if was_connected {
            self.hub.detach(self.id).await;
        }
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        if !*self.connected.read().await {
            return Err(TransportError::NotConnected);
        }
        self.hub.from_client(self.id, packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct EchoServer {
        hub: Arc<MemoryHub>,
    }

    #[async_trait]
    impl ServerHandler for EchoServer {
        async fn on_connect(&self, _conn: Uuid) {}
        async fn on_packet(&self, conn: Uuid, packet: Packet) {
            let _ = self.hub.send_packet(conn, packet).await;
        }
        async fn on_disconnect(&self, _conn: Uuid) {}
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Option<Packet>>,
    }

    #[async_trait]
    impl ClientHandler for Recorder {
        async fn on_packet(&self, packet: Option<Packet>) {
            let _ = self.tx.send(packet);
        }
    }

    #[test]
    fn test_echo_and_disconnect_sentinel() {
        tokio_test::block_on(async {
            let hub = MemoryHub::new();
            hub.start(Arc::new(EchoServer { hub: hub.clone() }))
                .await
                .unwrap();

            let client = MemoryClientTransport::new(hub.clone());
            let (tx, mut rx) = mpsc::unbounded_channel();
            client.connect(Arc::new(Recorder { tx })).await.unwrap();

            client.send_packet(Packet::shutdown()).await.unwrap();
            assert!(rx.recv().await.unwrap().is_some());

            client.disconnect().await;
            assert!(rx.recv().await.unwrap().is_none());
            assert!(client.send_packet(Packet::shutdown()).await.is_err());
        });
    }
}
