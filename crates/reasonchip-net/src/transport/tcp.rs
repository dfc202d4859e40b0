//! TCP stream transports.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::stream::{spawn_client_connection, spawn_server_connection, ClientConnection, ConnectionMap};
use super::{ClientHandler, ClientTransport, ServerHandler, ServerTransport, TransportError};
use crate::protocol::Packet;

pub struct TcpServerTransport {
    addr: String,
    cancel: Mutex<Option<CancellationToken>>,
    connections: ConnectionMap,
}

impl TcpServerTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            cancel: Mutex::new(None),
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    async fn start(&self, handler: Arc<dyn ServerHandler>) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.addr).await?;
        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let connections = self.connections.clone();
        let addr = self.addr.clone();
        tokio::spawn(async move {
            tracing::info!(%addr, "tcp server listening");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let id = Uuid::new_v4();
                            tracing::debug!(conn = %id, %peer, "accepted connection");
                            let _ = stream.set_nodelay(true);
                            spawn_server_connection(
                                stream,
                                id,
                                handler.clone(),
                                connections.clone(),
                                &cancel,
                            )
                            .await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
            }
            tracing::info!(%addr, "tcp server stopped");
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        self.connections.write().await.clear();
    }

    async fn send_packet(&self, conn: Uuid, packet: Packet) -> Result<(), TransportError> {
        let tx = {
            let connections = self.connections.read().await;
            connections
                .get(&conn)
                .map(|handle| handle.tx.clone())
                .ok_or(TransportError::UnknownConnection(conn))?
        };
        tx.send(packet)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close_connection(&self, conn: Uuid) -> Result<(), TransportError> {
        let connections = self.connections.read().await;
        let handle = connections
            .get(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        handle.cancel.cancel();
        Ok(())
    }
}

pub struct TcpClientTransport {
    addr: String,
    connection: Mutex<Option<ClientConnection>>,
}

impl TcpClientTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClientTransport for TcpClientTransport {
    async fn connect(&self, handler: Arc<dyn ClientHandler>) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.addr).await?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(addr = %self.addr, "connected");
        *self.connection.lock().await = Some(spawn_client_connection(stream, handler));
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.cancel.cancel();
        }
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        let tx = {
            let connection = self.connection.lock().await;
            connection
                .as_ref()
                .map(|c| c.tx.clone())
                .ok_or(TransportError::NotConnected)?
        };
        tx.send(packet)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct RecordingServer {
        events: mpsc::UnboundedSender<(Uuid, Option<Packet>)>,
        transport: Arc<TcpServerTransport>,
    }

    #[async_trait]
    impl ServerHandler for RecordingServer {
        async fn on_connect(&self, _conn: Uuid) {}
        async fn on_packet(&self, conn: Uuid, packet: Packet) {
            // Echo RESULT back so the client side is exercised too.
            let _ = self
                .transport
                .send_packet(conn, Packet::result_ok(packet.cookie.unwrap(), json!(1)))
                .await;
            let _ = self.events.send((conn, Some(packet)));
        }
        async fn on_disconnect(&self, conn: Uuid) {
            let _ = self.events.send((conn, None));
        }
    }

    struct RecordingClient {
        packets: mpsc::UnboundedSender<Option<Packet>>,
    }

    #[async_trait]
    impl ClientHandler for RecordingClient {
        async fn on_packet(&self, packet: Option<Packet>) {
            let _ = self.packets.send(packet);
        }
    }

    #[test]
    fn test_tcp_roundtrip_and_disconnect_notification() {
        tokio_test::block_on(async {
            // Learn a free port first, then hand the address around.
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = probe.local_addr().unwrap().to_string();
            drop(probe);
            let server = Arc::new(TcpServerTransport::new(addr.clone()));

            let (server_events_tx, mut server_events) = mpsc::unbounded_channel();
            server
                .start(Arc::new(RecordingServer {
                    events: server_events_tx,
                    transport: server.clone(),
                }))
                .await
                .unwrap();

            let client = TcpClientTransport::new(addr);
            let (client_packets_tx, mut client_packets) = mpsc::unbounded_channel();
            client
                .connect(Arc::new(RecordingClient {
                    packets: client_packets_tx,
                }))
                .await
                .unwrap();

            let cookie = Uuid::new_v4();
            client
                .send_packet(Packet::run(cookie, "p", json!({})))
                .await
                .unwrap();

            let (_conn, received) = server_events.recv().await.unwrap();
            assert_eq!(received.unwrap().cookie, Some(cookie));

            let echoed = client_packets.recv().await.unwrap().unwrap();
            assert_eq!(echoed.packet_type, PacketType::Result);

            client.disconnect().await;
            let (_conn, disconnect) = server_events.recv().await.unwrap();
            assert!(disconnect.is_none());

            server.stop().await;
        });
    }
}
