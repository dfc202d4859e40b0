//! The broker: routes RUN/CANCEL from clients to registered worker
//! slots and RESULTs back.
//!
//! All route-affecting decisions are serialized by one lock over the
//! switchboard; the lock is never held across a transport send.

mod switchboard;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::{Packet, PacketType, ResultCode};
use crate::transport::{ServerHandler, ServerTransport, TransportError};

pub use switchboard::{Route, RunDecision, Switchboard};

pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    client_transport: Arc<dyn ServerTransport>,
    worker_transport: Arc<dyn ServerTransport>,
    switchboard: Mutex<Switchboard>,
}

impl Broker {
    pub fn new(
        client_transport: Arc<dyn ServerTransport>,
        worker_transport: Arc<dyn ServerTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                client_transport,
                worker_transport,
                switchboard: Mutex::new(Switchboard::new()),
            }),
        }
    }

    /// Start both listeners. Workers register first in practice, but no
    /// ordering is required.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.inner
            .worker_transport
            .start(Arc::new(WorkerSide {
                inner: self.inner.clone(),
            }))
            .await?;
        self.inner
            .client_transport
            .start(Arc::new(ClientSide {
                inner: self.inner.clone(),
            }))
            .await?;
        tracing::info!("broker started");
        Ok(())
    }

    /// Send SHUTDOWN to every live worker and stop both transports.
    pub async fn shutdown(&self) {
        let workers = {
            let board = self.inner.switchboard.lock().await;
            board.live_workers()
        };
        for worker in workers {
            if let Err(err) = self
                .inner
                .worker_transport
                .send_packet(worker, Packet::shutdown())
                .await
            {
                tracing::debug!(worker = %worker, error = %err, "shutdown send failed");
            }
        }
        self.inner.client_transport.stop().await;
        self.inner.worker_transport.stop().await;
        tracing::info!("broker stopped");
    }
}

struct ClientSide {
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl ServerHandler for ClientSide {
    async fn on_connect(&self, conn: Uuid) {
        tracing::debug!(client = %conn, "client connected");
        self.inner.switchboard.lock().await.client_connected(conn);
    }

    async fn on_packet(&self, conn: Uuid, packet: Packet) {
        match packet.packet_type {
            PacketType::Run => self.inner.handle_run(conn, packet).await,
            PacketType::Cancel => self.inner.handle_cancel(conn, packet).await,
            other => {
                tracing::warn!(client = %conn, packet_type = ?other, "unexpected packet from client");
            }
        }
    }

    async fn on_disconnect(&self, conn: Uuid) {
        tracing::debug!(client = %conn, "client disconnected");
        let cancels = {
            let mut board = self.inner.switchboard.lock().await;
            board.client_disconnected(conn)
        };
        for (cookie, worker) in cancels {
            if let Err(err) = self
                .inner
                .worker_transport
                .send_packet(worker, Packet::cancel(cookie))
                .await
            {
                tracing::debug!(worker = %worker, error = %err, "cancel forward failed");
            }
        }
    }
}

struct WorkerSide {
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl ServerHandler for WorkerSide {
    async fn on_connect(&self, conn: Uuid) {
        tracing::debug!(worker = %conn, "worker connected");
        self.inner.switchboard.lock().await.worker_connected(conn);
    }

    async fn on_packet(&self, conn: Uuid, packet: Packet) {
        match packet.packet_type {
            PacketType::Register => {
                let capacity = packet.capacity.unwrap_or(0);
                tracing::debug!(worker = %conn, capacity, "worker registered capacity");
                self.inner.switchboard.lock().await.register(conn, capacity);
            }
            PacketType::Result => self.inner.handle_result(conn, packet).await,
            other => {
                tracing::warn!(worker = %conn, packet_type = ?other, "unexpected packet from worker");
            }
        }
    }

    async fn on_disconnect(&self, conn: Uuid) {
        tracing::debug!(worker = %conn, "worker disconnected");
        let lost = {
            let mut board = self.inner.switchboard.lock().await;
            board.worker_disconnected(conn)
        };
        for (cookie, client) in lost {
            let packet = Packet::result_code(
                cookie,
                ResultCode::WorkerLost,
                Some("the worker processing this run went away".to_string()),
            );
            if let Err(err) = self.inner.client_transport.send_packet(client, packet).await {
                tracing::debug!(client = %client, error = %err, "worker-lost notify failed");
            }
        }
    }
}

impl BrokerInner {
    async fn handle_run(&self, client: Uuid, packet: Packet) {
        let Some(cookie) = packet.cookie else {
            tracing::warn!(client = %client, "RUN without cookie dropped");
            return;
        };

        let decision = {
            let mut board = self.switchboard.lock().await;
            board.route_run(client, cookie)
        };

        match decision {
            RunDecision::Assigned(worker) => {
                tracing::debug!(client = %client, worker = %worker, cookie = %cookie, "run routed");
                if self
                    .worker_transport
                    .send_packet(worker, packet)
                    .await
                    .is_err()
                {
                    // The worker vanished between decision and send; its
                    // disconnect path will notify the client.
                    tracing::debug!(worker = %worker, cookie = %cookie, "run forward failed");
                }
            }
            RunDecision::NoWorker => {
                tracing::debug!(client = %client, cookie = %cookie, "no worker available");
                let packet = Packet::result_code(
                    cookie,
                    ResultCode::NoWorkerAvailable,
                    Some("no worker capacity is registered".to_string()),
                );
                let _ = self.client_transport.send_packet(client, packet).await;
            }
            RunDecision::DuplicateCookie => {
                tracing::warn!(client = %client, cookie = %cookie, "duplicate cookie");
                let packet = Packet::result_code(
                    cookie,
                    ResultCode::Error,
                    Some("cookie is already in use".to_string()),
                );
                let _ = self.client_transport.send_packet(client, packet).await;
            }
        }
    }

    async fn handle_cancel(&self, client: Uuid, packet: Packet) {
        let Some(cookie) = packet.cookie else {
            return;
        };
        let target = {
            let board = self.switchboard.lock().await;
            board.route_cancel(client, cookie)
        };
        // Unknown routes are ignored: the run already finished or never
        // existed; cancellation stays idempotent.
        if let Some(worker) = target {
            tracing::debug!(worker = %worker, cookie = %cookie, "cancel forwarded");
            let _ = self.worker_transport.send_packet(worker, packet).await;
        }
    }

    async fn handle_result(&self, worker: Uuid, packet: Packet) {
        let Some(cookie) = packet.cookie else {
            tracing::warn!(worker = %worker, "RESULT without cookie dropped");
            return;
        };
        let target = {
            let mut board = self.switchboard.lock().await;
            board.route_result(worker, cookie)
        };
        match target {
            Some(client) => {
                tracing::debug!(client = %client, cookie = %cookie, "result forwarded");
                let _ = self.client_transport.send_packet(client, packet).await;
            }
            None => {
                tracing::debug!(worker = %worker, cookie = %cookie, "orphan result discarded");
            }
        }
    }
}
