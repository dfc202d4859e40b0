//! Worker side: executes engine runs for RUN packets under a bounded
//! concurrency limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use reasonchip_core::Engine;

use crate::protocol::{Packet, PacketType, ResultCode};
use crate::transport::{client_transport, ClientHandler, ClientTransport, TransportError, TransportUri};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection to the broker was lost")]
    ConnectionLost,
}

struct RunningTask {
    token: CancellationToken,
}

struct ManagerInner {
    engine: Arc<Engine>,
    transport: Arc<dyn ClientTransport>,
    capacity: usize,
    tasks: Mutex<HashMap<Uuid, RunningTask>>,
    draining: AtomicBool,
    task_done: Notify,
    lost: CancellationToken,
}

/// Manages engine runs across one transport connection to the broker.
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(engine: Arc<Engine>, transport: Arc<dyn ClientTransport>, capacity: usize) -> Self {
        assert!(capacity > 0, "worker capacity must be positive");
        Self {
            inner: Arc::new(ManagerInner {
                engine,
                transport,
                capacity,
                tasks: Mutex::new(HashMap::new()),
                draining: AtomicBool::new(false),
                task_done: Notify::new(),
                lost: CancellationToken::new(),
            }),
        }
    }

    /// Connect to the broker and advertise full capacity.
    pub async fn start(&self) -> Result<(), TransportError> {
        let handler = Arc::new(ManagerHandler {
            inner: self.inner.clone(),
        });
        self.inner.transport.connect(handler).await?;
        self.inner
            .transport
            .send_packet(Packet::register(self.inner.capacity as u32))
            .await?;
        tracing::info!(capacity = self.inner.capacity, "worker registered with broker");
        Ok(())
    }

    /// Resolves when the broker connection is gone.
    pub async fn closed(&self) {
        self.inner.lost.cancelled().await;
    }

    /// Stop accepting runs, cancel what is in flight, drain, disconnect.
    pub async fn stop(&self) {
        ManagerInner::begin_drain(&self.inner).await;
        ManagerInner::drained(&self.inner).await;
        self.inner.transport.disconnect().await;
    }

    pub async fn running_count(&self) -> usize {
        self.inner.tasks.lock().await.len()
    }
}

struct ManagerHandler {
    inner: Arc<ManagerInner>,
}

#[async_trait]
impl ClientHandler for ManagerHandler {
    async fn on_packet(&self, packet: Option<Packet>) {
        let Some(packet) = packet else {
            tracing::warn!("broker connection lost");
            self.inner.lost.cancel();
            return;
        };
        match packet.packet_type {
            PacketType::Run => ManagerInner::handle_run(&self.inner, packet).await,
            PacketType::Cancel => ManagerInner::handle_cancel(&self.inner, packet).await,
            PacketType::Shutdown => ManagerInner::handle_shutdown(&self.inner).await,
            other => {
                tracing::warn!(packet_type = ?other, "unexpected packet from broker");
            }
        }
    }
}

impl ManagerInner {
    async fn handle_run(inner: &Arc<Self>, packet: Packet) {
        let (Some(cookie), Some(pipeline)) = (packet.cookie, packet.pipeline.clone()) else {
            tracing::error!("malformed RUN packet");
            return;
        };
        let variables = packet.variables.clone().unwrap_or_else(|| json!({}));

        if inner.draining.load(Ordering::SeqCst) {
            let reply =
                Packet::result_code(cookie, ResultCode::Error, Some("worker is draining".into()));
            let _ = inner.transport.send_packet(reply).await;
            return;
        }

        {
            let mut tasks = inner.tasks.lock().await;
            if tasks.len() >= inner.capacity {
                // The broker must not oversubscribe a slot it was never
                // given.
                tracing::error!(cookie = %cookie, "capacity exceeded");
                drop(tasks);
                let reply = Packet::result_code(
                    cookie,
                    ResultCode::Error,
                    Some("worker capacity exceeded".into()),
                );
                let _ = inner.transport.send_packet(reply).await;
                return;
            }
            if tasks.contains_key(&cookie) {
                tracing::error!(cookie = %cookie, "cookie collision");
                drop(tasks);
                let reply = Packet::result_code(
                    cookie,
                    ResultCode::Error,
                    Some("cookie collision".into()),
                );
                let _ = inner.transport.send_packet(reply).await;
                return;
            }
            let token = CancellationToken::new();
            tasks.insert(cookie, RunningTask { token: token.clone() });
            let inner = inner.clone();
            tokio::spawn(async move {
                Self::run_one(inner, cookie, pipeline, variables, token).await;
            });
        }
    }

    async fn run_one(
        inner: Arc<Self>,
        cookie: Uuid,
        pipeline: String,
        variables: Value,
        token: CancellationToken,
    ) {
        tracing::info!(cookie = %cookie, pipeline = %pipeline, "engine run starting");
        let started = std::time::Instant::now();
        let outcome = inner
            .engine
            .run_cancellable(&pipeline, variables, token)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let reply = match outcome {
            Ok(result) => {
                tracing::info!(cookie = %cookie, pipeline = %pipeline, elapsed_ms, "engine run completed");
                Packet::result_ok(cookie, result)
            }
            Err(err) if err.is_cancelled() => {
                tracing::info!(cookie = %cookie, pipeline = %pipeline, elapsed_ms, "engine run cancelled");
                Packet::result_code(cookie, ResultCode::Cancelled, None)
            }
            Err(err) => {
                tracing::error!(cookie = %cookie, pipeline = %pipeline, error = %err, "engine run failed");
                Packet::result_error(cookie, err.to_string(), error_chain(&err))
            }
        };
        let _ = inner.transport.send_packet(reply).await;

        inner.tasks.lock().await.remove(&cookie);
        inner.task_done.notify_waiters();

        // Restore exactly one slot unless we're shutting down.
        if !inner.draining.load(Ordering::SeqCst) {
            let _ = inner.transport.send_packet(Packet::register(1)).await;
        }
    }

    async fn handle_cancel(inner: &Arc<Self>, packet: Packet) {
        let Some(cookie) = packet.cookie else {
            return;
        };
        let tasks = inner.tasks.lock().await;
        match tasks.get(&cookie) {
            Some(task) => {
                tracing::info!(cookie = %cookie, "cancelling run");
                task.token.cancel();
            }
            None => {
                // Already finished, or a duplicate CANCEL: idempotent.
                tracing::debug!(cookie = %cookie, "cancel for unknown cookie");
            }
        }
    }

    async fn handle_shutdown(inner: &Arc<Self>) {
        tracing::info!("shutdown requested by broker");
        Self::begin_drain(inner).await;
        let inner = inner.clone();
        tokio::spawn(async move {
            Self::drained(&inner).await;
            inner.transport.disconnect().await;
        });
    }

    async fn begin_drain(inner: &Arc<Self>) {
        inner.draining.store(true, Ordering::SeqCst);
        let tokens: Vec<CancellationToken> = inner
            .tasks
            .lock()
            .await
            .values()
            .map(|task| task.token.clone())
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    async fn drained(inner: &Arc<Self>) {
        loop {
            let notified = inner.task_done.notified();
            if inner.tasks.lock().await.is_empty() {
                break;
            }
            notified.await;
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut cursor = err.source();
    while let Some(cause) = cursor {
        chain.push(cause.to_string());
        cursor = cause.source();
    }
    chain
}

/// A worker process: a task manager plus a reconnect policy.
pub struct Worker {
    uri: TransportUri,
    engine: Arc<Engine>,
    capacity: usize,
    reconnect: bool,
    backoff: Duration,
}

impl Worker {
    pub fn new(uri: TransportUri, engine: Arc<Engine>, capacity: usize) -> Self {
        Self {
            uri,
            engine,
            capacity,
            reconnect: false,
            backoff: Duration::from_secs(2),
        }
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Serve runs until the shutdown token fires. Transport loss is fatal
    /// to the session; with reconnect enabled the worker re-registers
    /// capacity after the backoff.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        loop {
            let transport = client_transport(&self.uri)?;
            let manager = TaskManager::new(self.engine.clone(), transport, self.capacity);

            match manager.start().await {
                Ok(()) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!("worker shutting down");
                            manager.stop().await;
                            return Ok(());
                        }
                        _ = manager.closed() => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, uri = %self.uri, "broker connection failed");
                    if !self.reconnect {
                        return Err(err.into());
                    }
                }
            }

            if !self.reconnect {
                return Err(WorkerError::ConnectionLost);
            }
            tracing::info!(backoff_s = self.backoff.as_secs(), "reconnecting to broker");
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }
}
