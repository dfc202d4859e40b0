//! Shared read/write pumps for stream-based transports (TCP and UNIX).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{framing, ClientHandler, ServerHandler};
use crate::protocol::Packet;

const SEND_QUEUE_DEPTH: usize = 64;

/// Broker-side record of one accepted connection.
pub(crate) struct ConnectionHandle {
    pub tx: mpsc::Sender<Packet>,
    pub cancel: CancellationToken,
}

pub(crate) type ConnectionMap = Arc<RwLock<HashMap<Uuid, ConnectionHandle>>>;

/// Wire an accepted stream into the connection map and start its reader
/// and writer tasks. The reader drives handler callbacks; connection
/// teardown always ends in `on_disconnect`.
pub(crate) async fn spawn_server_connection<S>(
    stream: S,
    id: Uuid,
    handler: Arc<dyn ServerHandler>,
    connections: ConnectionMap,
    parent_cancel: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Packet>(SEND_QUEUE_DEPTH);
    let cancel = parent_cancel.child_token();

    connections.write().await.insert(
        id,
        ConnectionHandle {
            tx,
            cancel: cancel.clone(),
        },
    );
    handler.on_connect(id).await;

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(packet) => {
                        if let Err(err) = framing::write_frame(&mut write_half, &packet).await {
                            tracing::debug!(conn = %id, error = %err, "write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = framing::read_frame(&mut read_half) => match frame {
                    Ok(Some(packet)) => handler.on_packet(id, packet).await,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(conn = %id, error = %err, "read failed");
                        break;
                    }
                }
            }
        }
        connections.write().await.remove(&id);
        cancel.cancel();
        handler.on_disconnect(id).await;
        tracing::debug!(conn = %id, "connection closed");
    });
}

/// Client-side connection state: a send queue plus its teardown token.
pub(crate) struct ClientConnection {
    pub tx: mpsc::Sender<Packet>,
    pub cancel: CancellationToken,
}

/// Start reader and writer tasks for a connected client stream. The
/// handler receives a final `None` exactly once.
pub(crate) fn spawn_client_connection<S>(
    stream: S,
    handler: Arc<dyn ClientHandler>,
) -> ClientConnection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Packet>(SEND_QUEUE_DEPTH);
    let cancel = CancellationToken::new();

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(packet) => {
                        if let Err(err) = framing::write_frame(&mut write_half, &packet).await {
                            tracing::debug!(error = %err, "write failed");
                            writer_cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    let reader_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_cancel.cancelled() => break,
                frame = framing::read_frame(&mut read_half) => match frame {
                    Ok(Some(packet)) => handler.on_packet(Some(packet)).await,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "read failed");
                        break;
                    }
                }
            }
        }
        reader_cancel.cancel();
        handler.on_packet(None).await;
    });

    ClientConnection { tx, cancel }
}
