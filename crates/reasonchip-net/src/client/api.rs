//! High-level client API over the multiplexor.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{Packet, PacketType, ResultCode};

use super::{ClientError, Multiplexor, Session};

/// Terminal outcome of one remote run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub rc: ResultCode,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub stacktrace: Option<Vec<String>>,
}

pub struct Api {
    mux: Arc<Multiplexor>,
}

impl Api {
    pub fn new(mux: Arc<Multiplexor>) -> Self {
        Self { mux }
    }

    /// Run a pipeline remotely and wait for its terminal RESULT.
    ///
    /// When `cancel` fires, a CANCEL is forwarded to the broker and the
    /// call keeps waiting for the terminal RESULT (normally
    /// `rc=CANCELLED`). The session is released on every path.
    pub async fn run_pipeline(
        &self,
        pipeline: &str,
        variables: Value,
        cookie: Option<Uuid>,
        cancel: Option<CancellationToken>,
    ) -> Result<RunOutcome, ClientError> {
        let mut session = self.mux.register_session().await?;
        let result = drive(&mut session, pipeline, variables, cookie, cancel).await;
        session.release().await;
        result
    }
}

async fn drive(
    session: &mut Session,
    pipeline: &str,
    variables: Value,
    cookie: Option<Uuid>,
    cancel: Option<CancellationToken>,
) -> Result<RunOutcome, ClientError> {
    let cookie = cookie.unwrap_or_else(Uuid::new_v4);
    tracing::debug!(cookie = %cookie, pipeline = %pipeline, "dispatching run");
    session
        .send(Packet::run(cookie, pipeline, variables))
        .await?;

    let mut cancel_sent = false;
    loop {
        let packet = match &cancel {
            Some(token) if !cancel_sent => {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(cookie = %cookie, "forwarding cancel");
                        session.send(Packet::cancel(cookie)).await?;
                        cancel_sent = true;
                        continue;
                    }
                    received = session.recv() => received?,
                }
            }
            _ => session.recv().await?,
        };

        if packet.packet_type == PacketType::Result && packet.cookie == Some(cookie) {
            return Ok(RunOutcome {
                rc: packet.rc.unwrap_or(ResultCode::Error),
                result: packet.result,
                error: packet.error,
                stacktrace: packet.stacktrace,
            });
        }
        tracing::debug!(cookie = %cookie, packet_type = ?packet.packet_type, "ignoring non-terminal packet");
    }
}
