//! The packet protocol spoken between clients, the broker and workers.
//!
//! One packet per frame. A cookie is the UUID labeling one run request;
//! it rides on RUN, CANCEL and RESULT packets end to end.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    /// Worker → broker: advertise spare capacity.
    #[serde(rename = "REGISTER")]
    Register,
    /// Client → broker → worker: run a pipeline.
    #[serde(rename = "RUN")]
    Run,
    /// Client → broker → worker: cancel a run in flight.
    #[serde(rename = "CANCEL")]
    Cancel,
    /// Worker → broker → client: terminal outcome of a run.
    #[serde(rename = "RESULT")]
    Result,
    /// Broker → worker: drain and exit.
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "NO_WORKER_AVAILABLE")]
    NoWorkerAvailable,
    #[serde(rename = "WORKER_LOST")]
    WorkerLost,
    #[serde(rename = "BROKER_LOST")]
    BrokerLost,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::Error => "ERROR",
            ResultCode::Cancelled => "CANCELLED",
            ResultCode::NoWorkerAvailable => "NO_WORKER_AVAILABLE",
            ResultCode::WorkerLost => "WORKER_LOST",
            ResultCode::BrokerLost => "BROKER_LOST",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub packet_type: PacketType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<ResultCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Vec<String>>,
}

impl Packet {
    fn bare(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            cookie: None,
            capacity: None,
            pipeline: None,
            variables: None,
            rc: None,
            result: None,
            error: None,
            stacktrace: None,
        }
    }

    pub fn register(capacity: u32) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::bare(PacketType::Register)
        }
    }

    pub fn run(cookie: Uuid, pipeline: impl Into<String>, variables: Value) -> Self {
        Self {
            cookie: Some(cookie),
            pipeline: Some(pipeline.into()),
            variables: Some(variables),
            ..Self::bare(PacketType::Run)
        }
    }

    pub fn cancel(cookie: Uuid) -> Self {
        Self {
            cookie: Some(cookie),
            ..Self::bare(PacketType::Cancel)
        }
    }

    pub fn shutdown() -> Self {
        Self::bare(PacketType::Shutdown)
    }

    pub fn result_ok(cookie: Uuid, result: Value) -> Self {
        Self {
            cookie: Some(cookie),
            rc: Some(ResultCode::Ok),
            result: Some(result),
            ..Self::bare(PacketType::Result)
        }
    }

    pub fn result_error(cookie: Uuid, error: impl Into<String>, stacktrace: Vec<String>) -> Self {
        Self {
            cookie: Some(cookie),
            rc: Some(ResultCode::Error),
            error: Some(error.into()),
            stacktrace: if stacktrace.is_empty() {
                None
            } else {
                Some(stacktrace)
            },
            ..Self::bare(PacketType::Result)
        }
    }

    pub fn result_code(cookie: Uuid, rc: ResultCode, error: Option<String>) -> Self {
        Self {
            cookie: Some(cookie),
            rc: Some(rc),
            error,
            ..Self::bare(PacketType::Result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_serialization() {
        let packet = Packet::run(Uuid::new_v4(), "app.entry", json!({"a": 1}));
        let bytes = serde_json::to_vec(&packet).unwrap();
        let back: Packet = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.packet_type, PacketType::Run);
        assert_eq!(back.pipeline.as_deref(), Some("app.entry"));
        assert_eq!(back.cookie, packet.cookie);
    }

    #[test]
    fn test_wire_names_are_stable() {
        let text = serde_json::to_string(&Packet::register(4)).unwrap();
        assert!(text.contains("\"REGISTER\""));
        let text =
            serde_json::to_string(&Packet::result_code(Uuid::new_v4(), ResultCode::WorkerLost, None))
                .unwrap();
        assert!(text.contains("\"WORKER_LOST\""));
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let text = serde_json::to_string(&Packet::shutdown()).unwrap();
        assert!(!text.contains("cookie"));
        assert!(!text.contains("stacktrace"));
    }
}
