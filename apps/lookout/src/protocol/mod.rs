//! Wire types shared by the queue coordinator channel and the in-band
//! telemetry channel. Both transports carry JSON frames tagged by `type`,
//! so one enum covers the whole event stream a session consumer sees.

use serde::{Deserialize, Serialize};

/// A single event forwarded to the session's event sink.
///
/// `answer` and `error` are the terminal outcomes of a queue attempt;
/// `done` is the coordinator's graceful-stop signal; `logs` arrives over
/// the peer connection's telemetry channel rather than the queue socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    QueuePosition { position: u32 },
    Assigned { worker_id: String },
    Answer { sdp: String },
    Error { reason: String },
    Done,
    Logs { logs: TelemetryRecord },
}

/// Detection summary pushed by the worker while it processes the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub total_amount: u64,
    pub amount: DetectionCounts,
    pub actions: MovementCounts,
    pub tactic: String,
    pub command: String,
    pub priority: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCounts {
    pub tanks: u64,
    pub ifv: u64,
    pub apc: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementCounts {
    pub moving_forward: u64,
    pub moving_back: u64,
    pub from_left_flank: u64,
    pub from_right_flank: u64,
}

/// The session description a queue attempt resolves with.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAnswer {
    pub sdp: String,
}
