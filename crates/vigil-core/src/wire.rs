use crate::report::ReportSnapshot;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// A frame read from an agent's persistent connection. The envelope is flat:
/// the optional `type` discriminator sits alongside the payload fields.
#[derive(Debug)]
pub enum AgentFrame {
    Report(Box<ReportSnapshot>),
    PingResult(PingResult),
}

/// Measurement result embedded in a `ping_result` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct PingResult {
    pub task_id: u64,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub ping_type: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid JSON")]
    InvalidJson,
    #[error("invalid report format")]
    InvalidReport,
    #[error("invalid ping result format")]
    InvalidPingResult,
    #[error("unknown message type: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Deserialize)]
struct FrameKind {
    #[serde(default, rename = "type")]
    kind: String,
}

/// Decode one frame. An empty or absent `type` is treated as a report, the
/// wire format agents have always sent.
pub fn decode_frame(raw: &[u8]) -> Result<AgentFrame, WireError> {
    let kind: FrameKind = serde_json::from_slice(raw).map_err(|_| WireError::InvalidJson)?;
    match kind.kind.as_str() {
        "" | "report" => serde_json::from_slice::<ReportSnapshot>(raw)
            .map(|report| AgentFrame::Report(Box::new(report)))
            .map_err(|_| WireError::InvalidReport),
        "ping_result" => serde_json::from_slice::<PingResult>(raw)
            .map(AgentFrame::PingResult)
            .map_err(|_| WireError::InvalidPingResult),
        other => Err(WireError::UnknownKind(other.to_string())),
    }
}
