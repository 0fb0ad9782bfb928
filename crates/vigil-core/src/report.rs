use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Stored CPU usage is never allowed below this floor. A literal zero is
/// indistinguishable downstream from "not yet sampled", so near-idle agents
/// are stored as 0.01 instead.
pub const CPU_USAGE_FLOOR: f64 = 0.01;

/// One decoded telemetry report from an agent. Immutable once ingested;
/// unknown fields survive a decode/encode round trip via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSnapshot {
    /// Agent identity as claimed in the body. May be empty; the transport
    /// layer falls back to the authenticated identity.
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub cpu: CpuUsage,
    #[serde(default)]
    pub ram: SpaceUsage,
    #[serde(default)]
    pub swap: SpaceUsage,
    #[serde(default)]
    pub disk: SpaceUsage,
    #[serde(default)]
    pub load: LoadAverages,
    #[serde(default)]
    pub network: NetworkUsage,
    #[serde(default)]
    pub connections: ConnectionCounts,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub process: u32,
    #[serde(default)]
    pub message: String,
    /// Stamped by the server at ingest time, not trusted from the agent.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub usage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpaceUsage {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadAverages {
    #[serde(default)]
    pub load1: f64,
    #[serde(default)]
    pub load5: f64,
    #[serde(default)]
    pub load15: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkUsage {
    #[serde(default)]
    pub up: u64,
    #[serde(default)]
    pub down: u64,
    #[serde(default, rename = "totalUp")]
    pub total_up: u64,
    #[serde(default, rename = "totalDown")]
    pub total_down: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionCounts {
    #[serde(default)]
    pub tcp: u32,
    #[serde(default)]
    pub udp: u32,
}

impl ReportSnapshot {
    /// Raise a below-floor CPU reading to the floor. Values at or above the
    /// floor pass through unchanged.
    pub fn normalize(&mut self) {
        if self.cpu.usage < CPU_USAGE_FLOOR {
            self.cpu.usage = CPU_USAGE_FLOOR;
        }
    }
}
