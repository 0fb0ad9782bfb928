use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A measurement task assigned to an agent, distributed via the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingTask {
    pub id: u64,
    pub client: String,
    pub kind: String,
    pub target: String,
    pub interval_secs: u64,
}

/// A completed measurement reported back by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRecord {
    pub client: String,
    pub task_id: u64,
    pub value: i64,
    pub kind: String,
    pub finished_at: DateTime<Utc>,
}
