//! Contracts for the hub's external collaborators. The ingestion front-end
//! only depends on these traits; concrete implementations live elsewhere
//! (vigil-storage for the database-backed ones).

use crate::task::{PingRecord, PingTask};
use serde_json::{Map, Value};
use thiserror::Error;

/// Resolves an agent bearer token to its client identity.
///
/// The error carries one uniform message for both missing and invalid
/// tokens, so an unauthenticated caller cannot distinguish the two.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Error)]
#[error("invalid or missing token")]
pub struct AuthError;

/// Presence transition delivery. Invoked after the owning lock is released,
/// exactly once per real transition and never for a stale timer callback.
/// Implementations must not block; delivery is best effort.
pub trait NotificationSink: Send + Sync {
    fn notify_online(&self, identity: &str, conn_token: i64);
    fn notify_offline(&self, identity: &str, conn_token: i64);
}

/// Task-scheduling store: ping task distribution and result persistence.
pub trait TaskStore: Send + Sync {
    fn ping_tasks(&self, identity: &str) -> anyhow::Result<Vec<PingTask>>;
    fn save_ping_record(&self, record: PingRecord) -> anyhow::Result<()>;
}

/// Read path for the public settings document.
pub trait SettingsProvider: Send + Sync {
    fn public_settings(&self) -> anyhow::Result<Map<String, Value>>;
}
