use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use vigil_core::collab::TaskStore;
use vigil_core::report::ReportSnapshot;
use vigil_core::task::PingRecord;
use vigil_core::wire::{decode_frame, AgentFrame, WireError};

/// Recent reports for one identity. The whole entry expires after
/// `history_ttl` of silence; the list itself is not length-capped while the
/// key stays alive (known limitation, an explicit bound would be a ring
/// buffer here).
struct HistoryEntry {
    reports: Vec<ReportSnapshot>,
    expires_at: Instant,
}

/// Validates, normalizes and stores incoming reports from either transport,
/// and routes embedded measurement results to the task store.
pub struct ReportPipeline {
    history: Mutex<HashMap<String, HistoryEntry>>,
    latest: RwLock<HashMap<String, ReportSnapshot>>,
    history_ttl: Duration,
    tasks: Arc<dyn TaskStore>,
}

impl ReportPipeline {
    pub fn new(history_ttl: Duration, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            history_ttl,
            tasks,
        }
    }

    /// Store one decoded report under the authenticated identity. The body's
    /// own uuid claim is replaced; the server timestamp wins over the agent's.
    pub async fn ingest_report(&self, identity: &str, mut report: ReportSnapshot) {
        report.normalize();
        report.uuid = identity.to_string();
        report.updated_at = Utc::now();

        {
            let mut history = self.history.lock().await;
            let entry = history
                .entry(identity.to_string())
                .or_insert_with(|| HistoryEntry {
                    reports: Vec::new(),
                    expires_at: Instant::now(),
                });
            entry.reports.push(report.clone());
            entry.expires_at = Instant::now() + self.history_ttl;
        }

        self.latest
            .write()
            .await
            .insert(identity.to_string(), report);
    }

    /// Dispatch one persistent-connection frame. Decode failures and unknown
    /// envelope types are returned to the caller for a soft error reply; no
    /// stored state is touched on failure.
    pub async fn ingest_frame(&self, identity: &str, raw: &[u8]) -> Result<(), WireError> {
        match decode_frame(raw)? {
            AgentFrame::Report(report) => {
                self.ingest_report(identity, *report).await;
                Ok(())
            }
            AgentFrame::PingResult(result) => {
                let record = PingRecord {
                    client: identity.to_string(),
                    task_id: result.task_id,
                    value: result.value,
                    kind: result.ping_type,
                    finished_at: result.finished_at,
                };
                let tasks = self.tasks.clone();
                // Fire and forget: a store failure is not the agent's problem.
                tokio::spawn(async move {
                    if let Err(err) = tasks.save_ping_record(record) {
                        warn!(event = "ping_record_store_failed", error = %err);
                    }
                });
                Ok(())
            }
        }
    }

    pub async fn latest(&self, identity: &str) -> Option<ReportSnapshot> {
        self.latest.read().await.get(identity).cloned()
    }

    /// All latest reports, ordered by identity for stable output.
    pub async fn latest_all(&self) -> Vec<ReportSnapshot> {
        let latest = self.latest.read().await;
        let mut reports: Vec<_> = latest.values().cloned().collect();
        reports.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        reports
    }

    /// Reports for one identity while its history key is alive.
    pub async fn history(&self, identity: &str) -> Vec<ReportSnapshot> {
        let history = self.history.lock().await;
        match history.get(identity) {
            Some(entry) if entry.expires_at > Instant::now() => entry.reports.clone(),
            _ => Vec::new(),
        }
    }

    /// Drop history keys whose sliding expiration has lapsed. Returns how
    /// many were removed.
    pub async fn prune_expired_history(&self) -> usize {
        let mut history = self.history.lock().await;
        let before = history.len();
        let now = Instant::now();
        history.retain(|_, entry| entry.expires_at > now);
        let removed = before - history.len();
        if removed > 0 {
            debug!(event = "history_pruned", removed = removed);
        }
        removed
    }

    pub fn spawn_history_reaper(self: Arc<Self>) {
        let interval = self.history_ttl / 2;
        let pipeline = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                pipeline.prune_expired_history().await;
            }
        });
    }
}
