use crate::registry::next_conn_token;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use vigil_core::collab::NotificationSink;

/// Per-identity presence session for the heartbeat (HTTP POST) transport.
///
/// The epoch increments on every refresh; an expiry callback only acts if
/// both the conn token and the epoch it captured at schedule time still
/// match under the map lock. Aborting the previous timer is an optimization,
/// not the correctness mechanism: an in-flight callback can survive the
/// abort, and the epoch compare is what neutralizes it.
struct PresenceEntry {
    conn_token: i64,
    epoch: u64,
    expiry: JoinHandle<()>,
}

type PresenceMap = Arc<Mutex<HashMap<String, PresenceEntry>>>;

/// Online/offline tracking for heartbeat-transport clients. Persistent
/// connections do not go through here; their presence is tied to connection
/// lifetime in the registry.
pub struct PresenceTracker {
    entries: PresenceMap,
    idle_window: Duration,
    notifier: Arc<dyn NotificationSink>,
}

impl PresenceTracker {
    pub fn new(idle_window: Duration, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            idle_window,
            notifier,
        }
    }

    /// Record a heartbeat. Creates the session (and emits Online) on the
    /// first beat; otherwise bumps the epoch and reschedules expiry without
    /// re-notifying.
    pub async fn refresh(&self, identity: &str) {
        let came_online = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(identity) {
                Some(entry) => {
                    entry.epoch += 1;
                    entry.expiry.abort();
                    entry.expiry = self.schedule_expiry(identity, entry.conn_token, entry.epoch);
                    None
                }
                None => {
                    let conn_token = next_conn_token();
                    let expiry = self.schedule_expiry(identity, conn_token, 0);
                    entries.insert(
                        identity.to_string(),
                        PresenceEntry {
                            conn_token,
                            epoch: 0,
                            expiry,
                        },
                    );
                    Some(conn_token)
                }
            }
        };
        if let Some(conn_token) = came_online {
            self.notifier.notify_online(identity, conn_token);
        }
    }

    /// Tear down the heartbeat session because a persistent connection took
    /// over the identity. Emits Offline for the heartbeat session's token.
    pub async fn supersede(&self, identity: &str) {
        let removed = {
            let mut entries = self.entries.lock().await;
            entries.remove(identity).map(|entry| {
                entry.expiry.abort();
                entry.conn_token
            })
        };
        if let Some(conn_token) = removed {
            debug!(event = "presence_superseded", identity = identity);
            self.notifier.notify_offline(identity, conn_token);
        }
    }

    pub async fn online_token(&self, identity: &str) -> Option<i64> {
        self.entries
            .lock()
            .await
            .get(identity)
            .map(|entry| entry.conn_token)
    }

    /// Identities currently online via heartbeats, sorted for stable output.
    pub async fn snapshot(&self) -> Vec<(String, i64)> {
        let entries = self.entries.lock().await;
        let mut online: Vec<_> = entries
            .iter()
            .map(|(identity, entry)| (identity.clone(), entry.conn_token))
            .collect();
        online.sort();
        online
    }

    fn schedule_expiry(&self, identity: &str, conn_token: i64, epoch: u64) -> JoinHandle<()> {
        let entries = self.entries.clone();
        let notifier = self.notifier.clone();
        let identity = identity.to_string();
        let window = self.idle_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            expire(&entries, notifier.as_ref(), &identity, conn_token, epoch).await;
        })
    }
}

async fn expire(
    entries: &PresenceMap,
    notifier: &dyn NotificationSink,
    identity: &str,
    conn_token: i64,
    epoch: u64,
) {
    let expired = {
        let mut entries = entries.lock().await;
        match entries.get(identity) {
            Some(entry) if entry.conn_token == conn_token && entry.epoch == epoch => {
                entries.remove(identity);
                true
            }
            // Stale callback: the session was refreshed or replaced after
            // this timer was scheduled.
            _ => false,
        }
    };
    if expired {
        debug!(event = "presence_expired", identity = identity);
        notifier.notify_offline(identity, conn_token);
    }
}
