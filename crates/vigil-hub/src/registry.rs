use axum::extract::ws::Message;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};
use vigil_core::collab::NotificationSink;

static LAST_CONN_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Strictly increasing connection token, clock-seeded so a larger token is
/// always a later event, even across identities.
pub fn next_conn_token() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let mut last = LAST_CONN_TOKEN.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_CONN_TOKEN.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// One open persistent connection. The read loop owns the socket's receive
/// half; everything else talks to the connection through the outbound
/// channel and the close signal.
pub struct Connection {
    id: i64,
    identity: String,
    outbound: mpsc::Sender<Message>,
    close: Notify,
}

impl Connection {
    pub fn new(identity: &str, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id: next_conn_token(),
            identity: identity.to_string(),
            outbound,
            close: Notify::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn send(&self, msg: Message) -> bool {
        self.outbound.send(msg).await.is_ok()
    }

    pub async fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send(Message::Text(value.to_string())).await
    }

    /// Ask the owning read loop to terminate. Non-blocking; the permit is
    /// retained if the loop is not waiting yet.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

/// Maps each identity to its single canonical persistent connection and
/// enforces takeover on reconnect.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    notifier: Arc<dyn NotificationSink>,
}

impl ConnectionRegistry {
    pub fn new(notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    /// Install `conn` as canonical for its identity, immediately. Any prior
    /// connection is signalled to close and its Offline is emitted here, so
    /// the notification stream stays ordered: Offline(old) before
    /// Online(new). The old read loop's own cleanup then finds it is no
    /// longer canonical and does nothing.
    pub async fn connect(&self, conn: Arc<Connection>) {
        let displaced = {
            let mut connections = self.connections.write().await;
            connections.insert(conn.identity().to_string(), conn.clone())
        };
        if let Some(old) = displaced {
            info!(
                event = "connection_superseded",
                identity = %conn.identity(),
                old_conn = old.id(),
                new_conn = conn.id()
            );
            old.request_close();
            self.notifier.notify_offline(conn.identity(), old.id());
        }
        self.notifier.notify_online(conn.identity(), conn.id());
    }

    /// Compare-and-remove keyed on the connection id: only the connection
    /// that is still canonical may delete the registry entry. The Offline
    /// for an actual removal is emitted here, once.
    pub async fn disconnect_conditionally(&self, conn: &Arc<Connection>) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(conn.identity()) {
                Some(current) if current.id() == conn.id() => {
                    connections.remove(conn.identity());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.notifier.notify_offline(conn.identity(), conn.id());
        } else {
            debug!(
                event = "stale_disconnect_ignored",
                identity = %conn.identity(),
                conn_id = conn.id()
            );
        }
    }

    pub async fn canonical_token(&self, identity: &str) -> Option<i64> {
        self.connections
            .read()
            .await
            .get(identity)
            .map(|conn| conn.id())
    }

    /// Identities with a live canonical connection, sorted for stable output.
    pub async fn snapshot(&self) -> Vec<(String, i64)> {
        let connections = self.connections.read().await;
        let mut online: Vec<_> = connections
            .iter()
            .map(|(identity, conn)| (identity.clone(), conn.id()))
            .collect();
        online.sort();
        online
    }
}
