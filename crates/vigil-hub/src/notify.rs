use tracing::info;
use vigil_core::collab::NotificationSink;

/// Default notification sink: structured log events. Real deployments hang
/// alerting off these via the log pipeline.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify_online(&self, identity: &str, conn_token: i64) {
        info!(
            event = "client_online",
            identity = identity,
            conn_token = conn_token
        );
    }

    fn notify_offline(&self, identity: &str, conn_token: i64) {
        info!(
            event = "client_offline",
            identity = identity,
            conn_token = conn_token
        );
    }
}
