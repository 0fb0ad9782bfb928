mod ingest;
mod notify;
mod presence;
mod registry;
mod routes;

use clap::Parser;
use notify::LogSink;
use routes::{build_router, AppState};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use vigil_core::collab::NotificationSink;
use vigil_storage::Store;

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub db_path: PathBuf,
    /// Silence threshold after which a client is declared offline. The agent
    /// reporting interval is not negotiated, so this must exceed it.
    pub idle_window: Duration,
    pub history_ttl: Duration,
    pub write_timeout: Duration,
    pub debug: bool,
    pub log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "vigil-hub")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:25774
    #[arg(long, default_value = "")]
    addr: String,
    /// SQLite database path
    #[arg(long, default_value = "")]
    db: String,
    /// Seconds of silence before a client goes offline
    #[arg(long, default_value_t = 11)]
    idle_seconds: u64,
    /// Sliding expiration of per-client report history, in seconds
    #[arg(long, default_value_t = 600)]
    history_ttl: u64,
    /// Per-frame write timeout towards agents, in seconds
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Directory for the hub log file; empty logs to stdout only
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let store = match Store::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(event = "store_open_failed", error = %err, path = %config.db_path.display());
            return;
        }
    };

    let sink: Arc<dyn NotificationSink> = Arc::new(LogSink);
    let app = AppState::new(config.clone(), store, sink);
    app.pipeline.clone().spawn_history_reaper();

    let router = build_router(app.clone());
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_failed", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        db = %config.db_path.display(),
        idle_seconds = config.idle_window.as_secs()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_flag(&args.addr, "VIGIL_ADDR", "0.0.0.0:25774"),
        db_path: PathBuf::from(resolve_flag(&args.db, "VIGIL_DB", "vigil.db")),
        idle_window: Duration::from_secs(args.idle_seconds),
        history_ttl: Duration::from_secs(args.history_ttl),
        write_timeout: Duration::from_secs(args.write_timeout),
        debug: args.debug || env_true("VIGIL_DEBUG"),
        log_dir: resolve_flag(&args.log_dir, "VIGIL_LOG_DIR", ""),
    }
}

fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("VIGIL_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = open_log_file(&config.log_dir);
    let make_writer = BoxMakeWriter::new(move || TeeWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_log_file(log_dir: &str) -> Option<Arc<Mutex<std::fs::File>>> {
    if log_dir.trim().is_empty() {
        return None;
    }
    let dir = PathBuf::from(log_dir);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("log_dir_error: {err}");
        return None;
    }
    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("vigil-hub.log"))
    {
        Ok(file) => Some(Arc::new(Mutex::new(file))),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    }
}

/// Duplicates log output to stdout and, when configured, the hub log file.
struct TeeWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl TeeWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}
