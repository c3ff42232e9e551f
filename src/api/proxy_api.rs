//! Embedding API
//!
//! A process-wide proxy instance that host applications start, stop and
//! inspect without holding on to a [`ProxyServer`] themselves.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::net::TcpListener;

use crate::proxy::config::{ProxyOptions, ProxySettings};
use crate::proxy::server::{ProxyServer, ServerHandle};
use crate::proxy::session::SessionSnapshot;

// Global proxy state
static PROXY_RUNNING: AtomicBool = AtomicBool::new(false);
static ACTIVE_SERVER_TASK: AtomicU64 = AtomicU64::new(0);
static ACTIVE_SERVER: Lazy<Mutex<Option<ServerHandle>>> = Lazy::new(|| Mutex::new(None));

/// Current running proxy config (port, bind_address, intercept)
static CURRENT_PROXY_CONFIG: Lazy<RwLock<(u16, String, bool)>> =
    Lazy::new(|| RwLock::new((0, String::new(), false)));

/// How many successive ports `start_proxy` tries when the requested one is taken
const PORT_ATTEMPTS: u16 = 20;

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize logging (call once at startup).
///
/// With `log_dir` logs go to a daily rolling file there, otherwise to stderr.
/// `RUST_LOG` wins over `verbose`.
pub fn init_core(log_dir: Option<String>, verbose: bool) -> Result<bool, String> {
    let level = resolve_log_level(verbose);

    match log_dir {
        Some(dir) => {
            let log_dir = PathBuf::from(dir);
            std::fs::create_dir_all(&log_dir).map_err(|e| {
                format!(
                    "Failed to create log directory {}: {}",
                    log_dir.display(),
                    e
                )
            })?;
            let file_appender = tracing_appender::rolling::daily(&log_dir, "tproxy");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Logging lasts until process exit
            std::mem::forget(guard);
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(non_blocking)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }

    tracing::info!("tproxy core initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(true)
}

fn resolve_log_level(verbose: bool) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    let fallback = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    match std::env::var("RUST_LOG") {
        Ok(val) => match val.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

pub fn create_default_config() -> ProxySettings {
    ProxySettings::default()
}

/// Proxy status information
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub is_running: bool,
    pub port: u16,
    pub bind_address: String,
    pub intercept: bool,
    pub active_connections: u32,
}

pub fn get_proxy_status() -> ProxyStatus {
    let (port, bind_address, intercept) = CURRENT_PROXY_CONFIG
        .read()
        .map(|config| config.clone())
        .unwrap_or_default();
    let active_connections = active_handle()
        .map(|handle| handle.connections().len() as u32)
        .unwrap_or(0);
    ProxyStatus {
        is_running: PROXY_RUNNING.load(Ordering::SeqCst),
        port,
        bind_address,
        intercept,
        active_connections,
    }
}

fn active_handle() -> Option<ServerHandle> {
    ACTIVE_SERVER.lock().ok().and_then(|guard| guard.clone())
}

/// Start the proxy from declarative settings.
pub async fn start_proxy(settings: ProxySettings) -> Result<bool, String> {
    let options = settings.into_options().map_err(|e| format!("{:#}", e))?;
    start_proxy_with_options(settings, options).await
}

/// Start the proxy with programmatic options (callbacks, injectors, ...).
/// `settings` only supplies the listen address.
pub async fn start_proxy_with_options(
    settings: ProxySettings,
    options: ProxyOptions,
) -> Result<bool, String> {
    if PROXY_RUNNING.load(Ordering::SeqCst) {
        tracing::info!("Proxy already running");
        return Ok(true);
    }

    let listener = bind_available_port(&settings.bind_address, settings.port, PORT_ATTEMPTS).await?;
    let selected_port = listener.local_addr().map_err(|e| e.to_string())?.port();
    if selected_port != settings.port && settings.port != 0 {
        tracing::warn!("Port {} in use, falling back to {}", settings.port, selected_port);
    }

    let intercept = options.intercept;
    let server = ProxyServer::from_listener(listener, options).map_err(|e| format!("{:#}", e))?;
    let handle = server.handle();

    if let Ok(mut current) = CURRENT_PROXY_CONFIG.write() {
        *current = (selected_port, settings.bind_address.clone(), intercept);
    }
    if let Ok(mut active) = ACTIVE_SERVER.lock() {
        *active = Some(handle);
    }
    PROXY_RUNNING.store(true, Ordering::SeqCst);
    ACTIVE_SERVER_TASK.fetch_add(1, Ordering::SeqCst);
    tracing::info!("Starting proxy on {}:{}", settings.bind_address, selected_port);

    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!("Proxy server error: {}", e);
        }

        // If server exits, ensure flag is cleared
        PROXY_RUNNING.store(false, Ordering::SeqCst);
        ACTIVE_SERVER_TASK.fetch_sub(1, Ordering::SeqCst);
    });

    Ok(true)
}

async fn bind_available_port(
    bind_address: &str,
    start_port: u16,
    max_tries: u16,
) -> Result<TcpListener, String> {
    use std::io::ErrorKind;

    for offset in 0..max_tries {
        let candidate = start_port.saturating_add(offset);
        match TcpListener::bind((bind_address, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == ErrorKind::AddrInUse => continue,
            Err(err) => {
                return Err(format!(
                    "Failed to bind to {}:{}: {}",
                    bind_address, candidate, err
                ))
            }
        }
    }

    Err(format!(
        "No available port found in range {}-{}",
        start_port,
        start_port.saturating_add(max_tries.saturating_sub(1))
    ))
}

/// Stop the proxy server and wait for its accept loop to exit
pub async fn stop_proxy() -> Result<bool, String> {
    tracing::info!("Stopping proxy");
    let handle = ACTIVE_SERVER.lock().ok().and_then(|mut guard| guard.take());
    if let Some(handle) = handle {
        handle.stop();
    }
    loop {
        if ACTIVE_SERVER_TASK.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    }
    PROXY_RUNNING.store(false, Ordering::SeqCst);
    Ok(true)
}

/// Snapshot of every live session of the running proxy
pub fn list_connections() -> Vec<SessionSnapshot> {
    active_handle()
        .map(|handle| handle.connections().snapshot())
        .unwrap_or_default()
}

/// Ask one session of the running proxy to tear down
pub fn destroy_connection(id: String) -> bool {
    active_handle()
        .map(|handle| handle.connections().destroy(&id))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn log_level_prefers_rust_log() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(resolve_log_level(true), tracing::level_filters::LevelFilter::DEBUG);
        assert_eq!(resolve_log_level(false), tracing::level_filters::LevelFilter::WARN);

        std::env::set_var("RUST_LOG", "trace");
        assert_eq!(resolve_log_level(false), tracing::level_filters::LevelFilter::TRACE);
        std::env::remove_var("RUST_LOG");
    }

    #[test]
    #[serial]
    fn idle_status_reports_nothing_running() {
        let status = get_proxy_status();
        assert!(!status.is_running);
        assert_eq!(status.active_connections, 0);
        assert!(list_connections().is_empty());
        assert!(!destroy_connection("127.0.0.1:1".into()));
    }

    #[test]
    fn default_config_listens_locally() {
        let settings = create_default_config();
        assert_eq!(settings.listen_address(), "127.0.0.1:8080");
        assert!(!get_version().is_empty());
    }
}
