//! Listener and accept loop

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::proxy::config::{ProxyOptions, ProxySettings};
use crate::proxy::connection::{serve_connection, ProxyContext};
use crate::proxy::registry::ConnectionRegistry;

/// How often the accept loop re-checks the running flag
const ACCEPT_POLL: Duration = Duration::from_millis(500);

pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ProxyContext>,
    running: Arc<AtomicBool>,
}

/// Control handle that outlives [`ProxyServer::run`]'s borrow of the server
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    registry: ConnectionRegistry,
}

impl ServerHandle {
    /// Stop accepting; live sessions are destroyed once the loop exits.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.registry
    }
}

impl ProxyServer {
    pub async fn bind(addr: &str, options: ProxyOptions) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", addr))?;
        Self::from_listener(listener, options)
    }

    pub fn from_listener(listener: TcpListener, options: ProxyOptions) -> anyhow::Result<Self> {
        let context = ProxyContext::new(options).context("Failed to initialise proxy context")?;
        Ok(Self {
            listener,
            context: Arc::new(context),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Listener has no local address")
    }

    /// Live sessions keyed by `remoteAddress:remotePort`
    pub fn connections(&self) -> &ConnectionRegistry {
        self.context.registry()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: self.running.clone(),
            registry: self.context.registry().clone(),
        }
    }

    /// Accept connections until stopped.
    pub async fn run(self) -> anyhow::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Proxy server listening on {}", addr);
        }

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            // Accept with a timeout so a stop request is noticed promptly
            match tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((socket, peer_addr))) => {
                    tracing::debug!("Connection from {}", peer_addr);
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
                    }
                    let id = format!("{}:{}", peer_addr.ip(), peer_addr.port());
                    tokio::spawn(serve_connection(socket, id, self.context.clone()));
                }
                Ok(Err(e)) => tracing::error!("Accept error: {}", e),
                Err(_) => continue,
            }
        }

        let registry = self.context.registry();
        for id in registry.ids() {
            registry.destroy(&id);
        }
        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

/// Bind according to `settings` and serve until the process ends.
pub async fn run_server(settings: &ProxySettings) -> anyhow::Result<()> {
    let options = settings.into_options()?;
    let server = ProxyServer::bind(&settings.listen_address(), options).await?;
    server.run().await
}
