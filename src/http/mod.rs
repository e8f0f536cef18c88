//! HTTP(S) front end.
//!
//! [`BundleWebServer`] owns the listener lifecycle: it binds, serves on a
//! background task, and shuts down gracefully when its [`CancellationToken`]
//! fires.  In-flight requests get `shutdown_grace_period` to finish before
//! their connections are dropped.

pub mod handler;
pub mod tls;

use std::fmt::Debug;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::serve::Listener;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use handler::{create_router, parse_route, ParsedRoute};

use crate::config::ServerConfig;
use crate::registry::RouteRegistry;

pub struct BundleWebServer {
    listen: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    router: Router,
    grace_period: Duration,
}

/// A started server.  [`wait`](Self::wait) resolves once it has shut down.
pub struct RunningServer {
    local_addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
}

impl BundleWebServer {
    /// Prepare a server from config.  TLS material is loaded here so a bad
    /// certificate fails before anything is bound.
    pub fn new(config: &ServerConfig, registry: Arc<RouteRegistry>) -> Result<Self> {
        let tls = config
            .tls
            .as_ref()
            .map(tls::load_server_config)
            .transpose()?;
        Ok(Self {
            listen: config.listen,
            tls,
            router: create_router(registry, config.request_timeout()),
            grace_period: config.shutdown_grace_period(),
        })
    }

    /// Bind the listener and start serving in the background.
    pub async fn start(self, shutdown: CancellationToken) -> Result<RunningServer> {
        let tcp = TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("failed to bind listener on {}", self.listen))?;
        let local_addr = tcp.local_addr().context("failed to read bound address")?;

        let task = match self.tls {
            Some(config) => {
                let listener = tls::TlsListener::new(tcp, config)?;
                info!(%local_addr, tls = true, "bundle web server listening");
                tokio::spawn(serve_until_shutdown(
                    listener,
                    self.router,
                    shutdown,
                    self.grace_period,
                ))
            }
            None => {
                info!(%local_addr, tls = false, "bundle web server listening");
                tokio::spawn(serve_until_shutdown(
                    tcp,
                    self.router,
                    shutdown,
                    self.grace_period,
                ))
            }
        };

        Ok(RunningServer { local_addr, task })
    }
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server task to finish.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .context("web server task panicked")?
            .context("web server failed")?;
        info!("bundle web server stopped");
        Ok(())
    }
}

async fn serve_until_shutdown<L>(
    listener: L,
    router: Router,
    shutdown: CancellationToken,
    grace_period: Duration,
) -> std::io::Result<()>
where
    L: Listener,
    L::Addr: Debug,
{
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    let deadline = async {
        shutdown.cancelled().await;
        info!(grace_secs = grace_period.as_secs(), "shutting down web server");
        tokio::time::sleep(grace_period).await;
    };

    tokio::select! {
        result = server => result,
        () = deadline => {
            warn!("grace period elapsed; dropping remaining connections");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
