//! TLS-passthrough forwarding proxy
//!
//! Clients connect with TLS; the proxy reads their ClientHello just far
//! enough to learn the SNI hostname, opens a tunnel to `hostname:443` through
//! the configured upstream (an HTTP CONNECT proxy or an SSH server), replays
//! the captured bytes and then relays both directions untouched. TLS is never
//! terminated.

pub mod connection;
pub mod relay;
pub mod sni;
pub mod upstream;

pub use connection::{ConnectionError, ConnectionHandler, ConnectionState, ConnectionSummary};
pub use relay::{RelayStats, relay};
pub use sni::{SniError, extract_sni, read_client_hello};
pub use upstream::{Connector, HttpProxyConnector, SshConnector, UpstreamError};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::Registry;
use sniforward_config::{Config, ConfigError, UpstreamConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep, timeout};
use tracing::{error, info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;
// Pause after a failed accept (EMFILE and friends) before retrying
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Startup failures. Nothing that happens on an individual connection
/// surfaces here.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("upstream setup failed: {0}")]
    Upstream(#[from] UpstreamError),
}

/// Validates `config`, builds the configured connector and serves until a
/// message arrives on `shutdown_rx`.
pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ProxyError> {
    config.validate()?;
    info!(
        upstream = config.upstream.kind(),
        listeners = config.listen_addrs.len(),
        "Starting proxy"
    );

    match &config.upstream {
        UpstreamConfig::HttpProxy(http) => {
            let connector = HttpProxyConnector::new(http);
            Proxy::bind(&config, connector, registry.as_ref())
                .await?
                .run(shutdown_rx)
                .await
        }
        UpstreamConfig::Ssh(ssh) => {
            let connector = SshConnector::new(ssh)?;
            Proxy::bind(&config, connector, registry.as_ref())
                .await?
                .run(shutdown_rx)
                .await
        }
    }
}

/// Bound listeners plus the handler every accepted connection goes through.
pub struct Proxy<C> {
    listeners: Vec<TcpListener>,
    handler: ConnectionHandler<C>,
    limiter: Option<Arc<Semaphore>>,
    shutdown_timeout: Duration,
}

impl<C: Connector> Proxy<C> {
    /// Binds every listen address. Fails before accepting anything if one of
    /// them cannot be bound.
    pub async fn bind(
        config: &Config,
        connector: C,
        registry: Option<&Registry>,
    ) -> Result<Self, ProxyError> {
        let handler = ConnectionHandler::new(config, connector, registry)?;

        let mut listeners = Vec::new();
        for address in config.listen_socket_addrs()? {
            let listener = TcpListener::bind(address)
                .await
                .map_err(|source| ProxyError::Bind { address, source })?;
            let bound = listener.local_addr().unwrap_or(address);
            info!(address = %bound, upstream = handler.connector().name(), "Listening started");
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            handler,
            limiter: config.max_connections.map(|n| Arc::new(Semaphore::new(n))),
            shutdown_timeout: Duration::from_secs(
                config.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            ),
        })
    }

    /// Addresses actually bound, with ephemeral ports resolved.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Accept loop. Each connection runs in its own task; a failed accept or
    /// a failed connection never stops the loop.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), ProxyError> {
        let mut connections = JoinSet::new();

        loop {
            let mut accepts: FuturesUnordered<_> =
                self.listeners.iter().map(|l| l.accept()).collect();

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
                Some(result) = accepts.next() => {
                    let (socket, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            accept_backoff(&e).await;
                            continue;
                        }
                    };

                    let permit = match &self.limiter {
                        Some(limiter) => match limiter.clone().try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                warn!(%peer, "Connection limit reached, closing connection");
                                continue;
                            }
                        },
                        None => None,
                    };

                    let handler = self.handler.clone();
                    connections.spawn(async move {
                        let _permit = permit;
                        // Already logged and counted by the handler
                        let _ = handler.handle_connection(socket, peer).await;
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }

        let Self {
            listeners,
            handler,
            shutdown_timeout,
            ..
        } = self;
        drop(listeners);
        drain(&mut connections, shutdown_timeout).await;
        handler.close().await;
        info!("Proxy stopped");
        Ok(())
    }
}

async fn accept_backoff(e: &io::Error) {
    error!(error = %e, backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64, "Accept error");
    sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Waits up to `grace` for in-flight connections, then aborts the rest.
async fn drain(connections: &mut JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }
    info!(
        active = connections.len(),
        timeout_secs = grace.as_secs(),
        "Waiting for active connections to finish"
    );
    let finished = timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        warn!(
            remaining = connections.len(),
            "Shutdown timeout reached, aborting remaining connections"
        );
        connections.shutdown().await;
    }
}
