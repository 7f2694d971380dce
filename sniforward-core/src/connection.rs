use crate::relay::{RelayCounters, RelayStats, relay};
use crate::sni::{SniError, read_client_hello};
use crate::upstream::{Connector, UpstreamError};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use sniforward_config::{Config, matches_allowlist_pattern};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

/// Lifecycle of one accepted connection. `Closed` is reachable from every
/// other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Peeking,
    Dialing,
    Relaying,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Peeking => "peeking",
            ConnectionState::Dialing => "dialing",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Why a connection was closed before relaying finished.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("ClientHello rejected: {0}")]
    Handshake(#[from] SniError),
    #[error("no ClientHello within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("host {0} is not in the allowlist")]
    HostNotAllowed(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ConnectionError {
    /// Stable label for the `error_type` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::Handshake(_) => "sni_extraction",
            ConnectionError::HandshakeTimeout(_) => "handshake_timeout",
            ConnectionError::HostNotAllowed(_) => "host_not_allowed",
            ConnectionError::Upstream(_) => "upstream_dial",
        }
    }
}

/// Outcome of a connection that reached the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub hostname: String,
    pub stats: RelayStats,
}

struct ConnectionMetrics {
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    connection_duration: HistogramVec,
    errors_total: IntCounterVec,
    relay_counters: RelayCounters,
}

impl ConnectionMetrics {
    fn new(registry: &Registry, upstream: &str) -> Result<Self, prometheus::Error> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "sniforward_connections_total",
                "Total number of connections handled",
            ),
            &["upstream", "status"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::new(
            "sniforward_connections_active",
            "Number of currently active connections",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let connection_duration = HistogramVec::new(
            HistogramOpts::new(
                "sniforward_connection_duration_seconds",
                "Connection duration in seconds",
            )
            .buckets(vec![
                0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
            ]),
            &["upstream"],
        )?;
        registry.register(Box::new(connection_duration.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("sniforward_errors_total", "Total number of errors by type"),
            &["error_type"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "sniforward_bytes_transferred_total",
                "Total bytes transferred per upstream and direction",
            ),
            &["upstream", "direction"],
        )?;
        registry.register(Box::new(bytes_transferred.clone()))?;
        // The label set is fixed, so every connection shares these two series
        let relay_counters = RelayCounters {
            client_to_upstream: bytes_transferred.with_label_values(&[upstream, "tx"]),
            upstream_to_client: bytes_transferred.with_label_values(&[upstream, "rx"]),
        };

        Ok(Self {
            connections_total,
            connections_active,
            connection_duration,
            errors_total,
            relay_counters,
        })
    }
}

/// Holds one unit of `connections_active` and gives it back on drop, so a
/// connection aborted mid-relay still leaves the gauge.
struct ActiveConnection(IntGauge);

impl ActiveConnection {
    fn enter(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Drives every accepted connection through peek, dial and relay.
pub struct ConnectionHandler<C> {
    connector: Arc<C>,
    handshake_timeout: Duration,
    allowlist: Option<Arc<[String]>>,
    metrics: Option<Arc<ConnectionMetrics>>,
}

// Manual impl: `C` itself need not be Clone, it sits behind an Arc.
impl<C> Clone for ConnectionHandler<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            handshake_timeout: self.handshake_timeout,
            allowlist: self.allowlist.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<C: Connector> ConnectionHandler<C> {
    pub fn new(
        config: &Config,
        connector: C,
        registry: Option<&Registry>,
    ) -> Result<Self, prometheus::Error> {
        let metrics = registry
            .map(|registry| ConnectionMetrics::new(registry, connector.name()))
            .transpose()?
            .map(Arc::new);

        let allowlist = config.allowlist.as_ref().map(|patterns| {
            patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect::<Vec<_>>()
                .into()
        });

        Ok(Self {
            connector: Arc::new(connector),
            handshake_timeout: Duration::from_secs(config.timeouts.client_hello),
            allowlist,
            metrics,
        })
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Runs one connection to completion. Errors are already logged and
    /// counted when this returns; the client sees only the socket close.
    pub async fn handle_connection<S>(
        &self,
        client: S,
        peer: SocketAddr,
    ) -> Result<ConnectionSummary, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let start = Instant::now();
        info!(%peer, "Connection accepted");

        let _active = self
            .metrics
            .as_ref()
            .map(|m| ActiveConnection::enter(&m.connections_active));

        let mut state = ConnectionState::Accepted;
        let result = self.process(client, peer, &mut state).await;
        let duration = start.elapsed().as_secs_f64();
        transition(peer, &mut state, ConnectionState::Closed);

        if let Some(ref metrics) = self.metrics {
            let upstream = self.connector.name();
            metrics
                .connection_duration
                .with_label_values(&[upstream])
                .observe(duration);
            let status = if result.is_ok() { "success" } else { "failure" };
            metrics
                .connections_total
                .with_label_values(&[upstream, status])
                .inc();
            if let Err(ref e) = result {
                metrics.errors_total.with_label_values(&[e.kind()]).inc();
            }
        }

        if let Ok(ref summary) = result {
            info!(
                %peer,
                hostname = %summary.hostname,
                sent = summary.stats.client_to_upstream,
                received = summary.stats.upstream_to_client,
                duration_secs = duration,
                "Connection closed"
            );
        }
        result
    }

    async fn process<S>(
        &self,
        mut client: S,
        peer: SocketAddr,
        state: &mut ConnectionState,
    ) -> Result<ConnectionSummary, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Peeking: the handshake deadline covers the ClientHello read only
        transition(peer, state, ConnectionState::Peeking);
        let mut captured = Vec::with_capacity(512);
        let hostname = match timeout(
            self.handshake_timeout,
            read_client_hello(&mut client, &mut captured),
        )
        .await
        {
            Ok(Ok(hostname)) => hostname,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, bytes = captured.len(), "SNI extraction failed");
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    %peer,
                    error = "handshake timeout",
                    bytes = captured.len(),
                    "SNI extraction failed"
                );
                return Err(ConnectionError::HandshakeTimeout(self.handshake_timeout));
            }
        };
        info!(%peer, hostname = %hostname, "SNI resolved");

        if !self.is_host_allowed(&hostname) {
            warn!(%peer, hostname = %hostname, "Host not in allowlist");
            return Err(ConnectionError::HostNotAllowed(hostname));
        }

        // Dialing: the connector enforces its own timeout
        transition(peer, state, ConnectionState::Dialing);
        let upstream = match self.connector.connect(&hostname).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    %peer,
                    hostname = %hostname,
                    upstream = self.connector.name(),
                    error = %e,
                    "Upstream dial failed"
                );
                return Err(e.into());
            }
        };

        // Relaying: no deadline from here on
        transition(peer, state, ConnectionState::Relaying);
        let counters = self.metrics.as_ref().map(|m| m.relay_counters.clone());
        let stats = relay(client, captured, upstream, counters).await;

        Ok(ConnectionSummary { hostname, stats })
    }

    fn is_host_allowed(&self, hostname: &str) -> bool {
        let Some(ref allowlist) = self.allowlist else {
            return true;
        };
        let host_lower = hostname.to_lowercase();
        allowlist
            .iter()
            .any(|pattern| matches_allowlist_pattern(&host_lower, pattern))
    }

    /// Releases connector resources; called once the accept loop has drained.
    pub async fn close(&self) {
        self.connector.close().await;
    }
}

fn transition(peer: SocketAddr, state: &mut ConnectionState, to: ConnectionState) {
    debug!(%peer, from = state.as_str(), to = to.as_str(), "Connection state changed");
    *state = to;
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};
    use sniforward_config::{HttpProxyConfig, UpstreamConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    /// Hands out one end of an in-memory pipe and keeps the other.
    struct PipeConnector {
        dials: AtomicUsize,
        far_end: tokio::sync::Mutex<Option<DuplexStream>>,
        fail: bool,
    }

    impl PipeConnector {
        fn new(fail: bool) -> Self {
            Self {
                dials: AtomicUsize::new(0),
                far_end: tokio::sync::Mutex::new(None),
                fail,
            }
        }
    }

    impl Connector for PipeConnector {
        type Stream = DuplexStream;

        fn name(&self) -> &'static str {
            "pipe"
        }

        async fn connect(&self, _hostname: &str) -> Result<DuplexStream, UpstreamError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UpstreamError::Rejected { status: 407 });
            }
            let (near, far) = duplex(4096);
            *self.far_end.lock().await = Some(far);
            Ok(near)
        }
    }

    fn config(allowlist: Option<Vec<String>>) -> Config {
        Config {
            listen_addrs: vec!["127.0.0.1:0".to_string()],
            timeouts: Default::default(),
            upstream: UpstreamConfig::HttpProxy(HttpProxyConfig {
                address: "127.0.0.1:3128".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
                timeout: 1,
            }),
            metrics: Default::default(),
            allowlist,
            max_connections: None,
            shutdown_timeout: None,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Minimal ClientHello with a single server_name entry.
    fn client_hello(hostname: &str) -> Vec<u8> {
        let name = hostname.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(0);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut extensions = vec![0x00, 0x00];
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01, 0x00];
        handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ConnectionError::Handshake(SniError::NoServerName).kind(),
            "sni_extraction"
        );
        assert_eq!(
            ConnectionError::HostNotAllowed("a.test".into()).kind(),
            "host_not_allowed"
        );
        assert_eq!(
            ConnectionError::Upstream(UpstreamError::Rejected { status: 502 }).kind(),
            "upstream_dial"
        );
    }

    #[tokio::test]
    async fn test_relays_after_replaying_client_hello() {
        let handler = ConnectionHandler::new(&config(None), PipeConnector::new(false), None).unwrap();
        let (client, mut client_peer) = duplex(4096);
        let hello = client_hello("foo.test");

        client_peer.write_all(&hello).await.unwrap();
        client_peer.write_all(b"after").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle_connection(client, peer()).await })
        };

        // Wait for the dial, then act as the upstream server
        let mut far = take_far_end(&handler).await;
        let mut upstream_saw = Vec::new();
        far.read_to_end(&mut upstream_saw).await.unwrap();
        assert_eq!(&upstream_saw[..hello.len()], &hello[..]);
        assert_eq!(&upstream_saw[hello.len()..], b"after");

        far.write_all(b"reply").await.unwrap();
        far.shutdown().await.unwrap();
        let mut client_saw = Vec::new();
        client_peer.read_to_end(&mut client_saw).await.unwrap();
        assert_eq!(client_saw, b"reply");

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.hostname, "foo.test");
        assert_eq!(summary.stats.client_to_upstream, hello.len() as u64 + 5);
        assert_eq!(summary.stats.upstream_to_client, 5);
    }

    #[tokio::test]
    async fn test_bad_hello_never_dials() {
        let handler = ConnectionHandler::new(&config(None), PipeConnector::new(false), None).unwrap();
        let (client, mut client_peer) = duplex(4096);
        client_peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let result = handler.handle_connection(client, peer()).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Handshake(SniError::NotHandshakeRecord(b'G')))
        ));
        assert_eq!(handler.connector().dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_allowlist_blocks_before_dial() {
        let handler = ConnectionHandler::new(
            &config(Some(vec!["*.Example.com".to_string()])),
            PipeConnector::new(false),
            None,
        )
        .unwrap();

        let (client, mut client_peer) = duplex(4096);
        client_peer.write_all(&client_hello("evil.test")).await.unwrap();
        let result = handler.handle_connection(client, peer()).await;
        assert!(matches!(result, Err(ConnectionError::HostNotAllowed(ref h)) if h == "evil.test"));
        assert_eq!(handler.connector().dials.load(Ordering::SeqCst), 0);

        assert!(handler.is_host_allowed("API.example.com"));
        assert!(handler.is_host_allowed("example.com"));
        assert!(!handler.is_host_allowed("example.com.evil"));
    }

    #[tokio::test]
    async fn test_dial_failure_counted() {
        let registry = Registry::new();
        let handler =
            ConnectionHandler::new(&config(None), PipeConnector::new(true), Some(&registry)).unwrap();

        let (client, mut client_peer) = duplex(4096);
        client_peer.write_all(&client_hello("foo.test")).await.unwrap();
        let result = handler.handle_connection(client, peer()).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Upstream(UpstreamError::Rejected { status: 407 }))
        ));

        let metrics = handler.metrics.as_ref().unwrap();
        assert_eq!(
            metrics
                .errors_total
                .with_label_values(&["upstream_dial"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .connections_total
                .with_label_values(&["pipe", "failure"])
                .get(),
            1
        );
        assert_eq!(metrics.connections_active.get(), 0);
    }

    async fn take_far_end(handler: &ConnectionHandler<PipeConnector>) -> DuplexStream {
        loop {
            if let Some(far) = handler.connector().far_end.lock().await.take() {
                return far;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_byte_counters_do_not_grow_with_hostnames() {
        let registry = Registry::new();
        let handler =
            ConnectionHandler::new(&config(None), PipeConnector::new(false), Some(&registry)).unwrap();

        for i in 0..50 {
            let (client, mut client_peer) = duplex(4096);
            client_peer
                .write_all(&client_hello(&format!("h{i}.attacker.test")))
                .await
                .unwrap();
            client_peer.shutdown().await.unwrap();

            let task = {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle_connection(client, peer()).await })
            };
            drop(take_far_end(&handler).await);
            task.await.unwrap().unwrap();
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let exposition = String::from_utf8(buffer).unwrap();
        let series: Vec<&str> = exposition
            .lines()
            .filter(|line| line.starts_with("sniforward_bytes_transferred_total{"))
            .collect();
        assert_eq!(series.len(), 2, "{series:?}");
        assert!(series.iter().all(|line| line.contains(r#"upstream="pipe""#)));
        assert!(!exposition.contains("attacker.test"));
    }

    #[tokio::test]
    async fn test_aborted_connection_releases_gauge_and_relay() {
        let registry = Registry::new();
        let handler =
            ConnectionHandler::new(&config(None), PipeConnector::new(false), Some(&registry)).unwrap();

        let (client, mut client_peer) = duplex(4096);
        let hello = client_hello("foo.test");
        client_peer.write_all(&hello).await.unwrap();

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle_connection(client, peer()).await })
        };
        let mut far = take_far_end(&handler).await;
        let mut replayed = vec![0u8; hello.len()];
        far.read_exact(&mut replayed).await.unwrap();
        assert_eq!(replayed, hello);

        let metrics = handler.metrics.as_ref().unwrap();
        assert_eq!(metrics.connections_active.get(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(metrics.connections_active.get(), 0);

        let _ = client_peer.write_all(b"after-abort").await;
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), far.read_to_end(&mut rest))
            .await
            .expect("relay kept the upstream open")
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let mut config = config(None);
        config.timeouts.client_hello = 1;
        let handler = ConnectionHandler::new(&config, PipeConnector::new(false), None).unwrap();
        let (client, mut client_peer) = duplex(4096);
        // Half a record header, then silence
        client_peer.write_all(&[0x16, 0x03]).await.unwrap();

        let result = handler.handle_connection(client, peer()).await;
        assert!(matches!(result, Err(ConnectionError::HandshakeTimeout(_))));
        drop(client_peer);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        assert!(ConnectionHandler::new(&config(None), PipeConnector::new(false), Some(&registry)).is_ok());
        assert!(ConnectionHandler::new(&config(None), PipeConnector::new(false), Some(&registry)).is_err());
    }
}
