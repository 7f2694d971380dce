//! Upstream transports
//!
//! A [`Connector`] turns an SNI hostname into a duplex byte stream that ends at
//! `hostname:443`. The returned stream carries no framing of its own, so the
//! relay can copy the client's TLS bytes straight into it.

mod http_proxy;
mod ssh;

pub use http_proxy::HttpProxyConnector;
pub use ssh::{SshConnector, SshTunnelStream};

use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Port dialled on the far side of every upstream.
pub const UPSTREAM_TARGET_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("upstream I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("upstream did not complete setup within {0:?}")]
    Timeout(Duration),
    #[error("upstream proxy rejected CONNECT with status {status}")]
    Rejected { status: u16 },
    #[error("malformed upstream proxy response: {0}")]
    MalformedResponse(String),
    #[error("invalid SSH private key: {0}")]
    InvalidKey(String),
    #[error("SSH authentication failed for user {0}")]
    AuthenticationFailed(String),
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Dials the next hop for a routed connection.
///
/// One connector instance is shared by every connection, so `connect` must be
/// callable concurrently; both implementations open an independent socket per
/// call and keep no mutable state.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Opens a transparent stream to `hostname:443`, bounded by the
    /// connector's configured timeout.
    fn connect(
        &self,
        hostname: &str,
    ) -> impl Future<Output = Result<Self::Stream, UpstreamError>> + Send;

    /// Releases connector-wide resources at shutdown.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
