//! SSH tunnel upstream
//!
//! Each dial opens its own SSH session, authenticates with the configured
//! private key and requests a `direct-tcpip` channel to `hostname:443`. The
//! channel is the relayed stream; the session lives exactly as long as it.

use super::{Connector, UPSTREAM_TARGET_PORT, UpstreamError};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use russh::client::{self, Handle, Msg};
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key};
use russh::ChannelStream;
use sniforward_config::{HostKeyPolicy, SshConfig};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

/// Reported to the SSH server as the origin of forwarded channels.
const ORIGINATOR_ADDRESS: &str = "127.0.0.1";

pub struct SshConnector {
    address: String,
    username: String,
    key: Arc<PrivateKey>,
    host_key: HostKeyPolicy,
    timeout: Duration,
    client_config: Arc<client::Config>,
}

impl SshConnector {
    /// Decodes the private key up front so a bad key fails at startup rather
    /// than on the first connection.
    pub fn new(config: &SshConfig) -> Result<Self, UpstreamError> {
        let key = decode_private_key(&config.private_key)?;

        if config.host_key == HostKeyPolicy::AcceptAny {
            warn!(
                address = %config.address,
                "SSH host key verification disabled; any server key will be accepted"
            );
        }

        Ok(Self {
            address: config.address.clone(),
            username: config.username.clone(),
            key: Arc::new(key),
            host_key: config.host_key.clone(),
            timeout: Duration::from_secs(config.timeout),
            client_config: Arc::new(client::Config::default()),
        })
    }

    async fn open_session(&self) -> Result<Handle<HostKeyCheck>, UpstreamError> {
        debug!(address = %self.address, "Opening SSH session");
        let handler = HostKeyCheck {
            policy: self.host_key.clone(),
            address: self.address.clone(),
        };
        let mut session =
            client::connect(self.client_config.clone(), self.address.as_str(), handler).await?;

        let hash_alg = session.best_supported_rsa_hash().await?.flatten();
        let auth = session
            .authenticate_publickey(
                self.username.as_str(),
                PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg),
            )
            .await?;
        if !auth.success() {
            return Err(UpstreamError::AuthenticationFailed(self.username.clone()));
        }
        Ok(session)
    }
}

impl Connector for SshConnector {
    type Stream = SshTunnelStream;

    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn connect(&self, hostname: &str) -> Result<Self::Stream, UpstreamError> {
        let session = timeout(self.timeout, self.open_session())
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))??;

        let channel = timeout(
            self.timeout,
            session.channel_open_direct_tcpip(
                hostname,
                u32::from(UPSTREAM_TARGET_PORT),
                ORIGINATOR_ADDRESS,
                0,
            ),
        )
        .await
        .map_err(|_| UpstreamError::Timeout(self.timeout))??;

        debug!(address = %self.address, hostname, "SSH channel opened");
        Ok(SshTunnelStream {
            channel: Box::pin(channel.into_stream()),
            _session: session,
        })
    }
}

/// Decodes a base64-wrapped OpenSSH private key.
pub(crate) fn decode_private_key(encoded: &str) -> Result<PrivateKey, UpstreamError> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| UpstreamError::InvalidKey(format!("not valid base64: {e}")))?;
    let text = String::from_utf8(raw)
        .map_err(|_| UpstreamError::InvalidKey("decoded key is not UTF-8 text".to_string()))?;
    decode_secret_key(&text, None).map_err(|e| UpstreamError::InvalidKey(e.to_string()))
}

/// Compares a presented key against the policy.
pub(crate) fn host_key_matches(policy: &HostKeyPolicy, key: &PublicKey) -> bool {
    match policy {
        HostKeyPolicy::AcceptAny => true,
        HostKeyPolicy::Fingerprint { sha256 } => {
            let actual = key.fingerprint(HashAlg::Sha256).to_string();
            let expected = sha256.trim();
            actual == expected || actual.strip_prefix("SHA256:") == Some(expected)
        }
    }
}

struct HostKeyCheck {
    policy: HostKeyPolicy,
    address: String,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let accepted = host_key_matches(&self.policy, server_public_key);
        if !accepted {
            warn!(
                address = %self.address,
                fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
                "SSH host key does not match the configured fingerprint"
            );
        }
        Ok(accepted)
    }
}

/// A `direct-tcpip` channel together with the session that carries it.
pub struct SshTunnelStream {
    channel: Pin<Box<ChannelStream<Msg>>>,
    _session: Handle<HostKeyCheck>,
}

impl AsyncRead for SshTunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.channel.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for SshTunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.channel.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.channel.as_mut().poll_flush(cx)
    }

    /// Sends channel EOF; the session stays up until the stream is dropped.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.channel.as_mut().poll_shutdown(cx)
    }
}
