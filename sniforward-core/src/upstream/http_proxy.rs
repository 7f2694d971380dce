use super::{Connector, UPSTREAM_TARGET_PORT, UpstreamError};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sniforward_config::HttpProxyConfig;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tracing::debug;

const MAX_LINE_SIZE: u64 = 8192;
const MAX_HEADER_SIZE: usize = 16384;

/// Tunnels through an HTTP proxy with `CONNECT hostname:443`.
///
/// The stream handed back is the buffered reader that parsed the proxy's
/// response, so any bytes the proxy sent after its header block are relayed
/// rather than lost.
#[derive(Debug, Clone)]
pub struct HttpProxyConnector {
    address: String,
    authorization: String,
    timeout: Duration,
}

impl HttpProxyConnector {
    pub fn new(config: &HttpProxyConfig) -> Self {
        let credentials = format!("{}:{}", config.username, config.password);
        Self {
            address: config.address.clone(),
            authorization: format!("Basic {}", BASE64.encode(credentials)),
            timeout: Duration::from_secs(config.timeout),
        }
    }

    async fn establish(&self, hostname: &str) -> Result<BufReader<TcpStream>, UpstreamError> {
        debug!(proxy = %self.address, hostname, "Dialing upstream HTTP proxy");
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|source| UpstreamError::Connect {
                address: self.address.clone(),
                source,
            })?;
        let mut stream = BufReader::new(stream);

        let request = connect_request(hostname, &self.authorization);
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        read_connect_response(&mut stream).await?;
        debug!(proxy = %self.address, hostname, "CONNECT tunnel established");
        Ok(stream)
    }
}

impl Connector for HttpProxyConnector {
    type Stream = BufReader<TcpStream>;

    fn name(&self) -> &'static str {
        "http-proxy"
    }

    async fn connect(&self, hostname: &str) -> Result<Self::Stream, UpstreamError> {
        // Dropping the unfinished future closes the dialed socket.
        timeout(self.timeout, self.establish(hostname))
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))?
    }
}

/// Renders the CONNECT request for `hostname`.
pub(crate) fn connect_request(hostname: &str, authorization: &str) -> String {
    let target = format!("{hostname}:{UPSTREAM_TARGET_PORT}");
    format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: {authorization}\r\n\r\n"
    )
}

/// Consumes the proxy's status line and header block. Succeeds only on 200.
pub(crate) async fn read_connect_response<R>(reader: &mut R) -> Result<(), UpstreamError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    if read_line(reader, &mut line).await? == 0 {
        return Err(UpstreamError::MalformedResponse(
            "connection closed before status line".to_string(),
        ));
    }

    let status = parse_status_line(&line)?;
    if status != 200 {
        return Err(UpstreamError::Rejected { status });
    }

    let mut header_bytes = 0;
    loop {
        line.clear();
        let n = read_line(reader, &mut line).await?;
        if n == 0 {
            return Err(UpstreamError::MalformedResponse(
                "connection closed inside response headers".to_string(),
            ));
        }
        if line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
        header_bytes += n;
        if header_bytes > MAX_HEADER_SIZE {
            return Err(UpstreamError::MalformedResponse(
                "response headers too large".to_string(),
            ));
        }
    }
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<usize, UpstreamError>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_LINE_SIZE)
        .read_until(b'\n', line)
        .await?;
    if n > 0 && !line.ends_with(b"\n") {
        if n as u64 == MAX_LINE_SIZE {
            return Err(UpstreamError::MalformedResponse(
                "response line too long".to_string(),
            ));
        }
        return Err(UpstreamError::MalformedResponse(
            "connection closed mid-line".to_string(),
        ));
    }
    Ok(n)
}

/// Parses `HTTP/1.x <code> <reason>` into the status code.
pub(crate) fn parse_status_line(line: &[u8]) -> Result<u16, UpstreamError> {
    let malformed = || {
        UpstreamError::MalformedResponse(format!(
            "bad status line {:?}",
            String::from_utf8_lossy(line).trim_end()
        ))
    };

    let text = std::str::from_utf8(line).map_err(|_| malformed())?;
    let mut parts = text.trim_end_matches(['\r', '\n']).splitn(3, ' ');

    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with("HTTP/1.") {
        return Err(malformed());
    }
    let code = parts.next().ok_or_else(malformed)?;
    if code.len() != 3 {
        return Err(malformed());
    }
    code.parse::<u16>().map_err(|_| malformed())
}
