//! Full-duplex byte relay
//!
//! Each direction runs in its own task. When a source reaches EOF (or fails),
//! only the matching sink's write side is shut down, so the opposite
//! direction keeps flowing until its own source finishes. The relay returns
//! after both directions are done; dropping the halves then closes both
//! streams.
//!
//! Both tasks live in a `JoinSet` owned by the relay future, so dropping or
//! aborting that future aborts the copies and closes both streams.

use prometheus::IntCounter;
use std::io::Cursor;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 32768; // 32KB per direction

/// Byte counts for one relayed connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes written to the upstream, replayed ClientHello included
    pub client_to_upstream: u64,
    /// Bytes written back to the client
    pub upstream_to_client: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }
}

/// Prometheus counters fed while bytes move.
#[derive(Clone)]
pub struct RelayCounters {
    pub client_to_upstream: IntCounter,
    pub upstream_to_client: IntCounter,
}

/// Relays `client` and `upstream` until both directions finish.
///
/// `replay` holds bytes already read from the client; they are delivered to
/// the upstream before anything else read from `client`.
pub async fn relay<C, U>(
    client: C,
    replay: Vec<u8>,
    upstream: U,
    counters: Option<RelayCounters>,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = io::split(client);
    let (upstream_read, upstream_write) = io::split(upstream);
    let client_read = Cursor::new(replay).chain(client_read);

    let (tx_counter, rx_counter) = match counters {
        Some(c) => (Some(c.client_to_upstream), Some(c.upstream_to_client)),
        None => (None, None),
    };

    let mut directions = JoinSet::new();
    directions.spawn(async move {
        let direction = Direction::ClientToUpstream;
        (direction, copy_half(client_read, upstream_write, tx_counter, direction).await)
    });
    directions.spawn(async move {
        let direction = Direction::UpstreamToClient;
        (direction, copy_half(upstream_read, client_write, rx_counter, direction).await)
    });

    let mut stats = RelayStats::default();
    while let Some(joined) = directions.join_next().await {
        match joined {
            Ok((Direction::ClientToUpstream, copied)) => stats.client_to_upstream = copied,
            Ok((Direction::UpstreamToClient, copied)) => stats.upstream_to_client = copied,
            Err(e) => debug!(error = %e, "Relay task failed"),
        }
    }
    stats
}

/// Copies one direction, then half-closes the sink. Returns bytes written.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    counter: Option<IntCounter>,
    direction: Direction,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let result = pump(&mut reader, &mut writer, &counter, &mut copied).await;
    if let Err(e) = &result {
        debug!(
            direction = direction.as_str(),
            error = %e,
            bytes = copied,
            "Relay direction ended with error"
        );
    }

    // Propagate EOF without touching the reverse direction
    if let Err(e) = writer.shutdown().await {
        debug!(direction = direction.as_str(), error = %e, "Half-close failed");
    }
    copied
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &Option<IntCounter>,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
        if let Some(counter) = counter {
            counter.inc_by(n as u64);
        }
    }
}
