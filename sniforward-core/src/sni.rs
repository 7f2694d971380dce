//! TLS ClientHello inspection
//!
//! Walks the length-prefixed fields of the first handshake message to find the
//! Server Name Indication. Nothing is decrypted or validated beyond bounds:
//! the proxy only needs the routing key, and every byte it reads is kept so
//! the handshake can be replayed verbatim to the upstream.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const SNI_HOST_NAME: u8 = 0x00;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
/// Record header, handshake header, client version and random.
const FIXED_HELLO_LEN: usize = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + 2 + 32;
/// 2^14 plaintext plus the 256 bytes of expansion TLS 1.2 permits.
const MAX_RECORD_LEN: usize = 16384 + 256;
const MAX_HOSTNAME_LEN: usize = 253;
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum SniError {
    #[error("not a TLS handshake record (content type {0:#04x})")]
    NotHandshakeRecord(u8),
    #[error("handshake message is not a ClientHello (type {0:#04x})")]
    NotClientHello(u8),
    #[error("ClientHello truncated")]
    Truncated,
    #[error("server name list length {declared} does not match extension payload {actual}")]
    ListLengthMismatch { declared: usize, actual: usize },
    #[error("unsupported server name type {0:#04x}")]
    UnsupportedNameType(u8),
    #[error("ClientHello carries no server name")]
    NoServerName,
    #[error("server name is not a valid hostname")]
    InvalidHostname,
    #[error("TLS record length {0} exceeds the protocol maximum")]
    OversizedRecord(usize),
    #[error("failed to read ClientHello: {0}")]
    Io(#[from] io::Error),
}

/// Extracts the SNI hostname from a captured ClientHello.
///
/// `hello` must start at the TLS record header. The parser never reads outside
/// the slice, so it is safe on arbitrary input, and it does not consume
/// anything: calling it repeatedly on the same buffer gives the same answer.
/// Only the first entry of the server name list is honoured.
pub fn extract_sni(hello: &[u8]) -> Result<&str, SniError> {
    tracing::trace!("Starting SNI extraction from {} bytes", hello.len());

    if hello.len() < RECORD_HEADER_LEN {
        return Err(SniError::Truncated);
    }
    if hello[0] != TLS_HANDSHAKE {
        return Err(SniError::NotHandshakeRecord(hello[0]));
    }
    match hello.get(RECORD_HEADER_LEN) {
        None => return Err(SniError::Truncated),
        Some(&CLIENT_HELLO) => {}
        Some(&other) => return Err(SniError::NotClientHello(other)),
    }
    if hello.len() < FIXED_HELLO_LEN {
        return Err(SniError::Truncated);
    }

    let mut pos = FIXED_HELLO_LEN;

    // Session ID
    let session_id_length = read_u8(hello, pos)?;
    pos = skip(hello, pos + 1, session_id_length)?;

    // Cipher suites
    let cipher_suites_length = read_u16(hello, pos)?;
    pos = skip(hello, pos + 2, cipher_suites_length)?;

    // Compression methods
    let compression_methods_length = read_u8(hello, pos)?;
    pos = skip(hello, pos + 1, compression_methods_length)?;

    let extensions_length = read_u16(hello, pos)?;
    pos += 2;
    let extensions_end = skip(hello, pos, extensions_length)?;

    while pos + 4 <= extensions_end {
        let extension_type = read_u16(hello, pos)?;
        let extension_length = read_u16(hello, pos + 2)?;
        pos += 4;

        if pos + extension_length > extensions_end {
            return Err(SniError::Truncated);
        }
        if extension_type == SNI_EXTENSION as usize {
            return parse_server_name(&hello[pos..pos + extension_length]);
        }
        pos += extension_length;
    }

    Err(SniError::NoServerName)
}

fn parse_server_name(data: &[u8]) -> Result<&str, SniError> {
    let list_length = read_u16(data, 0)?;
    let payload = data.len() - 2;
    if list_length != payload {
        return Err(SniError::ListLengthMismatch {
            declared: list_length,
            actual: payload,
        });
    }

    let name_type = read_u8(data, 2)?;
    if name_type != SNI_HOST_NAME as usize {
        return Err(SniError::UnsupportedNameType(name_type as u8));
    }

    let name_length = read_u16(data, 3)?;
    let name = data.get(5..5 + name_length).ok_or(SniError::Truncated)?;
    let hostname = std::str::from_utf8(name).map_err(|_| SniError::InvalidHostname)?;
    if !is_valid_hostname(hostname) {
        return Err(SniError::InvalidHostname);
    }
    Ok(hostname)
}

/// The hostname ends up in a CONNECT request line and a `direct-tcpip`
/// request, so only the DNS host-name alphabet is accepted.
fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LEN
        && hostname
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}

#[inline]
fn read_u8(buf: &[u8], pos: usize) -> Result<usize, SniError> {
    buf.get(pos).map(|&b| b as usize).ok_or(SniError::Truncated)
}

#[inline]
fn read_u16(buf: &[u8], pos: usize) -> Result<usize, SniError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
        .ok_or(SniError::Truncated)
}

#[inline]
fn skip(buf: &[u8], start: usize, len: usize) -> Result<usize, SniError> {
    let end = start + len;
    if end > buf.len() {
        Err(SniError::Truncated)
    } else {
        Ok(end)
    }
}

/// Reads exactly one ClientHello handshake message from `reader` and returns
/// its SNI hostname.
///
/// Every byte read is appended to `captured`, on success and on failure alike,
/// in the order it arrived. The reader is never advanced past the end of the
/// first handshake message (or of the first record, if the message is split
/// across records), so `captured` followed by the rest of the stream is
/// exactly what the client sent.
pub async fn read_client_hello<R>(reader: &mut R, captured: &mut Vec<u8>) -> Result<String, SniError>
where
    R: AsyncRead + Unpin,
{
    let start = captured.len();

    fill(reader, captured, RECORD_HEADER_LEN).await?;
    let header = &captured[start..];
    if header[0] != TLS_HANDSHAKE {
        return Err(SniError::NotHandshakeRecord(header[0]));
    }

    let record_length = ((header[3] as usize) << 8) | (header[4] as usize);
    tracing::trace!("TLS record length from header: {}", record_length);
    if record_length > MAX_RECORD_LEN {
        return Err(SniError::OversizedRecord(record_length));
    }
    if record_length < HANDSHAKE_HEADER_LEN {
        return Err(SniError::Truncated);
    }

    fill(reader, captured, HANDSHAKE_HEADER_LEN).await?;
    let handshake = &captured[start + RECORD_HEADER_LEN..];
    if handshake[0] != CLIENT_HELLO {
        return Err(SniError::NotClientHello(handshake[0]));
    }
    let handshake_length =
        ((handshake[1] as usize) << 16) | ((handshake[2] as usize) << 8) | (handshake[3] as usize);

    let body_length = handshake_length.min(record_length - HANDSHAKE_HEADER_LEN);
    fill(reader, captured, body_length).await?;

    extract_sni(&captured[start..]).map(str::to_owned)
}

/// Appends exactly `count` more bytes from `reader` to `buf`.
async fn fill<R>(reader: &mut R, buf: &mut Vec<u8>, count: usize) -> Result<(), SniError>
where
    R: AsyncRead + Unpin,
{
    let target = buf.len() + count;
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    while buf.len() < target {
        let want = (target - buf.len()).min(READ_CHUNK_SIZE);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(SniError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}
