//! ICAP framed reader.
//!
//! Pulls exactly one complete ICAP message off a buffered stream without
//! relying on connection close. Proxies keep the TCP connection open while
//! they wait for the ICAP verdict, so a read-to-EOF strategy would hang
//! until the read deadline fires. The reader instead walks the message
//! structure (ICAP headers, encapsulated HTTP header sections, chunked
//! body) and stops at the exact last byte. Anything beyond one message is
//! left in the stream buffer.

use std::io::{self, ErrorKind};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

use crate::error::{Error, IcapResult};

/// One framed read: the raw message bytes plus the error that cut the read
/// short, if any. The caller decides whether partial bytes are usable.
#[derive(Debug, Default)]
pub struct FramedMessage {
    pub bytes: Vec<u8>,
    pub error: Option<Error>,
}

impl FramedMessage {
    fn complete(bytes: Vec<u8>) -> Self {
        Self { bytes, error: None }
    }

    fn failed(bytes: Vec<u8>, error: Error) -> Self {
        Self { bytes, error: Some(error) }
    }
}

/// Read one complete ICAP message from `reader`.
///
/// Phases:
/// 1. ICAP request line + ICAP headers, up to the blank line. The
///    `Encapsulated` value is retained to drive the remaining phases.
/// 2. Encapsulated HTTP request headers when the value names `req-hdr`.
///    `null-body` does not suppress this phase: it only asserts the absence
///    of a body section, the header section is still on the wire.
/// 3. Encapsulated HTTP response headers when the value names `res-hdr`.
/// 4. Chunked body when the value names `req-body`/`res-body` without
///    `null-body`, drained through the terminating zero chunk.
///
/// A header phase that exceeds `max_size` fails with
/// [`Error::MessageTooLarge`]; the chunked phase truncates silently instead
/// so that an oversized upload still produces a (partial) log entry.
pub async fn read_icap_message<R>(reader: &mut R, max_size: usize) -> FramedMessage
where
    R: AsyncBufRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut total = 0usize;

    // Phase 1: ICAP request line + ICAP headers.
    let mut encapsulated = String::new();
    loop {
        let line = match read_line(reader, &mut buf, &mut total, max_size).await {
            Ok(line) => line,
            Err(e) => return FramedMessage::failed(buf, e),
        };
        if line.is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("encapsulated:") {
            encapsulated = value.trim().to_string();
        }
    }

    // Nothing encapsulated at all (e.g. a bare OPTIONS probe).
    if encapsulated.is_empty() {
        trace!(len = buf.len(), "framed ICAP message without encapsulation");
        return FramedMessage::complete(buf);
    }

    // Phases 2 and 3: encapsulated HTTP header sections.
    if encapsulated.contains("req-hdr") {
        if let Err(e) = read_header_block(reader, &mut buf, &mut total, max_size).await {
            return FramedMessage::failed(buf, e);
        }
    }
    if encapsulated.contains("res-hdr") {
        if let Err(e) = read_header_block(reader, &mut buf, &mut total, max_size).await {
            return FramedMessage::failed(buf, e);
        }
    }

    // Phase 4: chunked body, drained through the zero chunk.
    let has_body = encapsulated.contains("req-body") || encapsulated.contains("res-body");
    if has_body && !encapsulated.contains("null-body") {
        loop {
            // The ceiling is not enforced on size lines; an oversized body
            // truncates below instead of failing the whole message.
            let size_line = match read_line(reader, &mut buf, &mut total, usize::MAX).await {
                Ok(line) => line,
                Err(e) => return FramedMessage::failed(buf, e),
            };
            let size_str = size_line.split(';').next().unwrap_or("").trim();
            let size = match usize::from_str_radix(size_str, 16) {
                Ok(n) if n > 0 => n,
                // Terminating chunk (or garbage): consume the blank line
                // after it and stop.
                _ => {
                    let _ = read_line(reader, &mut buf, &mut total, usize::MAX).await;
                    break;
                }
            };
            if total + size > max_size {
                break;
            }
            // Chunk data plus its trailing CRLF.
            let mut chunk = vec![0u8; size + 2];
            match reader.read_exact(&mut chunk).await {
                Ok(_) => {
                    total += chunk.len();
                    buf.extend_from_slice(&chunk);
                }
                Err(_) => break,
            }
        }
    }

    trace!(len = buf.len(), "framed one ICAP message");
    FramedMessage::complete(buf)
}

/// Read one CRLF-terminated line, appending its raw bytes to `out`.
/// Returns the line without its line terminator.
async fn read_line<R>(
    reader: &mut R,
    out: &mut Vec<u8>,
    total: &mut usize,
    max_size: usize,
) -> IcapResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let start = out.len();
    let n = reader.read_until(b'\n', out).await?;
    if n == 0 {
        return Err(Error::Io(io::Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed mid-message",
        )));
    }
    *total += n;
    if *total > max_size {
        return Err(Error::MessageTooLarge(max_size));
    }
    let line = String::from_utf8_lossy(&out[start..]);
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Drain one CRLF-terminated header block, up to and including its blank
/// line.
async fn read_header_block<R>(
    reader: &mut R,
    out: &mut Vec<u8>,
    total: &mut usize,
    max_size: usize,
) -> IcapResult<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = read_line(reader, out, total, max_size).await?;
        if line.is_empty() {
            return Ok(());
        }
    }
}
