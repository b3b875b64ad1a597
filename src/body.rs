//! Body handling: chunked decoding and log-safe rendering.
//!
//! Decoded bodies never reach the log verbatim unless they look like text:
//! `multipart/*` payloads are reduced to per-part summaries and binary
//! payloads to a size placeholder. File content in particular must never
//! leak into a log line.

use mime::Mime;

/// Decode an HTTP/1.1 chunked byte sequence into a contiguous payload.
///
/// Reads hex size lines (any `;`-delimited chunk extension stripped), the
/// chunk data, and the trailing CRLF. Stops at the zero chunk, on a
/// malformed size line, or on a short read, returning whatever was decoded
/// up to that point. Trailers are not handled beyond terminating the walk.
pub fn decode_chunked(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (line, next) = read_line(data, pos);
        pos = next;
        let size_str = String::from_utf8_lossy(trim_crlf(line));
        let size_str = size_str.split(';').next().unwrap_or("").trim().to_string();
        if size_str.is_empty() {
            continue;
        }
        let Ok(size) = usize::from_str_radix(&size_str, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        if pos + size > data.len() {
            break;
        }
        out.extend_from_slice(&data[pos..pos + size]);
        pos += size;
        // Consume the CRLF after the chunk data.
        let (_, next) = read_line(data, pos);
        pos = next;
    }
    out
}

/// Heuristic binary check: more than 10% non-printable bytes within the
/// first 512 bytes. Tab, LF and CR count as printable. This is fast and
/// good enough for logs; it is not mime sniffing.
pub fn is_binary(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(512)];
    if sample.is_empty() {
        return false;
    }
    let non_printable = sample
        .iter()
        .filter(|&&b| b < 0x09 || (b > 0x0d && b < 0x20) || b == 0x7f)
        .count();
    non_printable * 100 / sample.len() > 10
}

/// Walk a `multipart/*` body and summarize it part by part.
///
/// File parts are reduced to metadata, binary fields to their size, text
/// fields are inlined. Raw file bytes never appear in the output.
pub fn summarize_multipart(body: &[u8], boundary: &str) -> String {
    let mut tokens = Vec::new();
    for part in split_parts(body, boundary) {
        let (headers, data) = split_part(part);
        let disposition = part_header(&headers, "content-disposition").unwrap_or_default();
        let name = disposition_param(&disposition, "name").unwrap_or_default();
        if let Some(filename) = disposition_param(&disposition, "filename") {
            let content_type = part_header(&headers, "content-type")
                .filter(|ct| !ct.is_empty())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            tokens.push(format!(
                "[file: {filename:?}, content-type: {content_type:?}, {} bytes]",
                data.len(),
            ));
        } else if is_binary(data) {
            tokens.push(format!("[field: {name:?}, binary, {} bytes]", data.len()));
        } else {
            let value = String::from_utf8_lossy(data);
            tokens.push(format!("[field: {name:?} = {value:?}]"));
        }
    }
    if tokens.is_empty() {
        format!("[multipart: 0 parts, {} bytes]", body.len())
    } else {
        tokens.join("; ")
    }
}

/// Produce a log-safe rendering of a decoded body:
/// - `multipart/*` with a boundary: per-part summary;
/// - binary content: `[binary: N bytes]`;
/// - plain text: returned as-is.
pub fn sanitize_body(body: &[u8], content_type: &str) -> String {
    if body.is_empty() {
        return String::new();
    }
    if !content_type.is_empty() {
        if let Ok(media_type) = content_type.parse::<Mime>() {
            if media_type.type_() == mime::MULTIPART {
                if let Some(boundary) = media_type.get_param(mime::BOUNDARY) {
                    return summarize_multipart(body, boundary.as_str());
                }
            }
        }
    }
    if is_binary(body) {
        return format!("[binary: {} bytes]", body.len());
    }
    String::from_utf8_lossy(body).into_owned()
}

/// Next line starting at `start`: the line without its `\n` (a `\r` may
/// remain) and the position just past it.
fn read_line(data: &[u8], start: usize) -> (&[u8], usize) {
    match data[start..].iter().position(|&b| b == b'\n') {
        Some(i) => (&data[start..start + i], start + i + 1),
        None => (&data[start..], data.len()),
    }
}

fn trim_crlf(mut line: &[u8]) -> &[u8] {
    while let Some((&last, rest)) = line.split_last() {
        if last == b'\r' || last == b'\n' {
            line = rest;
        } else {
            break;
        }
    }
    line
}

/// Split a multipart body into raw parts delimited by `--boundary` lines.
/// A truncated body (no closing delimiter) keeps its final part.
fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delim = format!("--{boundary}");
    let delim = delim.as_bytes();
    let mut parts = Vec::new();
    let mut open: Option<usize> = None;
    let mut pos = 0;
    while pos < body.len() {
        let (raw_line, next) = read_line(body, pos);
        let line = trim_crlf(raw_line);
        let is_close = line.len() == delim.len() + 2 && line.starts_with(delim) && line.ends_with(b"--");
        if line == delim || is_close {
            if let Some(start) = open {
                // The CRLF before a delimiter belongs to it, not the part.
                parts.push(trim_trailing_crlf(&body[start..pos]));
            }
            if is_close {
                return parts;
            }
            open = Some(next);
        }
        pos = next;
    }
    if let Some(start) = open {
        parts.push(&body[start..]);
    }
    parts
}

fn trim_trailing_crlf(data: &[u8]) -> &[u8] {
    if data.ends_with(b"\r\n") {
        &data[..data.len() - 2]
    } else if data.ends_with(b"\n") {
        &data[..data.len() - 1]
    } else {
        data
    }
}

/// Split one part into its header block and its data.
fn split_part(part: &[u8]) -> (String, &[u8]) {
    match part.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(i) => (
            String::from_utf8_lossy(&part[..i]).into_owned(),
            &part[i + 4..],
        ),
        None => (String::new(), part),
    }
}

fn part_header(headers: &str, name: &str) -> Option<String> {
    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Extract a `key="value"` parameter from a Content-Disposition value.
fn disposition_param(disposition: &str, param: &str) -> Option<String> {
    for piece in disposition.split(';').skip(1) {
        let Some((key, value)) = piece.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(param) {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}
