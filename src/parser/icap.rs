//! ICAP message parsing and RFC 3507 `Encapsulated` decomposition.
//!
//! Offsets in the `Encapsulated` header are authoritative (RFC 3507
//! §4.4.1) and are **relative to the start of the encapsulated area**,
//! immediately after the ICAP headers CRLFCRLF. Splitting on blank lines
//! instead would misfire whenever a body happens to contain `\r\n\r\n`.

use std::collections::HashMap;

use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::body;
use crate::parser::http_embed;

/// Find end of an ICAP header block (position after CRLFCRLF).
#[inline]
pub fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Section names allowed in an `Encapsulated` header value.
const SECTION_NAMES: [&str; 6] = [
    "req-hdr", "res-hdr", "req-body", "res-body", "null-body", "opt-body",
];

/// Parse an `Encapsulated` value into `(name, offset)` entries, preserving
/// declaration order. Names are case-normalized; whitespace around tokens
/// and `=` is ignored; malformed tokens and unknown names are dropped.
pub fn parse_encapsulated(value: &str) -> Vec<(String, usize)> {
    let mut entries = Vec::new();
    for part in value.split(',') {
        let mut it = part.trim().split('=');
        let name = it.next().unwrap_or("").trim().to_ascii_lowercase();
        let Some(offset) = it.next().and_then(|s| s.trim().parse::<usize>().ok()) else {
            continue;
        };
        if SECTION_NAMES.contains(&name.as_str()) {
            entries.push((name, offset));
        }
    }
    entries
}

/// Slice the encapsulated buffer into named sections using the byte offsets
/// declared in the `Encapsulated` value.
///
/// Each section spans `[offset, next-offset)`; the last one runs to the end
/// of the buffer. `null-body` and `opt-body` bound their predecessor but
/// carry no extractable bytes. Offsets past the buffer drop the section,
/// ends are clamped to the buffer. Sections are independent copies.
pub fn split_encapsulated(data: &[u8], value: &str) -> HashMap<String, Vec<u8>> {
    let mut sections = HashMap::new();
    if data.is_empty() {
        return sections;
    }
    let entries = parse_encapsulated(value);
    for (i, (name, offset)) in entries.iter().enumerate() {
        if name == "null-body" || name == "opt-body" {
            continue;
        }
        if *offset >= data.len() {
            continue;
        }
        let end = match entries.get(i + 1) {
            Some((_, next)) => (*next).clamp(*offset, data.len()),
            None => data.len(),
        };
        sections.insert(name.clone(), data[*offset..end].to_vec());
    }
    sections
}

/// Everything extracted from one ICAP message, ready to be turned into a
/// log record.
///
/// Parsing is best effort and infallible: a malformed piece leaves its
/// fields empty while the neighbors stay valid.
#[derive(Debug, Default)]
pub struct ParsedMessage {
    pub icap_method: String,
    pub icap_url: String,
    pub icap_headers: HeaderMap,
    pub req_method: String,
    pub req_path: String,
    pub destination_url: String,
    pub req_headers: HeaderMap,
    pub req_body: String,
    pub resp_status: String,
    pub resp_headers: HeaderMap,
    pub resp_body: String,
}

/// Parse one raw ICAP message and reconstruct the encapsulated HTTP
/// request/response around it.
pub fn parse_message(raw: &[u8]) -> ParsedMessage {
    let mut msg = ParsedMessage::default();
    let hdr_end = find_double_crlf(raw).unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..hdr_end]);
    let mut lines = head.split("\r\n");

    // Request line: METHOD <icap-uri> ICAP/1.0
    let request_line = lines.next().unwrap_or("").trim();
    let mut parts = request_line.split_whitespace();
    if let (Some(method), Some(uri)) = (parts.next(), parts.next()) {
        msg.icap_method = method.to_string();
        msg.icap_url = uri.to_string();
    }
    debug!(method = %msg.icap_method, uri = %msg.icap_url, "parsing ICAP message");

    // ICAP headers; repeated names are preserved.
    let mut encapsulated_value = String::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("encapsulated") {
            encapsulated_value = value.to_string();
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            msg.icap_headers.append(name, value);
        }
    }

    let sections = split_encapsulated(&raw[hdr_end..], &encapsulated_value);

    if let Some(bytes) = sections.get("req-hdr") {
        match http_embed::parse_request_fragment(bytes) {
            Ok(req) => {
                msg.req_path = req.request_uri();
                msg.destination_url = req.destination_url().unwrap_or_default();
                msg.req_method = req.method;
                msg.req_headers = req.headers;
            }
            Err(e) => debug!(error = %e, "skipping unparseable req-hdr section"),
        }
    }
    if let Some(bytes) = sections.get("res-hdr") {
        match http_embed::parse_response_fragment(bytes) {
            Ok(resp) => {
                msg.resp_status = resp.status;
                msg.resp_headers = resp.headers;
            }
            Err(e) => debug!(error = %e, "skipping unparseable res-hdr section"),
        }
    }
    if let Some(bytes) = sections.get("req-body") {
        let decoded = body::decode_chunked(bytes);
        msg.req_body = body::sanitize_body(&decoded, header_str(&msg.req_headers, "content-type"));
    }
    if let Some(bytes) = sections.get("res-body") {
        let decoded = body::decode_chunked(bytes);
        msg.resp_body = body::sanitize_body(&decoded, header_str(&msg.resp_headers, "content-type"));
    }

    msg
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}
