//! Reconstruction of the HTTP fragments embedded in an ICAP message.
//!
//! The `req-hdr` / `res-hdr` sections sliced out by the decomposer are
//! plain HTTP/1.1 start-line + header blocks. Bodies travel separately as
//! chunked sections and are never part of a fragment.

use http::{HeaderMap, HeaderName, HeaderValue, Uri};

use crate::error::{Error, IcapResult};

/// Start line + headers of an embedded HTTP request.
#[derive(Debug, Default)]
pub struct RequestFragment {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
}

/// Status line + headers of an embedded HTTP response.
#[derive(Debug, Default)]
pub struct ResponseFragment {
    /// Text form of the status, e.g. `200 OK`.
    pub status: String,
    pub headers: HeaderMap,
}

impl RequestFragment {
    /// Path plus query of the request target, in origin form. Absolute and
    /// authority form targets are reduced to their path-and-query, with `/`
    /// as the fallback. Query strings are kept: for a GET they are often
    /// the only informative part.
    pub fn request_uri(&self) -> String {
        if self.target.starts_with('/') {
            return self.target.clone();
        }
        match self.target.parse::<Uri>() {
            Ok(uri) => uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .filter(|pq| !pq.is_empty())
                .unwrap_or_else(|| "/".to_string()),
            Err(_) => "/".to_string(),
        }
    }

    /// Host the request was aimed at: the `Host` header for origin-form
    /// targets, the target's authority otherwise.
    pub fn host(&self) -> String {
        if !self.target.starts_with('/') {
            if let Ok(uri) = self.target.parse::<Uri>() {
                if let Some(authority) = uri.authority() {
                    return authority.to_string();
                }
            }
        }
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    }

    /// Absolute URL the proxied request was headed for, or `None` when no
    /// host is known. The ICAP transport itself carries no TLS state; the
    /// proxy signals it through `X-Forwarded-Proto`.
    pub fn destination_url(&self) -> Option<String> {
        let host = self.host();
        if host.is_empty() {
            return None;
        }
        let https = self
            .headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("https"));
        let scheme = if https { "https" } else { "http" };
        Some(format!("{scheme}://{host}{}", self.request_uri()))
    }
}

/// Parse a `req-hdr` section as an HTTP/1.1 request start line + headers.
pub fn parse_request_fragment(raw: &[u8]) -> IcapResult<RequestFragment> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");
    let start = lines.next().unwrap_or("");
    let fields: Vec<&str> = start.split_whitespace().collect();
    if fields.len() != 3 || !fields[2].starts_with("HTTP/") {
        return Err(Error::http_parse(format!("invalid request line: {start:?}")));
    }
    let mut fragment = RequestFragment {
        method: fields[0].to_string(),
        target: fields[1].to_string(),
        headers: HeaderMap::new(),
    };
    parse_header_block(lines, &mut fragment.headers);
    Ok(fragment)
}

/// Parse a `res-hdr` section as an HTTP/1.1 status line + headers.
pub fn parse_response_fragment(raw: &[u8]) -> IcapResult<ResponseFragment> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");
    let start = lines.next().unwrap_or("");
    let (version, status) = start.split_once(' ').unwrap_or((start, ""));
    if !version.starts_with("HTTP/") || status.is_empty() {
        return Err(Error::http_parse(format!("invalid status line: {start:?}")));
    }
    let code = status.split_whitespace().next().unwrap_or("");
    if code.parse::<u16>().is_err() {
        return Err(Error::http_parse(format!("invalid status code: {code:?}")));
    }
    let mut fragment = ResponseFragment {
        status: status.trim().to_string(),
        headers: HeaderMap::new(),
    };
    parse_header_block(lines, &mut fragment.headers);
    Ok(fragment)
}

/// Collect `Name: value` lines into a header map until the blank line.
/// Lines that are not valid header fields are skipped, not fatal.
fn parse_header_block<'a>(lines: impl Iterator<Item = &'a str>, headers: &mut HeaderMap) {
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }
}
