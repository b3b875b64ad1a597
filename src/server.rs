//! ICAP server.
//!
//! Accepts OPTIONS / REQMOD / RESPMOD, logs the reconstructed traffic, and
//! always answers `204 No Modifications`; the server observes, it never
//! adapts. One task per accepted connection; within a connection the order
//! is strict: read, parse, log, respond, close. The server is off the
//! critical path of proxy traffic, so every post-accept failure is
//! contained to its connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, IcapResult};
use crate::logger::{self, LogRecord, RotatingWriter};
use crate::parser::{self, ParsedMessage};
use crate::{ICAP_VERSION, ISTAG, SERVICE_NAME};

/// How long in-flight connections may keep running after the shutdown
/// signal closes the listener.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

const RESPONSE_204: &str = "ICAP/1.0 204 No Modifications\r\nConnection: close\r\n\r\n";
const TUNNEL_PLACEHOLDER: &str = "[tunneled: HTTPS traffic, body not inspectable]";

/// The ICAP listener plus the shared traffic sink.
pub struct Server {
    listener: TcpListener,
    sink: Arc<RotatingWriter>,
    cfg: Arc<Config>,
}

impl Server {
    /// Bind the ICAP listening socket.
    pub async fn bind(cfg: Config, sink: Arc<RotatingWriter>) -> IcapResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.port))
            .await
            .map_err(|e| Error::startup(format!("failed to bind ICAP port {}: {e}", cfg.port)))?;
        Ok(Self {
            listener,
            sink,
            cfg: Arc::new(cfg),
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop: one task per connection, no ordering between
    /// connections. When `shutdown` resolves the listener closes and
    /// in-flight handlers get [`DRAIN_TIMEOUT`] to finish.
    pub async fn run<F>(self, shutdown: F) -> IcapResult<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.listener.local_addr()?;
        info!(%local_addr, "ICAP server listening");
        tokio::pin!(shutdown);

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept error");
                            continue;
                        }
                    };
                    debug!(%addr, "new connection");
                    let sink = Arc::clone(&self.sink);
                    let cfg = Arc::clone(&self.cfg);
                    handlers.spawn(handle_conn(socket, sink, cfg));
                }
                // Reap finished handlers so the set does not grow unbounded.
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        drop(self.listener);
        info!(in_flight = handlers.len(), "shutdown signal received, draining");
        let drain = async {
            while handlers.join_next().await.is_some() {}
        };
        if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("drain timeout expired with handlers still running");
        }
        Ok(())
    }
}

/// Handle one connection: read exactly one message, answer OPTIONS
/// immediately (never logged), or log the reconstructed traffic and answer
/// 204.
async fn handle_conn(socket: TcpStream, sink: Arc<RotatingWriter>, cfg: Arc<Config>) {
    let mut stream = BufReader::new(socket);

    let framed = match timeout(
        cfg.read_timeout,
        parser::read_icap_message(&mut stream, cfg.max_body_size),
    )
    .await
    {
        Ok(framed) => framed,
        Err(_) => {
            debug!("read deadline expired");
            return;
        }
    };
    // Oversized or unreadable messages are dropped without a response; the
    // proxy treats the closed connection as a bypass.
    if let Some(err) = framed.error {
        debug!(error = %err, "dropping unreadable message");
        return;
    }
    if framed.bytes.is_empty() {
        return;
    }

    let first_line = first_line(&framed.bytes);
    if first_line.trim_start().starts_with("OPTIONS ") {
        let service_uri = first_line.split_whitespace().nth(1).unwrap_or("");
        debug!(uri = %service_uri, "ICAP OPTIONS received");
        write_response(&mut stream, &options_response(service_uri), &cfg).await;
        return;
    }

    let record = build_record(parser::parse_message(&framed.bytes));
    if let Err(e) = sink.write_line(&record.to_json_line()) {
        error!(error = %e, "failed to append log entry");
    }
    if !write_response(&mut stream, RESPONSE_204, &cfg).await {
        let _ = sink.write_line(r#"{"error":"failed to write ICAP response"}"#);
    }
}

/// Assemble the JSON record for one inspected message.
fn build_record(msg: ParsedMessage) -> LogRecord {
    // Squid forwards only the CONNECT line for TLS tunnels; whatever flows
    // inside the tunnel is encrypted and never arrives as a body.
    let tunneled = msg.req_method == "CONNECT" && msg.req_body.is_empty();
    let req_body = if tunneled {
        TUNNEL_PLACEHOLDER.to_string()
    } else {
        msg.req_body
    };

    let mut icap_headers = logger::headers_to_map(&msg.icap_headers);
    logger::rewrite_date_header(&mut icap_headers);

    LogRecord {
        timestamp: logger::now_timestamp(),
        icap_method: msg.icap_method,
        icap_url: msg.icap_url,
        icap_headers,
        req_method: msg.req_method,
        req_path: msg.req_path,
        destination_url: msg.destination_url,
        tunneled,
        req_headers: logger::headers_to_map(&msg.req_headers),
        req_body,
        resp_status: msg.resp_status,
        resp_headers: logger::headers_to_map(&msg.resp_headers),
        resp_body: msg.resp_body,
    }
}

/// The canned OPTIONS reply. Squid reads this on startup to confirm the
/// service is alive and to learn its capabilities.
fn options_response(service_uri: &str) -> String {
    let method = if service_uri.to_ascii_lowercase().contains("respmod") {
        "RESPMOD"
    } else {
        "REQMOD"
    };
    [
        format!("{ICAP_VERSION} 200 OK"),
        format!("Methods: {method}"),
        format!("Service: {SERVICE_NAME}"),
        format!("ISTag: \"{ISTAG}\""),
        "Encapsulated: null-body=0".to_string(),
        "Max-Connections: 100".to_string(),
        "Options-TTL: 3600".to_string(),
        "Allow: 204".to_string(),
        "Preview: 0".to_string(),
        "Transfer-Complete: *".to_string(),
        "Transfer-Ignore: jpg,jpeg,gif,png,swf,flv,mp3,mp4,avi,mkv,zip,gz,tar,iso".to_string(),
        "Connection: close".to_string(),
        "\r\n".to_string(),
    ]
    .join("\r\n")
}

/// Write one ICAP response under the write deadline. Returns whether the
/// write succeeded.
async fn write_response(stream: &mut BufReader<TcpStream>, response: &str, cfg: &Config) -> bool {
    let write = async {
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    };
    match timeout(cfg.write_timeout, write).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "failed to write ICAP response");
            false
        }
        Err(_) => {
            warn!("write deadline expired");
            false
        }
    }
}

fn first_line(raw: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = raw
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end])
}

/// Serve `GET /healthz` until `shutdown` resolves.
pub async fn run_health<F>(listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route("/healthz", get(healthz));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn healthz() -> impl IntoResponse {
    ([(CONTENT_TYPE, "application/json")], r#"{"status":"ok"}"#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_message;

    #[test]
    fn options_reply_advertises_reqmod_by_default() {
        let resp = options_response("icap://localhost:11344/reqmod");
        assert!(resp.starts_with("ICAP/1.0 200 OK\r\n"));
        assert!(resp.contains("Methods: REQMOD\r\n"));
        assert!(resp.contains("Encapsulated: null-body=0\r\n"));
        assert!(resp.contains("Preview: 0\r\n"));
        assert!(resp.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn options_reply_switches_to_respmod_by_uri() {
        let resp = options_response("icap://localhost:11344/RespMod");
        assert!(resp.contains("Methods: RESPMOD\r\n"));
    }

    fn connect_message() -> Vec<u8> {
        let http = "CONNECT login.example.com:443 HTTP/1.1\r\nHost: login.example.com:443\r\n\r\n";
        format!(
            "REQMOD icap://localhost/reqmod ICAP/1.0\r\nHost: localhost\r\nEncapsulated: req-hdr=0, null-body={}\r\n\r\n{http}",
            http.len(),
        )
        .into_bytes()
    }

    #[test]
    fn connect_without_body_is_flagged_as_tunneled() {
        let record = build_record(parse_message(&connect_message()));
        assert!(record.tunneled);
        assert_eq!(record.req_body, TUNNEL_PLACEHOLDER);
        assert_eq!(record.req_method, "CONNECT");
    }

    #[test]
    fn non_connect_requests_are_not_tunneled() {
        let http = "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let raw = format!(
            "REQMOD icap://localhost/reqmod ICAP/1.0\r\nEncapsulated: req-hdr=0, null-body={}\r\n\r\n{http}",
            http.len(),
        );
        let record = build_record(parse_message(raw.as_bytes()));
        assert!(!record.tunneled);
        assert!(record.req_body.is_empty());
    }

    #[test]
    fn date_header_in_record_uses_the_log_timestamp_shape() {
        let raw = "REQMOD icap://localhost/reqmod ICAP/1.0\r\nDate: Sun, 02 Aug 2026 10:30:45 GMT\r\nEncapsulated: null-body=0\r\n\r\n";
        let record = build_record(parse_message(raw.as_bytes()));
        let date = &record.icap_headers["Date"];
        assert!(!date.contains("GMT"), "Date not rewritten: {date}");
        assert!(date.contains('T'));
    }
}
