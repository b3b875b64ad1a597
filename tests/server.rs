//! End-to-end scenarios against a live listener: raw ICAP bytes in over
//! TCP, response line and JSON log entries out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use icap_logger::Config;
use icap_logger::logger::RotatingWriter;
use icap_logger::server::{self, Server};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn temp_log(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("icap-logger-e2e-{name}-{}.log", std::process::id()))
}

async fn start_server(log_path: &Path, max_body_size: usize) -> std::net::SocketAddr {
    let cfg = Config {
        port: 0,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        max_body_size,
        ..Default::default()
    };
    let _ = std::fs::remove_file(log_path);
    let sink = Arc::new(RotatingWriter::open(log_path, 25).expect("open sink"));
    let server = Server::bind(cfg, sink).await.expect("bind server");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.run(std::future::pending()).await;
    });
    addr
}

/// Send one raw ICAP message and read the connection to close.
async fn exchange(addr: std::net::SocketAddr, message: &[u8]) -> String {
    let mut conn = TcpStream::connect(addr).await.expect("connect");
    conn.write_all(message).await.expect("send");
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.expect("read response");
    String::from_utf8_lossy(&buf).into_owned()
}

fn first_log_entry(log_path: &Path) -> Value {
    let content = std::fs::read_to_string(log_path).expect("read log");
    let line = content.lines().next().expect("log line present");
    serde_json::from_str(line).expect("log line is JSON")
}

#[tokio::test]
async fn bare_options_probe_gets_canned_200_and_no_log() {
    let log = temp_log("options");
    let addr = start_server(&log, 10 * 1024 * 1024).await;

    let resp = exchange(
        addr,
        b"OPTIONS icap://localhost:11344/reqmod ICAP/1.0\r\nHost: localhost\r\n\r\n",
    )
    .await;

    assert!(resp.starts_with("ICAP/1.0 200 OK\r\n"), "got: {resp}");
    assert!(resp.contains("Methods: REQMOD\r\n"));
    assert!(resp.contains("Encapsulated: null-body=0\r\n"));
    assert_eq!(std::fs::read_to_string(&log).unwrap_or_default(), "");
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn options_for_respmod_service_advertises_respmod() {
    let log = temp_log("options-respmod");
    let addr = start_server(&log, 10 * 1024 * 1024).await;

    let resp = exchange(
        addr,
        b"OPTIONS icap://localhost:11344/respmod ICAP/1.0\r\nHost: localhost\r\n\r\n",
    )
    .await;

    assert!(resp.contains("Methods: RESPMOD\r\n"));
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn reqmod_with_chunked_body_is_logged_and_answered_204() {
    let log = temp_log("reqmod-body");
    let addr = start_server(&log, 10 * 1024 * 1024).await;

    let http = "POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\n";
    let message = format!(
        "REQMOD icap://localhost/reqmod ICAP/1.0\r\nHost: localhost\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n{http}5\r\nhello\r\n0\r\n\r\n",
        http.len(),
    );
    let resp = exchange(addr, message.as_bytes()).await;
    assert!(resp.starts_with("ICAP/1.0 204 No Modifications\r\n"), "got: {resp}");

    let entry = first_log_entry(&log);
    assert_eq!(entry["icap_method"], "REQMOD");
    assert_eq!(entry["req_method"], "POST");
    assert_eq!(entry["req_path"], "/submit");
    assert_eq!(entry["destination_url"], "http://example.com/submit");
    assert_eq!(entry["req_body"], "hello");
    assert_eq!(entry["tunneled"], false);
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn reqmod_get_with_null_body_omits_req_body() {
    let log = temp_log("reqmod-null");
    let addr = start_server(&log, 10 * 1024 * 1024).await;

    let http = "GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let message = format!(
        "REQMOD icap://localhost/reqmod ICAP/1.0\r\nHost: localhost\r\nEncapsulated: req-hdr=0, null-body={}\r\n\r\n{http}",
        http.len(),
    );
    let resp = exchange(addr, message.as_bytes()).await;
    assert!(resp.starts_with("ICAP/1.0 204 No Modifications\r\n"));

    let entry = first_log_entry(&log);
    assert_eq!(entry["req_method"], "GET");
    assert_eq!(entry["req_path"], "/index.html");
    assert!(entry.get("req_body").is_none(), "req_body must be omitted");
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn respmod_with_body_extracts_status_headers_and_body() {
    let log = temp_log("respmod");
    let addr = start_server(&log, 10 * 1024 * 1024).await;

    let http = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n";
    let message = format!(
        "RESPMOD icap://localhost/respmod ICAP/1.0\r\nHost: localhost\r\nEncapsulated: res-hdr=0, res-body={}\r\n\r\n{http}5\r\nworld\r\n0\r\n\r\n",
        http.len(),
    );
    let resp = exchange(addr, message.as_bytes()).await;
    assert!(resp.starts_with("ICAP/1.0 204 No Modifications\r\n"));

    let entry = first_log_entry(&log);
    assert_eq!(entry["resp_status"], "200 OK");
    assert_eq!(entry["resp_headers"]["Content-Type"], "text/plain");
    assert_eq!(entry["resp_body"], "world");
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn connect_tunnel_is_flagged_with_placeholder_body() {
    let log = temp_log("connect");
    let addr = start_server(&log, 10 * 1024 * 1024).await;

    let http = "CONNECT login.example.com:443 HTTP/1.1\r\nHost: login.example.com:443\r\n\r\n";
    let message = format!(
        "REQMOD icap://localhost/reqmod ICAP/1.0\r\nHost: localhost\r\nEncapsulated: req-hdr=0, null-body={}\r\n\r\n{http}",
        http.len(),
    );
    let resp = exchange(addr, message.as_bytes()).await;
    assert!(resp.starts_with("ICAP/1.0 204 No Modifications\r\n"));

    let entry = first_log_entry(&log);
    assert_eq!(entry["tunneled"], true);
    assert_eq!(
        entry["req_body"],
        "[tunneled: HTTPS traffic, body not inspectable]"
    );
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn multi_chunk_text_body_appears_verbatim() {
    let log = temp_log("multichunk");
    let addr = start_server(&log, 10 * 1024 * 1024).await;

    let http = "POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Type: text/plain\r\n\r\n";
    let message = format!(
        "REQMOD icap://localhost/reqmod ICAP/1.0\r\nHost: localhost\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n{http}5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        http.len(),
    );
    let resp = exchange(addr, message.as_bytes()).await;
    assert!(resp.starts_with("ICAP/1.0 204 No Modifications\r\n"));

    let entry = first_log_entry(&log);
    assert_eq!(entry["req_body"], "hello world");
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn oversized_headers_close_the_connection_without_response() {
    let log = temp_log("too-large");
    let addr = start_server(&log, 128).await;

    let message = format!(
        "REQMOD icap://localhost/reqmod ICAP/1.0\r\nX-Padding: {}\r\nEncapsulated: null-body=0\r\n\r\n",
        "a".repeat(512),
    );
    let mut conn = TcpStream::connect(addr).await.expect("connect");
    conn.write_all(message.as_bytes()).await.expect("send");
    // The server drops the message and closes; depending on timing the
    // close may surface as EOF or as a reset, never as a response.
    let mut buf = Vec::new();
    let _ = conn.read_to_end(&mut buf).await;
    assert!(buf.is_empty(), "no response expected for an oversized message");
    assert_eq!(std::fs::read_to_string(&log).unwrap_or_default(), "");
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn healthz_answers_ok() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server::run_health(listener, std::future::pending()).await;
    });

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    let resp = String::from_utf8_lossy(&buf);
    assert!(resp.starts_with("HTTP/1.1 200 OK"), "got: {resp}");
    assert!(resp.ends_with(r#"{"status":"ok"}"#), "got: {resp}");
}
