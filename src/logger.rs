//! Structured traffic records and the size-rotated file they are appended
//! to.
//!
//! One connection produces at most one [`LogRecord`], rendered as a single
//! JSON line. The sink is shared between all connections; one write per
//! entry is atomic relative to rotation and to other writers.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use http::HeaderMap;
use serde::Serialize;
use tracing::warn;

/// Timestamp pattern used throughout the log: millisecond precision with
/// the local UTC offset, e.g. `2026-08-02T14:03:09.123+02:00`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Current local time rendered with [`TIMESTAMP_FORMAT`].
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// One JSON line in the traffic log. Every field except `timestamp` and
/// `tunneled` is omitted when empty.
#[derive(Debug, Default, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icap_method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icap_url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub icap_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub req_method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub req_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub destination_url: String,
    pub tunneled: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub req_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub req_body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resp_status: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resp_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resp_body: String,
}

impl LogRecord {
    /// Render as a single JSON line. A serialization failure degrades to a
    /// minimal error record instead of losing the write entirely.
    pub fn to_json_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            Err(e) => serde_json::json!({
                "error": format!("failed to marshal log entry: {e}"),
            })
            .to_string(),
        }
    }
}

/// Flatten a header map for the log: canonical names, repeated values
/// joined with `", "`.
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(canonical_header_name(name.as_str()), joined);
    }
    map
}

/// Title-case a lowercased header name (`content-type` → `Content-Type`).
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, seg) in name.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = seg.chars();
        if let Some(c0) = chars.next() {
            out.extend(c0.to_uppercase());
            for c in chars {
                out.extend(c.to_lowercase());
            }
        }
    }
    out
}

/// The proxy stamps `Date` in RFC 1123 GMT. Rewrite it to
/// [`TIMESTAMP_FORMAT`] in local time so every timestamp in a record reads
/// the same way.
pub fn rewrite_date_header(map: &mut BTreeMap<String, String>) {
    if let Some(date) = map.get("Date") {
        if let Ok(parsed) = DateTime::parse_from_rfc2822(date) {
            map.insert(
                "Date".to_string(),
                parsed.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string(),
            );
        }
    }
}

/// Append-only log sink that renames the file aside and reopens it once a
/// write would push it past the configured size.
#[derive(Debug)]
pub struct RotatingWriter {
    path: PathBuf,
    max_size: u64,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    size: u64,
}

impl RotatingWriter {
    /// Open (or create) the log file in append mode.
    pub fn open(path: impl Into<PathBuf>, max_size_mb: u64) -> std::io::Result<Self> {
        let path = path.into();
        let (file, size) = open_append(&path)?;
        Ok(Self {
            path,
            max_size: max_size_mb * 1024 * 1024,
            inner: Mutex::new(Inner { file, size }),
        })
    }

    /// Append one line; a trailing newline is added. The lock covers the
    /// rotation check and the write, so an entry is never split across
    /// files.
    pub fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let len = line.len() as u64 + 1;
        if inner.size > 0 && inner.size + len > self.max_size {
            self.rotate(&mut inner)?;
        }
        inner.file.write_all(line.as_bytes())?;
        inner.file.write_all(b"\n")?;
        inner.size += len;
        Ok(())
    }

    /// Rename the current file aside with a timestamp suffix and reopen.
    fn rotate(&self, inner: &mut Inner) -> std::io::Result<()> {
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(format!(".{}", Local::now().format("%Y%m%d-%H%M%S")));
        if let Err(e) = std::fs::rename(&self.path, &rotated) {
            warn!(error = %e, "log rotation rename failed");
        }
        let (file, size) = open_append(&self.path)?;
        inner.file = file;
        inner.size = size;
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<(File, u64)> {
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let size = file.metadata()?.len();
    Ok((file, size))
}
