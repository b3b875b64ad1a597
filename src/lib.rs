#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

pub mod body;
pub mod config;
pub mod error;
pub mod logger;
pub mod parser;
pub mod server;

pub use config::Config;
pub use error::{Error, IcapResult};
pub use server::Server;

/// Supported ICAP protocol version.
pub const ICAP_VERSION: &str = "ICAP/1.0";
/// Service identity advertised in OPTIONS replies.
pub const SERVICE_NAME: &str = "icap-logger/1.0";
/// ISTag advertised in OPTIONS replies.
pub const ISTAG: &str = "icap-logger-1.0";
