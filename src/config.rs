//! Runtime configuration.
//!
//! Values come from environment variables with hardcoded defaults; the
//! `--port=`, `--log=` and `--log-rotate-size=` command-line flags take
//! precedence over the environment. Timezone handling needs no knob of its
//! own: `TZ` is honored by the local-time rendering in the logger.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

/// Command-line overrides, applied on top of the environment.
#[derive(Parser, Debug, Default)]
#[command(
    name = "icap-logger",
    about = "Passive ICAP server that logs proxied HTTP traffic as JSON lines",
    version
)]
pub struct Args {
    /// ICAP listening port (overrides ICAP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Traffic log file path (overrides LOG_FILE)
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Rotate the traffic log after this many megabytes (overrides LOG_ROTATE_SIZE_MB)
    #[arg(long = "log-rotate-size")]
    pub log_rotate_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_file: PathBuf,
    pub log_rotate_size_mb: u64,
    pub max_body_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub health_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 11344,
            log_file: PathBuf::from("/var/log/icap/icap_logger.log"),
            log_rotate_size_mb: 25,
            max_body_size: 10 * 1024 * 1024,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            health_port: 8080,
        }
    }
}

impl Config {
    /// Build a config from the environment, then apply CLI overrides.
    /// Malformed environment values fall back to the defaults.
    pub fn load(args: &Args) -> Self {
        let defaults = Self::default();
        let mut cfg = Self {
            port: env_or("ICAP_PORT", defaults.port),
            log_file: std::env::var("LOG_FILE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
            log_rotate_size_mb: env_or("LOG_ROTATE_SIZE_MB", defaults.log_rotate_size_mb),
            max_body_size: env_or("MAX_BODY_SIZE", defaults.max_body_size),
            read_timeout: Duration::from_secs(env_or(
                "READ_TIMEOUT_SEC",
                defaults.read_timeout.as_secs(),
            )),
            write_timeout: Duration::from_secs(env_or(
                "WRITE_TIMEOUT_SEC",
                defaults.write_timeout.as_secs(),
            )),
            health_port: env_or("HEALTH_PORT", defaults.health_port),
        };
        if let Some(port) = args.port {
            cfg.port = port;
        }
        if let Some(ref log) = args.log {
            cfg.log_file = log.clone();
        }
        if let Some(size) = args.log_rotate_size {
            if size > 0 {
                cfg.log_rotate_size_mb = size;
            }
        }
        cfg
    }
}

fn env_or<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}
