//! Binary entry point: configuration, event-log setup, listeners, signal
//! handling.

use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use icap_logger::config::{Args, Config};
use icap_logger::logger::RotatingWriter;
use icap_logger::server::{self, Server};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let cfg = Config::load(&args);

    // Server events go to stdout as JSON; the traffic log is a separate
    // rotating file.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let sink = match RotatingWriter::open(&cfg.log_file, cfg.log_rotate_size_mb) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(path = %cfg.log_file.display(), error = %e, "failed to open log file");
            process::exit(1);
        }
    };

    let health_listener = match TcpListener::bind(("0.0.0.0", cfg.health_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = cfg.health_port, error = %e, "failed to bind health port");
            process::exit(1);
        }
    };

    let server = match Server::bind(cfg.clone(), Arc::clone(&sink)).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start ICAP listener");
            process::exit(1);
        }
    };

    info!(
        icap_port = cfg.port,
        health_port = cfg.health_port,
        log_file = %cfg.log_file.display(),
        log_rotate_size_mb = cfg.log_rotate_size_mb,
        max_body_size = cfg.max_body_size,
        read_timeout_sec = cfg.read_timeout.as_secs(),
        "ICAP logger started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let health_shutdown = wait_for(shutdown_rx.clone());
    tokio::spawn(async move {
        if let Err(e) = server::run_health(health_listener, health_shutdown).await {
            error!(error = %e, "health server error");
        }
    });

    if let Err(e) = server.run(wait_for(shutdown_rx)).await {
        error!(error = %e, "ICAP server error");
        process::exit(1);
    }
    info!("shutdown complete");
}

/// Resolve once the shutdown flag flips.
async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
