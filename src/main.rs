//! tcp-echo: a concurrent TCP echo server
//!
//! Every byte a client sends is written back to that same client, in order.
//!
//! Features:
//! - One task per connection, no framing
//! - Graceful shutdown on SIGINT/SIGTERM: stop accepting, leave open
//!   connections to finish on their own
//! - Optional idle timeout and bounded connection draining
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod server;
mod shutdown;

use config::{Config, ConfigError};
use connection::ConnectionTracker;
use server::{AcceptError, Server, StartError};
use shutdown::Shutdown;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            if !e.is_informational() {
                init_logging("info");
            }
            return ExitCode::from(report_config_error(&e));
        }
    };

    init_logging(&config.log_level);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers.max(1));
    }
    let runtime = match builder.enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, Shutdown::new())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Start(e)) => {
            error!("{e}");
            if let Some(hint) = e.hint() {
                info!("{hint}");
            }
            ExitCode::FAILURE
        }
        // Already logged by the accept loop.
        Err(RunError::Accept(_)) => ExitCode::FAILURE,
    }
}

/// Reasons the process exits with a failure status once configured.
#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Accept(#[from] AcceptError),
}

/// Print `--help`/`--version` output or log a configuration failure.
/// Returns the process exit status.
fn report_config_error(e: &ConfigError) -> u8 {
    if e.is_informational() {
        println!("{e}");
        0
    } else {
        error!("{e}");
        1
    }
}

/// Log to stdout. RUST_LOG wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Bind, serve until shutdown, then optionally drain.
async fn run(config: Config, shutdown: Shutdown) -> Result<(), RunError> {
    let server = Server::bind(&config.server, shutdown.clone()).await?;
    info!(
        address = %server.local_addr(),
        "Listening for connections... (Press Ctrl+C to stop)"
    );

    // Signalled by any signal that arrives after shutdown has started.
    let force = Arc::new(Notify::new());

    let signals = shutdown.clone();
    let repeat = Arc::clone(&force);
    tokio::spawn(async move {
        loop {
            match shutdown::wait_for_signal().await {
                Ok(signal) => {
                    info!(signal, "Received signal");
                    if !signals.stop() {
                        repeat.notify_one();
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for shutdown signals");
                    return;
                }
            }
        }
    });

    let tracker = server.tracker();
    server.run().await?;

    if let Some(limit) = config.drain_timeout {
        drain(&tracker, limit, &force).await;
    }

    Ok(())
}

/// Wait up to `limit` for open connections to finish. Ends early when
/// `force` is notified.
async fn drain(tracker: &ConnectionTracker, limit: Duration, force: &Notify) {
    tokio::select! {
        res = tokio::time::timeout(limit, tracker.wait_idle()) => {
            if res.is_err() {
                warn!(
                    abandoned = tracker.active(),
                    "Drain timeout elapsed, closing remaining connections"
                );
            }
        }
        _ = force.notified() => {
            warn!(
                abandoned = tracker.active(),
                "Shutdown forced, closing remaining connections"
            );
        }
    }
}
