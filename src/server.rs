//! TCP server for echo connections.
//!
//! Binds the listening socket, accepts connections, and hands each one to
//! its own `ConnectionHandler` task. The accept loop ends when the shared
//! `Shutdown` token is stopped; the listener is dropped (closed) on the way
//! out, so later connection attempts are refused. Handlers already running
//! are left to finish on their own.

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandler, ConnectionTracker};
use crate::shutdown::Shutdown;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Errors that prevent the server from reaching the listening state.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Permission denied. Port {} requires elevated privileges", .addr.port())]
    Permission { addr: SocketAddr, source: io::Error },
    #[error("Port {} is already in use", .addr.port())]
    AddressInUse { addr: SocketAddr, source: io::Error },
    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("Failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
}

impl StartError {
    /// Classify an OS-level socket/bind/listen failure.
    fn from_io(addr: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => StartError::Permission { addr, source },
            io::ErrorKind::AddrInUse => StartError::AddressInUse { addr, source },
            _ => StartError::Bind { addr, source },
        }
    }

    /// Suggested remedy printed after the diagnostic.
    pub fn hint(&self) -> Option<String> {
        match self {
            StartError::Permission { .. } => {
                Some("Try running with elevated privileges or choose a port above 1023".to_string())
            }
            StartError::AddressInUse { addr, .. } => Some(format!(
                "Try stopping whatever is using port {} or wait a moment",
                addr.port()
            )),
            _ => None,
        }
    }
}

/// The accept loop died while the server was still supposed to be running.
#[derive(Debug, Error)]
#[error("Error accepting connection: {0}")]
pub struct AcceptError(#[source] pub io::Error);

/// A bound, listening server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: Shutdown,
    tracker: Arc<ConnectionTracker>,
    idle_timeout: Option<Duration>,
}

impl Server {
    /// Resolve, bind and listen. On success the server is accepting at the
    /// kernel level; call `run` to start dispatching connections.
    pub async fn bind(config: &ServerConfig, shutdown: Shutdown) -> Result<Self, StartError> {
        let addr = resolve(&config.host, config.port).await?;

        let listener = create_listener(addr, config.backlog)
            .map_err(|e| StartError::from_io(addr, e))?;
        let listener = TcpListener::from_std(listener).map_err(|e| StartError::from_io(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StartError::from_io(addr, e))?;

        info!(
            address = %local_addr,
            backlog = config.backlog,
            idle_timeout = ?config.idle_timeout,
            "TCP echo server started"
        );

        Ok(Server {
            listener,
            local_addr,
            shutdown,
            tracker: ConnectionTracker::new(),
            idle_timeout: config.idle_timeout,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live-connection counter shared with every dispatched handler.
    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Accept connections until shutdown. Returns `Ok` when stopped through
    /// the shutdown token, `Err` if accept fails while still running.
    pub async fn run(self) -> Result<(), AcceptError> {
        let Server {
            listener,
            shutdown,
            tracker,
            idle_timeout,
            ..
        } = self;

        while shutdown.is_running() {
            tokio::select! {
                biased;

                _ = shutdown.stopped() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let guard = tracker.track();
                        let handler = ConnectionHandler::new(stream, peer, shutdown.clone())
                            .with_idle_timeout(idle_timeout);

                        tokio::spawn(async move {
                            handler.serve().await;
                            drop(guard);
                        });
                    }
                    // Listener torn down by a concurrent stop.
                    Err(_) if !shutdown.is_running() => break,
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        return Err(AcceptError(e));
                    }
                },
            }
        }

        drop(listener);
        info!(open_connections = tracker.active(), "Server stopped.");
        Ok(())
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, StartError> {
    let resolve_err = |source: io::Error| StartError::Resolve {
        host: host.to_string(),
        source,
    };

    tokio::net::lookup_host((host, port))
        .await
        .map_err(resolve_err)?
        .next()
        .ok_or_else(|| resolve_err(io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR and the given backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
