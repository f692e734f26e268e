//! Per-connection echo loop.
//!
//! A `ConnectionHandler` owns exactly one accepted stream. It reads a chunk,
//! writes the same bytes back in full, and repeats until the peer closes,
//! an I/O error occurs, or the server is stopping. The stream is dropped,
//! and therefore closed, on every exit path.

use crate::shutdown::Shutdown;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{error, info};

/// Read buffer size; also the largest chunk echoed in one write.
pub const BUFFER_SIZE: usize = 4096;

/// Number of bytes shown in the content preview of a received chunk.
pub const PREVIEW_LEN: usize = 100;

/// Why a connection ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Read returned end-of-stream.
    PeerClosed,
    /// The running flag was cleared between reads.
    ServerStopping,
}

/// Failures local to one connection. They end that connection only.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("idle for more than {0:?}")]
    IdleTimeout(Duration),
}

/// Echo loop for a single connection.
pub struct ConnectionHandler<S> {
    stream: S,
    peer: SocketAddr,
    shutdown: Shutdown,
    idle_timeout: Option<Duration>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr, shutdown: Shutdown) -> Self {
        Self {
            stream,
            peer,
            shutdown,
            idle_timeout: None,
        }
    }

    /// Close the connection when a read waits longer than `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Run the echo loop to completion and log the outcome. Never fails;
    /// errors stay inside this connection.
    pub async fn serve(self) {
        let peer = self.peer;
        info!(peer = %peer, "New connection");

        match self.run().await {
            Ok(CloseReason::PeerClosed) => info!(peer = %peer, "Client disconnected"),
            Ok(CloseReason::ServerStopping) => info!(peer = %peer, "Server stopping"),
            Err(ConnectionError::Write(e)) => {
                error!(peer = %peer, error = %e, "Failed to send data")
            }
            Err(e) => error!(peer = %peer, error = %e, "Connection error"),
        }

        info!(peer = %peer, "Connection closed");
    }

    /// Echo chunks until the connection ends. Consumes the handler so the
    /// stream is released however the loop exits.
    pub async fn run(mut self) -> Result<CloseReason, ConnectionError> {
        let mut buffer = BytesMut::zeroed(BUFFER_SIZE);

        while self.shutdown.is_running() {
            let n = self.read_chunk(&mut buffer).await?;
            if n == 0 {
                return Ok(CloseReason::PeerClosed);
            }

            let chunk = &buffer[..n];
            info!(target: "data", peer = %self.peer, bytes = n, "Received");
            info!(target: "data", peer = %self.peer, content = %preview(chunk), "Content");

            // write_all retries short writes until the chunk is fully sent.
            self.stream
                .write_all(chunk)
                .await
                .map_err(ConnectionError::Write)?;
            info!(target: "data", peer = %self.peer, bytes = n, "Echoed");
        }

        Ok(CloseReason::ServerStopping)
    }

    async fn read_chunk(&mut self, buffer: &mut [u8]) -> Result<usize, ConnectionError> {
        let read = self.stream.read(buffer);
        let result = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ConnectionError::IdleTimeout(limit))?,
            None => read.await,
        };
        result.map_err(ConnectionError::Read)
    }
}

/// Render the first `PREVIEW_LEN` bytes of a chunk with non-printable bytes
/// escaped, marking truncation with a trailing `...`.
pub fn preview(chunk: &[u8]) -> String {
    let head = &chunk[..chunk.len().min(PREVIEW_LEN)];
    let suffix = if chunk.len() > PREVIEW_LEN { "..." } else { "" };
    format!("{}{}", head.escape_ascii(), suffix)
}

/// Counts live connection handlers so shutdown can optionally wait for them.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection. It stays counted until the guard drops.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Number of live connections.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Resolve once no connections remain.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a running handler; releases its slot in the tracker on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let stream = Builder::new().read(b"hello").write(b"hello").build();
        let handler = ConnectionHandler::new(stream, peer(), Shutdown::new());
        assert_eq!(handler.run().await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_chunks_echoed_in_order() {
        let stream = Builder::new()
            .read(b"first")
            .write(b"first")
            .read(b"first")
            .write(b"first")
            .read(b"second")
            .write(b"second")
            .build();
        let handler = ConnectionHandler::new(stream, peer(), Shutdown::new());
        assert_eq!(handler.run().await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_large_chunk_split_at_buffer_size() {
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        let stream = Builder::new()
            .read(&data)
            .write(&data[..BUFFER_SIZE])
            .write(&data[BUFFER_SIZE..])
            .build();
        let handler = ConnectionHandler::new(stream, peer(), Shutdown::new());
        assert_eq!(handler.run().await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_read_error_ends_connection() {
        let stream = Builder::new()
            .read(b"ok")
            .write(b"ok")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let handler = ConnectionHandler::new(stream, peer(), Shutdown::new());
        match handler.run().await {
            Err(ConnectionError::Read(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_error_ends_connection() {
        let stream = Builder::new()
            .read(b"data")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let handler = ConnectionHandler::new(stream, peer(), Shutdown::new());
        match handler.run().await {
            Err(ConnectionError::Write(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stopped_server_skips_read() {
        let shutdown = Shutdown::new();
        shutdown.stop();
        let stream = Builder::new().build();
        let handler = ConnectionHandler::new(stream, peer(), shutdown);
        assert_eq!(handler.run().await.unwrap(), CloseReason::ServerStopping);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let stream = Builder::new().wait(Duration::from_secs(5)).build();
        let handler = ConnectionHandler::new(stream, peer(), Shutdown::new())
            .with_idle_timeout(Some(Duration::from_millis(50)));
        match handler.run().await {
            Err(ConnectionError::IdleTimeout(d)) => assert_eq!(d, Duration::from_millis(50)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview(b"hello"), "hello");
        assert_eq!(preview(b"a\r\n\x00"), "a\\r\\n\\x00");

        let long = vec![b'x'; 150];
        let shown = preview(&long);
        assert_eq!(shown.len(), PREVIEW_LEN + 3);
        assert!(shown.ends_with("..."));
    }

    #[tokio::test]
    async fn test_tracker_counts_and_drains() {
        let tracker = ConnectionTracker::new();
        let a = tracker.track();
        let b = tracker.track();
        assert_eq!(tracker.active(), 2);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        drop(a);
        assert_eq!(tracker.active(), 1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("tracker did not drain")
            .unwrap();
        assert_eq!(tracker.active(), 0);
    }
}
