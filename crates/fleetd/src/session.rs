//! Live transport handles bound to a device.
//!
//! A [`Session`] is the write side of one controller connection. The
//! connection registry stores sessions behind `Arc<dyn Session>` so that
//! sends can happen without holding the registry lock.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every write is bounded by [`WRITE_TIMEOUT`]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use fleet_protocol::CoreMessage;

/// Upper bound on a single line write (including flush).
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one accepted connection.
///
/// Distinguishes a replaced session from its successor when both are
/// bound to the same device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport failures. Never fatal to the daemon; the session is dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Session closed")]
    Closed,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Write side of a device connection.
#[async_trait]
pub trait Session: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    /// Writes one message. Fails if the session is closed or the write fails.
    async fn send(&self, message: &CoreMessage) -> Result<(), TransportError>;

    /// Closes the session. The connection's read loop observes this and exits.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Newline-delimited JSON session over any async writer.
pub struct LineSession<W> {
    connection_id: ConnectionId,
    writer: Mutex<BufWriter<W>>,
    closed: CancellationToken,
}

impl<W> LineSession<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(connection_id: ConnectionId, writer: W) -> Self {
        Self {
            connection_id,
            writer: Mutex::new(BufWriter::new(writer)),
            closed: CancellationToken::new(),
        }
    }

    /// Token cancelled when the session is closed, for the reader to select on.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl<W> Session for LineSession<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    async fn send(&self, message: &CoreMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let line = message
            .to_line()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        let mut writer = self.writer.lock().await;

        let result = timeout(WRITE_TIMEOUT, async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                trace!(connection = %self.connection_id, bytes = line.len(), "Line written");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        match timeout(WRITE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }
}
